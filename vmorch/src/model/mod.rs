pub mod command;
pub mod devices;
pub mod vm_config;
pub mod vm_status;
