//! QEMU implementation of the Native Engine boundary.

mod command;
mod manager;
mod parse;
mod qmp;

pub use manager::QemuEngine;
