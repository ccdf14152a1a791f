use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::{
    App,
    errors::Error,
    model::{command::CommandResult, devices::DeviceCapabilities},
};

use super::super::Result;

/// Cached capabilities first, then the engine's aggregate query, then the
/// individual kvm/jit probes.
#[instrument(skip(env))]
pub async fn kvm_info(env: &App) -> Result<CommandResult> {
    if let Some(capabilities) = env.devices().cached_capabilities() {
        return Ok(CommandResult::ok("device capabilities (cached)")
            .with_data(capabilities_data(&capabilities, true)?));
    }

    if env.features().device_capabilities {
        match env.engine().get_device_capabilities().await {
            Ok(capabilities) => {
                return Ok(CommandResult::ok("device capabilities")
                    .with_data(capabilities_data(&capabilities, false)?));
            }
            Err(e) => warn!("Aggregate capability query failed, probing directly: {}", e),
        }
    }

    let kvm_supported = env.engine().kvm_supported().await?;
    let jit_supported = env.engine().jit_supported().await?;
    Ok(CommandResult::ok("device capabilities").with_data(json!({
        "kvmSupported": kvm_supported,
        "jitSupported": jit_supported,
        "cached": false,
    })))
}

/// Never waits for a probe. With nothing cached a background scan is started
/// so that a later call finds it.
#[instrument(skip(env))]
pub async fn scan(env: &App) -> Result<CommandResult> {
    let result = env.devices().scan();
    if result.has_data() {
        return Ok(CommandResult::ok("device scan (cached)").with_data(to_value(&result)?));
    }

    if !env.features().device_scan {
        return Err(Error::Unsupported("scan_devices".into()));
    }

    let devices = env.devices_arc();
    tokio::spawn(async move {
        let result = devices.scan_async().await;
        info!("Background device scan finished, success={}", result.success);
    });

    Ok(
        CommandResult::failure("no cached device scan, scan started in background")
            .with_data(to_value(&result)?),
    )
}

#[instrument(skip(env))]
pub async fn refresh(env: &App) -> Result<CommandResult> {
    if !env.features().device_scan {
        return Err(Error::Unsupported("refresh_devices".into()));
    }
    let result = env.devices().scan_async().await;
    let response = if result.success {
        CommandResult::ok("device scan refreshed")
    } else {
        CommandResult::failure(result.error.clone().unwrap_or_default())
    };
    Ok(response.with_data(to_value(&result)?))
}

#[instrument(skip(env))]
pub async fn clear_cache(env: &App) -> Result<CommandResult> {
    env.devices().invalidate();
    Ok(CommandResult::ok("device cache cleared"))
}

fn capabilities_data(capabilities: &DeviceCapabilities, cached: bool) -> Result<Value> {
    let mut data = to_value(capabilities)?;
    if let Value::Object(map) = &mut data {
        map.insert("cached".into(), Value::Bool(cached));
    }
    Ok(data)
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::NativeCall(e.to_string()))
}
