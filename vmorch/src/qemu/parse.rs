//! Parsers for the text QEMU prints on `-machine help`, `-display help`,
//! `-device help`, `info snapshots` and for `/proc/meminfo`.

use crate::model::devices::DeviceOption;

pub fn machines(output: &str) -> Vec<DeviceOption> {
    output
        .lines()
        .filter(|line| !line.starts_with("Supported machines"))
        .filter_map(|line| {
            let line = line.trim();
            let (id, desc) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            (!id.is_empty()).then(|| DeviceOption::new(id, desc.trim()))
        })
        .collect()
}

pub fn displays(output: &str) -> Vec<DeviceOption> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.ends_with(':'))
        .map(|id| DeviceOption::new(id, id))
        .collect()
}

/// Network and sound devices out of `-device help`, in that order.
pub fn devices(output: &str) -> (Vec<DeviceOption>, Vec<DeviceOption>) {
    let mut networks = Vec::new();
    let mut audios = Vec::new();
    let mut section = "";

    for line in output.lines().map(str::trim) {
        if line.ends_with("devices:") {
            section = line;
            continue;
        }
        let Some(name) = quoted_after(line, "name ") else {
            continue;
        };
        let desc = quoted_after(line, "desc ").unwrap_or(name);
        let option = DeviceOption::new(name, desc);
        match section {
            "Network devices:" => networks.push(option),
            "Sound devices:" => audios.push(option),
            _ => {}
        }
    }

    (networks, audios)
}

fn quoted_after<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(&format!("{}\"", key))? + key.len() + 1;
    let rest = &line[start..];
    rest.find('"').map(|end| &rest[..end])
}

/// Snapshot tags from HMP `info snapshots`.
pub fn snapshot_tags(output: &str) -> Vec<String> {
    let mut lines = output.lines();
    if !lines.any(|line| line.split_whitespace().nth(1) == Some("TAG")) {
        return Vec::new();
    }
    lines
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
        .collect()
}

/// Map a QMP `query-status` run state onto the orchestrator's vocabulary.
pub fn run_state(state: &str) -> &'static str {
    match state {
        "running" | "colo" => "running",
        "paused" | "suspended" | "debug" | "save-vm" | "postmigrate" | "finish-migrate" => "paused",
        "prelaunch" | "inmigrate" | "restore-vm" => "starting",
        "shutdown" => "stopping",
        "internal-error" | "io-error" | "guest-panicked" | "watchdog" => "failed",
        // Unknown states are left to the orchestrator's normalization.
        _ => "unknown",
    }
}

/// `MemTotal` in MiB.
pub fn total_memory_mib(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kib| kib.parse::<u64>().ok())
        .map(|kib| kib / 1024)
}
