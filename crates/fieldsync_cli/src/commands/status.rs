//! Status command implementation.

use fieldsync_engine::PendingEntry;
use fieldsync_protocol::DeviceId;
use serde::Serialize;
use std::path::Path;

/// Per-device slice of the status report.
#[derive(Debug, Serialize)]
pub struct DeviceReport {
    /// The device the entries belong to.
    pub device: String,
    /// Entries in enqueue order.
    pub entries: Vec<PendingEntry>,
}

/// Runs the status command.
pub fn run(
    store: &Path,
    device: Option<&str>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let queue = super::open_queue(store)?;

    let mut devices: Vec<DeviceId> = match device {
        Some(device) => vec![DeviceId::new(device)],
        None => queue.devices(),
    };
    devices.sort_by(|a, b| a.as_str().cmp(b.as_str()));

    let reports: Vec<DeviceReport> = devices
        .iter()
        .map(|d| DeviceReport {
            device: d.to_string(),
            entries: queue.pending_for(d),
        })
        .collect();

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        _ => {
            print_text_output(&reports);
        }
    }

    Ok(())
}

fn print_text_output(reports: &[DeviceReport]) {
    if reports.iter().all(|r| r.entries.is_empty()) {
        println!("no operations recorded");
        return;
    }

    for report in reports {
        if report.entries.is_empty() {
            continue;
        }
        println!("device {}", report.device);
        println!("  {:<16} {:<16} {:<14} {:>7}", "id", "type", "status", "retries");
        for entry in &report.entries {
            println!(
                "  {:<16} {:<16} {:<14} {:>7}",
                entry.id.to_string(),
                entry.op_type.as_code(),
                format!("{:?}", entry.status),
                entry.retry_count,
            );
        }
    }
}
