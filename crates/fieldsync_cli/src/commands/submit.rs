//! Submit command implementation.

use fieldsync_protocol::{DeviceId, OperationType, Payload};
use std::path::Path;

/// Runs the submit command.
pub fn run(
    store: &Path,
    device: &str,
    op_type: &str,
    payload: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let op_type = OperationType::from_code(op_type)
        .ok_or_else(|| format!("unknown operation type: {op_type}"))?;
    let payload: Payload = serde_json::from_str(payload)
        .map_err(|e| format!("payload must be a JSON object: {e}"))?;
    let device = DeviceId::new(device);

    let queue = super::open_queue(store)?;
    let record = queue.enqueue(&device, op_type, payload)?;

    println!("enqueued {}", record.id);
    Ok(())
}
