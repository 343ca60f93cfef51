//! Escalations command implementation.

use std::path::Path;

/// Runs the escalations command.
pub fn run(store: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let queue = super::open_queue(store)?;
    let escalations = queue.escalations();

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&escalations)?);
        }
        _ => {
            if escalations.is_empty() {
                println!("no conflicts waiting for review");
                return Ok(());
            }
            for escalation in &escalations {
                println!(
                    "{}  local@{}ms  remote@{}ms  detected@{}ms",
                    escalation.operation_id,
                    escalation.local.created_at.as_millis(),
                    escalation.remote.created_at.as_millis(),
                    escalation.detected_at.as_millis(),
                );
            }
        }
    }

    Ok(())
}
