//! Compact command implementation.

use fieldsync_protocol::OperationStatus;
use std::path::Path;

/// Runs the compact command.
pub fn run(store: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let queue = super::open_queue(store)?;

    let settled: usize = queue
        .devices()
        .iter()
        .map(|d| {
            queue
                .pending_for(d)
                .iter()
                .filter(|e| e.status == OperationStatus::Succeeded)
                .count()
        })
        .sum();

    if dry_run {
        println!("{settled} settled record(s) would be removed (dry run)");
        return Ok(());
    }

    let removed = queue.compact()?;
    println!("removed {removed} settled record(s)");
    Ok(())
}
