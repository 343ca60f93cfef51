//! Dump journal command implementation.

use fieldsync_engine::{FileJournal, JournalFrame, JOURNAL_FILE_NAME};
use std::path::Path;

/// Runs the dump-journal command.
pub fn run(
    store: &Path,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = store.join(JOURNAL_FILE_NAME);
    if !path.exists() {
        return Err("journal file not found".into());
    }

    let journal = FileJournal::open(&path)?;
    let mut frames = journal.read_frames()?;
    if let Some(limit) = limit {
        frames.truncate(limit);
    }

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&frames)?);
        }
        _ => {
            print_text_output(&frames);
        }
    }

    Ok(())
}

fn print_text_output(frames: &[JournalFrame]) {
    println!("{} frame(s)", frames.len());
    for (index, frame) in frames.iter().enumerate() {
        match frame {
            JournalFrame::Enqueued(record) => {
                println!(
                    "{index:>6}  enqueued        {} {} retry={}",
                    record.id,
                    record.op_type.as_code(),
                    record.retry_count,
                );
            }
            JournalFrame::StatusChanged {
                id,
                status,
                retry_count,
            } => {
                println!("{index:>6}  status-changed  {id} {status:?} retry={retry_count}");
            }
            JournalFrame::Escalated(escalation) => {
                println!("{index:>6}  escalated       {}", escalation.operation_id);
            }
            JournalFrame::SequenceFloor {
                device_id,
                next_sequence,
            } => {
                println!("{index:>6}  sequence-floor  {device_id} next={next_sequence}");
            }
        }
    }
}
