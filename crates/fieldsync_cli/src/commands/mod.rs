//! CLI command implementations.

pub mod compact;
pub mod dump_journal;
pub mod escalations;
pub mod status;
pub mod submit;

use fieldsync_engine::{FileJournal, Journal, RetryPolicy, SyncQueue, JOURNAL_FILE_NAME};
use std::path::Path;
use std::sync::Arc;

/// Opens a store directory and rebuilds the queue from its journal.
pub fn open_queue(store: &Path) -> Result<SyncQueue, Box<dyn std::error::Error>> {
    let journal = Arc::new(FileJournal::open(&store.join(JOURNAL_FILE_NAME))?);
    Ok(SyncQueue::recover(
        journal as Arc<dyn Journal>,
        RetryPolicy::default(),
    )?)
}
