use super::{EntryStream, Journal, JournalEntry, RunKey};
use crate::error::JournalError;
use async_trait::async_trait;
use futures_util::stream;
use std::sync::{PoisonError, RwLock};

/// Process-local journal, for ephemeral networks and tests.
#[derive(Default)]
pub struct MemoryJournal {
    entries: RwLock<Vec<JournalEntry>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry of every run, in append order.
    pub fn snapshot(&self) -> Vec<JournalEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn append(&self, entry: &JournalEntry) -> Result<(), JournalError> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        Ok(())
    }

    fn entries_for<'a>(&'a self, run_key: &'a RunKey) -> EntryStream<'a> {
        let matching: Vec<Result<JournalEntry, JournalError>> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| &entry.run_key == run_key)
            .cloned()
            .map(Ok)
            .collect();
        Box::pin(stream::iter(matching))
    }
}
