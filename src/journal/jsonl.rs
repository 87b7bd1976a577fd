use super::{EntryStream, Journal, JournalEntry, RunKey};
use crate::error::JournalError;
use async_trait::async_trait;
use futures_util::Stream;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tracing::warn;

/// One JSON Lines file per run, at `<root>/<network>/<module>.jsonl`.
///
/// Appends are serialized through a mutex and synced to disk before they
/// resolve. A final line without its newline is what an interrupted append
/// leaves behind: reads skip it when it does not parse, and the next append
/// cuts it off before writing.
pub struct JsonlJournal {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlJournal {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path_for(&self, run_key: &RunKey) -> PathBuf {
        self.root
            .join(run_key.network())
            .join(format!("{}.jsonl", run_key.module()))
    }
}

/// Whether the file is non-empty and its last byte is not a newline.
/// Leaves the cursor at the start of the file.
async fn has_torn_tail(file: &mut File) -> std::io::Result<bool> {
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1)).await?;
    let mut last = [0_u8; 1];
    file.read_exact(&mut last).await?;
    file.seek(SeekFrom::Start(0)).await?;
    Ok(last[0] != b'\n')
}

fn stream_file(path: PathBuf) -> impl Stream<Item = Result<JournalEntry, JournalError>> + Send {
    async_stream::try_stream! {
        let file = match File::open(&path).await {
            Ok(file) => Some(file),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
            Err(error) => Err(error)?,
        };

        if let Some(mut file) = file {
            let torn = has_torn_tail(&mut file).await?;
            let mut lines = LinesStream::new(BufReader::new(file).lines());
            let mut line_number = 0_usize;
            while let Some(line) = lines.next().await {
                let line = line?;
                line_number += 1;
                if line.trim().is_empty() {
                    continue;
                }
                match parse_line(&path, line_number, &line) {
                    Ok(entry) => {
                        yield entry;
                    }
                    Err(error) => {
                        if torn && lines.next().await.is_none() {
                            warn!(path = %path.display(), line = line_number, "journal.torn_tail_skipped");
                            break;
                        }
                        Err(error)?;
                    }
                }
            }
        }
    }
}

fn parse_line(path: &Path, line_number: usize, line: &str) -> Result<JournalEntry, JournalError> {
    serde_json::from_str(line).map_err(|error| JournalError::Corrupt {
        position: format!("{}:{line_number}", path.display()),
        reason: error.to_string(),
    })
}

/// Terminate a complete final line that lost its newline, or truncate a
/// partial one, so the next append starts on a line of its own.
async fn repair_tail(file: &mut File, path: &Path) -> Result<(), JournalError> {
    if !has_torn_tail(file).await? {
        return Ok(());
    }
    let mut raw = Vec::new();
    file.read_to_end(&mut raw).await?;
    let start = raw
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map_or(0, |newline| newline + 1);

    if serde_json::from_slice::<JournalEntry>(&raw[start..]).is_ok() {
        file.seek(SeekFrom::End(0)).await?;
        file.write_all(b"\n").await?;
    } else {
        warn!(path = %path.display(), bytes = raw.len() - start, "journal.torn_tail_dropped");
        file.set_len(start as u64).await?;
    }
    Ok(())
}

#[async_trait]
impl Journal for JsonlJournal {
    async fn append(&self, entry: &JournalEntry) -> Result<(), JournalError> {
        let mut line = serde_json::to_string(entry)
            .map_err(|error| JournalError::Storage(format!("encode entry: {error}")))?;
        line.push('\n');

        let path = self.path_for(&entry.run_key);
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;
        repair_tail(&mut file, &path).await?;
        file.seek(SeekFrom::End(0)).await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }

    fn entries_for<'a>(&'a self, run_key: &'a RunKey) -> EntryStream<'a> {
        Box::pin(stream_file(self.path_for(run_key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{EntryPayload, ExecutionState, FutureResult, read_entries};
    use crate::module::FutureId;

    fn key() -> RunKey {
        RunKey::new("sepolia", "MyNFTCollection").unwrap()
    }

    fn success(local: &str) -> JournalEntry {
        JournalEntry::new(
            &key(),
            &FutureId::new("MyNFTCollection", local),
            ExecutionState::Success,
            EntryPayload::Result(FutureResult::contract("0xc0ffee", None)),
        )
    }

    #[tokio::test]
    async fn missing_file_is_an_empty_run() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JsonlJournal::new(dir.path());

        assert!(read_entries(&journal, &key()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn appends_are_visible_to_the_next_read() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JsonlJournal::new(dir.path());

        journal.append(&success("MyNFT")).await.unwrap();
        assert_eq!(read_entries(&journal, &key()).await.unwrap().len(), 1);

        journal.append(&success("Market")).await.unwrap();
        let entries = read_entries(&journal, &key()).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].future_id.as_str(), "MyNFTCollection#Market");
        assert!(journal.path_for(&key()).ends_with("sepolia/MyNFTCollection.jsonl"));
    }

    #[tokio::test]
    async fn corrupt_line_fails_fast_with_position() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JsonlJournal::new(dir.path());
        journal.append(&success("MyNFT")).await.unwrap();

        let path = journal.path_for(&key());
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{\"run_key\": \"sepolia/MyNF\n");
        std::fs::write(&path, raw).unwrap();
        journal.append(&success("Market")).await.unwrap();

        let err = read_entries(&journal, &key()).await.unwrap_err();
        match err {
            JournalError::Corrupt { position, .. } => assert!(position.ends_with(":2")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn interrupted_append_is_skipped_then_cut_off() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JsonlJournal::new(dir.path());
        journal.append(&success("MyNFT")).await.unwrap();

        let path = journal.path_for(&key());
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{\"run_key\": \"sepolia/MyNF");
        std::fs::write(&path, raw).unwrap();

        let entries = read_entries(&journal, &key()).await.unwrap();
        assert_eq!(entries.len(), 1);

        journal.append(&success("Market")).await.unwrap();
        let entries = read_entries(&journal, &key()).await.unwrap();
        let ids: Vec<&str> = entries.iter().map(|entry| entry.future_id.as_str()).collect();
        assert_eq!(ids, vec!["MyNFTCollection#MyNFT", "MyNFTCollection#Market"]);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
    }

    #[tokio::test]
    async fn complete_last_line_without_newline_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JsonlJournal::new(dir.path());
        journal.append(&success("MyNFT")).await.unwrap();

        let path = journal.path_for(&key());
        let raw = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, raw.trim_end()).unwrap();

        journal.append(&success("Market")).await.unwrap();
        assert_eq!(read_entries(&journal, &key()).await.unwrap().len(), 2);
    }
}
