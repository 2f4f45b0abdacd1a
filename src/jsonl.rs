//! Append-only JSON-lines files behind the durable log and account store.
//!
//! Every append is flushed and synced before it returns. The file only ever
//! grows by whole lines: a final line without its newline is a torn write
//! and is cut off on open, and an append that fails is cut back off the file.

use std::io;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{error, warn};

/// A complete line read back on open.
#[derive(Debug)]
pub(crate) struct Line {
    /// 1-based line number in the file
    pub(crate) number: usize,
    pub(crate) bytes: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct JsonLines {
    file: File,
    /// Offset just past the last complete line
    len: u64,
    /// Set when a failed append could not be cut back off
    poisoned: bool,
}

impl JsonLines {
    /// Open (or create) `path` and return its complete, non-blank lines.
    pub(crate) async fn open(path: &Path) -> io::Result<(Self, Vec<Line>)> {
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };
        let valid = content
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |idx| idx + 1);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        if valid < content.len() {
            warn!(
                path = %path.display(),
                discarded = content.len() - valid,
                "truncating torn write at end of file"
            );
            file.set_len(valid as u64).await?;
            file.sync_data().await?;
        }

        let lines = content[..valid]
            .split(|&b| b == b'\n')
            .enumerate()
            .filter(|(_, bytes)| !bytes.iter().all(u8::is_ascii_whitespace))
            .map(|(idx, bytes)| Line {
                number: idx + 1,
                bytes: bytes.to_vec(),
            })
            .collect();

        Ok((
            Self {
                file,
                len: valid as u64,
                poisoned: false,
            },
            lines,
        ))
    }

    /// Append `line` plus a newline and sync it to disk.
    pub(crate) async fn append(&mut self, line: &[u8]) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other(
                "file left inconsistent by an earlier failed append",
            ));
        }

        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line);
        buf.push(b'\n');

        match self.write_synced(&buf).await {
            Ok(()) => {
                self.len += buf.len() as u64;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = self.file.set_len(self.len).await {
                    error!(reason = %rollback, "failed to cut back a failed append");
                    self.poisoned = true;
                }
                Err(e)
            }
        }
    }

    async fn write_synced(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf).await?;
        // surfaces errors from the background write
        self.file.flush().await?;
        self.file.sync_data().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn texts(lines: &[Line]) -> Vec<(usize, String)> {
        lines
            .iter()
            .map(|l| (l.number, String::from_utf8_lossy(&l.bytes).to_string()))
            .collect()
    }

    #[tokio::test]
    async fn open_creates_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("new.jsonl");
        let (_, lines) = JsonLines::open(&path).await.unwrap();
        assert!(lines.is_empty());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn appended_lines_are_read_back_with_numbers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lines.jsonl");
        {
            let (mut file, _) = JsonLines::open(&path).await.unwrap();
            file.append(b"{\"a\":1}").await.unwrap();
            file.append(b"{\"a\":2}").await.unwrap();
        }
        let (_, lines) = JsonLines::open(&path).await.unwrap();
        assert_eq!(
            texts(&lines),
            vec![(1, "{\"a\":1}".to_string()), (2, "{\"a\":2}".to_string())]
        );
    }

    #[tokio::test]
    async fn torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("torn.jsonl");
        std::fs::write(&path, "{\"a\":1}\n{\"a\":").unwrap();

        let (mut file, lines) = JsonLines::open(&path).await.unwrap();
        assert_eq!(texts(&lines), vec![(1, "{\"a\":1}".to_string())]);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\":1}\n");

        file.append(b"{\"a\":2}").await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "{\"a\":1}\n{\"a\":2}\n"
        );
    }

    #[tokio::test]
    async fn failed_append_poisons_when_it_cannot_be_cut_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("readonly.jsonl");
        std::fs::write(&path, "{\"a\":1}\n").unwrap();

        // writes and truncation both fail on a read-only handle
        let file = OpenOptions::new().read(true).open(&path).await.unwrap();
        let mut lines = JsonLines {
            file,
            len: 8,
            poisoned: false,
        };

        assert!(lines.append(b"{\"a\":2}").await.is_err());
        assert!(lines.poisoned);
        let err = lines.append(b"{\"a\":3}").await.unwrap_err();
        assert!(err.to_string().contains("inconsistent"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\":1}\n");
    }
}
