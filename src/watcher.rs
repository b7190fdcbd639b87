//! Incremental log tailing for the watch loop.
//!
//! Reads bytes appended to the agent's output log since the last poll,
//! returning only complete lines. Uses synchronous `std::fs` reads since
//! these are quick local operations. The cursor is held in memory only:
//! a fresh tailer starts at the current end of file, so history is never
//! re-evaluated after a restart.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::Context;

/// Tracks a read cursor into the agent output log.
#[derive(Debug)]
pub struct LogTailer {
    path: PathBuf,
    cursor: u64,
    /// Partial trailing data carried between polls until its newline arrives.
    pending: Vec<u8>,
}

impl LogTailer {
    /// Create a tailer positioned at the current end of the log.
    ///
    /// A missing file positions the cursor at zero; the file may appear
    /// later once the supervised process starts writing.
    pub fn new(path: &Path) -> Self {
        let cursor = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        Self {
            path: path.to_path_buf(),
            cursor,
            pending: Vec::new(),
        }
    }

    /// Read any complete lines appended since the last poll.
    ///
    /// Advances the cursor past everything read; a trailing partial line
    /// is buffered and returned on a later poll once its newline arrives.
    /// A file that shrank (externally truncated) resets the cursor to
    /// zero; a missing file yields no lines.
    ///
    /// # Errors
    ///
    /// Returns an error if the log file exists but cannot be opened or
    /// read.
    pub fn poll_lines(&mut self) -> anyhow::Result<Vec<String>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut file = std::fs::File::open(&self.path)
            .with_context(|| format!("failed to open log file {}", self.path.display()))?;

        let file_len = file
            .metadata()
            .with_context(|| format!("failed to read metadata for {}", self.path.display()))?
            .len();

        // If the file shrank, start over and drop any stale partial line.
        if file_len < self.cursor {
            self.cursor = 0;
            self.pending.clear();
        }

        if file_len == self.cursor {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.cursor))
            .with_context(|| format!("failed to seek in {}", self.path.display()))?;

        let mut appended = Vec::new();
        file.read_to_end(&mut appended)
            .with_context(|| format!("failed to read from {}", self.path.display()))?;
        self.cursor = file_len;

        self.pending.extend_from_slice(&appended);

        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=newline).collect();
            line.pop(); // strip '\n'
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }

        Ok(lines)
    }

    /// Current byte offset of the read cursor.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn append(path: &Path, data: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open log");
        file.write_all(data.as_bytes()).expect("append");
    }

    #[test]
    fn starts_at_end_of_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("agent.log");
        append(&path, "history line\n");

        let mut tailer = LogTailer::new(&path);
        assert!(tailer.poll_lines().expect("poll").is_empty());

        append(&path, "new line\n");
        assert_eq!(tailer.poll_lines().expect("poll"), vec!["new line"]);
    }

    #[test]
    fn partial_line_waits_for_newline() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("agent.log");

        let mut tailer = LogTailer::new(&path);
        append(&path, "incomplete");
        assert!(tailer.poll_lines().expect("poll").is_empty());

        append(&path, " but finished\nnext");
        assert_eq!(
            tailer.poll_lines().expect("poll"),
            vec!["incomplete but finished"]
        );

        append(&path, "\n");
        assert_eq!(tailer.poll_lines().expect("poll"), vec!["next"]);
    }

    #[test]
    fn multiple_lines_in_one_poll_stay_ordered() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("agent.log");

        let mut tailer = LogTailer::new(&path);
        append(&path, "a\nb\nc\n");
        assert_eq!(tailer.poll_lines().expect("poll"), vec!["a", "b", "c"]);
    }

    #[test]
    fn missing_file_yields_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut tailer = LogTailer::new(&dir.path().join("agent.log"));
        assert!(tailer.poll_lines().expect("poll").is_empty());
    }

    #[test]
    fn shrunken_file_resets_cursor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("agent.log");
        append(&path, "old content that will vanish\n");

        let mut tailer = LogTailer::new(&path);
        std::fs::write(&path, "fresh\n").expect("truncate");

        assert_eq!(tailer.poll_lines().expect("poll"), vec!["fresh"]);
        assert_eq!(tailer.cursor(), 6);
    }

    #[test]
    fn crlf_line_endings_are_stripped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("agent.log");

        let mut tailer = LogTailer::new(&path);
        append(&path, "windows style\r\n");
        assert_eq!(tailer.poll_lines().expect("poll"), vec!["windows style"]);
    }
}
