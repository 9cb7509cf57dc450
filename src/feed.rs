use crate::supervisor::StopSignal;
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("failed to subscribe to {path}: {source}")]
    Subscribe {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read stream: {0}")]
    Read(#[from] std::io::Error),
    #[error("malformed stream item: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl StreamError {
    /// Fatal errors end the subscription; a malformed item only skips itself.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Malformed(_))
    }
}

pub type EventStream<T> = Box<dyn Iterator<Item = Result<T, StreamError>> + Send>;

/// A subscribable stream of items. Each subscription replays the source's
/// recent backlog before following new items, and ends once `stop` is
/// signalled.
pub trait EventSource: Send + Sync {
    type Item;

    fn subscribe(&self, stop: &StopSignal) -> Result<EventStream<Self::Item>, StreamError>;
}

/// Event source over a JSON-lines file that other processes append to.
pub struct JsonlFeed<T> {
    path: PathBuf,
    backlog: usize,
    poll_interval: Duration,
    _item: PhantomData<fn() -> T>,
}

impl<T> JsonlFeed<T> {
    pub fn new(path: impl AsRef<Path>, backlog: usize, poll_interval: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            backlog,
            poll_interval,
            _item: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T: DeserializeOwned + Send + 'static> EventSource for JsonlFeed<T> {
    type Item = T;

    fn subscribe(&self, stop: &StopSignal) -> Result<EventStream<T>, StreamError> {
        let file = File::open(&self.path).map_err(|source| StreamError::Subscribe {
            path: self.path.display().to_string(),
            source,
        })?;

        let mut stream = JsonlStream {
            reader: BufReader::new(file),
            pending: VecDeque::new(),
            partial: Vec::new(),
            stop: stop.clone(),
            poll_interval: self.poll_interval,
            _item: PhantomData,
        };
        stream.load_backlog(self.backlog)?;

        log::debug!(
            "Subscribed to {} with {} backlog items",
            self.path.display(),
            stream.pending.len()
        );
        Ok(Box::new(stream))
    }
}

struct JsonlStream<T> {
    reader: BufReader<File>,
    pending: VecDeque<Vec<u8>>,
    /// Bytes of a line whose newline has not been written yet.
    partial: Vec<u8>,
    stop: StopSignal,
    poll_interval: Duration,
    _item: PhantomData<fn() -> T>,
}

impl<T> JsonlStream<T> {
    fn load_backlog(&mut self, backlog: usize) -> Result<(), StreamError> {
        while self.read_available()? {
            while self.pending.len() > backlog {
                self.pending.pop_front();
            }
        }
        Ok(())
    }

    /// Read one chunk. Returns false at end of file.
    ///
    /// Lines are kept as raw bytes; a line that is not valid UTF-8 fails
    /// to parse on its own instead of failing the read.
    fn read_available(&mut self) -> Result<bool, StreamError> {
        if self.reader.read_until(b'\n', &mut self.partial)? == 0 {
            return Ok(false);
        }
        if self.partial.ends_with(b"\n") {
            let line = std::mem::take(&mut self.partial);
            if !line.iter().all(u8::is_ascii_whitespace) {
                self.pending.push_back(line);
            }
        }
        Ok(true)
    }
}

impl<T: DeserializeOwned> Iterator for JsonlStream<T> {
    type Item = Result<T, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Some(serde_json::from_slice(&line).map_err(StreamError::from));
            }
            if self.stop.is_stopped() {
                return None;
            }
            match self.read_available() {
                Ok(true) => {}
                Ok(false) => {
                    if self.stop.wait_timeout(self.poll_interval) {
                        return None;
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use std::thread;
    use tempfile::TempDir;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Item {
        id: u32,
    }

    fn feed_file(content: &[u8]) -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modlog.jsonl");
        fs::write(&path, content).unwrap();
        (dir, path)
    }

    fn append(path: &Path, content: &[u8]) {
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(content).unwrap();
    }

    #[test]
    fn test_replays_only_recent_backlog() {
        let (_dir, path) = feed_file(b"{\"id\":1}\n{\"id\":2}\n\n{\"id\":3}\n");
        let feed: JsonlFeed<Item> = JsonlFeed::new(&path, 2, Duration::from_millis(5));
        let stop = StopSignal::new();
        let mut stream = feed.subscribe(&stop).unwrap();

        assert_eq!(stream.next().unwrap().unwrap(), Item { id: 2 });
        assert_eq!(stream.next().unwrap().unwrap(), Item { id: 3 });
        stop.stop();
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_follows_appended_and_partial_lines() {
        let (_dir, path) = feed_file(b"{\"id\":1}\n{\"id\"");
        let feed: JsonlFeed<Item> = JsonlFeed::new(&path, 10, Duration::from_millis(5));
        let stop = StopSignal::new();
        let mut stream = feed.subscribe(&stop).unwrap();
        assert_eq!(stream.next().unwrap().unwrap(), Item { id: 1 });

        let writer_path = path.clone();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            append(&writer_path, b":2}\n{\"id\":3}\n");
        });

        assert_eq!(stream.next().unwrap().unwrap(), Item { id: 2 });
        assert_eq!(stream.next().unwrap().unwrap(), Item { id: 3 });
        writer.join().unwrap();
    }

    #[test]
    fn test_malformed_line_is_not_fatal() {
        let (_dir, path) = feed_file(b"not json\n{\"id\":7}\n");
        let feed: JsonlFeed<Item> = JsonlFeed::new(&path, 10, Duration::from_millis(5));
        let stop = StopSignal::new();
        let mut stream = feed.subscribe(&stop).unwrap();

        let error = stream.next().unwrap().unwrap_err();
        assert!(!error.is_fatal());
        assert_eq!(stream.next().unwrap().unwrap(), Item { id: 7 });
    }

    #[test]
    fn test_invalid_utf8_line_is_skipped_in_backlog_and_tail() {
        let (_dir, path) = feed_file(b"{\"id\":1}\n{\"id\":\xff}\n{\"id\":3}\n");
        let feed: JsonlFeed<Item> = JsonlFeed::new(&path, 10, Duration::from_millis(5));

        // every subscription must still come up
        for _ in 0..3 {
            let stop = StopSignal::new();
            let mut stream = feed.subscribe(&stop).unwrap();
            assert_eq!(stream.next().unwrap().unwrap(), Item { id: 1 });
            assert!(!stream.next().unwrap().unwrap_err().is_fatal());
            assert_eq!(stream.next().unwrap().unwrap(), Item { id: 3 });
        }

        let stop = StopSignal::new();
        let mut stream = feed.subscribe(&stop).unwrap();
        for _ in 0..3 {
            stream.next().unwrap().ok();
        }
        append(&path, b"\xfe\xfe\n{\"id\":4}\n");
        assert!(!stream.next().unwrap().unwrap_err().is_fatal());
        assert_eq!(stream.next().unwrap().unwrap(), Item { id: 4 });
    }

    #[test]
    fn test_missing_file_fails_subscription() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.jsonl");
        let feed: JsonlFeed<Item> = JsonlFeed::new(&path, 10, Duration::from_millis(5));
        let error = feed.subscribe(&StopSignal::new()).err().unwrap();
        assert!(error.is_fatal());
        assert!(error.to_string().contains("missing.jsonl"));
    }
}
