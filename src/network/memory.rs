//! Instrumented in-memory content network.
//!
//! Records every call, counts how many calls are in progress at once and can
//! be told to fail or to hold each call for a while, which is what the
//! engine tests need to observe concurrency and cleanup behaviour.

use super::{ContentNetwork, NetworkError};
use crate::storage::ObjectReader;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// What was added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddKind {
    /// A stream, with its full contents.
    Stream { bytes: Vec<u8> },
    /// A directory, with the slash-separated relative paths of its files.
    Directory { path: PathBuf, files: Vec<String> },
}

/// A recorded add call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddCall {
    pub name: String,
    pub kind: AddKind,
}

#[derive(Default)]
struct Inner {
    content_id: Mutex<String>,
    failure: Mutex<Option<String>>,
    delay: Mutex<Duration>,
    adds: Mutex<Vec<AddCall>>,
    unpins: Mutex<Vec<String>>,
    current: AtomicUsize,
    peak: AtomicUsize,
}

/// Fake content network. Clones share state.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Inner>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new("QmMemory")
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryNetwork {
    /// Creates a network whose adds return `content_id`.
    pub fn new(content_id: impl Into<String>) -> Self {
        let inner = Inner::default();
        *inner.content_id.lock() = content_id.into();
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Makes every subsequent call fail with `message` (`None` to recover).
    pub fn fail_with(&self, message: Option<&str>) {
        *self.inner.failure.lock() = message.map(str::to_string);
    }

    /// Holds every call for `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.inner.delay.lock() = delay;
    }

    pub fn adds(&self) -> Vec<AddCall> {
        self.inner.adds.lock().clone()
    }

    pub fn unpins(&self) -> Vec<String> {
        self.inner.unpins.lock().clone()
    }

    /// Calls currently in progress.
    pub fn in_flight(&self) -> usize {
        self.inner.current.load(Ordering::SeqCst)
    }

    /// Highest number of calls ever in progress at once.
    pub fn peak_in_flight(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }

    /// Counts the call as in flight, applies the delay and the failure switch.
    async fn enter(&self) -> Result<InFlight<'_>, NetworkError> {
        let now = self.inner.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.inner.current);

        let delay = *self.inner.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.inner.failure.lock().clone() {
            return Err(NetworkError::Api {
                status: 500,
                message,
            });
        }
        Ok(guard)
    }
}

fn list_files(root: &Path) -> std::io::Result<Vec<String>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                pending.push(entry.path());
            } else if let Ok(relative) = entry.path().strip_prefix(root) {
                files.push(
                    relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/"),
                );
            }
        }
    }
    files.sort();
    Ok(files)
}

#[async_trait]
impl ContentNetwork for MemoryNetwork {
    async fn add_stream(
        &self,
        name: &str,
        mut reader: ObjectReader,
    ) -> Result<String, NetworkError> {
        let _in_flight = self.enter().await?;
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await?;
        self.inner.adds.lock().push(AddCall {
            name: name.to_string(),
            kind: AddKind::Stream { bytes },
        });
        Ok(self.inner.content_id.lock().clone())
    }

    async fn add_dir(&self, path: &Path) -> Result<String, NetworkError> {
        let _in_flight = self.enter().await?;
        let files = list_files(path)?;
        self.inner.adds.lock().push(AddCall {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            kind: AddKind::Directory {
                path: path.to_path_buf(),
                files,
            },
        });
        Ok(self.inner.content_id.lock().clone())
    }

    async fn unpin(&self, content_id: &str) -> Result<(), NetworkError> {
        let _in_flight = self.enter().await?;
        self.inner.unpins.lock().push(content_id.to_string());
        Ok(())
    }
}
