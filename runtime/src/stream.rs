// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Ownership of a shared queue's backing file, and the registry through
//! which the simulator side of a run finds the queues the host created.

use std::cell::{RefCell, RefMut};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::queue::SharedMemoryQueue;

/// Environment variable naming the simulator-side stream channels, as a
/// comma-separated list of `id:path` pairs. Each path must name an existing
/// queue backing file.
pub const STREAM_ARGS_ENV: &str = "COSIM_STREAM_ARGS";

#[derive(Clone, Debug)]
pub struct StreamOptions {
    /// Queue capacity in records.
    pub depth: i32,
    /// Bytes per record.
    pub width: i32,
    /// Directory for the backing file; a shared-memory filesystem when
    /// available, so per-cycle traffic never hits a disk.
    pub dir: Option<PathBuf>,
}

fn default_dir() -> PathBuf {
    let shm = PathBuf::from("/dev/shm");
    if shm.is_dir() {
        shm
    } else {
        std::env::temp_dir()
    }
}

/// Wrapper of `SharedMemoryQueue` that owns the backing file.
///
/// The file is created on construction and removed when the stream is
/// dropped; devices only ever borrow the stream, they never create or
/// destroy the shared memory themselves.
#[derive(Debug)]
pub struct SharedMemoryStream {
    path: PathBuf,
    queue: RefCell<SharedMemoryQueue>,
    // Held for its Drop impl, which unlinks the backing file.
    _file: tempfile::NamedTempFile,
}

impl SharedMemoryStream {
    pub fn new(options: StreamOptions) -> anyhow::Result<Self> {
        let dir = options.dir.unwrap_or_else(default_dir);
        let file = tempfile::Builder::new()
            .prefix("shared_memory_queue.")
            .tempfile_in(&dir)
            .with_context(|| format!("create queue backing file in '{}'", dir.display()))?;
        let queue = SharedMemoryQueue::create(file.as_file(), options.depth, options.width)?;
        log::debug!(
            "created a depth-{} width-{} stream backed by '{}'",
            options.depth,
            options.width,
            file.path().display()
        );
        Ok(Self {
            path: file.path().to_path_buf(),
            queue: RefCell::new(queue),
            _file: file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The host side of the queue. Runtime-checked borrow so a stream can be
    /// shared with a device while the host keeps pushing and popping.
    pub fn queue(&self) -> RefMut<SharedMemoryQueue> {
        self.queue.borrow_mut()
    }
}

/// The simulator-side view of a run's streams: every queue named by
/// `STREAM_ARGS_ENV`, opened read/write and handed out by id.
///
/// Ownership of each channel is explicit; taking a queue out of the registry
/// is what ties it to one adapter for the rest of the run.
pub struct StreamRegistry {
    streams: HashMap<String, SharedMemoryQueue>,
}

impl StreamRegistry {
    pub fn from_env() -> anyhow::Result<Self> {
        let spec = std::env::var(STREAM_ARGS_ENV)
            .with_context(|| format!("`{}` must be set", STREAM_ARGS_ENV))?;
        log::debug!("{}: {}", STREAM_ARGS_ENV, spec);
        Self::from_spec(&spec)
    }

    pub fn from_spec(spec: &str) -> anyhow::Result<Self> {
        let mut streams = HashMap::new();
        for entry in spec.split(',').filter(|entry| !entry.is_empty()) {
            let (id, path) = entry
                .split_once(':')
                .with_context(|| format!("stream entry '{}' is not `id:path`", entry))?;
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .with_context(|| format!("open stream '{}' at '{}'", id, path))?;
            streams.insert(id.to_string(), SharedMemoryQueue::open(&file)?);
        }
        Ok(Self { streams })
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Hands the queue for `id` to the caller, or `None` if the id is
    /// unknown or was already taken.
    pub fn take(&mut self, id: &str) -> Option<SharedMemoryQueue> {
        self.streams.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_stream(depth: i32, width: i32) -> SharedMemoryStream {
        SharedMemoryStream::new(StreamOptions {
            depth,
            width,
            dir: None,
        })
        .unwrap()
    }

    #[test]
    fn test_stream_owns_backing_file() {
        let path;
        {
            let stream = new_stream(4, 2);
            path = stream.path().to_path_buf();
            assert!(path.exists());
            stream.queue().push(&[1, 2]);
            assert_eq!(stream.queue().pop(), vec![1, 2]);
        }
        assert!(!path.exists(), "backing file must be removed on drop");
    }

    #[test]
    fn test_registry_opens_host_streams() {
        let a = new_stream(4, 2);
        let b = new_stream(8, 4);
        a.queue().push(&[7, 7]);

        let spec = format!("3:{},5:{}", a.path().display(), b.path().display());
        let mut registry = StreamRegistry::from_spec(&spec).unwrap();
        assert_eq!(registry.len(), 2);

        let mut queue_a = registry.take("3").unwrap();
        assert_eq!(queue_a.width(), 2);
        assert_eq!(queue_a.pop(), vec![7, 7]);
        assert!(registry.take("3").is_none(), "a channel is taken only once");

        let queue_b = registry.take("5").unwrap();
        assert_eq!(queue_b.capacity(), 8);
        assert_eq!(queue_b.width(), 4);
    }

    #[test]
    fn test_registry_rejects_malformed_entries() {
        assert!(StreamRegistry::from_spec("no-colon-here").is_err());
        assert!(StreamRegistry::from_spec("0:/nonexistent/queue").is_err());
    }
}
