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

//! A lock-free single-producer single-consumer queue of fixed-width records,
//! backed by a memory-mapped file so that two independent processes can
//! share it.
//!
//! All operations are non-blocking; flow control is entirely the caller's
//! responsibility through `empty()`/`full()`. Violating a precondition
//! (push on full, pop on empty) is a defect in the caller and panics.

use std::fs::File;
use std::ops::Range;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::Context;
use memmap2::MmapMut;

use crate::Error;

const MAGIC: [u8; 4] = *b"shmq";
const VERSION: i32 = 1;

/// File layout: this header, then `depth * width` data bytes.
#[repr(C)]
struct QueueHeader {
    magic: [u8; 4],
    version: i32,
    depth: i32,
    width: i32,
    tail: AtomicI64,
    head: AtomicI64,
}

const HEADER_LEN: usize = std::mem::size_of::<QueueHeader>();
const _: () = assert!(HEADER_LEN == 32);

#[derive(Debug)]
pub struct SharedMemoryQueue {
    mmap: MmapMut,
}

impl SharedMemoryQueue {
    /// Initializes `file` as an empty queue of `depth` records of `width`
    /// bytes each and maps it.
    pub fn create(file: &File, depth: i32, width: i32) -> anyhow::Result<Self> {
        if depth <= 0 || width <= 0 {
            return Err(Error::QueueFormat(format!(
                "non-positive depth {} or width {}",
                depth, width
            ))
            .into());
        }
        file.set_len((HEADER_LEN + depth as usize * width as usize) as u64)
            .context("resize queue backing file")?;
        let mut mmap = unsafe { MmapMut::map_mut(file) }.context("map queue backing file")?;
        {
            let header = unsafe { &mut *(mmap.as_mut_ptr() as *mut QueueHeader) };
            header.magic = MAGIC;
            header.version = VERSION;
            header.depth = depth;
            header.width = width;
            *header.tail.get_mut() = 0;
            *header.head.get_mut() = 0;
        }
        mmap.flush().context("sync queue header")?;
        Ok(Self { mmap })
    }

    /// Maps an existing queue file, validating its header.
    pub fn open(file: &File) -> anyhow::Result<Self> {
        let mmap = unsafe { MmapMut::map_mut(file) }.context("map queue backing file")?;
        if mmap.len() < HEADER_LEN {
            return Err(Error::QueueFormat(format!(
                "file too short for a queue header: {} bytes",
                mmap.len()
            ))
            .into());
        }
        let queue = Self { mmap };
        let header = queue.header();
        if header.magic != MAGIC {
            return Err(Error::QueueFormat(format!(
                "unexpected magic {:?}; want {:?}",
                header.magic, MAGIC
            ))
            .into());
        }
        if header.version != VERSION {
            return Err(Error::QueueFormat(format!(
                "unexpected version {}; want {}",
                header.version, VERSION
            ))
            .into());
        }
        if header.depth <= 0 || header.width <= 0 {
            return Err(Error::QueueFormat(format!(
                "non-positive depth {} or width {}",
                header.depth, header.width
            ))
            .into());
        }
        let want_len = HEADER_LEN + header.depth as usize * header.width as usize;
        if queue.mmap.len() != want_len {
            return Err(Error::QueueFormat(format!(
                "unexpected mapping length {}; want {}",
                queue.mmap.len(),
                want_len
            ))
            .into());
        }
        Ok(queue)
    }

    fn header(&self) -> &QueueHeader {
        unsafe { &*(self.mmap.as_ptr() as *const QueueHeader) }
    }

    /// Byte range of the data slot for sequence number `seq`.
    fn slot(&self, seq: i64) -> Range<usize> {
        let header = self.header();
        let offset = HEADER_LEN
            + (seq % header.depth as i64) as usize * header.width as usize;
        offset..offset + header.width as usize
    }

    /// Number of records currently in the queue.
    pub fn size(&self) -> i64 {
        let header = self.header();
        header.head.load(Ordering::Acquire) - header.tail.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> i64 {
        self.header().depth as i64
    }

    /// Bytes per record, fixed for the queue's lifetime.
    pub fn width(&self) -> usize {
        self.header().width as usize
    }

    pub fn empty(&self) -> bool {
        self.size() <= 0
    }

    pub fn full(&self) -> bool {
        self.size() >= self.capacity()
    }

    /// The oldest record, without removing it.
    pub fn front(&self) -> Vec<u8> {
        let tail = self.header().tail.load(Ordering::Acquire);
        self.mmap[self.slot(tail)].to_vec()
    }

    pub fn pop(&mut self) -> Vec<u8> {
        assert!(!self.empty(), "pop called on an empty queue");
        let val = self.front();
        // The slot's bytes were already copied out; publishing the new tail
        // is a single atomic increment.
        self.header().tail.fetch_add(1, Ordering::Release);
        val
    }

    pub fn push(&mut self, record: &[u8]) {
        assert!(!self.full(), "push called on a full queue");
        assert_eq!(
            record.len(),
            self.width(),
            "unexpected record width: {} bytes",
            record.len()
        );
        let head = self.header().head.load(Ordering::Acquire);
        let range = self.slot(head);
        self.mmap[range].copy_from_slice(record);
        // Sync the record to the backing file before publishing the new
        // head, so the peer process never observes an unwritten slot.
        if let Err(e) = self.mmap.flush() {
            panic!("failed to sync shared queue: {}", e);
        }
        self.header().head.fetch_add(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::collections::VecDeque;
    use std::io::Write;

    fn new_queue(depth: i32, width: i32) -> SharedMemoryQueue {
        let file = tempfile::tempfile().unwrap();
        SharedMemoryQueue::create(&file, depth, width).unwrap()
    }

    #[test]
    fn test_capacity_four() {
        let mut queue = new_queue(4, 1);
        assert!(queue.empty());
        assert!(!queue.full());
        for byte in 0u8..4 {
            assert!(!queue.full());
            queue.push(&[byte]);
        }
        assert!(queue.full());
        assert_eq!(queue.size(), 4);

        assert_eq!(queue.pop(), vec![0]);
        assert!(!queue.full());
        assert_eq!(queue.size(), 3);
    }

    #[test]
    #[should_panic(expected = "push called on a full queue")]
    fn test_push_on_full_panics() {
        let mut queue = new_queue(1, 1);
        queue.push(&[1]);
        queue.push(&[2]);
    }

    #[test]
    #[should_panic(expected = "pop called on an empty queue")]
    fn test_pop_on_empty_panics() {
        let mut queue = new_queue(1, 1);
        queue.pop();
    }

    #[test]
    fn test_front_does_not_remove() {
        let mut queue = new_queue(2, 4);
        queue.push(b"abcd");
        assert_eq!(queue.front(), b"abcd".to_vec());
        assert_eq!(queue.front(), b"abcd".to_vec());
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.pop(), b"abcd".to_vec());
        assert!(queue.empty());
    }

    #[test]
    fn test_fifo_against_model() {
        let mut rng = rand::thread_rng();
        let mut queue = new_queue(8, 2);
        let mut model: VecDeque<[u8; 2]> = VecDeque::new();
        let mut next = 0u16;
        for _ in 0..10_000 {
            if rng.gen_bool(0.5) && !queue.full() {
                let record = next.to_le_bytes();
                queue.push(&record);
                model.push_back(record);
                next = next.wrapping_add(1);
            } else if !queue.empty() {
                assert_eq!(queue.pop(), model.pop_front().unwrap().to_vec());
            }
            assert_eq!(queue.size() as usize, model.len());
            assert!(queue.size() >= 0 && queue.size() <= queue.capacity());
        }
    }

    #[test]
    fn test_two_mappings_share_state() {
        // A producer and a consumer mapping the same backing file see each
        // other's pushes and pops, as two processes would.
        let file = tempfile::tempfile().unwrap();
        let mut producer = SharedMemoryQueue::create(&file, 4, 8).unwrap();
        let mut consumer = SharedMemoryQueue::open(&file).unwrap();

        producer.push(b"record_a");
        producer.push(b"record_b");
        assert_eq!(consumer.size(), 2);
        assert_eq!(consumer.pop(), b"record_a".to_vec());
        assert_eq!(producer.size(), 1);
        assert_eq!(consumer.pop(), b"record_b".to_vec());
        assert!(producer.empty());
    }

    #[test]
    fn test_open_rejects_garbage() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"not a queue header at all, sorry").unwrap();
        assert!(SharedMemoryQueue::open(&file).is_err());
    }

    #[test]
    fn test_create_rejects_non_positive_dimensions() {
        let file = tempfile::tempfile().unwrap();
        assert!(SharedMemoryQueue::create(&file, 0, 4).is_err());
        assert!(SharedMemoryQueue::create(&file, 4, 0).is_err());
    }
}
