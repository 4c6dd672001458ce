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

//! Per-cycle adapters between a simulated circuit's read/write request
//! signals and a shared queue, implementing a registered valid/ready
//! handshake.
//!
//! The simulated circuit acts on the adapter's answer from the *previous*
//! clock edge, so each adapter keeps one bit of remembered state per
//! channel: whether it reported valid (resp. ready) last cycle. A record
//! presented as valid in cycle k is popped during cycle k+1, and only if
//! the circuit asserted its read enable in cycle k; acting on the queue's
//! current state instead would drop or duplicate records.

use crate::queue::SharedMemoryQueue;

/// Consumer side: the circuit reads records out of the queue.
pub struct IstreamAdapter {
    queue: SharedMemoryQueue,
    last_valid: bool,
}

impl IstreamAdapter {
    pub fn new(queue: SharedMemoryQueue) -> Self {
        Self {
            queue,
            last_valid: false,
        }
    }

    /// One clock edge. `read` is the circuit's read enable for the cycle
    /// that just completed. Returns the record to present and whether it is
    /// valid; a not-valid answer presents a zero-filled placeholder.
    pub fn cycle(&mut self, read: bool) -> (Vec<u8>, bool) {
        if self.last_valid && read {
            // We presented a record last cycle and the circuit consumed it;
            // remove it now.
            assert!(
                !self.queue.empty(),
                "circuit consumed a record the queue no longer holds"
            );
            self.queue.pop();
        }

        if self.queue.empty() {
            self.last_valid = false;
            // Nothing to present; give the producing process a chance to
            // run before the next cycle.
            std::thread::yield_now();
            (vec![0; self.queue.width()], false)
        } else {
            // Present without popping; removal is deferred until the
            // circuit has actually read it.
            self.last_valid = true;
            (self.queue.front(), true)
        }
    }

    pub fn queue(&self) -> &SharedMemoryQueue {
        &self.queue
    }
}

/// Producer side: the circuit writes records into the queue.
pub struct OstreamAdapter {
    queue: SharedMemoryQueue,
    /// `None` until the first cycle has answered.
    last_ready: Option<bool>,
}

impl OstreamAdapter {
    pub fn new(queue: SharedMemoryQueue) -> Self {
        Self {
            queue,
            last_ready: None,
        }
    }

    /// One clock edge. `write` is the circuit's write enable for the cycle
    /// that just completed, `record` the data it drove. Returns whether the
    /// queue can accept a record in the next cycle.
    pub fn cycle(&mut self, record: &[u8], write: bool) -> bool {
        if self.queue.full() {
            // A full queue is only reachable after we reported not-ready,
            // or on the very first cycle; anything else means the circuit
            // wrote through backpressure.
            assert_ne!(
                self.last_ready,
                Some(true),
                "queue filled up although ready was reported last cycle"
            );
            self.last_ready = Some(false);
            // Give the consuming process a chance to drain the queue.
            std::thread::yield_now();
            return false;
        }

        // The circuit writes in the cycle after we reported ready.
        if self.last_ready == Some(true) && write {
            self.queue.push(record);
        }

        let ready = !self.queue.full();
        self.last_ready = Some(ready);
        ready
    }

    pub fn queue(&self) -> &SharedMemoryQueue {
        &self.queue
    }
}
