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

//! Accelerator argument descriptions and the value types bound to them.

use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::Error;

/// The declared category of an accelerator argument.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ArgCat {
    Scalar,
    Mmap,
    Stream,
    StreamArray,
}

impl fmt::Display for ArgCat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Scalar => write!(f, "scalar"),
            Self::Mmap => write!(f, "mmap"),
            Self::Stream => write!(f, "stream"),
            Self::StreamArray => write!(f, "stream array"),
        }
    }
}

/// One entry of the packaged argument metadata.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ArgInfo {
    pub index: usize,
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(rename = "category")]
    pub cat: ArgCat,
}

impl fmt::Display for ArgInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ArgInfo: {{index: {}, name: '{}', type: '{}', category: {}}}",
            self.index, self.name, self.type_name, self.cat
        )
    }
}

/// The immutable, ordered table of an accelerator's declared arguments.
///
/// Loaded once from packaged metadata; every later binding is validated
/// against it.
#[derive(Clone, Debug)]
pub struct ArgCatalog {
    args: Vec<ArgInfo>,
}

impl ArgCatalog {
    /// Loads the catalog from an argument-metadata JSON file: an array of
    /// `{index, name, type, category}` objects, indices contiguous from 0.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::MalformedMetadata(format!("'{}': {}", path.display(), e)))?;
        let args: Vec<ArgInfo> = serde_json::from_str(&text)
            .map_err(|e| Error::MalformedMetadata(format!("'{}': {}", path.display(), e)))?;
        for (position, arg) in args.iter().enumerate() {
            if arg.index != position {
                return Err(Error::MalformedMetadata(format!(
                    "expecting argument #{}, got argument #{}",
                    position, arg.index
                )));
            }
        }
        Ok(Self { args })
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ArgInfo> {
        self.args.get(index)
    }

    pub fn args(&self) -> &[ArgInfo] {
        &self.args
    }
}

/// The simulator's access direction for a buffer argument.
///
/// `ReadOnly` buffers are inputs the simulator consumes (staged before
/// launch), `WriteOnly` buffers are outputs it produces (collected after the
/// run), `ReadWrite` is both.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Tag {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Non-owning descriptor of a host-resident buffer handed to a device for
/// DMA-style staging.
///
/// The device copies data out of (and, for outputs, back into) the described
/// range around a run. The caller must keep the allocation alive, and must
/// not touch it between `exec()` and `finish()`, for as long as the binding
/// is in use.
#[derive(Clone, Copy, Debug)]
pub struct BufferArg {
    ptr: *mut u8,
    size_in_bytes: usize,
    count: usize,
}

impl BufferArg {
    pub fn new<T>(data: &mut [T]) -> Self {
        Self {
            ptr: data.as_mut_ptr() as *mut u8,
            size_in_bytes: std::mem::size_of_val(data),
            count: data.len(),
        }
    }

    /// Element count, as declared to the simulator.
    pub fn size_in_count(&self) -> usize {
        self.count
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }

    /// # Safety
    ///
    /// The range described at construction must still be live and unaliased.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr, self.size_in_bytes)
    }

    /// # Safety
    ///
    /// The range described at construction must still be live and unaliased.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.size_in_bytes)
    }
}
