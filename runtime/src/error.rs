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

use std::fmt;

use crate::args::ArgCat;

#[derive(Debug, Eq, PartialEq)]
pub enum Error {
    /// An argument index beyond the catalog's declared range.
    IndexOutOfRange { index: usize, count: usize },
    /// A binding call whose category disagrees with the catalog.
    CategoryMismatch {
        index: usize,
        name: String,
        want: ArgCat,
        got: ArgCat,
    },
    /// The packaged argument metadata could not be understood.
    MalformedMetadata(String),
    /// A mapped queue file whose header failed validation.
    QueueFormat(String),
    /// `exec()` while a run is already in flight (or the device is done).
    RunInFlight,
    /// `finish()` without a preceding `exec()`.
    NotLaunched,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::IndexOutOfRange { index, count } => {
                write!(
                    f,
                    "cannot set argument #{}; there are only {} arguments",
                    index, count
                )
            }
            Self::CategoryMismatch {
                index,
                name,
                want,
                got,
            } => {
                write!(
                    f,
                    "cannot set argument #{} '{}' as a {}; it is a {}",
                    index, name, want, got
                )
            }
            Self::MalformedMetadata(what) => {
                write!(f, "malformed argument metadata: {}", what)
            }
            Self::QueueFormat(what) => write!(f, "bad shared queue: {}", what),
            Self::RunInFlight => write!(f, "a run is already in flight"),
            Self::NotLaunched => write!(f, "exec() must be called before finish()"),
        }
    }
}

// Needed so `anyhow::Result` accepts our definition of errors at the
// orchestration layer.
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}
