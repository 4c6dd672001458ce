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

//! Runtime for driving a hardware accelerator design that runs inside an
//! external cycle-accurate simulator, through the same device-control
//! interface used for real hardware.
//!
//! The host binds scalar, buffer and stream arguments against the
//! accelerator's packaged argument catalog, launches the simulation
//! subprocess, and exchanges streaming data with the simulated design
//! through shared-memory queues governed by a cycle-delayed valid/ready
//! handshake.

mod args;
mod cosim;
mod device;
mod error;
mod handshake;
mod queue;
mod stream;

pub use crate::args::{ArgCat, ArgCatalog, ArgInfo, BufferArg, Tag};
pub use crate::cosim::{CosimDevice, CosimOptions, DEFAULT_EXECUTABLE};
pub use crate::device::{new_device, Device};
pub use crate::error::Error;
pub use crate::handshake::{IstreamAdapter, OstreamAdapter};
pub use crate::queue::SharedMemoryQueue;
pub use crate::stream::{SharedMemoryStream, StreamOptions, StreamRegistry, STREAM_ARGS_ENV};
