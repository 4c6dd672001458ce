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

//! The backend-independent device contract, and the factory that picks a
//! backend from a packaged artifact.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context;

use crate::args::{ArgInfo, BufferArg, Tag};
use crate::cosim::{CosimDevice, CosimOptions};
use crate::stream::SharedMemoryStream;
use crate::Error;

/// One uniform execution protocol over every backend: bind arguments by
/// index, schedule transfers, execute, wait or cancel, read timing.
///
/// A run is: bind → `write_to_device()` → `exec()` → `read_from_device()`
/// → `finish()`; `write_to_device()`/`read_from_device()` only schedule, the
/// transfers happen at `exec()` and `finish()` respectively, mirroring how a
/// physical accelerator pipelines enqueued transfers with kernel launches.
pub trait Device {
    /// Binds a scalar argument from its raw little-endian bytes.
    fn set_scalar_arg(&mut self, index: usize, arg: &[u8]) -> Result<(), Error>;

    /// Binds a buffer argument; `tag` is the simulator's access direction.
    fn set_buffer_arg(&mut self, index: usize, tag: Tag, arg: &BufferArg) -> Result<(), Error>;

    /// Binds a stream argument to an already-open shared queue.
    fn set_stream_arg(
        &mut self,
        index: usize,
        tag: Tag,
        arg: Rc<SharedMemoryStream>,
    ) -> Result<(), Error>;

    /// Removes `index` from the transfer schedules; returns how many
    /// schedule entries were removed.
    fn suspend_buffer(&mut self, index: usize) -> usize;

    fn write_to_device(&mut self);
    fn read_from_device(&mut self);
    fn exec(&mut self) -> anyhow::Result<()>;

    /// Blocks until the run completes and collects scheduled outputs.
    fn finish(&mut self) -> anyhow::Result<()>;

    /// Cancels a running run; idempotent, never blocks, gives no
    /// partial-result guarantee.
    fn kill(&mut self);

    /// Non-blocking completion poll.
    fn is_finished(&mut self) -> bool;

    fn args_info(&self) -> &[ArgInfo];

    fn load_time(&self) -> Duration;
    fn compute_time(&self) -> Duration;
    fn store_time(&self) -> Duration;
    fn load_bytes(&self) -> usize;
    fn store_bytes(&self) -> usize;
}

const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";

/// Selects a backend by sniffing the packaged artifact's leading bytes.
///
/// A ZIP-packaged artifact selects the cosimulation backend. An
/// unrecognized format is not an error: it yields `None` so the caller can
/// try other backends.
pub fn new_device(path: &Path, options: CosimOptions) -> anyhow::Result<Option<Box<dyn Device>>> {
    let mut file =
        File::open(path).with_context(|| format!("open artifact '{}'", path.display()))?;
    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) => {}
        // A file shorter than the magic cannot be a packaged artifact.
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            log::debug!("'{}' is too short to be a packaged artifact", path.display());
            return Ok(None);
        }
        Err(e) => {
            return Err(e).with_context(|| format!("read artifact '{}'", path.display()));
        }
    }
    if magic != ZIP_MAGIC {
        log::debug!("'{}' is not a packaged artifact we recognize", path.display());
        return Ok(None);
    }
    Ok(Some(Box::new(CosimDevice::new(path, options)?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_factory_selects_cosim_for_zip_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("kernel.xo");
        std::fs::write(&artifact, b"PK\x03\x04 rest of the archive").unwrap();
        std::fs::write(
            dir.path().join("kernel.args.json"),
            r#"[{"index": 0, "name": "n", "type": "uint64_t", "category": "scalar"}]"#,
        )
        .unwrap();

        let device = new_device(&artifact, CosimOptions::default())
            .unwrap()
            .expect("zip magic must select the cosim backend");
        assert_eq!(device.args_info().len(), 1);
    }

    #[test]
    fn test_factory_yields_none_for_unknown_formats() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"ELF or whatever, not a zip").unwrap();
        assert!(new_device(file.path(), CosimOptions::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_factory_yields_none_for_truncated_artifacts() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"PK").unwrap();
        assert!(new_device(file.path(), CosimOptions::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_factory_errors_on_unreadable_artifacts() {
        assert!(new_device(Path::new("/nonexistent/kernel.xo"), CosimOptions::default()).is_err());
    }
}
