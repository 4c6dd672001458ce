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

//! The cosimulation device: runs a packaged hardware design inside an
//! external cycle-accurate simulator while presenting the same device
//! interface a physical board would.
//!
//! One run stages bound input buffers to data files, emits a JSON run
//! configuration, launches the simulator subprocess, and on completion
//! reads output data files back into the bound host buffers. Streams are
//! not staged at all: they are shared-memory queues the simulator maps
//! directly and exchanges data with once per simulated cycle.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::Serialize;

use crate::args::{ArgCat, ArgCatalog, ArgInfo, BufferArg, Tag};
use crate::device::Device;
use crate::stream::{SharedMemoryStream, STREAM_ARGS_ENV};
use crate::Error;

/// Simulator launcher looked up on `PATH` unless overridden.
pub const DEFAULT_EXECUTABLE: &str = "fast-cosim";

/// Programmatic equivalents of the simulator launcher's flags.
#[derive(Clone, Debug, Default)]
pub struct CosimOptions {
    /// Use this work directory (created if needed, preserved afterwards)
    /// instead of a temporary one that is removed on drop.
    pub work_dir: Option<PathBuf>,
    /// Use this executable instead of `fast-cosim`.
    pub executable: Option<PathBuf>,
    /// Start the simulator's GUI.
    pub start_gui: bool,
    /// Save the waveform in the work directory.
    pub save_waveform: bool,
    /// Override the target part number.
    pub part_num: Option<String>,
    /// Only set the simulation up; skip result collection.
    pub setup_only: bool,
    /// Skip the simulation itself and go straight to result collection.
    pub resume_from_post_sim: bool,
}

#[derive(Debug)]
enum WorkDir {
    /// Removed when the device is dropped.
    Temp(tempfile::TempDir),
    /// User-specified, preserved.
    Fixed(PathBuf),
}

impl WorkDir {
    fn path(&self) -> &Path {
        match self {
            Self::Temp(dir) => dir.path(),
            Self::Fixed(path) => path,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Configured,
    Running,
    Finished,
    Killed,
}

#[derive(Debug)]
struct RunContext {
    start: Instant,
    child: Child,
}

/// The run-configuration artifact consumed by the simulator subprocess.
/// Field names are the wire format; tables are keyed by argument index as
/// text.
#[derive(Serialize)]
struct RunConfig {
    xo_path: String,
    scalar_to_val: BTreeMap<String, String>,
    axi_to_c_array_size: BTreeMap<String, usize>,
    axi_to_data_file: BTreeMap<String, String>,
    axis_to_data_file: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct CosimDevice {
    xo_path: PathBuf,
    options: CosimOptions,
    work_dir: WorkDir,
    catalog: ArgCatalog,

    scalars: HashMap<usize, String>,
    buffer_table: HashMap<usize, BufferArg>,
    stream_table: BTreeMap<usize, Rc<SharedMemoryStream>>,
    /// Inputs to stage at `exec()`.
    load_indices: BTreeSet<usize>,
    /// Outputs to collect at `finish()`.
    store_indices: BTreeSet<usize>,

    write_scheduled: bool,
    read_scheduled: bool,
    state: State,
    context: Option<RunContext>,

    load_time: Duration,
    compute_time: Duration,
    store_time: Duration,
}

impl CosimDevice {
    /// Binds the argument catalog from the packaged metadata next to the
    /// artifact and allocates the work directory.
    pub fn new(xo_path: &Path, options: CosimOptions) -> anyhow::Result<Self> {
        let xo_path = std::fs::canonicalize(xo_path)
            .with_context(|| format!("resolve artifact '{}'", xo_path.display()))?;
        let catalog = ArgCatalog::load(&metadata_path(&xo_path))?;

        let work_dir = match &options.work_dir {
            Some(dir) => {
                if !dir.is_dir() {
                    std::fs::create_dir_all(dir)
                        .with_context(|| format!("create work directory '{}'", dir.display()))?;
                    log::info!("created work directory '{}'", dir.display());
                }
                WorkDir::Fixed(
                    std::fs::canonicalize(dir)
                        .with_context(|| format!("resolve work directory '{}'", dir.display()))?,
                )
            }
            None => WorkDir::Temp(
                tempfile::Builder::new()
                    .prefix("fast-cosim.")
                    .tempdir()
                    .context("create work directory")?,
            ),
        };

        log::info!(
            "running hardware simulation of '{}' in '{}'",
            xo_path.display(),
            work_dir.path().display()
        );
        Ok(Self {
            xo_path,
            options,
            work_dir,
            catalog,
            scalars: HashMap::new(),
            buffer_table: HashMap::new(),
            stream_table: BTreeMap::new(),
            load_indices: BTreeSet::new(),
            store_indices: BTreeSet::new(),
            write_scheduled: false,
            read_scheduled: false,
            state: State::Configured,
            context: None,
            load_time: Duration::ZERO,
            compute_time: Duration::ZERO,
            store_time: Duration::ZERO,
        })
    }

    pub fn work_dir(&self) -> &Path {
        self.work_dir.path()
    }

    fn check_arg(&self, index: usize, want: ArgCat) -> Result<&ArgInfo, Error> {
        let info = self.catalog.get(index).ok_or(Error::IndexOutOfRange {
            index,
            count: self.catalog.len(),
        })?;
        if info.cat != want {
            return Err(Error::CategoryMismatch {
                index,
                name: info.name.clone(),
                want,
                got: info.cat,
            });
        }
        Ok(info)
    }

    fn input_data_path(&self, index: usize) -> PathBuf {
        self.work_dir.path().join(format!("{}.bin", index))
    }

    fn output_data_path(&self, index: usize) -> PathBuf {
        self.work_dir.path().join(format!("{}_out.bin", index))
    }

    fn config_path(&self) -> PathBuf {
        self.work_dir.path().join("config.json")
    }

    /// Writes every scheduled input buffer to its data file.
    fn stage_buffers(&mut self) -> anyhow::Result<()> {
        let tic = Instant::now();
        for &index in &self.load_indices {
            let arg = self.buffer_table[&index];
            let path = self.input_data_path(index);
            std::fs::write(&path, unsafe { arg.as_slice() })
                .with_context(|| format!("stage argument #{} to '{}'", index, path.display()))?;
        }
        self.load_time = tic.elapsed();
        Ok(())
    }

    /// Reads every scheduled output data file back into its host buffer.
    fn collect_buffers(&mut self) -> anyhow::Result<()> {
        let tic = Instant::now();
        for &index in &self.store_indices {
            let arg = self.buffer_table[&index];
            let path = self.output_data_path(index);
            let data = std::fs::read(&path)
                .with_context(|| format!("collect argument #{} from '{}'", index, path.display()))?;
            let dst = unsafe { arg.as_mut_slice() };
            anyhow::ensure!(
                data.len() >= dst.len(),
                "output file '{}' holds {} bytes; want at least {}",
                path.display(),
                data.len(),
                dst.len()
            );
            dst.copy_from_slice(&data[..dst.len()]);
        }
        self.store_time = tic.elapsed();
        Ok(())
    }

    fn run_config(&self) -> RunConfig {
        let mut config = RunConfig {
            xo_path: self.xo_path.display().to_string(),
            scalar_to_val: BTreeMap::new(),
            axi_to_c_array_size: BTreeMap::new(),
            axi_to_data_file: BTreeMap::new(),
            axis_to_data_file: BTreeMap::new(),
        };
        for (&index, val) in &self.scalars {
            config.scalar_to_val.insert(index.to_string(), val.clone());
        }
        for (&index, arg) in &self.buffer_table {
            config
                .axi_to_c_array_size
                .insert(index.to_string(), arg.size_in_count());
        }
        for &index in &self.load_indices {
            config.axi_to_data_file.insert(
                index.to_string(),
                self.input_data_path(index).display().to_string(),
            );
        }
        for (&index, stream) in &self.stream_table {
            log::debug!("arg[{}] is a stream backed by '{}'", index, stream.path().display());
            config
                .axis_to_data_file
                .insert(index.to_string(), stream.path().display().to_string());
        }
        config
    }

    fn command(&self) -> Command {
        // Resuming from post-sim replaces the simulation with a no-op.
        if self.options.resume_from_post_sim {
            let mut command = Command::new("/bin/sh");
            command.args(["-c", ":"]);
            return command;
        }

        let executable = self
            .options
            .executable
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_EXECUTABLE));
        let mut command = Command::new(executable);
        command
            .arg(format!("--config_path={}", self.config_path().display()))
            .arg(format!(
                "--tb_output_dir={}",
                self.work_dir.path().join("output").display()
            ));
        if self.options.setup_only {
            command.arg("--setup_only");
        } else {
            command.arg("--launch_simulation");
        }
        if self.options.start_gui {
            command.arg("--start_gui");
        }
        if self.options.save_waveform {
            command.arg("--save_waveform");
        }
        if let Some(part_num) = &self.options.part_num {
            command.arg(format!("--part_num={}", part_num));
        }
        command
    }
}

fn metadata_path(xo_path: &Path) -> PathBuf {
    xo_path.with_extension("args.json")
}

impl Device for CosimDevice {
    fn set_scalar_arg(&mut self, index: usize, arg: &[u8]) -> Result<(), Error> {
        self.check_arg(index, ArgCat::Scalar)?;
        // Little-endian: hex digits in memory order.
        let mut val = String::with_capacity(arg.len() * 2);
        for byte in arg {
            val.push_str(&format!("{:02x}", byte));
        }
        self.scalars.insert(index, val);
        Ok(())
    }

    fn set_buffer_arg(&mut self, index: usize, tag: Tag, arg: &BufferArg) -> Result<(), Error> {
        self.check_arg(index, ArgCat::Mmap)?;
        self.buffer_table.insert(index, *arg);
        if tag == Tag::ReadOnly || tag == Tag::ReadWrite {
            self.load_indices.insert(index);
        }
        if tag == Tag::WriteOnly || tag == Tag::ReadWrite {
            self.store_indices.insert(index);
        }
        Ok(())
    }

    fn set_stream_arg(
        &mut self,
        index: usize,
        _tag: Tag,
        arg: Rc<SharedMemoryStream>,
    ) -> Result<(), Error> {
        let info = self.catalog.get(index).ok_or(Error::IndexOutOfRange {
            index,
            count: self.catalog.len(),
        })?;
        if info.cat != ArgCat::Stream && info.cat != ArgCat::StreamArray {
            return Err(Error::CategoryMismatch {
                index,
                name: info.name.clone(),
                want: ArgCat::Stream,
                got: info.cat,
            });
        }
        self.stream_table.insert(index, arg);
        Ok(())
    }

    fn suspend_buffer(&mut self, index: usize) -> usize {
        self.load_indices.remove(&index) as usize + self.store_indices.remove(&index) as usize
    }

    fn write_to_device(&mut self) {
        // Staging is deferred to exec() so late bindings are captured.
        self.write_scheduled = true;
    }

    fn read_from_device(&mut self) {
        self.read_scheduled = true;
    }

    fn exec(&mut self) -> anyhow::Result<()> {
        if self.state == State::Running {
            return Err(Error::RunInFlight.into());
        }
        // A finished or killed device may run again; reap the previous
        // subprocess before replacing it.
        if let Some(context) = self.context.as_mut() {
            let _ = context.child.wait();
        }
        if self.write_scheduled {
            self.stage_buffers()?;
        }

        let start = Instant::now();
        let config_path = self.config_path();
        let config =
            serde_json::to_string_pretty(&self.run_config()).context("serialize run config")?;
        std::fs::write(&config_path, config)
            .with_context(|| format!("write run config '{}'", config_path.display()))?;

        let stream_args = self
            .stream_table
            .iter()
            .map(|(index, stream)| format!("{}:{}", index, stream.path().display()))
            .collect::<Vec<_>>()
            .join(",");

        let mut command = self.command();
        command.env(STREAM_ARGS_ENV, stream_args);
        let child = command
            .spawn()
            .with_context(|| format!("launch simulator {:?}", command.get_program()))?;
        log::info!("launched the simulator subprocess (pid {})", child.id());

        self.context = Some(RunContext { start, child });
        self.state = State::Running;
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        match self.state {
            State::Running => {}
            State::Finished | State::Killed => return Ok(()),
            State::Configured => return Err(Error::NotLaunched.into()),
        }
        let context = match self.context.as_mut() {
            Some(context) => context,
            None => return Err(Error::NotLaunched.into()),
        };

        let status = context
            .child
            .wait()
            .context("wait for the simulator subprocess")?;
        if !status.success() {
            // Partial results are never trusted; this run is over.
            log::error!("simulator subprocess exited with {}", status);
            panic!("simulator subprocess failed: {}", status);
        }

        self.state = State::Finished;
        if self.options.setup_only {
            return Ok(());
        }
        self.compute_time = context.start.elapsed();

        if self.read_scheduled {
            self.collect_buffers()?;
        }
        Ok(())
    }

    fn kill(&mut self) {
        if self.state != State::Running {
            return;
        }
        if let Some(context) = self.context.as_mut() {
            log::warn!("killing the simulator subprocess");
            if let Err(e) = context.child.kill() {
                log::warn!("failed to kill the simulator subprocess: {}", e);
            }
        }
        self.state = State::Killed;
    }

    fn is_finished(&mut self) -> bool {
        match self.state {
            State::Configured => false,
            State::Finished | State::Killed => true,
            State::Running => match self.context.as_mut() {
                Some(context) => match context.child.try_wait() {
                    Ok(status) => status.is_some(),
                    Err(e) => {
                        log::warn!("failed to poll the simulator subprocess: {}", e);
                        false
                    }
                },
                None => false,
            },
        }
    }

    fn args_info(&self) -> &[ArgInfo] {
        self.catalog.args()
    }

    fn load_time(&self) -> Duration {
        self.load_time
    }

    fn compute_time(&self) -> Duration {
        self.compute_time
    }

    fn store_time(&self) -> Duration {
        self.store_time
    }

    fn load_bytes(&self) -> usize {
        self.buffer_table.values().map(BufferArg::size_in_bytes).sum()
    }

    fn store_bytes(&self) -> usize {
        self.store_indices
            .iter()
            .map(|index| self.buffer_table[index].size_in_bytes())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writes a zip-magic artifact with a 3-argument catalog: an input
    /// buffer, an output buffer and a scalar.
    fn make_artifact(dir: &Path) -> PathBuf {
        let artifact = dir.join("kernel.xo");
        std::fs::write(&artifact, b"PK\x03\x04 pretend archive").unwrap();
        std::fs::write(
            dir.join("kernel.args.json"),
            r#"[
                {"index": 0, "name": "in", "type": "uint8_t*", "category": "mmap"},
                {"index": 1, "name": "out", "type": "uint8_t*", "category": "mmap"},
                {"index": 2, "name": "n", "type": "uint64_t", "category": "scalar"}
            ]"#,
        )
        .unwrap();
        artifact
    }

    fn make_device(dir: &Path) -> CosimDevice {
        // Surfaces the subprocess diagnostics when RUST_LOG asks for them.
        let _ = env_logger::try_init();
        let artifact = make_artifact(dir);
        CosimDevice::new(
            &artifact,
            CosimOptions {
                work_dir: Some(dir.join("work")),
                resume_from_post_sim: true,
                ..CosimOptions::default()
            },
        )
        .unwrap()
    }

    /// Swaps the supervised subprocess for `sh -c <script>`, reaping the
    /// original first.
    fn swap_child(device: &mut CosimDevice, script: &str) {
        let context = device.context.as_mut().unwrap();
        context.child.wait().unwrap();
        context.child = Command::new("/bin/sh").args(["-c", script]).spawn().unwrap();
    }

    #[test]
    fn test_missing_metadata_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("kernel.xo");
        std::fs::write(&artifact, b"PK\x03\x04").unwrap();
        let result = CosimDevice::new(&artifact, CosimOptions::default());
        assert!(matches!(
            result.unwrap_err().downcast_ref::<Error>(),
            Some(Error::MalformedMetadata(_))
        ));
    }

    #[test]
    fn test_binding_errors_mutate_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = make_device(dir.path());
        let mut data = [0u8; 16];
        let buffer = BufferArg::new(&mut data);

        assert_eq!(
            device.set_scalar_arg(5, &[0; 8]),
            Err(Error::IndexOutOfRange { index: 5, count: 3 })
        );
        // Binding a scalar to an mmap-declared index fails with a category
        // mismatch and leaves every table untouched.
        assert_eq!(
            device.set_scalar_arg(0, &[0; 8]),
            Err(Error::CategoryMismatch {
                index: 0,
                name: "in".to_string(),
                want: ArgCat::Scalar,
                got: ArgCat::Mmap,
            })
        );
        assert_eq!(
            device.set_buffer_arg(2, Tag::ReadOnly, &buffer),
            Err(Error::CategoryMismatch {
                index: 2,
                name: "n".to_string(),
                want: ArgCat::Mmap,
                got: ArgCat::Scalar,
            })
        );
        assert!(device.scalars.is_empty());
        assert!(device.buffer_table.is_empty());
        assert!(device.load_indices.is_empty());
        assert!(device.store_indices.is_empty());
    }

    #[test]
    fn test_suspend_buffer_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = make_device(dir.path());
        let mut data = [0u8; 16];
        device
            .set_buffer_arg(0, Tag::ReadWrite, &BufferArg::new(&mut data))
            .unwrap();
        assert_eq!(device.suspend_buffer(0), 2);
        assert_eq!(device.suspend_buffer(0), 0);
        assert_eq!(device.suspend_buffer(1), 0);
    }

    #[test]
    fn test_staging_and_run_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = make_device(dir.path());

        let mut input = [0xabu8; 16];
        let mut output = [0u8; 16];
        device
            .set_buffer_arg(0, Tag::ReadOnly, &BufferArg::new(&mut input))
            .unwrap();
        device
            .set_buffer_arg(1, Tag::WriteOnly, &BufferArg::new(&mut output))
            .unwrap();
        device.set_scalar_arg(2, &7u64.to_le_bytes()).unwrap();

        device.write_to_device();
        device.exec().unwrap();

        // Exactly one input data file: the output buffer is not staged.
        let work = dir.path().join("work");
        assert_eq!(std::fs::read(work.join("0.bin")).unwrap(), vec![0xab; 16]);
        assert!(!work.join("1.bin").exists());

        let config: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(work.join("config.json")).unwrap())
                .unwrap();
        assert_eq!(config["scalar_to_val"]["2"], "0700000000000000");
        assert_eq!(config["axi_to_c_array_size"]["0"], 16);
        assert_eq!(config["axi_to_c_array_size"]["1"], 16);
        assert!(config["axi_to_data_file"]["0"]
            .as_str()
            .unwrap()
            .ends_with("0.bin"));
        assert!(config["axi_to_data_file"].get("1").is_none());

        device.finish().unwrap();
        assert!(device.is_finished());
        assert_eq!(device.load_bytes(), 32);
        assert_eq!(device.store_bytes(), 16);
    }

    #[test]
    fn test_finish_collects_scheduled_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = make_device(dir.path());

        let mut output = [0u8; 16];
        device
            .set_buffer_arg(1, Tag::WriteOnly, &BufferArg::new(&mut output))
            .unwrap();
        device.read_from_device();
        device.exec().unwrap();

        // Pretend the simulator produced the output file.
        std::fs::write(dir.path().join("work").join("1_out.bin"), [0x5au8; 16]).unwrap();
        device.finish().unwrap();
        assert_eq!(output, [0x5a; 16]);
    }

    #[test]
    fn test_exec_with_run_in_flight_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = make_device(dir.path());
        device.exec().unwrap();
        assert!(matches!(
            device.exec().unwrap_err().downcast_ref::<Error>(),
            Some(Error::RunInFlight)
        ));
        device.finish().unwrap();
    }

    #[test]
    fn test_finished_device_can_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = make_device(dir.path());

        let mut input = [1u8; 8];
        device
            .set_buffer_arg(0, Tag::ReadOnly, &BufferArg::new(&mut input))
            .unwrap();
        device.write_to_device();
        device.exec().unwrap();
        device.finish().unwrap();
        assert_eq!(device.state, State::Finished);

        // The second run stages the buffer contents afresh.
        input = [2u8; 8];
        device.exec().unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("work").join("0.bin")).unwrap(),
            vec![2u8; 8]
        );
        device.finish().unwrap();
        assert_eq!(device.state, State::Finished);
    }

    #[test]
    fn test_finish_before_exec_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = make_device(dir.path());
        assert!(matches!(
            device.finish().unwrap_err().downcast_ref::<Error>(),
            Some(Error::NotLaunched)
        ));
    }

    #[test]
    fn test_kill_skips_output_collection() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = make_device(dir.path());

        let mut output = [0u8; 16];
        device
            .set_buffer_arg(1, Tag::WriteOnly, &BufferArg::new(&mut output))
            .unwrap();
        device.read_from_device();
        device.exec().unwrap();
        swap_child(&mut device, "sleep 30");

        assert!(!device.is_finished());
        device.kill();
        assert!(device.is_finished());
        assert_eq!(device.state, State::Killed);
        // Killing again is a no-op.
        device.kill();
        assert_eq!(device.state, State::Killed);
        // No output was ever collected; the buffer is untouched.
        assert_eq!(output, [0u8; 16]);

        // Reap the killed child so the test leaves no zombie behind.
        device.context.as_mut().unwrap().child.wait().unwrap();
    }

    #[test]
    #[should_panic(expected = "simulator subprocess failed")]
    fn test_nonzero_exit_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = make_device(dir.path());
        device.exec().unwrap();
        swap_child(&mut device, "exit 2");
        device.finish().unwrap();
    }

    #[test]
    fn test_temp_work_dir_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = make_artifact(dir.path());
        let work;
        {
            let device = CosimDevice::new(&artifact, CosimOptions::default()).unwrap();
            work = device.work_dir().to_path_buf();
            assert!(work.is_dir());
        }
        assert!(!work.exists());
    }
}
