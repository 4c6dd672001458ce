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

//! A loopback demonstration of the cosimulation runtime.
//!
//! First half: plays both sides of the streaming protocol in one process.
//! The host pushes words into a shared queue; a pretend simulated circuit,
//! opened through the stream registry exactly as a simulator would, drains
//! them through the cycle-delayed handshake and echoes them into a second
//! queue the host pops.
//!
//! Second half: a complete device run against a packaged artifact in
//! resume-from-post-sim mode, so no actual simulator installation is
//! needed to try the control flow end to end.

use anyhow::Context;
use runtime::{
    new_device, BufferArg, CosimOptions, Device, IstreamAdapter, OstreamAdapter,
    SharedMemoryStream, StreamOptions, StreamRegistry, Tag,
};

const WORDS: u32 = 16;

/// Streams `WORDS` words from the host through the circuit and back, over
/// two shared queues.
fn stream_loopback() -> anyhow::Result<()> {
    let to_circuit = SharedMemoryStream::new(StreamOptions {
        depth: 4,
        width: 4,
        dir: None,
    })?;
    let from_circuit = SharedMemoryStream::new(StreamOptions {
        depth: 4,
        width: 4,
        dir: None,
    })?;

    // The simulator side finds its channels by id, exactly as it would
    // through the environment contract.
    let spec = format!(
        "3:{},4:{}",
        to_circuit.path().display(),
        from_circuit.path().display()
    );
    let mut registry = StreamRegistry::from_spec(&spec)?;
    let mut istream = IstreamAdapter::new(registry.take("3").context("stream 3")?);
    let mut ostream = OstreamAdapter::new(registry.take("4").context("stream 4")?);

    let mut pushed = 0u32;
    let mut echoed: Option<Vec<u8>> = None;
    let mut read_enable = false;
    let mut ready = false;
    let mut received = Vec::new();
    let mut cycles = 0u32;
    while received.len() < WORDS as usize {
        cycles += 1;
        anyhow::ensure!(cycles < 10_000, "loopback wedged after {} cycles", cycles);
        // Host side: feed the input queue and drain the output queue.
        if pushed < WORDS && !to_circuit.queue().full() {
            to_circuit.queue().push(&pushed.to_le_bytes());
            pushed += 1;
        }
        if !from_circuit.queue().empty() {
            let word = from_circuit.queue().pop();
            received.push(u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
        }

        // Circuit side, one clock edge: write back what was latched last
        // cycle, then latch the next valid input word.
        let write = echoed.is_some() && ready;
        let record = echoed.clone().unwrap_or_else(|| vec![0; 4]);
        ready = ostream.cycle(&record, write);
        if write {
            echoed = None;
        }

        let (data, valid) = istream.cycle(read_enable);
        read_enable = valid && echoed.is_none();
        if read_enable {
            echoed = Some(data);
        }
    }

    anyhow::ensure!(
        received == (0..WORDS).collect::<Vec<_>>(),
        "loopback returned {:?}",
        received
    );
    log::info!("streamed {} words through the loopback", WORDS);
    Ok(())
}

/// One full device run in resume-from-post-sim mode.
fn device_run() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let artifact = dir.path().join("kernel.xo");
    std::fs::write(&artifact, b"PK\x03\x04 pretend packaged design")?;
    std::fs::write(
        dir.path().join("kernel.args.json"),
        r#"[
            {"index": 0, "name": "words", "type": "uint32_t*", "category": "mmap"},
            {"index": 1, "name": "count", "type": "uint64_t", "category": "scalar"}
        ]"#,
    )?;

    let mut device = new_device(
        &artifact,
        CosimOptions {
            resume_from_post_sim: true,
            ..CosimOptions::default()
        },
    )?
    .context("no backend recognizes the artifact")?;

    let mut words: Vec<u32> = (0..WORDS).collect();
    let count = words.len() as u64;
    device.set_buffer_arg(0, Tag::ReadOnly, &BufferArg::new(&mut words))?;
    device.set_scalar_arg(1, &count.to_le_bytes())?;

    device.write_to_device();
    device.exec()?;
    device.finish()?;

    log::info!(
        "run complete: staged {} bytes in {:?}, computed in {:?}",
        device.load_bytes(),
        device.load_time(),
        device.compute_time()
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    stream_loopback()?;
    device_run()?;
    println!("loopback OK");
    Ok(())
}
