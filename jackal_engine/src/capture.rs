//! Disk-recording capture client
//!
//! The process callback copies one period of every input port into a pooled
//! [`SampleBlock`]; a consumer thread interleaves the blocks and writes them
//! to a WAV file. When the pool is empty the period is dropped and counted,
//! the process thread never waits for the disk.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hound::{SampleFormat, WavSpec, WavWriter};
use jackal_rt::{
    BlockSink, DiagnosticSubmitter, PipelineConsumer, PipelineError, PipelineProducer,
    PipelineStats, ProduceStatus, SampleBlock, StreamingPipeline, rt_diag,
};
use jackal_shared_memory::AUDIO;
use tracing::{debug, info};

use crate::client::{Client, InputPort, ProcessScope, ProcessStatus};
use crate::engine::Engine;
use crate::error::EngineResult;
use crate::graph::{ClientId, PortId};

/// Blocks in the capture pool when none is configured.
pub const DEFAULT_CAPTURE_BLOCKS: usize = 64;

/// Sample encoding of the output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum WavFormat {
    /// 8-bit integer
    Int8,
    /// 16-bit integer
    Int16,
    /// 24-bit integer
    Int24,
    /// 32-bit integer
    Int32,
    /// 32-bit float
    Float32,
}

impl WavFormat {
    /// Bits per sample.
    pub fn bits(self) -> u16 {
        match self {
            WavFormat::Int8 => 8,
            WavFormat::Int16 => 16,
            WavFormat::Int24 => 24,
            WavFormat::Int32 | WavFormat::Float32 => 32,
        }
    }

    fn sample_format(self) -> SampleFormat {
        match self {
            WavFormat::Float32 => SampleFormat::Float,
            _ => SampleFormat::Int,
        }
    }
}

// ─── WAV Sink ───────────────────────────────────────────────────────

/// Consumer side: interleaves blocks into a WAV file.
pub struct WavSink {
    writer: WavWriter<BufWriter<File>>,
    format: WavFormat,
    channels: usize,
    written_frames: u64,
    target_frames: Option<u64>,
}

impl WavSink {
    /// Create `path`. With `target_frames` the sink reports done once that
    /// many frames are on disk and ignores the rest.
    pub fn create(
        path: &Path,
        channels: usize,
        sample_rate: u32,
        format: WavFormat,
        target_frames: Option<u64>,
    ) -> Result<Self, hound::Error> {
        let spec = WavSpec {
            channels: channels as u16,
            sample_rate,
            bits_per_sample: format.bits(),
            sample_format: format.sample_format(),
        };
        let writer = WavWriter::create(path, spec)?;
        Ok(Self {
            writer,
            format,
            channels,
            written_frames: 0,
            target_frames,
        })
    }

    /// Frames written so far.
    pub fn written_frames(&self) -> u64 {
        self.written_frames
    }

    fn write_sample(&mut self, sample: f32) -> Result<(), hound::Error> {
        match self.format {
            WavFormat::Float32 => self.writer.write_sample(sample),
            int => {
                let max_val = (1i64 << (int.bits() - 1)) as f32;
                let scaled = (sample * max_val).clamp(-max_val, max_val - 1.0) as i32;
                self.writer.write_sample(scaled)
            }
        }
    }
}

fn sink_error(e: hound::Error) -> PipelineError {
    PipelineError::Sink {
        reason: e.to_string(),
    }
}

impl BlockSink<SampleBlock> for WavSink {
    fn write_block(&mut self, block: &SampleBlock) -> Result<(), PipelineError> {
        let mut frames = block.frames() as u64;
        if let Some(target) = self.target_frames {
            frames = frames.min(target.saturating_sub(self.written_frames));
        }
        let channels = self.channels.min(block.channels());

        for frame in 0..frames as usize {
            for ch in 0..self.channels {
                let sample = if ch < channels {
                    block.channel(ch)[frame]
                } else {
                    0.0
                };
                self.write_sample(sample).map_err(sink_error)?;
            }
        }
        self.written_frames += frames;
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.target_frames
            .is_some_and(|target| self.written_frames >= target)
    }

    fn finish(self) -> Result<(), PipelineError> {
        debug!(frames = self.written_frames, "Finalizing WAV file");
        self.writer.finalize().map_err(sink_error)
    }
}

// ─── Capture Client ─────────────────────────────────────────────────

/// Realtime side: copies inputs into pool blocks.
pub struct CaptureClient {
    inputs: Vec<InputPort>,
    producer: PipelineProducer<SampleBlock>,
    diag: DiagnosticSubmitter,
    seq: u64,
    finished: bool,
}

impl CaptureClient {
    /// Client reading `inputs`, channel `i` from `inputs[i]`.
    pub fn new(
        inputs: Vec<InputPort>,
        producer: PipelineProducer<SampleBlock>,
        diag: DiagnosticSubmitter,
    ) -> Self {
        Self {
            inputs,
            producer,
            diag,
            seq: 0,
            finished: false,
        }
    }
}

impl Client for CaptureClient {
    fn process(&mut self, scope: &mut ProcessScope<'_>) -> ProcessStatus {
        if self.finished {
            return ProcessStatus::Continue;
        }
        let inputs = &self.inputs;
        let seq = self.seq;
        let nframes = scope.nframes() as usize;

        let status = self.producer.produce(|block| {
            let mut frames = nframes;
            for (ch, port) in inputs.iter().enumerate().take(block.channels()) {
                let src = scope.input(port);
                let dst = block.channel_mut(ch);
                let n = src.len().min(dst.len());
                dst[..n].copy_from_slice(&src[..n]);
                frames = frames.min(n);
            }
            block.set_frames(frames);
            block.seq = seq;
        });

        match status {
            ProduceStatus::Queued => self.seq += 1,
            ProduceStatus::Dropped => {
                rt_diag!(self.diag, "capture: no free block, dropped period {seq}");
                self.seq += 1;
            }
            ProduceStatus::Finished => self.finished = true,
        }
        ProcessStatus::Continue
    }
}

// ─── Setup ──────────────────────────────────────────────────────────

/// What to record and where.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Output file
    pub path: PathBuf,
    /// Input ports to create, one per channel
    pub channels: usize,
    /// Sample encoding
    pub format: WavFormat,
    /// Stop after this much audio; `None` records until closed
    pub duration: Option<Duration>,
    /// Blocks in the pool
    pub blocks: usize,
}

impl CaptureOptions {
    /// Defaults for everything but the file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            channels: 2,
            format: WavFormat::Int16,
            duration: None,
            blocks: DEFAULT_CAPTURE_BLOCKS,
        }
    }
}

/// A running capture.
pub struct CaptureHandle {
    client: ClientId,
    ports: Vec<PortId>,
    pipeline: StreamingPipeline<SampleBlock>,
    consumer: PipelineConsumer<SampleBlock>,
}

impl CaptureHandle {
    /// Capture client key.
    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Input ports, in channel order.
    pub fn ports(&self) -> &[PortId] {
        &self.ports
    }

    /// True once the target duration is on disk.
    pub fn is_done(&self) -> bool {
        self.consumer.is_finished()
    }

    /// Pipeline counters.
    pub fn stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }

    /// Flush pending blocks, finalize the file and return the blocks written.
    /// The client stays in the graph until closed.
    pub fn finish(self) -> EngineResult<u64> {
        let stats = self.pipeline.stats();
        let written = self.consumer.close()?;
        info!(
            blocks = written,
            dropped = stats.dropped,
            "Capture finished"
        );
        Ok(written)
    }
}

/// Open a client named `name` with `options.channels` audio inputs, start
/// the writer thread and activate the client.
pub fn start_capture(
    engine: &mut Engine,
    diag: DiagnosticSubmitter,
    name: &str,
    options: &CaptureOptions,
) -> EngineResult<CaptureHandle> {
    let sample_rate = engine.sample_rate();
    let nframes = engine.nframes() as usize;
    let channels = options.channels.max(1);
    let target_frames = options
        .duration
        .map(|d| (d.as_secs_f64() * sample_rate as f64).round() as u64);

    let sink = WavSink::create(&options.path, channels, sample_rate, options.format, target_frames)?;
    let pipeline =
        StreamingPipeline::new(options.blocks, || SampleBlock::new(channels, nframes))?;

    let client = engine.open_client(name)?;
    let mut inputs = Vec::with_capacity(channels);
    for ch in 0..channels {
        inputs.push(engine.register_input(client, &format!("input{}", ch + 1), AUDIO.id)?);
    }
    let ports = inputs.iter().map(InputPort::id).collect();

    let consumer = pipeline.start_consumer(engine.threads(), "jackal-capture", sink)?;
    engine.activate(
        client,
        Box::new(CaptureClient::new(inputs, pipeline.producer(), diag)),
    )?;

    info!(
        path = %options.path.display(),
        channels,
        format = ?options.format,
        "Capture started"
    );
    Ok(CaptureHandle {
        client,
        ports,
        pipeline,
        consumer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(channels: usize, frames: usize, value: impl Fn(usize, usize) -> f32) -> SampleBlock {
        let mut block = SampleBlock::new(channels, frames);
        for ch in 0..channels {
            for (i, s) in block.channel_mut(ch).iter_mut().enumerate() {
                *s = value(ch, i);
            }
        }
        block.set_frames(frames);
        block
    }

    #[test]
    fn test_wav_sink_interleaves() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");

        let mut sink = WavSink::create(&path, 2, 48_000, WavFormat::Float32, None).unwrap();
        sink.write_block(&block(2, 4, |ch, i| if ch == 0 { i as f32 } else { -(i as f32) }))
            .unwrap();
        sink.finish().unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        let samples: Vec<f32> = reader.samples::<f32>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0.0, -0.0, 1.0, -1.0, 2.0, -2.0, 3.0, -3.0]);
    }

    #[test]
    fn test_wav_sink_stops_at_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.wav");

        let mut sink = WavSink::create(&path, 1, 8_000, WavFormat::Int16, Some(6)).unwrap();
        sink.write_block(&block(1, 4, |_, _| 0.5)).unwrap();
        assert!(!sink.is_done());
        sink.write_block(&block(1, 4, |_, _| 0.5)).unwrap();
        assert!(sink.is_done());
        assert_eq!(sink.written_frames(), 6);
        sink.finish().unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.duration(), 6);
        assert_eq!(reader.spec().bits_per_sample, 16);
    }

    #[test]
    fn test_int_formats_clamp() {
        let dir = tempfile::tempdir().unwrap();
        for format in [WavFormat::Int8, WavFormat::Int16, WavFormat::Int24, WavFormat::Int32] {
            let path = dir.path().join(format!("{format:?}.wav"));
            let mut sink = WavSink::create(&path, 1, 8_000, format, None).unwrap();
            sink.write_block(&block(1, 3, |_, i| [2.0, -2.0, 0.0][i])).unwrap();
            sink.finish().unwrap();

            let mut reader = hound::WavReader::open(&path).unwrap();
            let max = 1i64 << (format.bits() - 1);
            let samples: Vec<i64> = reader
                .samples::<i32>()
                .map(|s| s.unwrap() as i64)
                .collect();
            assert_eq!(samples.len(), 3, "{format:?}");
            assert!(samples[0] <= max - 1 && samples[0] > 0, "{format:?}: {samples:?}");
            assert!(samples[1] >= -max && samples[1] < 0, "{format:?}: {samples:?}");
            assert_eq!(samples[2], 0, "{format:?}");
        }
    }
}
