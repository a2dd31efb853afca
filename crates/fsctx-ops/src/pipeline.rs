//! Large-file copy with a reader and a writer running side by side.
//!
//! The calling thread reads chunks and hands them to a scoped writer thread
//! through a bounded channel, so a slow target never holds more than the
//! configured number of chunks in memory. The writer only writes; prompts
//! about its failures are raised on the calling thread once it has stopped.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use fsctx_core::FsError;
use parking_lot::Mutex;

use crate::answer::{AnswerFlags, ControlSignal};
use crate::context::{Flow, FsContext, Scope, Step};

/// Smallest chunk the reader asks for.
pub(crate) const MIN_CHUNK: usize = 64 * 1024;

/// Byte and chunk counts of one pipelined copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub chunks_read: u64,
    pub chunks_written: u64,
}

/// Chunk size that would have taken about `interval`, at most double the
/// current one.
pub(crate) fn next_chunk_size(current: usize, took: Duration, interval: Duration) -> usize {
    let doubled = current.saturating_mul(2);
    if took.is_zero() {
        return doubled;
    }
    let scaled = current as f64 * interval.as_secs_f64() / took.as_secs_f64();
    (scaled as usize).clamp(1, doubled)
}

#[derive(Default)]
struct WriterState {
    bytes: AtomicU64,
    chunks: AtomicU64,
    /// Set by the reader when it gives up; the writer then drains without writing.
    abort: AtomicBool,
    failure: Mutex<Option<io::Error>>,
}

fn write_chunks(chunks: Receiver<Vec<u8>>, mut output: File, state: &WriterState) {
    for chunk in chunks.iter() {
        if state.abort.load(Ordering::Acquire) {
            continue;
        }
        if let Err(error) = output.write_all(&chunk) {
            *state.failure.lock() = Some(error);
            // Dropping the receiver makes the reader's next send fail.
            return;
        }
        state.bytes.fetch_add(chunk.len() as u64, Ordering::Release);
        state.chunks.fetch_add(1, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct ReadTally {
    bytes: u64,
    chunks: u64,
    writer_gone: bool,
}

impl FsContext {
    /// Copy the rest of `input` to `output` with a writer thread.
    pub(crate) fn copy_pipelined(
        &mut self,
        scope: &Scope,
        source: &Path,
        dest: &Path,
        mut input: File,
        output: File,
    ) -> Step<PipelineStats> {
        let slots = self.config.pipeline_slots.max(2);
        let (sender, receiver) = crossbeam_channel::bounded::<Vec<u8>>(slots - 1);
        let state = WriterState::default();
        let mut reported = 0u64;

        let (read, writer_panicked) = std::thread::scope(|threads| {
            let shared = &state;
            let writer = threads.spawn(move || write_chunks(receiver, output, shared));
            let read = self.read_chunks(scope, source, &mut input, sender, &state, &mut reported);
            if read.is_err() {
                state.abort.store(true, Ordering::Release);
            }
            (read, writer.join().is_err())
        });
        self.sync_written(&state, &mut reported);

        if writer_panicked {
            return Err(Flow::Failed(FsError::Other {
                message: format!("writer thread for {} panicked", dest.display()),
            }));
        }
        let tally = read?;

        if let Some(error) = state.failure.lock().take() {
            // The writer is gone, so a retry of the write itself is not possible.
            let writer_scope = scope.without(AnswerFlags::RETRY);
            self.handle_error(&writer_scope, FsError::io(dest, error))?;
            return Err(Flow::Signal(ControlSignal::RetryEntry));
        }
        debug_assert!(!tally.writer_gone, "writer stopped without a failure");

        let stats = PipelineStats {
            bytes_read: tally.bytes,
            bytes_written: state.bytes.load(Ordering::Acquire),
            chunks_read: tally.chunks,
            chunks_written: state.chunks.load(Ordering::Acquire),
        };
        tracing::debug!(?stats, "Pipelined copy finished");
        Ok(stats)
    }

    fn read_chunks(
        &mut self,
        scope: &Scope,
        source: &Path,
        input: &mut File,
        sender: Sender<Vec<u8>>,
        state: &WriterState,
        reported: &mut u64,
    ) -> Step<ReadTally> {
        let interval = self.config.progress_interval();
        let ceiling = self.buffer.ceiling();
        let floor = MIN_CHUNK.min(ceiling);
        let mut chunk_size = self.buffer.size().clamp(floor, ceiling);
        let mut tally = ReadTally::default();

        loop {
            self.checkpoint(scope)?;
            let started = Instant::now();
            let mut chunk = vec![0u8; chunk_size];
            let mut filled = 0;
            self.attempt(scope, source, || {
                while filled < chunk.len() {
                    match input.read(&mut chunk[filled..]) {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            })?;
            if filled == 0 {
                return Ok(tally);
            }

            chunk.truncate(filled);
            tally.bytes += filled as u64;
            tally.chunks += 1;
            if sender.send(chunk).is_err() {
                tally.writer_gone = true;
                return Ok(tally);
            }
            self.sync_written(state, reported);

            chunk_size = next_chunk_size(chunk_size, started.elapsed(), interval).clamp(floor, ceiling);
        }
    }

    /// Move bytes the writer has finished into the progress counters.
    fn sync_written(&mut self, state: &WriterState, reported: &mut u64) {
        let written = state.bytes.load(Ordering::Acquire);
        if written > *reported {
            self.progress.add_bytes(written - *reported);
            *reported = written;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::context;
    use crate::context::Naming;
    use crate::operation::OperationKind;
    use crate::preset::PresetPolicy;
    use fsctx_core::EngineConfig;
    use tempfile::TempDir;

    #[test]
    fn test_next_chunk_size() {
        let interval = Duration::from_millis(100);
        assert_eq!(next_chunk_size(1000, Duration::ZERO, interval), 2000);
        assert_eq!(next_chunk_size(1000, Duration::from_millis(10), interval), 2000);
        assert_eq!(next_chunk_size(1000, Duration::from_millis(200), interval), 500);
    }

    #[test]
    fn test_pipelined_copy_counts_match() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("big.bin");
        let dest = temp.path().join("copy.bin");
        let data: Vec<u8> = (0..10 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&source, &data).unwrap();

        let config = EngineConfig {
            pipeline_slots: 4,
            ..Default::default()
        };
        let mut ctx = context(PresetPolicy::new(), config);
        let scope = Scope::root(OperationKind::Copying, None, Naming::Ask);
        let input = File::open(&source).unwrap();
        let output = File::create(&dest).unwrap();

        let stats = ctx.copy_pipelined(&scope, &source, &dest, input, output).unwrap();

        assert_eq!(stats.bytes_read, data.len() as u64);
        assert_eq!(stats.bytes_written, stats.bytes_read);
        assert_eq!(stats.chunks_written, stats.chunks_read);
        assert_eq!(ctx.progress().current.bytes, data.len() as u64);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }
}
