//! Prime+probe measurement of one cache level.
//!
//! Every iteration walks a cache aligned buffer twice. Priming loads each
//! line set by set with ways in descending order, so every set is filled by
//! the buffer. After one voluntary yield, probing reloads each line with ways
//! in ascending order and times the load with the core cycle counter. A line
//! that was evicted while the processor was away shows up as a slow probe.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod benchmark;
pub mod cancel;
pub mod matrix;
pub mod output;

pub use cancel::CancellationToken;
pub use matrix::LatencyMatrix;

use cache_utils::cache_info::CacheGeometry;
use cache_utils::perf::CycleCounter;
use cache_utils::TimingPrimitives;
use output::MatrixSink;
use std::io;
use std::path::PathBuf;
use std::thread;
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Cache(#[from] cache_utils::Error),
    #[error("writing the measurements")]
    Output(#[source] io::Error),
    #[error("encoding the dataset")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decoding the dataset")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("changing the permissions of {}", path.display())]
    Chmod {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("the buffer holds {len} bytes, the cache needs {needed}")]
    BufferTooSmall { len: usize, needed: usize },
    #[error("the engine has already run")]
    AlreadyRun,
    #[error("no benchmark samples were taken")]
    NoSamples,
}

impl Error {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::Cache(e) => e.kind_name(),
            Error::Output(_) => "ERROR_IO_OUTPUT",
            Error::Encode(_) | Error::Decode(_) => "ERROR_DATASET",
            Error::Chmod { .. } => "ERROR_CHMOD",
            Error::BufferTooSmall { .. } => "ERROR_BUFFER_SIZE",
            Error::AlreadyRun => "ERROR_ENGINE_STATE",
            Error::NoSamples => "ERROR_NO_SAMPLES",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    /// `Completed` or `Cancelled`.
    pub state: EngineState,
    pub iterations: u64,
}

/// Runs prime/yield/probe over one cache aligned buffer.
#[derive(Debug)]
pub struct PrimeProbeEngine<'a, P: TimingPrimitives> {
    primitives: P,
    buffer: &'a [u8],
    geometry: CacheGeometry,
    matrix: LatencyMatrix,
    state: EngineState,
}

impl<'a, P: TimingPrimitives> PrimeProbeEngine<'a, P> {
    /// `buffer` must be aligned to `geometry`, see
    /// [`cache_utils::mmap::AlignedAllocator`].
    pub fn new(primitives: P, buffer: &'a [u8], geometry: CacheGeometry) -> Result<Self> {
        if buffer.len() < geometry.total_size {
            return Err(Error::BufferTooSmall {
                len: buffer.len(),
                needed: geometry.total_size,
            });
        }
        Ok(PrimeProbeEngine {
            primitives,
            buffer,
            matrix: LatencyMatrix::for_geometry(&geometry),
            geometry,
            state: EngineState::Idle,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn geometry(&self) -> &CacheGeometry {
        &self.geometry
    }

    /// Latencies of the last probe.
    pub fn matrix(&self) -> &LatencyMatrix {
        &self.matrix
    }

    pub fn primitives(&self) -> &P {
        &self.primitives
    }

    pub fn prime(&self) {
        let base = self.buffer.as_ptr();
        for set in 0..self.geometry.set_count {
            for way in (0..self.geometry.ways).rev() {
                let offset = self.geometry.offset(set, way);
                // In bounds: offset < total_size <= buffer.len().
                unsafe {
                    self.primitives.fenced_read(base.add(offset));
                }
            }
        }
    }

    pub fn probe(&mut self) {
        let base = self.buffer.as_ptr();
        let p = &self.primitives;
        for set in 0..self.geometry.set_count {
            for way in 0..self.geometry.ways {
                let offset = self.geometry.offset(set, way);
                let slot = self.matrix.slot_ptr(set, way);
                p.serialize();
                let start = p.read_cycle_counter_low32();
                unsafe {
                    p.fenced_read(base.add(offset));
                }
                let end = p.read_cycle_counter_low32();
                unsafe {
                    p.nontemporal_store32(slot, end.wrapping_sub(start));
                }
                p.serialize();
            }
        }
    }

    fn iterate<S: MatrixSink>(
        &mut self,
        iterations: u64,
        token: &CancellationToken,
        sink: &mut S,
        done: &mut u64,
    ) -> Result<EngineState> {
        loop {
            if iterations > 0 && *done >= iterations {
                return Ok(EngineState::Completed);
            }
            if token.is_cancelled() {
                return Ok(EngineState::Cancelled);
            }
            self.prime();
            thread::yield_now();
            self.probe();
            sink.write_matrix(&self.matrix)?;
            *done += 1;
        }
    }

    /// Measures `iterations` times, or until `token` is cancelled when
    /// `iterations` is 0. Each matrix goes to `sink` as soon as it is probed.
    ///
    /// `counter` must already be counting on the current core; it is disabled
    /// exactly once before returning, whatever the outcome.
    pub fn run<S: MatrixSink, C: CycleCounter>(
        &mut self,
        iterations: u64,
        token: &CancellationToken,
        sink: &mut S,
        counter: C,
    ) -> Result<RunOutcome> {
        if self.state != EngineState::Idle {
            counter.disable()?;
            return Err(Error::AlreadyRun);
        }
        self.state = EngineState::Running;
        debug!(iterations, "measurement started");

        let mut done = 0;
        let result = self.iterate(iterations, token, sink, &mut done);
        let disabled = counter.disable();

        match (result, disabled) {
            (Ok(state), Ok(())) => {
                self.state = state;
                info!(iterations = done, ?state, "measurement finished");
                Ok(RunOutcome {
                    state,
                    iterations: done,
                })
            }
            (Ok(_), Err(e)) => {
                self.state = EngineState::Failed;
                Err(e.into())
            }
            (Err(e), disabled) => {
                if let Err(close) = disabled {
                    error!("Error while disabling the cycle counter: {}", close);
                }
                self.state = EngineState::Failed;
                Err(e)
            }
        }
    }
}

/// Profiles `geometry` on core `cpu` with the hardware counter and `rdpmc`.
///
/// The caller must already run on `cpu`.
#[cfg(target_arch = "x86_64")]
pub fn profile<S: MatrixSink>(
    buffer: &[u8],
    geometry: CacheGeometry,
    cpu: usize,
    iterations: u64,
    token: &CancellationToken,
    sink: &mut S,
) -> Result<RunOutcome> {
    use cache_utils::perf::PerformanceCounter;
    use cache_utils::RdpmcPrimitives;

    let mut engine = PrimeProbeEngine::new(RdpmcPrimitives, buffer, geometry)?;
    let counter = PerformanceCounter::enable(cpu)?;
    engine.run(iterations, token, sink, counter)
}


#[cfg(test)]
mod tests {
    use super::testing::{MockCounter, RecordingPrimitives};
    use super::*;
    use cache_utils::cache_info::CacheType;

    fn small() -> CacheGeometry {
        CacheGeometry::new(64, 4, 3, 1, CacheType::Data).unwrap()
    }

    /// Collects matrices and cancels `token` after `cancel_after` of them.
    struct Collect {
        matrices: Vec<LatencyMatrix>,
        token: CancellationToken,
        cancel_after: Option<usize>,
        fail_at: Option<usize>,
    }

    impl Collect {
        fn new(token: &CancellationToken) -> Self {
            Collect {
                matrices: Vec::new(),
                token: token.clone(),
                cancel_after: None,
                fail_at: None,
            }
        }
    }

    impl MatrixSink for Collect {
        fn write_matrix(&mut self, matrix: &LatencyMatrix) -> Result<()> {
            if self.fail_at == Some(self.matrices.len()) {
                return Err(Error::Output(io::Error::from(io::ErrorKind::BrokenPipe)));
            }
            self.matrices.push(matrix.clone());
            if self.cancel_after == Some(self.matrices.len()) {
                self.token.cancel();
            }
            Ok(())
        }

        fn close(self) -> Result<()> {
            Ok(())
        }
    }

    fn offsets(reads: &[usize], base: *const u8) -> Vec<usize> {
        reads.iter().map(|a| a - base as usize).collect()
    }

    #[test]
    fn prime_walks_ways_descending() {
        let g = small();
        let buffer = vec![0u8; g.total_size];
        let engine = PrimeProbeEngine::new(RecordingPrimitives::default(), &buffer, g).unwrap();
        engine.prime();

        let visited = offsets(&engine.primitives().reads.borrow(), buffer.as_ptr());
        let mut expected = Vec::new();
        for set in 0..g.set_count {
            for way in (0..g.ways).rev() {
                expected.push(g.offset(set, way));
            }
        }
        assert_eq!(visited, expected);
        assert_eq!(visited[..3], [512, 256, 0]);
    }

    #[test]
    fn probe_walks_ways_ascending_and_fills_the_matrix() {
        let g = small();
        let buffer = vec![0u8; g.total_size];
        let mut engine =
            PrimeProbeEngine::new(RecordingPrimitives::default(), &buffer, g).unwrap();
        engine.matrix.fill(u32::MAX);
        engine.probe();

        let visited = offsets(&engine.primitives().reads.borrow(), buffer.as_ptr());
        let mut expected = Vec::new();
        for set in 0..g.set_count {
            for way in 0..g.ways {
                expected.push(g.offset(set, way));
            }
        }
        assert_eq!(visited, expected);

        // The k-th timed read costs k cycles plus the first counter read.
        let m = engine.matrix();
        assert_eq!((m.set_count(), m.ways()), (4, 3));
        for set in 0..4 {
            for way in 0..3 {
                assert_eq!(m.get(set, way), (set * 3 + way) as u32 + 2);
            }
        }
        assert_eq!(engine.primitives().serializations.get(), 2 * 12);
    }

    #[test]
    fn counter_wraparound_is_modular() {
        let g = small();
        let buffer = vec![0u8; g.total_size];
        let mut engine =
            PrimeProbeEngine::new(RecordingPrimitives::starting_at(u32::MAX - 1), &buffer, g)
                .unwrap();
        engine.probe();
        assert_eq!(engine.matrix().get(0, 0), 2);
    }

    #[test]
    fn bounded_run_completes() {
        let g = small();
        let buffer = vec![0u8; g.total_size];
        let mut engine =
            PrimeProbeEngine::new(RecordingPrimitives::default(), &buffer, g).unwrap();
        let token = CancellationToken::new();
        let mut sink = Collect::new(&token);
        let counter = MockCounter::default();

        let outcome = engine.run(3, &token, &mut sink, counter.clone()).unwrap();
        assert_eq!(
            outcome,
            RunOutcome {
                state: EngineState::Completed,
                iterations: 3
            }
        );
        assert_eq!(engine.state(), EngineState::Completed);
        assert_eq!(sink.matrices.len(), 3);
        assert_eq!(counter.disables.get(), 1);
        // prime + probe each read every line once per iteration.
        assert_eq!(engine.primitives().reads.borrow().len(), 3 * 2 * 12);
    }

    #[test]
    fn unbounded_run_stops_at_the_next_boundary() {
        let g = small();
        let buffer = vec![0u8; g.total_size];
        let mut engine =
            PrimeProbeEngine::new(RecordingPrimitives::default(), &buffer, g).unwrap();
        let token = CancellationToken::new();
        let mut sink = Collect::new(&token);
        sink.cancel_after = Some(5);
        let counter = MockCounter::default();

        let outcome = engine.run(0, &token, &mut sink, counter.clone()).unwrap();
        assert_eq!(outcome.state, EngineState::Cancelled);
        assert_eq!(outcome.iterations, 5);
        assert_eq!(sink.matrices.len(), 5);
        assert_eq!(counter.disables.get(), 1);
    }

    #[test]
    fn cancelled_before_start_measures_nothing() {
        let g = small();
        let buffer = vec![0u8; g.total_size];
        let mut engine =
            PrimeProbeEngine::new(RecordingPrimitives::default(), &buffer, g).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let mut sink = Collect::new(&token);
        let counter = MockCounter::default();

        let outcome = engine.run(10, &token, &mut sink, counter.clone()).unwrap();
        assert_eq!(outcome.state, EngineState::Cancelled);
        assert_eq!(outcome.iterations, 0);
        assert!(engine.primitives().reads.borrow().is_empty());
        assert_eq!(counter.disables.get(), 1);
    }

    #[test]
    fn sink_failure_still_disables_the_counter() {
        let g = small();
        let buffer = vec![0u8; g.total_size];
        let mut engine =
            PrimeProbeEngine::new(RecordingPrimitives::default(), &buffer, g).unwrap();
        let token = CancellationToken::new();
        let mut sink = Collect::new(&token);
        sink.fail_at = Some(1);
        let counter = MockCounter::default();

        assert!(matches!(
            engine.run(0, &token, &mut sink, counter.clone()),
            Err(Error::Output(_))
        ));
        assert_eq!(engine.state(), EngineState::Failed);
        assert_eq!(sink.matrices.len(), 1);
        assert_eq!(counter.disables.get(), 1);
    }

    #[test]
    fn close_failure_fails_the_run() {
        let g = small();
        let buffer = vec![0u8; g.total_size];
        let mut engine =
            PrimeProbeEngine::new(RecordingPrimitives::default(), &buffer, g).unwrap();
        let token = CancellationToken::new();
        let mut sink = Collect::new(&token);
        let counter = MockCounter {
            fail: true,
            ..Default::default()
        };

        let e = engine.run(1, &token, &mut sink, counter.clone()).unwrap_err();
        assert_eq!(e.kind_name(), "ERROR_FD_CYCLE_CLOSE");
        assert_eq!(engine.state(), EngineState::Failed);
        assert_eq!(counter.disables.get(), 1);
    }

    #[test]
    fn engine_runs_once() {
        let g = small();
        let buffer = vec![0u8; g.total_size];
        let mut engine =
            PrimeProbeEngine::new(RecordingPrimitives::default(), &buffer, g).unwrap();
        let token = CancellationToken::new();
        let mut sink = Collect::new(&token);
        engine.run(1, &token, &mut sink, MockCounter::default()).unwrap();

        let counter = MockCounter::default();
        assert!(matches!(
            engine.run(1, &token, &mut sink, counter.clone()),
            Err(Error::AlreadyRun)
        ));
        assert_eq!(counter.disables.get(), 1);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let g = small();
        let buffer = vec![0u8; g.total_size - 1];
        assert!(matches!(
            PrimeProbeEngine::new(RecordingPrimitives::default(), &buffer, g),
            Err(Error::BufferTooSmall { .. })
        ));
    }
}
