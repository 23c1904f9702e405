//! The periodic capture loop.
//!
//! Each pass: check the exchange has room, suspend the runtime, write one sample per thread,
//! resume, publish. Nothing in a pass is allowed to fail the loop; collaborator errors end up
//! in the `PassReport` and are logged once the runtime is running again.

use std::ops::ControlFlow;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::SamplerConfig;
use crate::encoder::BatchWriter;
use crate::error::{Error, Result, RuntimeError};
use crate::exchange::{BufferExchange, Published};
use crate::names::NameCache;
use crate::registry::ThreadRegistry;
use crate::stats::{PassReport, SamplerStats};
use crate::types::{ProfilingRuntime, ThreadHandle, ThreadIdentity};

/// Keeps the runtime suspended while alive.
///
/// Resuming is attempted on every path out of the frozen window, unwinding included. A runtime
/// left suspended would hang the whole process.
struct Suspension<'r, R: ProfilingRuntime + ?Sized> {
    runtime: &'r R,
    stats: &'r SamplerStats,
    resumed: bool,
}

impl<'r, R: ProfilingRuntime + ?Sized> Suspension<'r, R> {
    fn begin(runtime: &'r R, stats: &'r SamplerStats) -> std::result::Result<Self, RuntimeError> {
        runtime.suspend_all()?;
        Ok(Suspension {
            runtime,
            stats,
            resumed: false,
        })
    }

    fn resume(mut self) -> std::result::Result<(), RuntimeError> {
        self.resumed = true;
        self.runtime.resume_all()
    }
}

impl<'r, R: ProfilingRuntime + ?Sized> Drop for Suspension<'r, R> {
    fn drop(&mut self) {
        // Only reached while unwinding, when the pass report is lost; count the failure directly.
        if !self.resumed && self.runtime.resume_all().is_err() {
            self.stats.record_failed_resume();
        }
    }
}

pub struct Sampler<R> {
    runtime: R,
    registry: Arc<ThreadRegistry>,
    exchange: Arc<BufferExchange>,
    stats: Arc<SamplerStats>,
    names: NameCache,
    threads: Vec<ThreadHandle>,
    config: SamplerConfig,
}

impl<R: ProfilingRuntime> Sampler<R> {
    pub fn new(
        runtime: R,
        registry: Arc<ThreadRegistry>,
        exchange: Arc<BufferExchange>,
        stats: Arc<SamplerStats>,
        config: SamplerConfig,
    ) -> Self {
        Sampler {
            runtime,
            registry,
            exchange,
            stats,
            names: NameCache::new(config.name_cache_capacity),
            threads: Vec::new(),
            config,
        }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Runs one iteration of the loop.
    ///
    /// Returns `None` when the pass was skipped because the reader has not made room; the
    /// runtime is not touched in that case.
    pub fn sample_once(&mut self) -> Option<PassReport> {
        if !self.exchange.has_capacity() {
            self.stats.record_skip();
            return None;
        }

        // Everything that allocates happens out here, before the runtime is frozen.
        let mut writer = BatchWriter::new(self.config.buffer_capacity);
        let mut report = PassReport::default();
        writer.start_batch();
        self.threads.clear();
        let known = self.registry.len();
        if self.threads.capacity() < known {
            self.threads.reserve(known * 2);
        }

        self.capture(&mut writer, &mut report);

        writer.end_batch();
        report.bytes = writer.position();
        report.truncated = writer.truncated();
        report.published = self.exchange.publish(writer.finish()) == Published::Stored;

        log_pass(&report);
        self.stats.record_pass(&report);
        self.stats.record_names(self.names.stats());
        Some(report)
    }

    fn capture(&mut self, writer: &mut BatchWriter, report: &mut PassReport) {
        let runtime = &self.runtime;
        let stats = &*self.stats;
        let names = &mut self.names;
        let threads = &mut self.threads;
        let max_frames = self.config.max_frames;

        // Taken before suspending, so no frozen thread can be inside a notification holding it.
        let snapshot = self.registry.snapshot();
        let unknown = ThreadIdentity::default();

        let started = Instant::now();
        let suspension = match Suspension::begin(runtime, stats) {
            Ok(suspension) => suspension,
            Err(err) => {
                report.suspend_error = Some(err);
                report.frozen = started.elapsed();
                return;
            }
        };

        // No logging in here: a frozen thread may hold the logger's lock.
        if let Err(err) = runtime.enumerate_threads(threads) {
            report.enumerate_error = Some(err);
        }

        for &thread in threads.iter() {
            let identity = snapshot.lookup(thread).unwrap_or(&unknown);
            writer.start_sample(thread, identity);

            let mut depth = 0;
            let mut written = 0;
            let walked = runtime.walk_stack(thread, &mut |method, context| {
                if depth >= max_frames {
                    return ControlFlow::Break(());
                }
                depth += 1;
                let name = names.resolve(runtime, method, context);
                if writer.record_frame(method, name) {
                    written += 1;
                }
                ControlFlow::Continue(())
            });
            if let Err(err) = walked {
                report.walk_failures += 1;
                report.first_walk_error.get_or_insert(err);
            }

            writer.end_sample();
            report.threads += 1;
            report.frames += written;
        }

        report.resume_error = suspension.resume().err();
        report.frozen = started.elapsed();
    }

    /// Samples every `interval` until `stop` receives a message or is disconnected.
    pub fn run(mut self, stop: Receiver<()>) {
        let interval = self.config.interval();
        let anchor = Instant::now();
        info!("sampling every {:?}", interval);

        loop {
            let now = Instant::now();
            let timeout = next_deadline(anchor, interval, now).saturating_duration_since(now);
            match stop.recv_timeout(timeout) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            if self.sample_once().is_none() {
                trace!("reader has no free slot, skipping interval");
            }
        }

        info!("sampling stopped");
    }
}

impl<R: ProfilingRuntime + Send + 'static> Sampler<R> {
    /// Moves the sampler onto its own thread.
    pub fn spawn(self) -> Result<SamplerHandle> {
        let (stop, stopped) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("stackshot-sampler".to_string())
            .spawn(move || self.run(stopped))
            .map_err(Error::Spawn)?;
        Ok(SamplerHandle {
            stop: Some(stop),
            thread: Some(thread),
        })
    }
}

/// Owner of a running sampling thread. Dropping it stops and joins the thread.
pub struct SamplerHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SamplerHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            // The thread may already be gone.
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("sampling thread panicked");
            }
        }
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// First deadline strictly after `now` on the grid `anchor + n * interval`.
///
/// Passes that overrun skip the ticks they missed instead of firing them back to back.
fn next_deadline(anchor: Instant, interval: Duration, now: Instant) -> Instant {
    let interval_nanos = interval.as_nanos().max(1);
    let elapsed = now.saturating_duration_since(anchor).as_nanos();
    let ticks = elapsed / interval_nanos + 1;
    anchor + Duration::from_nanos((ticks * interval_nanos) as u64)
}

fn log_pass(report: &PassReport) {
    if let Some(err) = report.suspend_error {
        warn!("suspending runtime failed, no threads sampled: {}", err);
    }
    if let Some(err) = report.enumerate_error {
        warn!("enumerating threads failed: {}", err);
    }
    if let Some(err) = report.first_walk_error {
        warn!(
            "stack walk failed for {} of {} threads, first error: {}",
            report.walk_failures, report.threads, err
        );
    }
    if let Some(err) = report.resume_error {
        error!("resuming runtime failed: {}", err);
    }
    if !report.published {
        warn!("reader is behind, dropped a {} byte capture", report.bytes);
    }
    debug!(
        "resumed runtime ({} threads, {} frames) after {} micros, {} bytes{}",
        report.threads,
        report.frames,
        report.frozen.as_micros(),
        report.bytes,
        if report.truncated { ", truncated" } else { "" }
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode;
    use crate::encoder::{BATCH_END, BATCH_START};
    use crate::error::MetadataError;
    use crate::exchange::CaptureBuffer;
    use crate::types::{ClassId, FrameContext, MetadataSource, MethodId, MethodInfo};
    use parking_lot::Mutex;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[derive(Default)]
    struct FakeRuntime {
        /// Methods are `class * 100 + n`.
        stacks: Vec<(ThreadHandle, Vec<u64>)>,
        fail_suspend: bool,
        fail_resume: bool,
        fail_enumerate_after: Option<usize>,
        fail_walk: Option<ThreadHandle>,
        panic_on_method: Option<u64>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeRuntime {
        fn with_stacks(stacks: Vec<(u64, Vec<u64>)>) -> Self {
            FakeRuntime {
                stacks: stacks
                    .into_iter()
                    .map(|(thread, frames)| (ThreadHandle(thread), frames))
                    .collect(),
                ..FakeRuntime::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn count(&self, call: &str) -> usize {
            self.calls.lock().iter().filter(|c| c.as_str() == call).count()
        }
    }

    impl MetadataSource for FakeRuntime {
        fn method_info(
            &self,
            method: MethodId,
            _context: FrameContext,
        ) -> std::result::Result<MethodInfo, MetadataError> {
            if self.panic_on_method == Some(method.0) {
                panic!("metadata blew up");
            }
            Ok(MethodInfo {
                class: Some(ClassId(method.0 / 100)),
                name: format!("m{}", method.0 % 100),
            })
        }

        fn type_name(&self, class: ClassId) -> std::result::Result<String, MetadataError> {
            Ok(format!("C{}", class.0))
        }
    }

    impl ProfilingRuntime for FakeRuntime {
        fn suspend_all(&self) -> std::result::Result<(), RuntimeError> {
            self.calls.lock().push("suspend".to_string());
            if self.fail_suspend {
                return Err(RuntimeError::new(-2));
            }
            Ok(())
        }

        fn resume_all(&self) -> std::result::Result<(), RuntimeError> {
            self.calls.lock().push("resume".to_string());
            if self.fail_resume {
                return Err(RuntimeError::new(-5));
            }
            Ok(())
        }

        fn enumerate_threads(
            &self,
            threads: &mut Vec<ThreadHandle>,
        ) -> std::result::Result<(), RuntimeError> {
            threads.clear();
            for (i, (thread, _)) in self.stacks.iter().enumerate() {
                if self.fail_enumerate_after == Some(i) {
                    return Err(RuntimeError::new(-3));
                }
                threads.push(*thread);
            }
            Ok(())
        }

        fn walk_stack(
            &self,
            thread: ThreadHandle,
            visit: &mut dyn FnMut(MethodId, FrameContext) -> ControlFlow<()>,
        ) -> std::result::Result<(), RuntimeError> {
            self.calls.lock().push(format!("walk {}", thread.0));
            let frames = self
                .stacks
                .iter()
                .find(|(t, _)| *t == thread)
                .map(|(_, frames)| frames.clone())
                .unwrap_or_default();
            for (i, method) in frames.into_iter().enumerate() {
                if self.fail_walk == Some(thread) && i == 1 {
                    return Err(RuntimeError::new(-4));
                }
                if visit(MethodId(method), FrameContext(i as u64)).is_break() {
                    break;
                }
            }
            Ok(())
        }
    }

    fn sampler(runtime: FakeRuntime, config: SamplerConfig) -> Sampler<FakeRuntime> {
        Sampler::new(
            runtime,
            Arc::new(ThreadRegistry::new()),
            Arc::new(BufferExchange::new()),
            Arc::new(SamplerStats::default()),
            config,
        )
    }

    fn frame_names(sample: &crate::decoder::Sample) -> Vec<&str> {
        sample.frames.iter().map(|f| f.name.as_str()).collect()
    }

    #[test]
    fn no_threads_gives_empty_batch() {
        let mut sampler = sampler(FakeRuntime::default(), SamplerConfig::default());
        let report = sampler.sample_once().unwrap();
        assert_eq!(report.threads, 0);
        assert!(report.published);
        assert_eq!(sampler.runtime().calls(), vec!["suspend", "resume"]);
        assert_eq!(
            sampler.exchange.take().unwrap().as_bytes(),
            &[BATCH_START, BATCH_END]
        );
    }

    #[test]
    fn samples_every_thread() {
        let runtime = FakeRuntime::with_stacks(vec![(1, vec![101, 102, 201]), (2, vec![101])]);
        let mut sampler = sampler(runtime, SamplerConfig::default());
        sampler.registry.on_assigned_to_os_thread(ThreadHandle(1), 4242);
        sampler.registry.on_name_changed(ThreadHandle(1), "main");

        let report = sampler.sample_once().unwrap();
        assert_eq!((report.threads, report.frames), (2, 4));
        assert_eq!(
            sampler.runtime().calls(),
            vec!["suspend", "walk 1", "walk 2", "resume"]
        );

        let batch = decode(sampler.exchange.take().unwrap().as_bytes()).unwrap();
        assert_eq!(batch.samples.len(), 2);
        let first = &batch.samples[0];
        assert_eq!((first.thread, first.native_id), (1, 4242));
        assert_eq!(first.thread_name, "main");
        assert_eq!(frame_names(first), vec!["C1::m1", "C1::m2", "C2::m1"]);

        // Thread 2 is not in the registry.
        let second = &batch.samples[1];
        assert_eq!((second.thread, second.native_id), (2, 0));
        assert_eq!(second.thread_name, "");
        assert_eq!(second.frames[0].code, 1);
        assert!(!second.frames[0].defines);
    }

    #[test]
    fn full_exchange_skips_pass() {
        let runtime = FakeRuntime::with_stacks(vec![(1, vec![101])]);
        let mut sampler = sampler(runtime, SamplerConfig::default());
        sampler.exchange.publish(CaptureBuffer::new(vec![1]));
        sampler.exchange.publish(CaptureBuffer::new(vec![2]));

        assert!(sampler.sample_once().is_none());
        assert!(sampler.runtime().calls().is_empty());
        assert_eq!(sampler.stats.snapshot().skipped, 1);
    }

    #[test]
    fn failed_walk_keeps_partial_stack() {
        let mut runtime = FakeRuntime::with_stacks(vec![(1, vec![101, 102, 103]), (2, vec![201])]);
        runtime.fail_walk = Some(ThreadHandle(1));
        let mut sampler = sampler(runtime, SamplerConfig::default());

        let report = sampler.sample_once().unwrap();
        assert_eq!(report.walk_failures, 1);
        assert_eq!(report.first_walk_error, Some(RuntimeError::new(-4)));
        assert_eq!(sampler.runtime().count("resume"), 1);

        let batch = decode(sampler.exchange.take().unwrap().as_bytes()).unwrap();
        assert_eq!(frame_names(&batch.samples[0]), vec!["C1::m1"]);
        assert_eq!(frame_names(&batch.samples[1]), vec!["C2::m1"]);
    }

    #[test]
    fn failed_enumeration_keeps_threads_seen() {
        let mut runtime = FakeRuntime::with_stacks(vec![(1, vec![101]), (2, vec![201])]);
        runtime.fail_enumerate_after = Some(1);
        let mut sampler = sampler(runtime, SamplerConfig::default());

        let report = sampler.sample_once().unwrap();
        assert_eq!(report.enumerate_error, Some(RuntimeError::new(-3)));
        assert_eq!(report.threads, 1);
        assert_eq!(sampler.runtime().count("resume"), 1);
    }

    #[test]
    fn failed_suspend_publishes_empty_batch() {
        let mut runtime = FakeRuntime::with_stacks(vec![(1, vec![101])]);
        runtime.fail_suspend = true;
        let mut sampler = sampler(runtime, SamplerConfig::default());

        let report = sampler.sample_once().unwrap();
        assert_eq!(report.suspend_error, Some(RuntimeError::new(-2)));
        assert_eq!(sampler.runtime().calls(), vec!["suspend"]);
        let batch = decode(sampler.exchange.take().unwrap().as_bytes()).unwrap();
        assert!(batch.samples.is_empty());
    }

    #[test]
    fn deep_stacks_are_cut() {
        let runtime = FakeRuntime::with_stacks(vec![(1, (101..150).collect())]);
        let config = SamplerConfig {
            max_frames: 3,
            ..SamplerConfig::default()
        };
        let mut sampler = sampler(runtime, config);
        sampler.sample_once().unwrap();
        let batch = decode(sampler.exchange.take().unwrap().as_bytes()).unwrap();
        assert_eq!(frame_names(&batch.samples[0]), vec!["C1::m1", "C1::m2", "C1::m3"]);
    }

    #[test]
    fn small_buffer_is_truncated_but_published() {
        let runtime = FakeRuntime::with_stacks(vec![(1, (101..190).collect())]);
        let config = SamplerConfig {
            buffer_capacity: 64,
            ..SamplerConfig::default()
        };
        let mut sampler = sampler(runtime, config);
        let report = sampler.sample_once().unwrap();
        assert!(report.truncated);
        assert!(report.bytes <= 64);
        let batch = decode(sampler.exchange.take().unwrap().as_bytes()).unwrap();
        assert_eq!(batch.samples.len(), 1);
        // Only frames that made it into the buffer are counted.
        assert!(!batch.samples[0].frames.is_empty());
        assert_eq!(report.frames, batch.samples[0].frames.len());
        assert!(report.frames < 89);
        assert_eq!(sampler.stats.snapshot().truncated, 1);
    }

    #[test]
    fn panic_while_frozen_still_resumes() {
        let mut runtime = FakeRuntime::with_stacks(vec![(1, vec![101, 102])]);
        runtime.panic_on_method = Some(102);
        let mut sampler = sampler(runtime, SamplerConfig::default());

        let result = catch_unwind(AssertUnwindSafe(|| sampler.sample_once()));
        assert!(result.is_err());
        assert_eq!(sampler.runtime().count("resume"), 1);
        assert_eq!(sampler.stats.snapshot().failed_resumes, 0);
    }

    #[test]
    fn failed_resume_while_unwinding_is_counted() {
        let mut runtime = FakeRuntime::with_stacks(vec![(1, vec![101, 102])]);
        runtime.panic_on_method = Some(102);
        runtime.fail_resume = true;
        let mut sampler = sampler(runtime, SamplerConfig::default());

        let result = catch_unwind(AssertUnwindSafe(|| sampler.sample_once()));
        assert!(result.is_err());
        assert_eq!(sampler.runtime().count("resume"), 1);
        let stats = sampler.stats.snapshot();
        assert_eq!((stats.passes, stats.failed_resumes), (0, 1));
    }

    #[test]
    fn failed_resume_is_reported() {
        let mut runtime = FakeRuntime::with_stacks(vec![(1, vec![101])]);
        runtime.fail_resume = true;
        let mut sampler = sampler(runtime, SamplerConfig::default());

        let report = sampler.sample_once().unwrap();
        assert_eq!(report.resume_error, Some(RuntimeError::new(-5)));
        assert_eq!(sampler.runtime().count("resume"), 1);
        assert_eq!(sampler.stats.snapshot().failed_resumes, 1);
    }

    #[test]
    fn deadlines_stay_on_grid() {
        let anchor = Instant::now();
        let interval = Duration::from_millis(100);
        assert_eq!(next_deadline(anchor, interval, anchor), anchor + interval);
        assert_eq!(
            next_deadline(anchor, interval, anchor + Duration::from_millis(130)),
            anchor + Duration::from_millis(200)
        );
        // Overran by several intervals: the missed ticks are skipped.
        assert_eq!(
            next_deadline(anchor, interval, anchor + Duration::from_millis(550)),
            anchor + Duration::from_millis(600)
        );
    }

    #[test]
    fn spawned_sampler_publishes_and_stops() {
        let runtime = FakeRuntime::with_stacks(vec![(1, vec![101])]);
        let config = SamplerConfig {
            interval_ms: 5,
            ..SamplerConfig::default()
        };
        let sampler = sampler(runtime, config);
        let exchange = sampler.exchange.clone();
        let stats = sampler.stats.clone();
        let handle = sampler.spawn().unwrap();

        let started = Instant::now();
        while exchange.pending() < 2 && started.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(1));
        }
        handle.stop();

        assert_eq!(exchange.pending(), 2);
        let passes = stats.snapshot().passes;
        assert!(passes >= 2);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(stats.snapshot().passes, passes);
    }
}
