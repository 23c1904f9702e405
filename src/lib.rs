//! stackshot is the in-process half of a sampling profiler for managed runtimes.
//!
//! Once per interval the sampler suspends the runtime, walks every managed thread's stack,
//! resumes the runtime and encodes what it saw into a compact binary buffer. Buffers wait in a
//! two-slot exchange until an external reader drains them through the exported
//! `stackshot_read_thread_samples` function. If the reader falls behind, captures are skipped
//! or dropped rather than queued.
//!
//! The runtime itself is reached through the `ProfilingRuntime` trait. Thread names and OS ids
//! come from lifecycle notifications, which the host forwards to `ThreadRegistry`.

#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

pub mod config;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod exchange;
pub mod ffi;
pub mod names;
pub mod registry;
pub mod sampler;
pub mod speedscope;
pub mod stats;
pub mod types;

use std::sync::Arc;

pub use config::SamplerConfig;
pub use error::{Error, Result};
pub use exchange::{BufferExchange, CaptureBuffer};
pub use registry::ThreadRegistry;
pub use sampler::{Sampler, SamplerHandle};
pub use stats::{SamplerStats, StatsSnapshot};
pub use types::{ProfilingRuntime, ThreadHandle, ThreadIdentity};

/// Owns the state shared between the sampling thread, lifecycle notifications and the reader.
pub struct Profiler {
    config: SamplerConfig,
    registry: Arc<ThreadRegistry>,
    exchange: Arc<BufferExchange>,
    stats: Arc<SamplerStats>,
}

impl Profiler {
    pub fn new(config: SamplerConfig) -> Result<Profiler> {
        config.validate()?;
        Ok(Profiler {
            config,
            registry: Arc::new(ThreadRegistry::new()),
            exchange: Arc::new(BufferExchange::new()),
            stats: Arc::new(SamplerStats::default()),
        })
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Where the host sends thread lifecycle notifications.
    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }

    pub fn exchange(&self) -> &Arc<BufferExchange> {
        &self.exchange
    }

    /// Binds this profiler's exchange to the exported pull function until the profiler is dropped.
    pub fn install_pull_api(&self) {
        if ffi::install(self.exchange.clone()).is_some() {
            warn!("replaced a previously installed exchange");
        }
    }

    /// A sampler wired to this profiler, for driving passes by hand.
    pub fn sampler<R: ProfilingRuntime>(&self, runtime: R) -> Sampler<R> {
        Sampler::new(
            runtime,
            self.registry.clone(),
            self.exchange.clone(),
            self.stats.clone(),
            self.config.clone(),
        )
    }

    /// Starts sampling `runtime` on a background thread.
    pub fn start<R: ProfilingRuntime + Send + 'static>(&self, runtime: R) -> Result<SamplerHandle> {
        self.sampler(runtime).spawn()
    }

    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.stats.snapshot();
        snapshot.dropped = self.exchange.dropped();
        snapshot
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        // Leave a newer profiler's exchange alone.
        if ffi::uninstall_if(&self.exchange) {
            debug!("uninstalled pull api");
        }
    }
}
