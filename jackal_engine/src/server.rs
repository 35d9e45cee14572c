//! Server context
//!
//! Everything one server instance owns, created in dependency order and torn
//! down in reverse: shared memory context, thread manager, diagnostic
//! channel, engine.

use jackal_rt::{
    DiagnosticChannel, DiagnosticSink, DiagnosticSubmitter, DiagnosticSummary,
    RealtimeThreadManager, TracingSink,
};
use jackal_shared_memory::ShmContext;
use tracing::info;

use crate::config::EngineConfig;
use crate::driver::Driver;
use crate::engine::Engine;
use crate::error::EngineResult;

/// Totals reported by [`ServerContext::teardown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownReport {
    /// Completed process cycles
    pub cycles: u64,
    /// Missed deadlines
    pub xruns: u64,
    /// Diagnostic channel totals
    pub diagnostics: DiagnosticSummary,
}

/// One server instance.
pub struct ServerContext {
    config: EngineConfig,
    threads: RealtimeThreadManager,
    diagnostics: DiagnosticChannel,
    engine: Engine,
}

impl ServerContext {
    /// Bring up a server whose diagnostics go to `tracing`.
    pub fn init(config: EngineConfig, driver: Box<dyn Driver>) -> EngineResult<Self> {
        let sink = TracingSink::new(config.diagnostics.prefix.clone());
        Self::init_with_sink(config, driver, sink)
    }

    /// Bring up a server with a custom diagnostic sink.
    pub fn init_with_sink(
        config: EngineConfig,
        driver: Box<dyn Driver>,
        sink: impl DiagnosticSink,
    ) -> EngineResult<Self> {
        config.validate()?;
        let threads = RealtimeThreadManager::new();
        if config.engine.realtime {
            threads.validate_priority(config.engine.rt_priority)?;
        }

        let ctx = ShmContext::init(&config.shm)?;
        let diagnostics = DiagnosticChannel::start(&threads, sink)?;
        let engine = Engine::new(
            &config,
            ctx,
            threads.clone(),
            diagnostics.submitter(),
            driver,
        )?;

        info!(
            service = %config.shared.service_name,
            shm = %config.shm.directory.display(),
            "Server initialized"
        );
        Ok(Self {
            config,
            threads,
            diagnostics,
            engine,
        })
    }

    /// The engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The engine, mutably.
    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    /// Loaded configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Thread manager shared by every thread the server creates.
    pub fn threads(&self) -> &RealtimeThreadManager {
        &self.threads
    }

    /// A diagnostic handle for client code running on the process thread.
    pub fn diagnostics(&self) -> DiagnosticSubmitter {
        self.diagnostics.submitter()
    }

    /// Stop the engine, drain diagnostics and destroy every segment this
    /// process created.
    pub fn teardown(self) -> EngineResult<TeardownReport> {
        let Self {
            engine,
            diagnostics,
            ..
        } = self;
        let cycles = engine.cycle_count();
        let xruns = engine.xrun_count();

        let ctx = engine.close()?;
        let summary = diagnostics.shutdown()?;
        ctx.teardown()?;

        info!(
            cycles,
            xruns,
            delivered = summary.delivered,
            overruns = summary.overruns,
            "Server torn down"
        );
        Ok(TeardownReport {
            cycles,
            xruns,
            diagnostics: summary,
        })
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}
