//! Simulation driver: runs the iteration loop on a backend
//!
//! One iteration is always encode → sort → build tree → attractive forces →
//! repulsive forces → integrate. The driver owns the cooling schedule, the
//! synchronisation cadence and the termination checks; backends only know how
//! to run a single iteration.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::LayoutConfig;
use crate::cooling::{CoolingSchedule, StopReason};
use crate::error::{LayoutError, LayoutResult};
use crate::gpu::{BoundingBox, GpuNode};
use crate::graph::GraphData;

/// Parameters of a single iteration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationParams {
    pub cooling_factor: f32,
    pub ideal_length: f32,
    pub theta: f32,
    pub domain_low: f32,
    pub domain_high: f32,
}

/// An execution target for the layout pipeline
pub trait LayoutBackend {
    /// Copy a dataset into backend-owned buffers, replacing any previous one
    fn load(&mut self, graph: &GraphData) -> LayoutResult<()>;

    fn node_count(&self) -> usize;

    fn edge_count(&self) -> usize;

    /// Queue one full iteration. May return before the work has finished.
    fn iterate(&mut self, params: &IterationParams) -> LayoutResult<()>;

    /// Block until all queued iterations have finished
    fn synchronize(&mut self) -> LayoutResult<()>;

    fn read_positions(&mut self) -> LayoutResult<Vec<GpuNode>>;

    fn read_bounds(&mut self) -> LayoutResult<BoundingBox>;
}

/// Lifecycle of a [`LayoutEngine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    Completed,
    Stopped,
}

/// Cooperative stop flag, observed at iteration boundaries
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running layout to stop after its current iteration
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Periodic report emitted at every synchronisation point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub iteration: u32,
    pub cooling_factor: f32,
    pub elapsed: Duration,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let average_ms = if self.iteration == 0 {
            0.0
        } else {
            self.elapsed.as_secs_f64() * 1000.0 / f64::from(self.iteration)
        };
        write!(
            f,
            "Iteration {} ({:.3} s, {:.3} ms per iteration)",
            self.iteration,
            self.elapsed.as_secs_f64(),
            average_ms
        )
    }
}

/// Statistics of a finished run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    pub iterations: u32,
    pub elapsed: Duration,
    pub final_cooling: f32,
    pub reason: StopReason,
}

impl RunSummary {
    /// Mean wall time per iteration in milliseconds
    pub fn average_iteration_ms(&self) -> f64 {
        if self.iterations == 0 {
            0.0
        } else {
            self.elapsed.as_secs_f64() * 1000.0 / f64::from(self.iterations)
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Completed in {} iterations with average iteration time {:.3} ms",
            self.iterations,
            self.average_iteration_ms()
        )
    }
}

/// Result of [`LayoutEngine::run`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunOutcome {
    /// Nothing to lay out; the backend was not touched
    NoData,
    Completed(RunSummary),
    Stopped(RunSummary),
}

impl RunOutcome {
    pub fn summary(&self) -> Option<&RunSummary> {
        match self {
            RunOutcome::NoData => None,
            RunOutcome::Completed(summary) | RunOutcome::Stopped(summary) => Some(summary),
        }
    }
}

/// Owns a backend and drives layout runs on it.
///
/// Parameters can only change between runs: [`LayoutEngine::run`] borrows
/// the engine mutably for its whole duration.
pub struct LayoutEngine<B: LayoutBackend> {
    backend: B,
    config: LayoutConfig,
    state: EngineState,
    loaded: bool,
    stop: StopHandle,
}

impl<B: LayoutBackend> LayoutEngine<B> {
    pub fn new(backend: B, config: LayoutConfig) -> LayoutResult<Self> {
        config.validate()?;
        Ok(Self {
            backend,
            config,
            state: EngineState::Idle,
            loaded: false,
            stop: StopHandle::new(),
        })
    }

    /// Hand a new dataset to the backend and return to `Idle`
    pub fn load(&mut self, graph: &GraphData) -> LayoutResult<()> {
        graph.validate()?;
        self.backend.load(graph)?;
        self.loaded = true;
        self.state = EngineState::Idle;
        tracing::info!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "loaded graph"
        );
        Ok(())
    }

    pub fn config(&self) -> &LayoutConfig {
        &self.config
    }

    /// Replace the parameters used by subsequent runs
    pub fn set_config(&mut self, config: LayoutConfig) -> LayoutResult<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Handle that can stop a run from another thread
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Current node positions
    pub fn positions(&mut self) -> LayoutResult<Vec<GpuNode>> {
        if !self.loaded {
            return Err(LayoutError::NotLoaded);
        }
        self.backend.read_positions()
    }

    pub fn run(&mut self) -> LayoutResult<RunOutcome> {
        self.run_with_progress(|_| {})
    }

    /// Run until convergence, budget exhaustion or a stop request.
    ///
    /// `on_progress` is called at every synchronisation point.
    pub fn run_with_progress(
        &mut self,
        mut on_progress: impl FnMut(&Progress),
    ) -> LayoutResult<RunOutcome> {
        if !self.loaded {
            return Err(LayoutError::NotLoaded);
        }

        let nodes = self.backend.node_count();
        let edges = self.backend.edge_count();
        if nodes == 0 || (self.config.require_edges && edges == 0) {
            tracing::warn!(nodes, edges, "no data to lay out");
            self.state = EngineState::Idle;
            return Ok(RunOutcome::NoData);
        }

        self.stop.clear();
        self.state = EngineState::Running;
        tracing::info!(
            nodes,
            edges,
            budget = self.config.iteration_budget,
            "starting layout run"
        );

        let result = self.iterate_until_done(&mut on_progress);
        let summary = match result {
            Ok(summary) => summary,
            Err(e) => {
                self.state = EngineState::Idle;
                return Err(e);
            }
        };

        let outcome = if summary.reason == StopReason::Requested {
            self.state = EngineState::Stopped;
            RunOutcome::Stopped(summary)
        } else {
            self.state = EngineState::Completed;
            RunOutcome::Completed(summary)
        };
        tracing::info!(reason = ?summary.reason, "{}", summary);
        Ok(outcome)
    }

    fn iterate_until_done(
        &mut self,
        on_progress: &mut impl FnMut(&Progress),
    ) -> LayoutResult<RunSummary> {
        let schedule = CoolingSchedule::from_config(&self.config);
        let sync_interval = self.config.sync_interval.max(1);
        let start = Instant::now();
        let mut iteration = 0;

        let reason = loop {
            if let Some(reason) = schedule.termination(iteration) {
                break reason;
            }
            if self.stop.is_requested() {
                break StopReason::Requested;
            }

            let params = IterationParams {
                cooling_factor: schedule.factor(iteration),
                ideal_length: self.config.ideal_length,
                theta: self.config.theta,
                domain_low: self.config.domain_low,
                domain_high: self.config.domain_high,
            };
            self.backend.iterate(&params)?;
            iteration += 1;

            if iteration % sync_interval == 0 {
                self.backend.synchronize()?;
                let progress = Progress {
                    iteration,
                    cooling_factor: schedule.factor(iteration),
                    elapsed: start.elapsed(),
                };
                tracing::debug!(cooling = progress.cooling_factor, "{}", progress);
                on_progress(&progress);
            }
        };

        self.backend.synchronize()?;

        Ok(RunSummary {
            iterations: iteration,
            elapsed: start.elapsed(),
            final_cooling: schedule.factor(iteration),
            reason,
        })
    }
}
