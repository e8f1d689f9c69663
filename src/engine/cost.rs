//! Orchestration overhead accounting.
//!
//! Everything is measured in monotonic microseconds through the injected
//! [`Clock`], so the numbers are exact under a manual clock in tests.

use std::sync::Arc;

use crate::clock::Clock;
use crate::execution::{OrchestrationCost, WaveStats};

pub(crate) struct CostTracker {
    clock: Arc<dyn Clock>,
    run_start: u64,
    graph_build: u64,
    first_dispatch: Option<u64>,
    last_completion: Option<u64>,
    previous_wave_end: Option<u64>,
    current_wave_start: u64,
    waves: Vec<WaveStats>,
}

impl CostTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let run_start = clock.now_micros();
        Self {
            clock,
            run_start,
            graph_build: 0,
            first_dispatch: None,
            last_completion: None,
            previous_wave_end: None,
            current_wave_start: 0,
            waves: Vec::new(),
        }
    }

    pub fn now(&self) -> u64 {
        self.clock.now_micros()
    }

    pub fn record_graph_build(&mut self, started: u64) {
        self.graph_build = self.now().saturating_sub(started);
    }

    pub fn graph_build_micros(&self) -> u64 {
        self.graph_build
    }

    /// Called when the engine starts admitting a wave's tasks. The gap to
    /// the previous wave's end is that wave's scheduling delay.
    pub fn wave_started(&mut self, iteration: usize, task_ids: Vec<String>) {
        let now = self.now();
        let delay = self
            .previous_wave_end
            .map_or(0, |end| now.saturating_sub(end));
        self.current_wave_start = now;
        self.waves.push(WaveStats {
            iteration,
            task_ids,
            duration_micros: 0,
            scheduling_delay_micros: delay,
        });
    }

    pub fn task_dispatched(&mut self) {
        if self.first_dispatch.is_none() {
            self.first_dispatch = Some(self.now());
        }
    }

    pub fn wave_finished(&mut self) {
        let now = self.now();
        self.last_completion = Some(now);
        self.previous_wave_end = Some(now);
        if let Some(wave) = self.waves.last_mut() {
            wave.duration_micros = now.saturating_sub(self.current_wave_start);
        }
    }

    /// Seal the accounting at `execute()` return time.
    pub fn finish(self) -> (OrchestrationCost, u64) {
        let finished = self.now();
        let total = finished.saturating_sub(self.run_start);

        let setup = self
            .first_dispatch
            .unwrap_or(finished)
            .saturating_sub(self.run_start);
        let teardown = self
            .last_completion
            .map_or(0, |last| finished.saturating_sub(last));
        let scheduling: u64 = self.waves.iter().map(|w| w.scheduling_delay_micros).sum();
        let cost = setup + teardown + scheduling;
        // Precision loss is acceptable for a reporting percentage.
        #[allow(clippy::cast_precision_loss)]
        let percentage = if total == 0 {
            0.0
        } else {
            cost as f64 / total as f64 * 100.0
        };

        let execution_time_ms = total / 1_000;
        (
            OrchestrationCost {
                setup_duration_micros: setup,
                teardown_duration_micros: teardown,
                scheduling_overhead_micros: scheduling,
                total_orchestration_cost_micros: cost,
                orchestration_cost_percentage: percentage,
                execution_iterations: self.waves.len(),
                waves: self.waves,
            },
            execution_time_ms,
        )
    }
}
