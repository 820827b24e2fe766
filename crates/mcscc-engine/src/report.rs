//! Run counters and the final report.

use std::fmt;
use std::time::Duration;

use mcscc_types::{StateRef, Verdict, WorkerId};
use serde::Serialize;

/// Counters of one worker, summed only when the run ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct WorkerStats {
    /// States whose successors this worker expanded.
    pub explored: u64,
    /// States this worker claimed before anyone else.
    pub unique: u64,
    /// Successor edges generated.
    pub transitions: u64,
    pub self_loops: u64,
    /// Components this worker marked dead.
    pub components: u64,
    /// Deepest search stack, in expanded states.
    pub max_depth: u64,
    /// Most entries held by the search stack at once.
    pub peak_stack: u64,
}

impl WorkerStats {
    /// Fold `other` into `self`: counts add, watermarks take the maximum.
    pub fn absorb(&mut self, other: &Self) {
        self.explored += other.explored;
        self.unique += other.unique;
        self.transitions += other.transitions;
        self.self_loops += other.self_loops;
        self.components += other.components;
        self.max_depth = self.max_depth.max(other.max_depth);
        self.peak_stack = self.peak_stack.max(other.peak_stack);
    }
}

impl fmt::Display for WorkerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "explored={} unique={} transitions={} self_loops={} components={} max_depth={}",
            self.explored,
            self.unique,
            self.transitions,
            self.self_loops,
            self.components,
            self.max_depth,
        )
    }
}

/// Where an accepting cycle was proved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleWitness {
    pub worker: WorkerId,
    /// A state of the accepting component.
    pub state: StateRef,
    /// The worker's search path from the initial state, at proof time.
    pub path: Vec<StateRef>,
}

/// Outcome and counters of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckReport {
    pub verdict: Verdict,
    /// Distinct states claimed.
    pub states: u64,
    /// State expansions across workers; exceeds `states` when workers
    /// overlap.
    pub explored: u64,
    pub transitions: u64,
    /// Components marked dead.
    pub components: u64,
    pub self_loops: u64,
    pub max_depth: u64,
    /// References issued by the indexing table.
    pub states_stored: usize,
    /// `states / components`, or 0 without completed components.
    pub avg_component_size: f64,
    /// Bytes held by the shared structures and the peak search stacks.
    pub memory_bytes: usize,
    pub elapsed: Duration,
    pub workers: Vec<WorkerStats>,
    pub witness: Option<CycleWitness>,
}

impl CheckReport {
    /// Whether an accepting cycle was proved.
    #[must_use]
    pub const fn is_cycle(&self) -> bool {
        self.verdict.is_cycle()
    }

    /// Sum of all worker counters.
    #[must_use]
    pub fn totals(&self) -> WorkerStats {
        let mut total = WorkerStats::default();
        for stats in &self.workers {
            total.absorb(stats);
        }
        total
    }

    /// Serialize as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns [`mcscc_error::McscError::Json`] if serialization fails.
    pub fn to_json(&self) -> mcscc_error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: states={} transitions={} components={} self_loops={} max_depth={} memory_bytes={} elapsed_ms={}",
            self.verdict,
            self.states,
            self.transitions,
            self.components,
            self.self_loops,
            self.max_depth,
            self.memory_bytes,
            self.elapsed.as_millis(),
        )
    }
}
