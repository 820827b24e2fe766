//! Multi-worker accepting-cycle checker.
//!
//! The checker owns the shared structures of one search: the state store
//! (indexing table plus reference-to-state mapping), the union-find and the
//! stop flag. [`Checker::run`] starts one scoped thread per worker; every
//! worker searches the whole graph from the initial state and they meet
//! only through the shared structures. After the run the structures stay
//! readable for queries and trace reconstruction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use mcscc_error::{McscError, Result};
use mcscc_store::StateStore;
use mcscc_types::{StateRef, Verdict, WorkerId};
use parking_lot::Mutex;

use crate::config::CheckerConfig;
use crate::model::Model;
use crate::report::{CheckReport, CycleWitness, WorkerStats};
use crate::union_find::UnionFind;
use crate::worker::Worker;

/// Shared state of one accepting-cycle search.
pub struct Checker<M: Model> {
    model: M,
    config: CheckerConfig,
    store: StateStore<M::State>,
    uf: UnionFind,
    stop: AtomicBool,
    cycle_found: AtomicBool,
    witness: Mutex<Option<CycleWitness>>,
    ran: AtomicBool,
}

/// Raises the stop flag if the owning worker unwinds.
struct StopOnPanic<'a>(&'a AtomicBool);

impl Drop for StopOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.store(true, Ordering::Release);
        }
    }
}

impl<M: Model> Checker<M> {
    /// Validate `config` and allocate the shared structures.
    ///
    /// # Errors
    ///
    /// Returns [`McscError::InvalidConfig`] for an out-of-range setting.
    pub fn new(model: M, config: CheckerConfig) -> Result<Self> {
        config.validate()?;
        let store = StateStore::new(config.log_table_size)?;
        let uf = UnionFind::new(store.max_refs());
        Ok(Self {
            model,
            config,
            store,
            uf,
            stop: AtomicBool::new(false),
            cycle_found: AtomicBool::new(false),
            witness: Mutex::new(None),
            ran: AtomicBool::new(false),
        })
    }

    /// Run the search to completion, or until an accepting cycle is proved
    /// when `stop_on_cycle` is set.
    ///
    /// # Errors
    ///
    /// - [`McscError::AlreadyRan`] on a second call.
    /// - [`McscError::TableFull`] / [`McscError::KeyCollisions`] when the
    ///   indexing table is too small; all workers stop.
    /// - [`McscError::WorkerPanicked`] when a worker hit an internal fault.
    #[allow(clippy::cast_precision_loss)]
    pub fn run(&self) -> Result<CheckReport> {
        if self.ran.swap(true, Ordering::AcqRel) {
            return Err(McscError::AlreadyRan);
        }
        let started = Instant::now();
        tracing::info!(
            target: "mcscc.checker",
            workers = self.config.workers,
            log_table_size = self.config.log_table_size,
            stop_on_cycle = self.config.stop_on_cycle,
            "search started"
        );

        let ids: Vec<WorkerId> = (0..self.config.workers)
            .filter_map(WorkerId::new)
            .collect();
        let outcomes: Vec<Result<WorkerStats>> = thread::scope(|scope| {
            let handles: Vec<_> = ids
                .iter()
                .map(|&id| {
                    scope.spawn(move || {
                        let _guard = StopOnPanic(&self.stop);
                        let outcome = Worker::new(self, id).run();
                        if outcome.is_err() {
                            self.stop.store(true, Ordering::Release);
                        }
                        outcome
                    })
                })
                .collect();
            handles
                .into_iter()
                .zip(&ids)
                .map(|(handle, id)| {
                    handle.join().unwrap_or_else(|_| {
                        Err(McscError::WorkerPanicked { worker: id.get() })
                    })
                })
                .collect()
        });

        let mut workers = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome {
                Ok(stats) => workers.push(stats),
                Err(err) => {
                    tracing::error!(target: "mcscc.checker", error = %err, "search aborted");
                    return Err(err);
                }
            }
        }

        let mut total = WorkerStats::default();
        for stats in &workers {
            total.absorb(stats);
        }
        let verdict = if self.cycle_found.load(Ordering::Acquire) {
            Verdict::CycleFound
        } else {
            Verdict::NoCycleFound
        };
        let avg_component_size = if total.components > 0 {
            total.unique as f64 / total.components as f64
        } else {
            0.0
        };
        let stack_bytes: u64 = workers.iter().map(|s| s.peak_stack).sum::<u64>()
            * std::mem::size_of::<StateRef>() as u64;
        let report = CheckReport {
            verdict,
            states: total.unique,
            explored: total.explored,
            transitions: total.transitions,
            components: total.components,
            self_loops: total.self_loops,
            max_depth: total.max_depth,
            states_stored: self.store.len(),
            avg_component_size,
            memory_bytes: self.store.memory_bytes()
                + self.uf.memory_bytes()
                + stack_bytes as usize,
            elapsed: started.elapsed(),
            workers,
            witness: self.witness.lock().clone(),
        };
        tracing::info!(
            target: "mcscc.checker",
            verdict = %report.verdict,
            states = report.states,
            transitions = report.transitions,
            components = report.components,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "search finished"
        );
        Ok(report)
    }

    #[must_use]
    pub const fn config(&self) -> &CheckerConfig {
        &self.config
    }

    #[must_use]
    pub const fn model(&self) -> &M {
        &self.model
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Ask all workers to stop at their next loop iteration.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Whether `a` and `b` ended up in one component.
    #[must_use]
    pub fn same_component(&self, a: StateRef, b: StateRef) -> bool {
        self.uf.same_set(a, b)
    }

    /// Whether the component of `r` was completed.
    #[must_use]
    pub fn is_dead(&self, r: StateRef) -> bool {
        self.uf.is_dead(r)
    }

    /// Reference of `state`, if the search reached it.
    ///
    /// # Errors
    ///
    /// Propagates indexing-table errors.
    pub fn lookup(&self, state: &M::State) -> Result<Option<StateRef>> {
        self.store.lookup(state, self.model.state_hash(state))
    }

    /// State vector behind `r`.
    #[must_use]
    pub fn state(&self, r: StateRef) -> Option<&M::State> {
        self.store.get(r)
    }

    /// Where the first accepting cycle was proved.
    #[must_use]
    pub fn witness(&self) -> Option<CycleWitness> {
        self.witness.lock().clone()
    }

    #[must_use]
    pub const fn union_find(&self) -> &UnionFind {
        &self.uf
    }

    #[must_use]
    pub const fn store(&self) -> &StateStore<M::State> {
        &self.store
    }

    pub(crate) fn intern(&self, state: &M::State) -> Result<StateRef> {
        let hash = self.model.state_hash(state);
        let (r, _) = self.store.find_or_put(state, hash)?;
        Ok(r)
    }

    pub(crate) fn is_accepting_ref(&self, r: StateRef) -> bool {
        self.store
            .get(r)
            .is_some_and(|state| self.model.is_accepting(state))
    }

    pub(crate) fn report_cycle(&self, worker: WorkerId, state: StateRef, path: Vec<StateRef>) {
        let first = !self.cycle_found.swap(true, Ordering::AcqRel);
        if first {
            tracing::info!(
                target: "mcscc.worker",
                %worker,
                %state,
                depth = path.len(),
                "accepting cycle found"
            );
            *self.witness.lock() = Some(CycleWitness {
                worker,
                state,
                path,
            });
        }
        if self.config.stop_on_cycle {
            self.stop();
        }
    }
}

impl<M: Model> std::fmt::Debug for Checker<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checker")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("uf", &self.uf)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}
