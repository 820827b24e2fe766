//! One search worker.
//!
//! Each worker runs a depth-first search over the shared union-find. The
//! search stack is a [`FrameStack`]: the element that opened a frame is the
//! state being expanded (`peek(1)`), the frame holds its not yet handled
//! successors. The roots stack holds one entry per open component root.
//!
//! For an edge `src -> t` the worker claims `t`:
//!
//! - `First`/`Success`: push `t` on the roots stack and expand it;
//! - `Dead`: skip;
//! - `Found` in the set of `src`: skip;
//! - `Found` elsewhere: pop roots and unite them with `src` until `src` and
//!   `t` share a set. A union whose set holds an accepting state proves an
//!   accepting cycle.
//!
//! A state whose successors are all handled leaves its component's list.
//! On backtrack the worker either stays in the parent's component, picks
//! another live member of the finished state's component, or marks the
//! component dead.

use std::convert::Infallible;
use std::ops::ControlFlow;

use mcscc_error::Result;
use mcscc_store::FrameStack;
use mcscc_types::{StateRef, WorkerId};

use crate::checker::Checker;
use crate::config::PERMUTE_STRIDE;
use crate::model::Model;
use crate::report::WorkerStats;
use crate::union_find::{Claim, Pick};

pub(crate) struct Worker<'a, M: Model> {
    checker: &'a Checker<M>,
    id: WorkerId,
    dfs: FrameStack<StateRef>,
    roots: FrameStack<StateRef>,
    successors: Vec<(M::Label, M::State)>,
    stats: WorkerStats,
}

impl<'a, M: Model> Worker<'a, M> {
    pub(crate) fn new(checker: &'a Checker<M>, id: WorkerId) -> Self {
        Self {
            checker,
            id,
            dfs: FrameStack::with_capacity(1_024),
            roots: FrameStack::with_capacity(256),
            successors: Vec::new(),
            stats: WorkerStats::default(),
        }
    }

    /// Search from the initial state until it is dead or the run stops.
    pub(crate) fn run(mut self) -> Result<WorkerStats> {
        let checker = self.checker;
        let initial = checker.intern(&checker.model().initial_state())?;
        tracing::debug!(target: "mcscc.worker", worker = %self.id, %initial, "worker started");

        match self.claim(initial) {
            Claim::Dead => return Ok(self.finish()),
            Claim::First | Claim::Success | Claim::Found => {}
        }
        self.roots.push(initial);
        self.dfs.push(initial);
        self.expand(initial)?;

        while !checker.is_stopped() {
            let src = *self.dfs.peek(1);
            let next = if checker.union_find().is_in_list(src) {
                self.dfs.top().copied()
            } else {
                None
            };
            match next {
                Some(target) => self.follow_edge(src, target)?,
                None => {
                    checker.union_find().remove_from_list(src);
                    self.dfs.leave();
                    let done = self.dfs.pop();
                    if self.backtrack(done)? {
                        break;
                    }
                }
            }
        }
        Ok(self.finish())
    }

    fn claim(&mut self, r: StateRef) -> Claim {
        let checker = self.checker;
        let claim = checker
            .union_find()
            .claim(r, self.id, || checker.is_accepting_ref(r));
        if claim == Claim::First {
            self.stats.unique += 1;
            let interval = checker.config().progress_interval;
            if interval > 0 && self.stats.unique % interval == 0 {
                tracing::info!(
                    target: "mcscc.worker",
                    worker = %self.id,
                    explored = self.stats.explored,
                    unique = self.stats.unique,
                    transitions = self.stats.transitions,
                    depth = self.dfs.frame_count(),
                    "progress"
                );
            }
        }
        claim
    }

    /// Open a frame above `r` (the top of the current frame) holding its
    /// successors.
    fn expand(&mut self, r: StateRef) -> Result<()> {
        let checker = self.checker;
        let Some(state) = checker.state(r) else {
            unreachable!("reference {r} has no stored state");
        };
        self.successors.clear();
        checker.model().successors(state, &mut self.successors);
        let out_degree = self.successors.len();

        self.dfs.enter();
        let start = if checker.config().permute_successors && out_degree > 0 {
            (self.id.get() * PERMUTE_STRIDE) % out_degree
        } else {
            0
        };
        for i in 0..out_degree {
            let (_, succ) = &self.successors[(start + i) % out_degree];
            let succ_ref = checker.intern(succ)?;
            self.dfs.push(succ_ref);
        }

        self.stats.explored += 1;
        self.stats.transitions += out_degree as u64;
        self.stats.max_depth = self.stats.max_depth.max(self.dfs.frame_count() as u64);
        Ok(())
    }

    fn follow_edge(&mut self, src: StateRef, target: StateRef) -> Result<()> {
        let checker = self.checker;
        let uf = checker.union_find();

        if target == src {
            self.dfs.pop();
            self.stats.self_loops += 1;
            if checker.is_accepting_ref(src) {
                self.report_cycle(src);
            }
            return Ok(());
        }

        match self.claim(target) {
            Claim::First | Claim::Success => {
                self.roots.push(target);
                self.expand(target)?;
            }
            Claim::Dead => {
                self.dfs.pop();
            }
            Claim::Found => {
                self.dfs.pop();
                while !uf.same_set(src, target) {
                    self.roots.pop();
                    let Some(&root) = self.roots.top() else {
                        panic!("roots stack exhausted while uniting {src} with {target}");
                    };
                    if uf.union(root, src) {
                        self.report_cycle(src);
                    }
                }
            }
        }
        Ok(())
    }

    /// Handle the fully handled state `done`, just popped. Returns whether
    /// the search is over.
    fn backtrack(&mut self, done: StateRef) -> Result<bool> {
        let uf = self.checker.union_find();
        let parent = (self.dfs.frame_count() > 0).then(|| *self.dfs.peek(1));
        if parent.is_some_and(|p| uf.same_set(p, done)) {
            return Ok(false);
        }

        match uf.pick_from_list(done) {
            Pick::Live(next) => {
                self.dfs.push(next);
                self.expand(next)?;
                Ok(false)
            }
            pick @ (Pick::Dead | Pick::MarkedDead) => {
                if pick == Pick::MarkedDead {
                    self.stats.components += 1;
                }
                if parent.is_none() {
                    return Ok(true);
                }
                loop {
                    let Some(&root) = self.roots.top() else {
                        panic!("roots stack exhausted below dead component of {done}");
                    };
                    if !uf.same_set(done, root) {
                        break;
                    }
                    self.roots.pop();
                }
                Ok(false)
            }
        }
    }

    fn report_cycle(&self, state: StateRef) {
        let mut path = Vec::with_capacity(self.dfs.frame_count());
        let ControlFlow::Continue(()) = self.dfs.walk_down(|&r| {
            path.push(r);
            ControlFlow::<Infallible>::Continue(())
        });
        self.checker.report_cycle(self.id, state, path);
    }

    fn finish(mut self) -> WorkerStats {
        self.stats.peak_stack = (self.dfs.peak_len() + self.roots.peak_len()) as u64;
        let stopped = self.checker.is_stopped();
        tracing::debug!(
            target: "mcscc.worker",
            worker = %self.id,
            stopped,
            stats = %self.stats,
            "worker finished"
        );
        self.stats
    }
}
