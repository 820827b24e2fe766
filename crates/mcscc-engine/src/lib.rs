//! Multi-core on-the-fly accepting-cycle detection.
//!
//! A [`Checker`] runs one union-find SCC search per worker thread over a
//! [`Model`]. Workers share the indexing table, the union-find and a stop
//! flag; the first union that merges an accepting state into a non-trivial
//! component (or an accepting self-loop) proves an accepting cycle.
//!
//! ```
//! use mcscc_engine::{Checker, CheckerConfig, ExplicitGraph};
//!
//! let graph = ExplicitGraph::from_edges(3, &[(0, 1), (1, 2), (2, 1)]).with_accepting(2);
//! let config = CheckerConfig::default().with_workers(2).with_log_table_size(10);
//! let report = Checker::new(graph, config)?.run()?;
//! assert!(report.is_cycle());
//! # Ok::<(), mcscc_error::McscError>(())
//! ```

pub mod checker;
pub mod config;
pub mod model;
pub mod report;
pub mod union_find;
mod worker;

pub use checker::Checker;
pub use config::{CheckerConfig, DEFAULT_LOG_TABLE_SIZE, PERMUTE_STRIDE};
pub use model::{ExplicitGraph, Model};
pub use report::{CheckReport, CycleWitness, WorkerStats};
pub use union_find::{Claim, Pick, UnionFind};
