//! The graph under search, produced on demand.

use std::hash::{Hash, Hasher};

use xxhash_rust::xxh3::Xxh3;

/// Implicit transition system with a Büchi acceptance condition.
///
/// `successors` must be a pure function of the state: equal states yield
/// equal successor sets. It is called concurrently from every worker with no
/// shared lock held.
pub trait Model: Sync {
    type State: Clone + Eq + Hash + Send + Sync;
    type Label;

    /// Root of the search.
    fn initial_state(&self) -> Self::State;

    /// Append the outgoing transitions of `state` to `out`.
    fn successors(&self, state: &Self::State, out: &mut Vec<(Self::Label, Self::State)>);

    /// Whether `state` satisfies the acceptance condition.
    fn is_accepting(&self, state: &Self::State) -> bool;

    /// 64-bit fingerprint used to derive indexing-table keys.
    fn state_hash(&self, state: &Self::State) -> u64 {
        let mut hasher = Xxh3::new();
        state.hash(&mut hasher);
        hasher.finish()
    }
}

/// Graph with numbered vertices, given up front.
///
/// ```
/// use mcscc_engine::ExplicitGraph;
///
/// let g = ExplicitGraph::new(3)
///     .with_edge(0, 1)
///     .with_edge(1, 2)
///     .with_edge(2, 1)
///     .with_accepting(2);
/// assert_eq!(g.edge_count(), 3);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExplicitGraph {
    edges: Vec<Vec<u32>>,
    accepting: Vec<bool>,
    initial: u32,
}

impl ExplicitGraph {
    /// `vertices` isolated, non-accepting vertices; vertex 0 is initial.
    #[must_use]
    pub fn new(vertices: usize) -> Self {
        Self {
            edges: vec![Vec::new(); vertices],
            accepting: vec![false; vertices],
            initial: 0,
        }
    }

    /// Graph over `vertices` with the given edges.
    #[must_use]
    pub fn from_edges(vertices: usize, edges: &[(u32, u32)]) -> Self {
        let mut graph = Self::new(vertices);
        for &(from, to) in edges {
            graph.add_edge(from, to);
        }
        graph
    }

    /// Add the edge `from -> to`.
    ///
    /// # Panics
    ///
    /// Panics if either vertex does not exist.
    pub fn add_edge(&mut self, from: u32, to: u32) {
        assert!(
            (to as usize) < self.edges.len(),
            "edge target {to} out of range"
        );
        self.edges[from as usize].push(to);
    }

    /// Mark `vertex` accepting.
    pub fn set_accepting(&mut self, vertex: u32) {
        self.accepting[vertex as usize] = true;
    }

    #[must_use]
    pub fn with_edge(mut self, from: u32, to: u32) -> Self {
        self.add_edge(from, to);
        self
    }

    #[must_use]
    pub fn with_accepting(mut self, vertex: u32) -> Self {
        self.set_accepting(vertex);
        self
    }

    /// Start the search from `vertex` instead of 0.
    ///
    /// # Panics
    ///
    /// Panics if the vertex does not exist.
    #[must_use]
    pub fn with_initial(mut self, vertex: u32) -> Self {
        assert!((vertex as usize) < self.edges.len(), "initial vertex {vertex} out of range");
        self.initial = vertex;
        self
    }

    #[must_use]
    pub fn vertices(&self) -> usize {
        self.edges.len()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.iter().map(Vec::len).sum()
    }

    /// Targets of the edges leaving `vertex`, in insertion order.
    #[must_use]
    pub fn successors_of(&self, vertex: u32) -> &[u32] {
        &self.edges[vertex as usize]
    }
}

impl Model for ExplicitGraph {
    type State = u32;
    /// Position of the edge in its source's edge list.
    type Label = usize;

    fn initial_state(&self) -> u32 {
        self.initial
    }

    fn successors(&self, state: &u32, out: &mut Vec<(usize, u32)>) {
        out.extend(self.successors_of(*state).iter().copied().enumerate());
    }

    fn is_accepting(&self, state: &u32) -> bool {
        self.accepting[*state as usize]
    }
}
