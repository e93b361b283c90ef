//! Decoding-graph interface and its CSR-backed implementation.
//!
//! The decoder only needs a handful of read-only operations from the graph:
//! start state, final cost, per-state arcs, and a per-state count of
//! input-epsilon arcs (used to seed the non-emitting closure worklist).
//! Input labels are transition-ids with 0 reserved for epsilon; output labels
//! are word-ids.

use std::sync::Arc;

/// Graph state id.
pub type StateId = u32;

/// Reserved epsilon label on the input side of graph arcs.
pub const EPSILON: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphArc {
    pub ilabel: u32,
    pub olabel: u32,
    pub weight: f32,
    pub nextstate: StateId,
}

/// Read-only weighted decoding graph over tropical weights.
///
/// Implementations must be cheap to query: `arcs` returns a contiguous slice
/// and `num_input_epsilons` is expected to be precomputed.
pub trait DecodingGraph {
    fn start(&self) -> StateId;

    /// Final cost of a state; `f32::INFINITY` when the state is not final.
    fn final_cost(&self, state: StateId) -> f32;

    fn num_input_epsilons(&self, state: StateId) -> usize;

    fn arcs(&self, state: StateId) -> &[GraphArc];

    fn num_states(&self) -> usize;

    /// Type tag for diagnostics ("vector", "const", ...).
    fn graph_type(&self) -> &'static str;
}

/// Graph stored in CSR format: arcs sorted by source state with an
/// offsets array of length `num_states + 1`.
pub struct VectorGraph {
    start: StateId,
    offsets: Vec<u32>,
    arcs: Vec<GraphArc>,
    final_costs: Vec<f32>,
    /// Per-state count of arcs with epsilon input label.
    num_input_eps: Vec<u32>,
}

impl VectorGraph {
    /// Build a graph from an arc list. Arcs may be given in any order.
    /// `finals` lists `(state, final_cost)` pairs.
    pub fn from_arcs(
        num_states: u32,
        start: StateId,
        finals: &[(StateId, f32)],
        arc_list: &[(StateId, GraphArc)],
    ) -> Self {
        let n = num_states as usize;
        assert!((start as usize) < n, "start state out of range");

        let mut final_costs = vec![f32::INFINITY; n];
        for &(s, c) in finals {
            final_costs[s as usize] = c;
        }

        // Sort arcs by source state for CSR.
        let mut indices: Vec<usize> = (0..arc_list.len()).collect();
        indices.sort_by_key(|&i| arc_list[i].0);

        let mut offsets = vec![0u32; n + 1];
        let mut arcs = Vec::with_capacity(arc_list.len());
        let mut num_input_eps = vec![0u32; n];

        for &idx in &indices {
            let (src, arc) = arc_list[idx];
            let src = src as usize;
            offsets[src + 1] += 1;
            if arc.ilabel == EPSILON {
                num_input_eps[src] += 1;
            }
            arcs.push(arc);
        }
        for i in 1..=n {
            offsets[i] += offsets[i - 1];
        }

        VectorGraph {
            start,
            offsets,
            arcs,
            final_costs,
            num_input_eps,
        }
    }
}

impl DecodingGraph for VectorGraph {
    #[inline]
    fn start(&self) -> StateId {
        self.start
    }

    #[inline]
    fn final_cost(&self, state: StateId) -> f32 {
        self.final_costs[state as usize]
    }

    #[inline]
    fn num_input_epsilons(&self, state: StateId) -> usize {
        self.num_input_eps[state as usize] as usize
    }

    #[inline]
    fn arcs(&self, state: StateId) -> &[GraphArc] {
        let lo = self.offsets[state as usize] as usize;
        let hi = self.offsets[state as usize + 1] as usize;
        &self.arcs[lo..hi]
    }

    #[inline]
    fn num_states(&self) -> usize {
        self.final_costs.len()
    }

    fn graph_type(&self) -> &'static str {
        "vector"
    }
}

// Shared read-only access: a decoder can hold `&G` or `Arc<G>` when the same
// graph serves several instances, or `G` by value to take ownership.
impl<G: DecodingGraph + ?Sized> DecodingGraph for &G {
    fn start(&self) -> StateId {
        (**self).start()
    }
    fn final_cost(&self, state: StateId) -> f32 {
        (**self).final_cost(state)
    }
    fn num_input_epsilons(&self, state: StateId) -> usize {
        (**self).num_input_epsilons(state)
    }
    fn arcs(&self, state: StateId) -> &[GraphArc] {
        (**self).arcs(state)
    }
    fn num_states(&self) -> usize {
        (**self).num_states()
    }
    fn graph_type(&self) -> &'static str {
        (**self).graph_type()
    }
}

impl<G: DecodingGraph + ?Sized> DecodingGraph for Arc<G> {
    fn start(&self) -> StateId {
        (**self).start()
    }
    fn final_cost(&self, state: StateId) -> f32 {
        (**self).final_cost(state)
    }
    fn num_input_epsilons(&self, state: StateId) -> usize {
        (**self).num_input_epsilons(state)
    }
    fn arcs(&self, state: StateId) -> &[GraphArc] {
        (**self).arcs(state)
    }
    fn num_states(&self) -> usize {
        (**self).num_states()
    }
    fn graph_type(&self) -> &'static str {
        (**self).graph_type()
    }
}
