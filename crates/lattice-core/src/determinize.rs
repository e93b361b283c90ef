//! Pruned lattice determinization.
//!
//! Turns a state-level lattice into a word-level compact lattice: every
//! distinct word sequence keeps exactly one path, weighted by the cheapest
//! state-level path with that word sequence and carrying that path's
//! transition-id string.
//!
//! The construction is a weighted subset BFS. A determinized state is a set
//! of `(lattice state, residual weight, residual transition-id string)`
//! elements, canonicalized by dividing out the minimum weight and the common
//! string prefix (both go onto the incoming arc) and interned by quantized
//! key, the same intern-the-subset pattern as a plain powerset construction.
//! Expansion is pruned against a backward best-cost array: any element that
//! cannot reach a final state within `beam` of the overall best path is
//! dropped.
//!
//! The input must be acyclic. Chunk lattices are acyclic by construction;
//! a cycle therefore indicates an epsilon cycle in the decoding graph.

use crate::lattice::{CompactLattice, CompactLatticeArc, Lattice};
use crate::weight::{CompactLatticeWeight, LatticeWeight};
use crate::LatticeError;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

/// Options for the determinization back-end.
#[derive(Debug, Clone, Copy)]
pub struct DeterminizeOptions {
    /// Weight quantization step used when interning subsets.
    pub delta: f32,
    /// Approximate memory bound in bytes; exceeding it truncates the
    /// construction (recoverable, the result is still a valid lattice).
    pub max_mem: usize,
}

impl Default for DeterminizeOptions {
    fn default() -> Self {
        DeterminizeOptions {
            delta: 1.0 / 1024.0,
            max_mem: 50_000_000,
        }
    }
}

/// One entry of a weighted subset.
#[derive(Debug, Clone)]
struct Element {
    state: u32,
    weight: LatticeWeight,
    string: Vec<u32>,
}

/// Quantized subset key for interning.
type SubsetKey = Vec<(u32, i64, i64, Vec<u32>)>;

struct SubsetArena {
    map: FxHashMap<SubsetKey, u32>,
    subsets: Vec<Vec<Element>>,
    /// Best known forward cost (total) into each determinized state.
    forward: Vec<f32>,
    mem_used: usize,
}

impl SubsetArena {
    fn new() -> Self {
        SubsetArena {
            map: FxHashMap::default(),
            subsets: Vec::new(),
            forward: Vec::new(),
            mem_used: 0,
        }
    }

    /// Intern a canonical subset. Returns `(id, is_new)` and keeps the
    /// smallest forward cost seen for the id.
    fn intern(&mut self, elems: Vec<Element>, forward: f32, delta: f32) -> (u32, bool) {
        let key: SubsetKey = elems
            .iter()
            .map(|e| {
                (
                    e.state,
                    (e.weight.graph / delta).round() as i64,
                    (e.weight.acoustic / delta).round() as i64,
                    e.string.clone(),
                )
            })
            .collect();
        if let Some(&id) = self.map.get(&key) {
            if forward < self.forward[id as usize] {
                self.forward[id as usize] = forward;
            }
            return (id, false);
        }
        let id = self.subsets.len() as u32;
        self.mem_used += elems
            .iter()
            .map(|e| 32 + 4 * e.string.len())
            .sum::<usize>()
            + 64;
        self.subsets.push(elems);
        self.forward.push(forward);
        self.map.insert(key, id);
        (id, true)
    }
}

/// Deterministic element order: by state, then weight, then string.
fn element_better(a: &Element, b: &Element) -> bool {
    let (ta, tb) = (a.weight.total(), b.weight.total());
    if ta != tb {
        return ta < tb;
    }
    if a.weight.graph != b.weight.graph {
        return a.weight.graph < b.weight.graph;
    }
    a.string < b.string
}

/// Close a set of elements over word-epsilon arcs (olabel == 0), keeping the
/// best element per lattice state. `topo_order` is the input's topological
/// order, so one forward sweep reaches a fixpoint.
fn epsilon_close(
    lat: &Lattice,
    topo_order: &[u32],
    elems: Vec<Element>,
    beam_limit: impl Fn(&Element) -> bool,
) -> Vec<Element> {
    let mut best: FxHashMap<u32, Element> = FxHashMap::default();
    for e in elems {
        match best.get(&e.state) {
            Some(old) if !element_better(&e, old) => {}
            _ => {
                best.insert(e.state, e);
            }
        }
    }
    for &s in topo_order {
        let Some(e) = best.get(&s).cloned() else { continue };
        for a in lat.arcs(s) {
            if a.olabel != 0 {
                continue;
            }
            let mut string = e.string.clone();
            if a.ilabel != 0 {
                string.push(a.ilabel);
            }
            let cand = Element {
                state: a.nextstate,
                weight: e.weight.times(&a.weight),
                string,
            };
            if beam_limit(&cand) {
                continue;
            }
            match best.get(&cand.state) {
                Some(old) if !element_better(&cand, old) => {}
                _ => {
                    best.insert(cand.state, cand);
                }
            }
        }
    }
    let mut out: Vec<Element> = best.into_values().collect();
    out.sort_by_key(|e| e.state);
    out
}

/// Divide out the minimum weight and the common string prefix; returns the
/// extracted common part as a `CompactLatticeWeight`.
fn normalize(elems: &mut Vec<Element>) -> CompactLatticeWeight {
    debug_assert!(!elems.is_empty());
    let mut min_idx = 0;
    for i in 1..elems.len() {
        if element_better(&elems[i], &elems[min_idx]) {
            min_idx = i;
        }
    }
    let common_w = elems[min_idx].weight;

    let mut prefix_len = elems[0].string.len();
    for e in elems.iter().skip(1) {
        let mut l = 0;
        while l < prefix_len && l < e.string.len() && e.string[l] == elems[0].string[l] {
            l += 1;
        }
        prefix_len = l;
    }
    let prefix: Vec<u32> = elems[0].string[..prefix_len].to_vec();

    for e in elems.iter_mut() {
        e.weight = LatticeWeight::new(
            e.weight.graph - common_w.graph,
            e.weight.acoustic - common_w.acoustic,
        );
        e.string.drain(..prefix_len);
    }
    CompactLatticeWeight::new(common_w, prefix)
}

/// Backward best total cost from each state to any final state.
fn backward_costs(lat: &Lattice, topo_order: &[u32]) -> Vec<f32> {
    let mut beta = vec![f32::INFINITY; lat.num_states()];
    for &s in topo_order.iter().rev() {
        let f = lat.final_weight(s);
        let mut b = if f.is_zero() { f32::INFINITY } else { f.total() };
        for a in lat.arcs(s) {
            let cand = a.weight.total() + beta[a.nextstate as usize];
            if cand < b {
                b = cand;
            }
        }
        beta[s as usize] = b;
    }
    beta
}

/// Determinize `lat` over its word (output) labels with beam pruning.
///
/// Returns the compact lattice and a flag that is false when the
/// construction was truncated by `opts.max_mem` (callers log a warning; the
/// partial result is still usable).
pub fn determinize_lattice_pruned(
    lat: &Lattice,
    beam: f32,
    opts: &DeterminizeOptions,
) -> Result<(CompactLattice, bool), LatticeError> {
    let mut clat = CompactLattice::new();
    if lat.is_empty() {
        return Ok((clat, true));
    }
    let topo_order = lat.top_sort_order().ok_or(LatticeError::EpsilonCycle)?;
    let beta = backward_costs(lat, &topo_order);
    let best = beta[lat.start() as usize];
    if best == f32::INFINITY {
        // No path reaches a final state; nothing to determinize.
        return Ok((clat, true));
    }
    let cutoff = best + beam;

    let mut arena = SubsetArena::new();
    let mut worklist: VecDeque<u32> = VecDeque::new();

    let start_elems = epsilon_close(
        lat,
        &topo_order,
        vec![Element {
            state: lat.start(),
            weight: LatticeWeight::one(),
            string: Vec::new(),
        }],
        |e| e.weight.total() + beta[e.state as usize] > cutoff,
    );
    if start_elems.is_empty() {
        return Ok((clat, true));
    }
    // The start subset is not normalized: there is no incoming arc to carry
    // a divided-out weight, and the start state is never re-entered.
    let (start_id, _) = arena.intern(start_elems, 0.0, opts.delta);
    clat.add_state();
    clat.set_start(start_id);
    worklist.push_back(start_id);

    let mut truncated = false;

    while let Some(sid) = worklist.pop_front() {
        if arena.mem_used > opts.max_mem {
            truncated = true;
            break;
        }
        let subset = arena.subsets[sid as usize].clone();
        let fwd = arena.forward[sid as usize];

        // Final weight: the best element that is final in the input.
        let mut final_w: Option<(LatticeWeight, Vec<u32>)> = None;
        for e in &subset {
            let f = lat.final_weight(e.state);
            if f.is_zero() {
                continue;
            }
            let w = e.weight.times(&f);
            if fwd + w.total() > cutoff {
                continue;
            }
            let better = match &final_w {
                None => true,
                Some((bw, bs)) => {
                    w.total() < bw.total()
                        || (w.total() == bw.total() && w.graph < bw.graph)
                        || (w.total() == bw.total() && w.graph == bw.graph && e.string < *bs)
                }
            };
            if better {
                final_w = Some((w, e.string.clone()));
            }
        }
        if let Some((w, string)) = final_w {
            clat.set_final(sid, CompactLatticeWeight::new(w, string));
        }

        // Bucket successor elements by word label.
        let mut buckets: FxHashMap<u32, Vec<Element>> = FxHashMap::default();
        for e in &subset {
            for a in lat.arcs(e.state) {
                if a.olabel == 0 {
                    continue; // inside the closure already
                }
                let mut string = e.string.clone();
                if a.ilabel != 0 {
                    string.push(a.ilabel);
                }
                let cand = Element {
                    state: a.nextstate,
                    weight: e.weight.times(&a.weight),
                    string,
                };
                if fwd + cand.weight.total() + beta[cand.state as usize] > cutoff {
                    continue;
                }
                buckets.entry(a.olabel).or_default().push(cand);
            }
        }

        let mut labels: Vec<u32> = buckets.keys().copied().collect();
        labels.sort_unstable();
        for label in labels {
            let elems = buckets.remove(&label).unwrap();
            let closed = epsilon_close(lat, &topo_order, elems, |e| {
                fwd + e.weight.total() + beta[e.state as usize] > cutoff
            });
            if closed.is_empty() {
                continue;
            }
            let mut set = closed;
            let common = normalize(&mut set);
            let next_fwd = fwd + common.weight.total();
            let (did, is_new) = arena.intern(set, next_fwd, opts.delta);
            if is_new {
                clat.add_state();
                worklist.push_back(did);
            }
            clat.add_arc(
                sid,
                CompactLatticeArc {
                    label,
                    weight: common,
                    nextstate: did,
                },
            );
        }
    }

    if truncated {
        log::warn!(
            "lattice determinization hit the memory bound ({} bytes); result is truncated",
            opts.max_mem
        );
    }
    clat.connect();
    Ok((clat, !truncated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::LatticeArc;

    fn arc(ilabel: u32, olabel: u32, g: f32, a: f32, nextstate: u32) -> LatticeArc {
        LatticeArc {
            ilabel,
            olabel,
            weight: LatticeWeight::new(g, a),
            nextstate,
        }
    }

    /// Two state-level paths with the same word must merge into one arc
    /// carrying the cheaper path's alignment.
    #[test]
    fn test_same_word_paths_merge() {
        let mut lat = Lattice::new();
        let s0 = lat.add_state();
        let s1 = lat.add_state();
        let s2 = lat.add_state();
        lat.set_start(s0);
        lat.add_arc(s0, arc(10, 5, 0.0, 1.0, s1));
        lat.add_arc(s0, arc(11, 5, 0.0, 3.0, s2));
        lat.set_final(s1, LatticeWeight::one());
        lat.set_final(s2, LatticeWeight::one());

        let (clat, full) = determinize_lattice_pruned(&lat, 10.0, &DeterminizeOptions::default())
            .unwrap();
        assert!(full);
        assert_eq!(clat.arcs(clat.start()).len(), 1);
        let a = &clat.arcs(clat.start())[0];
        assert_eq!(a.label, 5);
        // The strings diverge immediately, so the arc carries no common
        // prefix; the best path's alignment surfaces on the final weight.
        assert_eq!(a.weight.string, Vec::<u32>::new());
        assert_eq!(a.weight.weight.total(), 1.0);
        let f = clat.final_weight(a.nextstate);
        assert_eq!(f.string, vec![10]);
        assert_eq!(f.weight.total(), 0.0);
    }

    /// Distinct word sequences stay distinct.
    #[test]
    fn test_distinct_words_branch() {
        let mut lat = Lattice::new();
        let s0 = lat.add_state();
        let s1 = lat.add_state();
        let s2 = lat.add_state();
        lat.set_start(s0);
        lat.add_arc(s0, arc(10, 5, 0.0, 1.0, s1));
        lat.add_arc(s0, arc(11, 6, 0.0, 2.0, s2));
        lat.set_final(s1, LatticeWeight::one());
        lat.set_final(s2, LatticeWeight::one());

        let (clat, _) = determinize_lattice_pruned(&lat, 10.0, &DeterminizeOptions::default())
            .unwrap();
        assert_eq!(clat.arcs(clat.start()).len(), 2);
    }

    /// Word labels on epsilon-input arcs are real transitions; epsilon-word
    /// arcs collapse into the subsets.
    #[test]
    fn test_word_on_epsilon_input_arc() {
        let mut lat = Lattice::new();
        let s0 = lat.add_state();
        let s1 = lat.add_state();
        let s2 = lat.add_state();
        lat.set_start(s0);
        lat.add_arc(s0, arc(10, 0, 0.0, 0.5, s1)); // emitting, no word
        lat.add_arc(s1, arc(0, 7, 0.25, 0.0, s2)); // word on eps input
        lat.set_final(s2, LatticeWeight::one());

        let (clat, _) = determinize_lattice_pruned(&lat, 10.0, &DeterminizeOptions::default())
            .unwrap();
        let a0 = &clat.arcs(clat.start())[0];
        assert_eq!(a0.label, 7);
        // The emitting transition-id travels with the word arc's string.
        assert_eq!(a0.weight.string, vec![10]);
        let total: f32 = a0.weight.weight.total();
        assert!((total - 0.75).abs() < 1e-6);
    }

    /// Paths worse than the beam are pruned away.
    #[test]
    fn test_beam_prunes_expensive_path() {
        let mut lat = Lattice::new();
        let s0 = lat.add_state();
        let s1 = lat.add_state();
        let s2 = lat.add_state();
        lat.set_start(s0);
        lat.add_arc(s0, arc(10, 5, 0.0, 0.0, s1));
        lat.add_arc(s0, arc(11, 6, 0.0, 50.0, s2));
        lat.set_final(s1, LatticeWeight::one());
        lat.set_final(s2, LatticeWeight::one());

        let (clat, full) = determinize_lattice_pruned(&lat, 3.0, &DeterminizeOptions::default())
            .unwrap();
        assert!(full);
        assert_eq!(clat.arcs(clat.start()).len(), 1);
        assert_eq!(clat.arcs(clat.start())[0].label, 5);
    }

    #[test]
    fn test_cycle_is_an_error() {
        let mut lat = Lattice::new();
        let s0 = lat.add_state();
        let s1 = lat.add_state();
        lat.set_start(s0);
        lat.add_arc(s0, arc(0, 0, 0.0, 0.0, s1));
        lat.add_arc(s1, arc(0, 0, 0.0, 0.0, s0));
        lat.set_final(s1, LatticeWeight::one());

        let err = determinize_lattice_pruned(&lat, 10.0, &DeterminizeOptions::default());
        assert!(matches!(err, Err(LatticeError::EpsilonCycle)));
    }

    #[test]
    fn test_empty_input() {
        let lat = Lattice::new();
        let (clat, full) =
            determinize_lattice_pruned(&lat, 10.0, &DeterminizeOptions::default()).unwrap();
        assert!(full);
        assert!(clat.is_empty());
    }

    /// Determinism: two identical runs produce identical lattices.
    #[test]
    fn test_deterministic_output() {
        let mut lat = Lattice::new();
        for _ in 0..4 {
            lat.add_state();
        }
        lat.set_start(0);
        lat.add_arc(0, arc(10, 5, 0.1, 0.2, 1));
        lat.add_arc(0, arc(11, 6, 0.2, 0.1, 2));
        lat.add_arc(1, arc(12, 7, 0.0, 0.3, 3));
        lat.add_arc(2, arc(13, 7, 0.3, 0.0, 3));
        lat.set_final(3, LatticeWeight::new(0.5, 0.0));

        let (a, _) = determinize_lattice_pruned(&lat, 10.0, &DeterminizeOptions::default())
            .unwrap();
        let (b, _) = determinize_lattice_pruned(&lat, 10.0, &DeterminizeOptions::default())
            .unwrap();
        assert_eq!(a.num_states(), b.num_states());
        for s in 0..a.num_states() as u32 {
            assert_eq!(a.arcs(s), b.arcs(s));
            assert_eq!(a.final_weight(s), b.final_weight(s));
        }
    }
}
