//! Incremental lattice determinization.
//!
//! Maintains one determinized lattice across chunk boundaries. Each raw
//! chunk is determinized on its own, appended with a state-id offset, and
//! stitched to the previous chunk through the synthetic state-labels the
//! lattice builder placed on boundary arcs: a final arc of the previous
//! chunk and an initial arc of the new chunk that carry the same label
//! describe the same token, so the pair is rewritten into one interior arc.
//!
//! The provisional weights that guided chunk determinization (`tot_cost` on
//! initial arcs, `extra_cost` on final arcs) are cancelled during the
//! rewrite, so net path weights equal those of a single-pass lattice; the
//! provisional weights only ever bias the determinizer's pruning.

use crate::determinize::{determinize_lattice_pruned, DeterminizeOptions};
use crate::lattice::{convert_to_lattice, CompactLattice, CompactLatticeArc, Lattice};
use crate::weight::{CompactLatticeWeight, LatticeWeight};
use crate::LatticeError;
use rustc_hash::FxHashMap;

/// Owns the stitched, determinized lattice of the utterance so far.
pub struct IncrementalDeterminizer {
    /// Chunk determinization beam. Using the main decoding beam here (wider
    /// than `lattice_beam`) keeps boundary arcs from being pruned before the
    /// next chunk arrives to cancel their provisional costs.
    beam: f32,
    /// Beam for the optional full re-determinization at finalize.
    lattice_beam: f32,
    /// Labels above this value are synthetic state-labels.
    max_word_id: u32,
    det_opts: DeterminizeOptions,

    lat: CompactLattice,
    /// Boundary arcs of the chunk appended last: `(state, arc position)`.
    final_arc_list: Vec<(u32, usize)>,
    final_arc_list_prev: Vec<(u32, usize)>,
    determinization_finalized: bool,
}

impl IncrementalDeterminizer {
    pub fn new(
        beam: f32,
        lattice_beam: f32,
        max_word_id: u32,
        det_opts: DeterminizeOptions,
    ) -> Self {
        IncrementalDeterminizer {
            beam,
            lattice_beam,
            max_word_id,
            det_opts,
            lat: CompactLattice::new(),
            final_arc_list: Vec::new(),
            final_arc_list_prev: Vec::new(),
            determinization_finalized: false,
        }
    }

    /// Reset per-utterance state.
    pub fn init(&mut self) {
        self.final_arc_list.clear();
        self.final_arc_list_prev.clear();
        self.lat = CompactLattice::new();
        self.determinization_finalized = false;
    }

    /// The determinized lattice accumulated so far.
    pub fn lattice(&self) -> &CompactLattice {
        &self.lat
    }

    /// Determinize one raw chunk and append it. `initial_cost` / `final_cost`
    /// map synthetic labels to the provisional costs to cancel.
    pub fn process_chunk(
        &mut self,
        raw: &Lattice,
        first_frame: i32,
        last_frame: i32,
        initial_cost: &FxHashMap<u32, f32>,
        final_cost: &FxHashMap<u32, f32>,
    ) -> Result<bool, LatticeError> {
        let not_first_chunk = first_frame != 0;

        let (chunk, fully_determinized) =
            determinize_lattice_pruned(raw, self.beam, &self.det_opts)?;
        if !fully_determinized {
            log::warn!("chunk determinization finished earlier than the beam");
        }

        std::mem::swap(&mut self.final_arc_list, &mut self.final_arc_list_prev);
        self.final_arc_list.clear();

        self.append_chunk(&chunk, not_first_chunk, initial_cost, final_cost);
        log::debug!(
            "frames ({first_frame}, {last_frame}): {} chunk states, {} lattice states",
            chunk.num_states(),
            self.lat.num_states()
        );

        Ok(self.lat.num_states() > 0)
    }

    fn append_chunk(
        &mut self,
        chunk: &CompactLattice,
        not_first_chunk: bool,
        initial_cost: &FxHashMap<u32, f32>,
        final_cost: &FxHashMap<u32, f32>,
    ) {
        if chunk.is_empty() {
            log::warn!("empty determinized chunk; lattice will lose paths");
        }

        // The chunk-start state is not re-added for later chunks, so every
        // copied state lands at `old id + state_offset`.
        let mut state_offset = self.lat.num_states() as u32;
        if not_first_chunk && state_offset > 0 {
            state_offset -= 1;
        }

        // Initial boundary arcs of this chunk, by synthetic label.
        let mut initial_arc_map: FxHashMap<u32, usize> = FxHashMap::default();

        for s in 0..chunk.num_states() as u32 {
            let copied = !not_first_chunk || s != 0;
            let state_appended = if copied {
                let sa = self.lat.add_state();
                debug_assert_eq!(sa, s + state_offset);
                self.lat.set_final(sa, chunk.final_weight(s).clone());
                sa
            } else {
                u32::MAX
            };
            for (pos, arc) in chunk.arcs(s).iter().enumerate() {
                if copied {
                    self.lat.add_arc(
                        state_appended,
                        CompactLatticeArc {
                            label: arc.label,
                            weight: arc.weight.clone(),
                            nextstate: arc.nextstate + state_offset,
                        },
                    );
                }
                if arc.label > self.max_word_id {
                    if not_first_chunk && s == 0 {
                        // Initial arc: consumed by the stitch below.
                        initial_arc_map.insert(arc.label, pos);
                    } else {
                        // Final arc: the next chunk will stitch through it.
                        debug_assert!(!chunk.final_weight(arc.nextstate).is_zero());
                        self.final_arc_list.push((state_appended, pos));
                    }
                }
            }
        }

        if !not_first_chunk {
            if chunk.num_states() > 0 {
                self.lat.set_start(0);
            }
            return;
        }

        // Stitch: rewrite each previous-chunk final arc onto the matching
        // state inside this chunk, cancelling the provisional costs. A label
        // with no match was pruned between chunks; its arc is orphaned by
        // killing the final state it points at (connect() sweeps it later).
        if self.final_arc_list_prev.is_empty() {
            log::warn!("no boundary arcs from the previous chunk; cannot stitch");
            return;
        }
        let mut prev_final_states: Vec<u32> = Vec::new();
        for &(state, pos) in &self.final_arc_list_prev {
            let arc_prev = self.lat.arcs(state)[pos].clone();
            prev_final_states.push(arc_prev.nextstate);
            let Some(&init_pos) = initial_arc_map.get(&arc_prev.label) else {
                continue;
            };
            let arc_init = &chunk.arcs(0)[init_pos];
            debug_assert_eq!(arc_init.label, arc_prev.label);

            let cancel_initial = CompactLatticeWeight::new(
                LatticeWeight::new(0.0, -initial_cost[&arc_prev.label]),
                Vec::new(),
            );
            let cancel_final = CompactLatticeWeight::new(
                LatticeWeight::new(0.0, -final_cost[&arc_prev.label]),
                Vec::new(),
            );
            let final_prev = self.lat.final_weight(arc_prev.nextstate).clone();
            let weight = arc_init
                .weight
                .times(&final_prev)
                .times(&cancel_initial)
                .times(&cancel_final)
                .times(&arc_prev.weight);

            let arc = self.lat.arc_mut(state, pos);
            arc.nextstate = arc_init.nextstate + state_offset;
            arc.weight = weight;
            // The state-label was scaffolding; the stitched arc is epsilon.
            arc.label = 0;
        }
        for s in prev_final_states {
            self.lat.set_final(s, CompactLatticeWeight::zero());
        }
    }

    /// Finish the utterance: sweep orphaned states and optionally run one
    /// full pruned re-determinization for best compactness. Idempotent.
    pub fn finalize(&mut self, redeterminize: bool) -> Result<bool, LatticeError> {
        if self.determinization_finalized {
            return Ok(true);
        }
        self.lat.connect();
        if redeterminize {
            let expanded = convert_to_lattice(&self.lat);
            if expanded.top_sort_order().is_none() {
                // Determinization would not terminate on a cyclic input.
                return Err(LatticeError::EpsilonCycle);
            }
            let (redet, fully) =
                determinize_lattice_pruned(&expanded, self.lattice_beam, &self.det_opts)?;
            if !fully {
                log::warn!("re-determinization finished earlier than the beam");
            }
            self.lat = redet;
        }
        self.lat.connect();
        log::debug!("finalized lattice: {} states", self.lat.num_states());
        self.determinization_finalized = true;
        Ok(self.lat.num_states() > 0)
    }
}
