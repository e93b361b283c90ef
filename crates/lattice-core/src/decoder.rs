//! The incremental lattice decoder: beam search, backward pruning, chunk
//! extraction and the public driving API.
//!
//! Frames are indexed "frame plus one" internally: `active_toks[0]` holds the
//! pre-audio start token, and the tokens reached by consuming acoustic frame
//! `t` live at `active_toks[t + 1]`. The decodable object is zero-based.
//!
//! A note on `extra_cost`: define the forward cost of a token as the
//! shortest-path cost from it to any token on the most recent frame (zero on
//! that frame itself). A token's `extra_cost` is its forward cost minus the
//! smallest forward cost on its own frame, so it is always >= 0 and a token
//! whose `extra_cost` exceeds the lattice beam provably cannot appear in the
//! lattice. Keeping the difference rather than the forward cost itself means
//! new frames change only finitely many values, which is what makes the
//! backward dirty-flag pruning cheap.

use crate::decodable::Decodable;
use crate::determinize::DeterminizeOptions;
use crate::graph::{DecodingGraph, StateId};
use crate::hash::{Elem, TokenHash};
use crate::incremental::IncrementalDeterminizer;
use crate::lattice::{convert_to_lattice, shortest_path, CompactLattice, Lattice, LatticeArc};
use crate::token::{FrameSlot, TokenId, TokenPool, NONE};
use crate::weight::LatticeWeight;
use crate::LatticeError;
use rustc_hash::{FxHashMap, FxHashSet};

/// Iteration caps that turn epsilon cycles into errors instead of hangs.
const MAX_CLOSURE_ITERS: usize = 1_000_000;
const MAX_TOPSORT_LOOPS: usize = 1_000_000;

#[derive(Debug, Clone)]
pub struct LatticeIncrementalDecoderConfig {
    /// Main pruning beam for the emitting expansion.
    pub beam: f32,
    /// Tighter beam used by lattice pruning and final re-determinization.
    pub lattice_beam: f32,
    /// Token-count bounds steering the adaptive beam.
    pub max_active: usize,
    pub min_active: usize,
    /// How often (in frames) periodic pruning and chunk emission run.
    pub prune_interval: i32,
    /// Multiplier on `lattice_beam` for periodic (non-terminal) prunes.
    pub prune_scale: f32,
    /// Slack added to the cutoff when the adaptive beam engages.
    pub beam_delta: f32,
    /// Frontier hash resize factor.
    pub hash_ratio: f32,
    /// Frames to hold back past the prune cadence before emitting a
    /// determinized chunk, so volatile prefixes are not re-determinized.
    pub determinize_delay: i32,
    /// Run a full pruned re-determinization at finalize.
    pub redeterminize: bool,
    /// Output labels above this value are reserved for synthetic
    /// chunk-boundary state-labels.
    pub max_word_id: u32,
    pub det_opts: DeterminizeOptions,
}

impl Default for LatticeIncrementalDecoderConfig {
    fn default() -> Self {
        LatticeIncrementalDecoderConfig {
            beam: 13.0,
            lattice_beam: 6.0,
            max_active: usize::MAX,
            min_active: 200,
            prune_interval: 25,
            prune_scale: 0.1,
            beam_delta: 0.5,
            hash_ratio: 1.5,
            determinize_delay: 25,
            redeterminize: false,
            max_word_id: 10_000_000,
            det_opts: DeterminizeOptions::default(),
        }
    }
}

impl LatticeIncrementalDecoderConfig {
    pub fn check(&self) -> Result<(), LatticeError> {
        if !(self.beam > 0.0) {
            return Err(LatticeError::Config(format!("beam = {}", self.beam)));
        }
        if !(self.lattice_beam > 0.0) {
            return Err(LatticeError::Config(format!(
                "lattice_beam = {}",
                self.lattice_beam
            )));
        }
        if self.max_active <= 1 {
            return Err(LatticeError::Config(format!(
                "max_active = {}",
                self.max_active
            )));
        }
        if self.min_active > self.max_active {
            return Err(LatticeError::Config(format!(
                "min_active = {} > max_active",
                self.min_active
            )));
        }
        if self.prune_interval <= 0 {
            return Err(LatticeError::Config(format!(
                "prune_interval = {}",
                self.prune_interval
            )));
        }
        if !(self.prune_scale > 0.0 && self.prune_scale < 1.0) {
            return Err(LatticeError::Config(format!(
                "prune_scale = {}",
                self.prune_scale
            )));
        }
        if !(self.beam_delta > 0.0) {
            return Err(LatticeError::Config(format!(
                "beam_delta = {}",
                self.beam_delta
            )));
        }
        if !(self.hash_ratio >= 1.0) {
            return Err(LatticeError::Config(format!(
                "hash_ratio = {}",
                self.hash_ratio
            )));
        }
        if self.determinize_delay < 0 {
            return Err(LatticeError::Config(format!(
                "determinize_delay = {}",
                self.determinize_delay
            )));
        }
        if self.max_word_id == 0 {
            return Err(LatticeError::Config("max_word_id = 0".into()));
        }
        Ok(())
    }
}

/// Instantiate one decoder per thing to decode. The graph may be shared
/// read-only across instances (`&G` / `Arc<G>` implement `DecodingGraph`);
/// passing an owned graph hands its lifetime to the decoder.
pub struct LatticeIncrementalDecoder<G: DecodingGraph> {
    graph: G,
    config: LatticeIncrementalDecoderConfig,

    pool: TokenPool,
    toks: TokenHash,
    active_toks: Vec<FrameSlot>,
    num_toks: usize,
    cost_offsets: Vec<f32>,

    /// Non-emitting closure worklist, kept allocated across frames.
    queue: Vec<StateId>,
    /// Scratch for the cutoff computation.
    tmp_array: Vec<f32>,

    warned: bool,
    decoding_finalized: bool,
    final_costs: FxHashMap<TokenId, f32>,
    final_relative_cost: f32,
    final_best_cost: f32,

    determinizer: IncrementalDeterminizer,
    last_get_lattice_frame: i32,
    /// Synthetic label bookkeeping for chunk boundaries.
    state_label_map: FxHashMap<TokenId, u32>,
    state_label_available_idx: u32,
    state_label_initial_cost: FxHashMap<u32, f32>,
    state_label_final_cost: FxHashMap<u32, f32>,
}

impl<G: DecodingGraph> LatticeIncrementalDecoder<G> {
    pub fn new(graph: G, config: LatticeIncrementalDecoderConfig) -> Result<Self, LatticeError> {
        config.check()?;
        let determinizer = IncrementalDeterminizer::new(
            config.beam,
            config.lattice_beam,
            config.max_word_id,
            config.det_opts,
        );
        Ok(LatticeIncrementalDecoder {
            graph,
            toks: TokenHash::new(1000), // something reasonable for frame one
            pool: TokenPool::new(),
            active_toks: Vec::new(),
            num_toks: 0,
            cost_offsets: Vec::new(),
            queue: Vec::new(),
            tmp_array: Vec::new(),
            warned: false,
            decoding_finalized: false,
            final_costs: FxHashMap::default(),
            final_relative_cost: f32::INFINITY,
            final_best_cost: f32::INFINITY,
            determinizer,
            last_get_lattice_frame: 0,
            state_label_map: FxHashMap::default(),
            state_label_available_idx: 0,
            state_label_initial_cost: FxHashMap::default(),
            state_label_final_cost: FxHashMap::default(),
            config,
        })
    }

    pub fn config(&self) -> &LatticeIncrementalDecoderConfig {
        &self.config
    }

    /// Frames decoded so far (the decodable's frame counter).
    pub fn num_frames_decoded(&self) -> i32 {
        self.active_toks.len() as i32 - 1
    }

    /// Total alive tokens across all frames.
    pub fn num_active_tokens(&self) -> usize {
        self.num_toks
    }

    /// Tokens on the current frontier.
    pub fn num_frontier_tokens(&self) -> usize {
        self.toks.len()
    }

    /// Reset per-utterance state and create the frame-0 start token.
    pub fn init_decoding(&mut self) -> Result<(), LatticeError> {
        // Clean up from last time.
        self.toks.clear();
        self.cost_offsets.clear();
        self.clear_active_tokens();
        self.warned = false;
        self.decoding_finalized = false;
        self.final_costs.clear();

        let start_state = self.graph.start();
        self.active_toks.push(FrameSlot::new());
        let start_tok = self.pool.new_token(0.0, 0.0, NONE);
        self.active_toks[0].head = start_tok;
        self.toks.insert(start_state, start_tok);
        self.num_toks += 1;

        self.last_get_lattice_frame = 0;
        self.state_label_map.clear();
        self.state_label_available_idx = self.config.max_word_id + 1;
        self.state_label_initial_cost.clear();
        self.state_label_final_cost.clear();
        self.determinizer.init();

        self.process_nonemitting(self.config.beam)
    }

    /// Decode everything the decodable has, finalize and emit the last
    /// chunk. Returns true when any traceback survives (not necessarily
    /// through a final state).
    pub fn decode<D: Decodable>(&mut self, decodable: &mut D) -> Result<bool, LatticeError> {
        self.init_decoding()?;

        while !decodable.is_last_frame(self.num_frames_decoded() - 1) {
            if self.num_frames_decoded() % self.config.prune_interval == 0 {
                self.prune_active_tokens(self.config.lattice_beam * self.config.prune_scale);
                // Chunks trail the frontier by determinize_delay so we do not
                // determinize prefixes that pruning is still reshaping.
                let chunk_frame = self.num_frames_decoded() - self.config.determinize_delay;
                if chunk_frame > 0 {
                    self.update_lattice_to(false, false, chunk_frame)?;
                }
            }
            let cost_cutoff = self.process_emitting(decodable);
            self.process_nonemitting(cost_cutoff)?;
        }
        self.finalize_decoding();
        self.update_lattice_to(true, self.config.redeterminize, self.num_frames_decoded())?;

        Ok(!self.active_toks.is_empty() && self.active_toks.last().unwrap().head != NONE)
    }

    /// Decode until the decodable runs dry, or at most `max_num_frames` more
    /// frames when it is non-negative. This is the streaming entry point and
    /// the caller's cancellation primitive.
    pub fn advance_decoding<D: Decodable>(
        &mut self,
        decodable: &mut D,
        max_num_frames: i32,
    ) -> Result<(), LatticeError> {
        assert!(
            !self.active_toks.is_empty() && !self.decoding_finalized,
            "init_decoding must be called before advance_decoding"
        );
        let num_frames_ready = decodable.num_frames_ready();
        // The decodable may not shrink or be swapped out between calls.
        assert!(num_frames_ready >= self.num_frames_decoded());
        let mut target = num_frames_ready;
        if max_num_frames >= 0 {
            target = target.min(self.num_frames_decoded() + max_num_frames);
        }
        while self.num_frames_decoded() < target {
            if self.num_frames_decoded() % self.config.prune_interval == 0 {
                self.prune_active_tokens(self.config.lattice_beam * self.config.prune_scale);
                let chunk_frame = self.num_frames_decoded() - self.config.determinize_delay;
                if chunk_frame > 0 {
                    self.update_lattice_to(false, false, chunk_frame)?;
                }
            }
            let cost_cutoff = self.process_emitting(decodable);
            self.process_nonemitting(cost_cutoff)?;
        }
        Ok(())
    }

    /// Terminal pruning pass that takes the graph's final weights into
    /// account. After this the instance is read-only: no more advancing.
    /// Calling it again is a no-op.
    pub fn finalize_decoding(&mut self) {
        if self.decoding_finalized {
            return;
        }
        let final_frame_plus_one = self.num_frames_decoded();
        let num_toks_begin = self.num_toks;
        self.prune_forward_links_final();
        for f in (0..final_frame_plus_one).rev() {
            // A delta of zero means we always update.
            self.prune_forward_links(f as usize, 0.0);
            self.prune_tokens_for_frame((f + 1) as usize);
        }
        self.prune_tokens_for_frame(0);
        log::debug!(
            "pruned tokens from {} to {}",
            num_toks_begin,
            self.num_toks
        );
    }

    /// Difference between the best final-reaching cost and the best
    /// surviving cost; +inf when no token reaches a final state.
    pub fn final_relative_cost(&self) -> f32 {
        if self.decoding_finalized {
            self.final_relative_cost
        } else {
            let (_, relative, _) = self.compute_final_costs(false);
            relative
        }
    }

    /// Fetch the determinized lattice up to `last_frame_of_chunk`.
    ///
    /// Repeated calls with the same frame are no-ops; a call with an earlier
    /// frame logs a warning and changes nothing. After `finalize_decoding`
    /// the terminal chunk (with final probabilities) is emitted and
    /// `redeterminize` optionally compacts the whole lattice.
    pub fn get_lattice(
        &mut self,
        use_final_probs: bool,
        redeterminize: bool,
        last_frame_of_chunk: i32,
    ) -> Result<CompactLattice, LatticeError> {
        self.update_lattice_to(use_final_probs, redeterminize, last_frame_of_chunk)?;
        Ok(self.determinizer.lattice().clone())
    }

    /// The chunking work of `get_lattice`, without copying the result out
    /// (the periodic in-decode calls have no use for the copy).
    fn update_lattice_to(
        &mut self,
        use_final_probs: bool,
        redeterminize: bool,
        last_frame_of_chunk: i32,
    ) -> Result<(), LatticeError> {
        let not_first_chunk = self.last_get_lattice_frame != 0;
        if self.last_get_lattice_frame < last_frame_of_chunk {
            let raw = self.get_raw_lattice_chunk(
                self.last_get_lattice_frame,
                last_frame_of_chunk,
                use_final_probs,
                not_first_chunk,
                !self.decoding_finalized,
            )?;
            match raw {
                Some(raw) => {
                    self.determinizer.process_chunk(
                        &raw,
                        self.last_get_lattice_frame,
                        last_frame_of_chunk,
                        &self.state_label_initial_cost,
                        &self.state_label_final_cost,
                    )?;
                }
                None => {
                    log::warn!(
                        "no lattice chunk for frames ({}, {}); returning what we have",
                        self.last_get_lattice_frame,
                        last_frame_of_chunk
                    );
                }
            }
            self.last_get_lattice_frame = last_frame_of_chunk;
        } else if self.last_get_lattice_frame > last_frame_of_chunk {
            log::warn!(
                "get_lattice called for frame {} but the determinizer is already at frame {}",
                last_frame_of_chunk,
                self.last_get_lattice_frame
            );
        }

        if self.decoding_finalized {
            self.determinizer.finalize(redeterminize)?;
        }
        Ok(())
    }

    /// The single best path, expanded back to state level.
    pub fn best_path(&mut self, use_final_probs: bool) -> Result<Lattice, LatticeError> {
        let clat = self.get_lattice(
            use_final_probs,
            self.config.redeterminize,
            self.num_frames_decoded(),
        )?;
        let best = shortest_path(&clat)?;
        Ok(convert_to_lattice(&best))
    }

    /// The state-level lattice: the compact lattice expanded and trimmed.
    pub fn raw_lattice(&mut self, use_final_probs: bool) -> Result<Lattice, LatticeError> {
        let clat = self.get_lattice(
            use_final_probs,
            self.config.redeterminize,
            self.num_frames_decoded(),
        )?;
        let mut lat = convert_to_lattice(&clat);
        lat.connect();
        Ok(lat)
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    fn possibly_resize_hash(&mut self, num_toks: usize) {
        let new_sz = (num_toks as f32 * self.config.hash_ratio) as usize;
        if new_sz > self.toks.size() {
            self.toks.set_size(new_sz);
        }
    }

    /// Locate the token for `state` on `frame_plus_one`, or insert a fresh
    /// one. An existing token keeps its identity and is only re-costed when
    /// the new path is cheaper; `changed` reports whether anything improved.
    fn find_or_add_token(
        &mut self,
        state: StateId,
        frame_plus_one: usize,
        tot_cost: f32,
        changed: Option<&mut bool>,
    ) -> TokenId {
        debug_assert!(frame_plus_one < self.active_toks.len());
        match self.toks.find(state) {
            None => {
                // Tokens on the frontier start with zero extra_cost: any of
                // them could still end up on the winning path.
                let head = self.active_toks[frame_plus_one].head;
                let tok = self.pool.new_token(tot_cost, 0.0, head);
                self.active_toks[frame_plus_one].head = tok;
                self.num_toks += 1;
                self.toks.insert(state, tok);
                if let Some(c) = changed {
                    *c = true;
                }
                tok
            }
            Some(tok) => {
                if self.pool.tok(tok).tot_cost > tot_cost {
                    // Cheaper path to the same state: re-cost in place. Any
                    // forward links already pointing here stay valid and are
                    // cleaned up by the pruner if they become uncompetitive.
                    self.pool.tok_mut(tok).tot_cost = tot_cost;
                    if let Some(c) = changed {
                        *c = true;
                    }
                } else if let Some(c) = changed {
                    *c = false;
                }
                tok
            }
        }
    }

    /// Weight cutoff for this frame's expansion; also counts tokens and finds
    /// the best entry for the lookahead.
    fn get_cutoff(&mut self, elems: &[Elem]) -> (f32, f32, Option<usize>, usize) {
        let count = elems.len();
        let mut best_weight = f32::INFINITY;
        let mut best_idx = None;

        if self.config.max_active == usize::MAX && self.config.min_active == 0 {
            for (i, e) in elems.iter().enumerate() {
                let w = self.pool.tok(e.tok).tot_cost;
                if w < best_weight {
                    best_weight = w;
                    best_idx = Some(i);
                }
            }
            return (best_weight + self.config.beam, self.config.beam, best_idx, count);
        }

        self.tmp_array.clear();
        for (i, e) in elems.iter().enumerate() {
            let w = self.pool.tok(e.tok).tot_cost;
            self.tmp_array.push(w);
            if w < best_weight {
                best_weight = w;
                best_idx = Some(i);
            }
        }

        let beam_cutoff = best_weight + self.config.beam;
        let mut min_active_cutoff = f32::INFINITY;
        let mut max_active_cutoff = f32::INFINITY;

        log::debug!(
            "tokens active on frame {}: {}",
            self.num_frames_decoded(),
            count
        );

        if count > self.config.max_active {
            self.tmp_array
                .select_nth_unstable_by(self.config.max_active, f32::total_cmp);
            max_active_cutoff = self.tmp_array[self.config.max_active];
        }
        if max_active_cutoff < beam_cutoff {
            // max_active is tighter than the beam.
            let adaptive_beam = max_active_cutoff - best_weight + self.config.beam_delta;
            return (max_active_cutoff, adaptive_beam, best_idx, count);
        }
        if count > self.config.min_active {
            if self.config.min_active == 0 {
                min_active_cutoff = best_weight;
            } else {
                let upper = if count > self.config.max_active {
                    self.config.max_active
                } else {
                    count
                };
                if self.config.min_active < upper {
                    self.tmp_array[..upper]
                        .select_nth_unstable_by(self.config.min_active, f32::total_cmp);
                }
                // When min_active == max_active the element is already in
                // place from the partition above.
                min_active_cutoff = self.tmp_array[self.config.min_active];
            }
        }
        if min_active_cutoff > beam_cutoff {
            // min_active is looser than the beam.
            let adaptive_beam = min_active_cutoff - best_weight + self.config.beam_delta;
            (min_active_cutoff, adaptive_beam, best_idx, count)
        } else {
            (beam_cutoff, self.config.beam, best_idx, count)
        }
    }

    /// Consume one acoustic frame: detach the frontier, expand every
    /// surviving token over emitting arcs into a new frontier. Returns the
    /// cutoff to hand to the non-emitting pass.
    fn process_emitting<D: Decodable>(&mut self, decodable: &mut D) -> f32 {
        assert!(!self.active_toks.is_empty());
        let frame = self.active_toks.len() as i32 - 1; // zero-based acoustic frame
        self.active_toks.push(FrameSlot::new());

        let elems = self.toks.clear(); // swap prev/current frontier
        let (cur_cutoff, adaptive_beam, best_idx, tok_cnt) = self.get_cutoff(&elems);
        log::debug!("adaptive beam on frame {} is {}", frame, adaptive_beam);

        self.possibly_resize_hash(tok_cnt);

        // Pruning "online" before having seen all next-frame tokens.
        let mut next_cutoff = f32::INFINITY;
        // Keeps acoustic sums in a good dynamic range.
        let mut cost_offset = 0.0;

        // Lookahead over the best token's arcs for a first estimate of
        // next_cutoff, so early expansions already prune well.
        if let Some(bi) = best_idx {
            let state = elems[bi].state;
            let tot_cost = self.pool.tok(elems[bi].tok).tot_cost;
            cost_offset = -tot_cost;
            let num_arcs = self.graph.arcs(state).len();
            for ai in 0..num_arcs {
                let arc = self.graph.arcs(state)[ai];
                if arc.ilabel != 0 {
                    let new_weight = arc.weight + cost_offset
                        - decodable.loglike(frame, arc.ilabel)
                        + tot_cost;
                    if new_weight + adaptive_beam < next_cutoff {
                        next_cutoff = new_weight + adaptive_beam;
                    }
                }
            }
        }

        self.cost_offsets.resize(frame as usize + 1, 0.0);
        self.cost_offsets[frame as usize] = cost_offset;

        for e in &elems {
            let state = e.state;
            let cur_cost = self.pool.tok(e.tok).tot_cost;
            if cur_cost > cur_cutoff {
                continue;
            }
            let num_arcs = self.graph.arcs(state).len();
            for ai in 0..num_arcs {
                let arc = self.graph.arcs(state)[ai];
                if arc.ilabel == 0 {
                    continue; // the non-emitting pass handles these
                }
                let ac_cost = cost_offset - decodable.loglike(frame, arc.ilabel);
                let graph_cost = arc.weight;
                let tot_cost = cur_cost + ac_cost + graph_cost;
                if tot_cost > next_cutoff {
                    continue;
                } else if tot_cost + adaptive_beam < next_cutoff {
                    next_cutoff = tot_cost + adaptive_beam; // prune by best current token
                }
                let next_tok =
                    self.find_or_add_token(arc.nextstate, frame as usize + 1, tot_cost, None);
                let links = self.pool.tok(e.tok).links;
                let link = self
                    .pool
                    .new_link(next_tok, arc.ilabel, arc.olabel, graph_cost, ac_cost, links);
                self.pool.tok_mut(e.tok).links = link;
            }
        }
        // The detached entries die here; the tokens they pointed at live on
        // in the frame lists.
        drop(elems);
        next_cutoff
    }

    /// Epsilon closure at the frontier. A state is re-queued only when its
    /// cost strictly improved and it has further input-epsilon arcs.
    fn process_nonemitting(&mut self, cutoff: f32) -> Result<(), LatticeError> {
        assert!(!self.active_toks.is_empty());
        let frame_plus_one = self.active_toks.len() - 1;

        debug_assert!(self.queue.is_empty());

        if self.toks.is_empty() && !self.warned {
            log::warn!(
                "no surviving tokens: frame is {}",
                self.active_toks.len() as i32 - 2
            );
            self.warned = true;
        }

        for e in self.toks.iter() {
            if self.graph.num_input_epsilons(e.state) != 0 {
                self.queue.push(e.state);
            }
        }

        let mut iters = 0usize;
        while let Some(state) = self.queue.pop() {
            iters += 1;
            if iters > MAX_CLOSURE_ITERS {
                self.queue.clear();
                log::error!("non-emitting closure did not settle; epsilon cycle in the graph");
                return Err(LatticeError::EpsilonCycle);
            }

            let tok = self
                .toks
                .find(state)
                .expect("queued state must be in the frontier");
            let cur_cost = self.pool.tok(tok).tot_cost;
            if cur_cost > cutoff {
                continue;
            }
            // This token's epsilon links are about to be regenerated, so the
            // closure sub-graph stays clean on revisits.
            self.pool.delete_forward_links(tok);
            let num_arcs = self.graph.arcs(state).len();
            for ai in 0..num_arcs {
                let arc = self.graph.arcs(state)[ai];
                if arc.ilabel != 0 {
                    continue;
                }
                let graph_cost = arc.weight;
                let tot_cost = cur_cost + graph_cost;
                if tot_cost < cutoff {
                    let mut changed = false;
                    let new_tok = self.find_or_add_token(
                        arc.nextstate,
                        frame_plus_one,
                        tot_cost,
                        Some(&mut changed),
                    );
                    let links = self.pool.tok(tok).links;
                    let link =
                        self.pool
                            .new_link(new_tok, 0, arc.olabel, graph_cost, 0.0, links);
                    self.pool.tok_mut(tok).links = link;
                    if changed && self.graph.num_input_epsilons(arc.nextstate) != 0 {
                        self.queue.push(arc.nextstate);
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pruning
    // ------------------------------------------------------------------

    /// Recompute `extra_cost` for every token on a frame from its surviving
    /// links, excising links beyond the lattice beam. Iterates to a fixed
    /// point because the intra-frame list is not topologically ordered.
    /// Returns `(extra_costs_changed, links_pruned)`.
    fn prune_forward_links(&mut self, frame_plus_one: usize, delta: f32) -> (bool, bool) {
        let mut extra_costs_changed = false;
        let mut links_pruned = false;
        debug_assert!(frame_plus_one < self.active_toks.len());

        if self.active_toks[frame_plus_one].head == NONE && !self.warned {
            // Empty list; should not happen.
            log::warn!("no tokens alive [doing pruning]; warning first time only per utterance");
            self.warned = true;
        }

        let mut changed = true;
        while changed {
            changed = false;
            let mut tok = self.active_toks[frame_plus_one].head;
            while tok != NONE {
                let tok_tot_cost = self.pool.tok(tok).tot_cost;
                let mut tok_extra_cost = f32::INFINITY;
                let mut prev_link = NONE;
                let mut l = self.pool.tok(tok).links;
                while l != NONE {
                    let link = *self.pool.link(l);
                    let next_tok = link.next_tok;
                    // Difference in cost between the best paths through the
                    // link's source and destination; >= 0 in exact arithmetic.
                    let mut link_extra_cost = self.pool.tok(next_tok).extra_cost
                        + ((tok_tot_cost + link.acoustic_cost + link.graph_cost)
                            - self.pool.tok(next_tok).tot_cost);
                    debug_assert!(!link_extra_cost.is_nan());
                    if link_extra_cost > self.config.lattice_beam {
                        let next_link = link.next;
                        if prev_link != NONE {
                            self.pool.link_mut(prev_link).next = next_link;
                        } else {
                            self.pool.tok_mut(tok).links = next_link;
                        }
                        self.pool.free_link(l);
                        l = next_link;
                        links_pruned = true;
                    } else {
                        if link_extra_cost < 0.0 {
                            // Floating-point slack; anything beyond it points
                            // at an invariant bug upstream.
                            if link_extra_cost < -0.01 {
                                log::warn!("negative extra_cost: {}", link_extra_cost);
                            }
                            link_extra_cost = 0.0;
                        }
                        if link_extra_cost < tok_extra_cost {
                            tok_extra_cost = link_extra_cost;
                        }
                        prev_link = l;
                        l = link.next;
                    }
                }
                if (tok_extra_cost - self.pool.tok(tok).extra_cost).abs() > delta {
                    changed = true;
                }
                // +inf means no forward link survived.
                self.pool.tok_mut(tok).extra_cost = tok_extra_cost;
                tok = self.pool.tok(tok).next;
            }
            if changed {
                extra_costs_changed = true;
            }
        }
        (extra_costs_changed, links_pruned)
    }

    /// Final-frame version of `prune_forward_links`: a token's base
    /// `extra_cost` measures it against the best truly-final hypothesis.
    fn prune_forward_links_final(&mut self) {
        assert!(!self.active_toks.is_empty());
        let frame_plus_one = self.active_toks.len() - 1;

        if self.active_toks[frame_plus_one].head == NONE {
            log::warn!("no tokens alive at end of input");
        }

        let (final_costs, final_relative_cost, final_best_cost) = self.compute_final_costs(true);
        self.final_costs = final_costs;
        self.final_relative_cost = final_relative_cost;
        self.final_best_cost = final_best_cost;
        if self.final_costs.is_empty() {
            log::warn!("no token reaches a final state; treating every token as final");
        }
        self.decoding_finalized = true;
        // The frontier hash would otherwise hold tokens about to be freed.
        drop(self.toks.clear());

        let delta = 1.0e-5f32;
        let mut changed = true;
        while changed {
            changed = false;
            let mut tok = self.active_toks[frame_plus_one].head;
            while tok != NONE {
                let tok_tot_cost = self.pool.tok(tok).tot_cost;
                // Instead of initializing to infinity, seed with how far this
                // token's (cost + final-prob) is from the best such pair.
                let final_cost = if self.final_costs.is_empty() {
                    0.0
                } else {
                    self.final_costs
                        .get(&tok)
                        .copied()
                        .unwrap_or(f32::INFINITY)
                };
                let mut tok_extra_cost = tok_tot_cost + final_cost - self.final_best_cost;

                let mut prev_link = NONE;
                let mut l = self.pool.tok(tok).links;
                while l != NONE {
                    let link = *self.pool.link(l);
                    let next_tok = link.next_tok;
                    let mut link_extra_cost = self.pool.tok(next_tok).extra_cost
                        + ((tok_tot_cost + link.acoustic_cost + link.graph_cost)
                            - self.pool.tok(next_tok).tot_cost);
                    if link_extra_cost > self.config.lattice_beam {
                        let next_link = link.next;
                        if prev_link != NONE {
                            self.pool.link_mut(prev_link).next = next_link;
                        } else {
                            self.pool.tok_mut(tok).links = next_link;
                        }
                        self.pool.free_link(l);
                        l = next_link;
                    } else {
                        if link_extra_cost < 0.0 {
                            if link_extra_cost < -0.01 {
                                log::warn!("negative extra_cost: {}", link_extra_cost);
                            }
                            link_extra_cost = 0.0;
                        }
                        if link_extra_cost < tok_extra_cost {
                            tok_extra_cost = link_extra_cost;
                        }
                        prev_link = l;
                        l = link.next;
                    }
                }
                // Unlike the interior case, a token over the beam must be
                // marked here: its final-prob component never shows up as a
                // missing forward link.
                if tok_extra_cost > self.config.lattice_beam {
                    tok_extra_cost = f32::INFINITY;
                }
                if !approx_equal(self.pool.tok(tok).extra_cost, tok_extra_cost, delta) {
                    changed = true;
                }
                self.pool.tok_mut(tok).extra_cost = tok_extra_cost;
                tok = self.pool.tok(tok).next;
            }
        }
    }

    /// Free every token on the frame whose `extra_cost` is infinite, fixing
    /// up the singly-linked list.
    fn prune_tokens_for_frame(&mut self, frame_plus_one: usize) {
        debug_assert!(frame_plus_one < self.active_toks.len());
        if self.active_toks[frame_plus_one].head == NONE && !self.warned {
            log::warn!("no tokens alive [doing pruning]");
            self.warned = true;
        }
        let mut prev_tok = NONE;
        let mut tok = self.active_toks[frame_plus_one].head;
        while tok != NONE {
            let next_tok = self.pool.tok(tok).next;
            if self.pool.tok(tok).extra_cost == f32::INFINITY {
                // Unreachable from the end of the graph.
                if prev_tok != NONE {
                    self.pool.tok_mut(prev_tok).next = next_tok;
                } else {
                    self.active_toks[frame_plus_one].head = next_tok;
                }
                debug_assert_eq!(self.pool.tok(tok).links, NONE);
                self.pool.free_token(tok);
                self.num_toks -= 1;
            } else {
                prev_tok = tok;
            }
            tok = next_tok;
        }
    }

    /// Backward sweep over the frames, driven by the two dirty flags; stops
    /// propagating as soon as nothing changes within `delta`.
    fn prune_active_tokens(&mut self, delta: f32) {
        let cur_frame_plus_one = self.num_frames_decoded();
        let num_toks_begin = self.num_toks;

        for f in (0..cur_frame_plus_one).rev() {
            let f = f as usize;
            // Forward links need pruning when the frame list is new, or when
            // a downstream token changed its extra_cost after the last pass.
            if self.active_toks[f].must_prune_forward_links {
                let (extra_costs_changed, links_pruned) = self.prune_forward_links(f, delta);
                if extra_costs_changed && f > 0 {
                    self.active_toks[f - 1].must_prune_forward_links = true;
                }
                if links_pruned {
                    self.active_toks[f].must_prune_tokens = true;
                }
                self.active_toks[f].must_prune_forward_links = false;
            }
            if f + 1 < cur_frame_plus_one as usize && self.active_toks[f + 1].must_prune_tokens {
                self.prune_tokens_for_frame(f + 1);
                self.active_toks[f + 1].must_prune_tokens = false;
            }
        }
        log::debug!(
            "prune_active_tokens: pruned tokens from {} to {}",
            num_toks_begin,
            self.num_toks
        );
    }

    /// Scan the frontier for final states. Returns the per-token final-cost
    /// map (when `want_map`), the relative final cost and the best final
    /// cost (falling back to the best surviving cost when nothing is final).
    fn compute_final_costs(&self, want_map: bool) -> (FxHashMap<TokenId, f32>, f32, f32) {
        assert!(!self.decoding_finalized);
        let mut final_costs = FxHashMap::default();
        let infinity = f32::INFINITY;
        let mut best_cost = infinity;
        let mut best_cost_with_final = infinity;

        for e in self.toks.iter() {
            let final_cost = self.graph.final_cost(e.state);
            let cost = self.pool.tok(e.tok).tot_cost;
            let cost_with_final = cost + final_cost;
            best_cost = best_cost.min(cost);
            best_cost_with_final = best_cost_with_final.min(cost_with_final);
            if want_map && final_cost != infinity {
                final_costs.insert(e.tok, final_cost);
            }
        }

        let final_relative_cost = if best_cost == infinity && best_cost_with_final == infinity {
            // Likely nothing survived at all; this is the least bad answer.
            infinity
        } else {
            best_cost_with_final - best_cost
        };
        let final_best_cost = if best_cost_with_final != infinity {
            best_cost_with_final
        } else {
            best_cost
        };
        (final_costs, final_relative_cost, final_best_cost)
    }

    fn clear_active_tokens(&mut self) {
        for f in 0..self.active_toks.len() {
            let mut tok = self.active_toks[f].head;
            while tok != NONE {
                self.pool.delete_forward_links(tok);
                let next = self.pool.tok(tok).next;
                self.pool.free_token(tok);
                self.num_toks -= 1;
                tok = next;
            }
        }
        self.active_toks.clear();
        debug_assert_eq!(self.num_toks, 0);
    }

    // ------------------------------------------------------------------
    // Raw-lattice extraction
    // ------------------------------------------------------------------

    /// Order one frame's token list so intra-frame epsilon links only go
    /// forward. List order is already close (new tokens go on the front), so
    /// positions are assigned in reverse and bumped on conflict; a bounded
    /// number of reprocess rounds settles it, or the graph has an epsilon
    /// cycle.
    fn top_sort_tokens(&self, frame_plus_one: usize) -> Result<Vec<TokenId>, LatticeError> {
        let mut token2pos: FxHashMap<TokenId, usize> = FxHashMap::default();
        let mut num_toks = 0usize;
        let mut tok = self.active_toks[frame_plus_one].head;
        while tok != NONE {
            num_toks += 1;
            tok = self.pool.tok(tok).next;
        }
        let mut cur_pos = 0usize;
        tok = self.active_toks[frame_plus_one].head;
        while tok != NONE {
            cur_pos += 1;
            token2pos.insert(tok, num_toks - cur_pos);
            tok = self.pool.tok(tok).next;
        }

        let mut reprocess: FxHashSet<TokenId> = FxHashSet::default();
        tok = self.active_toks[frame_plus_one].head;
        while tok != NONE {
            let pos = token2pos[&tok];
            let mut l = self.pool.tok(tok).links;
            while l != NONE {
                let link = self.pool.link(l);
                if link.ilabel == 0 {
                    // Only epsilon links stay on this frame; emitting links
                    // leave it and cannot affect the order.
                    if let Some(&next_pos) = token2pos.get(&link.next_tok) {
                        if next_pos < pos {
                            token2pos.insert(link.next_tok, cur_pos);
                            cur_pos += 1;
                            reprocess.insert(link.next_tok);
                        }
                    }
                }
                l = link.next;
            }
            reprocess.remove(&tok);
            tok = self.pool.tok(tok).next;
        }

        let mut loop_count = 0usize;
        while !reprocess.is_empty() {
            loop_count += 1;
            if loop_count >= MAX_TOPSORT_LOOPS {
                log::error!("token top-sort did not settle; epsilon cycle in the graph");
                return Err(LatticeError::EpsilonCycle);
            }
            let reprocess_vec: Vec<TokenId> = reprocess.drain().collect();
            for tok in reprocess_vec {
                let pos = token2pos[&tok];
                let mut l = self.pool.tok(tok).links;
                while l != NONE {
                    let link = self.pool.link(l);
                    if link.ilabel == 0 {
                        if let Some(&next_pos) = token2pos.get(&link.next_tok) {
                            if next_pos < pos {
                                token2pos.insert(link.next_tok, cur_pos);
                                cur_pos += 1;
                                reprocess.insert(link.next_tok);
                            }
                        }
                    }
                    l = link.next;
                }
            }
        }

        let mut slots: Vec<TokenId> = vec![NONE; cur_pos];
        for (&tok, &pos) in &token2pos {
            slots[pos] = tok;
        }
        Ok(slots.into_iter().filter(|&t| t != NONE).collect())
    }

    /// Build the raw lattice chunk for frames `[frame_begin, frame_end]`.
    ///
    /// With `create_initial_state`, boundary tokens at `frame_begin` hang off
    /// a fresh chunk-start state through their state-labels, weighted by
    /// their `tot_cost` (recorded for later cancellation). With
    /// `create_final_state`, tokens at `frame_end` get fresh state-labels and
    /// arcs into a chunk-final state weighted by their `extra_cost`, which
    /// carries forward-looking pruning information into the determinizer.
    ///
    /// Returns `None` (after a warning) when some frame has no tokens.
    fn get_raw_lattice_chunk(
        &mut self,
        frame_begin: i32,
        frame_end: i32,
        use_final_probs: bool,
        create_initial_state: bool,
        create_final_state: bool,
    ) -> Result<Option<Lattice>, LatticeError> {
        assert!(
            !self.decoding_finalized || use_final_probs,
            "cannot ask for a lattice without final probs after finalize_decoding"
        );
        assert!(frame_end > 0);

        let final_costs_local;
        let final_costs: &FxHashMap<TokenId, f32> = if self.decoding_finalized {
            &self.final_costs
        } else if use_final_probs {
            let (map, _, _) = self.compute_final_costs(true);
            final_costs_local = map;
            &final_costs_local
        } else {
            final_costs_local = FxHashMap::default();
            &final_costs_local
        };

        let mut ofst = Lattice::new();
        if create_initial_state {
            ofst.add_state(); // chunk-start state, id 0
        }

        // One lattice state per token, topologically ordered within frames.
        let mut tok_map: FxHashMap<TokenId, u32> = FxHashMap::default();
        for f in frame_begin..=frame_end {
            if self.active_toks[f as usize].head == NONE {
                log::warn!(
                    "get_raw_lattice_chunk: no tokens active on frame {}; not producing lattice",
                    f
                );
                return Ok(None);
            }
            let sorted = self.top_sort_tokens(f as usize)?;
            for tok in sorted {
                tok_map.insert(tok, ofst.add_state());
            }
        }
        // State zero is the start whether or not it is a dedicated chunk
        // start.
        ofst.set_start(0);

        if create_initial_state {
            let mut tok = self.active_toks[frame_begin as usize].head;
            while tok != NONE {
                let cur_state = tok_map[&tok];
                // The label was assigned when this frame was the previous
                // chunk's final frame.
                let id = *self
                    .state_label_map
                    .get(&tok)
                    .expect("boundary token must have a state-label");
                // The token's alpha becomes the provisional initial weight
                // guiding the chunk determinization; it is cancelled when the
                // chunks are stitched.
                let cost_offset = self.pool.tok(tok).tot_cost;
                self.state_label_initial_cost.insert(id, cost_offset);
                ofst.add_arc(
                    0,
                    LatticeArc {
                        ilabel: 0,
                        olabel: id,
                        weight: LatticeWeight::new(0.0, cost_offset),
                        nextstate: cur_state,
                    },
                );
                tok = self.pool.tok(tok).next;
            }
        }

        for f in frame_begin..=frame_end {
            let mut tok = self.active_toks[f as usize].head;
            while tok != NONE {
                let cur_state = tok_map[&tok];
                let mut l = self.pool.tok(tok).links;
                while l != NONE {
                    let link = *self.pool.link(l);
                    // Emitting arcs out of the last frame belong to the next
                    // chunk.
                    if f == frame_end && link.ilabel > 0 {
                        l = link.next;
                        continue;
                    }
                    let nextstate = *tok_map
                        .get(&link.next_tok)
                        .expect("link destination must be inside the chunk");
                    let cost_offset = if link.ilabel != 0 {
                        debug_assert!((f as usize) < self.cost_offsets.len());
                        self.cost_offsets[f as usize]
                    } else {
                        0.0
                    };
                    ofst.add_arc(
                        cur_state,
                        LatticeArc {
                            ilabel: link.ilabel,
                            olabel: link.olabel,
                            weight: LatticeWeight::new(
                                link.graph_cost,
                                link.acoustic_cost - cost_offset,
                            ),
                            nextstate,
                        },
                    );
                    l = link.next;
                }
                if f == frame_end {
                    // Work out the state's final weight; if a chunk-final
                    // state is requested these move onto its boundary arcs
                    // below.
                    let weight = if use_final_probs && !final_costs.is_empty() {
                        match final_costs.get(&tok) {
                            Some(&c) => LatticeWeight::new(c, 0.0),
                            None => LatticeWeight::zero(),
                        }
                    } else {
                        LatticeWeight::one()
                    };
                    ofst.set_final(cur_state, weight);
                }
                tok = self.pool.tok(tok).next;
            }
        }

        if create_final_state {
            let end_state = ofst.add_state();
            ofst.set_final(end_state, LatticeWeight::one());

            self.state_label_map.clear();
            let mut tok = self.active_toks[frame_end as usize].head;
            while tok != NONE {
                let cur_state = tok_map[&tok];
                // A unique state-label per boundary token; the next chunk's
                // initial arcs will carry the same labels.
                let id = self.state_label_available_idx;
                self.state_label_available_idx += 1;
                self.state_label_map.insert(tok, id);

                let final_weight = ofst.final_weight(cur_state);
                debug_assert!(!final_weight.is_zero());
                // extra_cost carries future information from the pruner: it
                // stops the determinizer's beam from discarding arcs that
                // turn out cheap once the next chunk arrives.
                let cost_offset = self.pool.tok(tok).extra_cost;
                self.state_label_final_cost.insert(id, cost_offset);
                ofst.add_arc(
                    cur_state,
                    LatticeArc {
                        ilabel: 0,
                        olabel: id,
                        weight: final_weight.times(&LatticeWeight::new(0.0, cost_offset)),
                        nextstate: end_state,
                    },
                );
                ofst.set_final(cur_state, LatticeWeight::zero());
                tok = self.pool.tok(tok).next;
            }
        }

        Ok(if ofst.num_states() > 0 { Some(ofst) } else { None })
    }
}

#[inline]
fn approx_equal(a: f32, b: f32, delta: f32) -> bool {
    if a == b {
        return true;
    }
    (a - b).abs() <= delta * (a.abs() + b.abs())
}
