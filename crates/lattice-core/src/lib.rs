//! Incremental lattice-generating beam-search decoder over WFST decoding
//! graphs.
//!
//! Given a stream of per-frame acoustic log-likelihoods, the decoder keeps a
//! beam of hypothesis tokens, expands them frame by frame through the graph,
//! prunes them backwards by forward slack, and emits a determinized word
//! lattice incrementally while decoding continues.

pub mod decodable;
pub mod decoder;
pub mod determinize;
pub mod graph;
pub mod hash;
pub mod incremental;
pub mod lattice;
pub mod token;
pub mod weight;

pub use decodable::{Decodable, MatrixDecodable};
pub use decoder::{LatticeIncrementalDecoder, LatticeIncrementalDecoderConfig};
pub use determinize::DeterminizeOptions;
pub use graph::{DecodingGraph, GraphArc, StateId, VectorGraph};
pub use lattice::{
    convert_to_lattice, shortest_path, CompactLattice, CompactLatticeArc, Lattice, LatticeArc,
};
pub use weight::{CompactLatticeWeight, LatticeWeight};

/// Errors surfaced to the caller. Search degradation (dead beams, truncated
/// determinization) is not an error: it is logged and a best-effort lattice
/// is still produced.
#[derive(thiserror::Error, Debug)]
pub enum LatticeError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("the decoding graph has an epsilon cycle")]
    EpsilonCycle,
    #[error("lattice determinization failed: {0}")]
    Determinize(String),
}
