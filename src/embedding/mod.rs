//! Embedding lookup and token scoring (§4.9).

pub mod lookup;
pub mod scoring;

pub use lookup::{EmbeddingLayer, EmbeddingTable};
pub use scoring::{ScoringRule, TokenScoringLayer};
