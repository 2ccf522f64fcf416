//! Agent machinery: the LM adapter, the chain-of-thought request builder
//! and few-shot feedback retrieval.

pub mod chain;
pub mod client;
pub mod feedback;

pub use chain::ChainOfThought;
pub use client::{load_base_lm, load_complex_lm, HttpLm};
pub use feedback::{fetch_similar, FEEDBACK_COLLECTION};
