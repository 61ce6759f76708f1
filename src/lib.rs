//! Autoregressive decoder-only transformer backbone.
//!
//! Given hidden states shaped `(batch, seq_len, d_model)` and an
//! incremental [`DecodeState`], the [`Backbone`] produces transformed
//! hidden states through stacked grouped-query attention + gated
//! feed-forward blocks with rotary positional embeddings and a
//! preallocated per-layer key/value cache.
//!
//! The intended driving loop is owned by the caller:
//! 1. build a [`Backbone`] from a validated [`BackboneConfig`];
//! 2. call [`Backbone::allocate_inference_cache`] and store the returned
//!    cache map into a fresh [`DecodeState`];
//! 3. issue one prefill call (offset 0, multi-token) followed by
//!    single-token decode calls, advancing the state's offset by each
//!    chunk's length in between.
//!
//! Tokenization, weight loading, the logits head, and sampling live in
//! external collaborators; this crate is inference-only and
//! single-threaded per session.

pub mod attention;
pub mod backbone;
pub mod config;
pub mod dtypes;
pub mod error;
pub mod feed_forward;
pub mod kv_cache;
pub mod linear;
pub mod mask;
pub mod norm;
pub mod rope;

mod block;

pub use attention::Attention;
pub use backbone::Backbone;
pub use block::TransformerBlock;
pub use config::{Architecture, AttentionHeads, BackboneConfig};
pub use dtypes::PrecisionPolicy;
pub use error::{BackboneError, Result};
pub use feed_forward::FeedForward;
pub use kv_cache::{DecodeState, LayerKvCache};
pub use rope::{apply_rotary, RotaryAngles, RotaryTable, DEFAULT_ROPE_BASE, DEFAULT_TABLE_LEN};
