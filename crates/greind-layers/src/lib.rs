//! CPU decoder-layer core for LLaMA-style autoregressive models.
//!
//! This crate implements the two sub-layers of one transformer decoder
//! layer — self-attention with a fused kernel family and the gated MLP —
//! together with the pieces they share: packed (optionally quantized)
//! weights, a per-layer KV cache, rotary embeddings, normalization, and the
//! projection GEMM dispatcher. Model loading, tokenization, sampling, and
//! the cross-rank reduce are left to the embedding application.

pub mod activations;
pub mod attention;
pub mod cache;
pub mod context;
pub mod dtype;
pub mod kernels;
pub mod matmul;
pub mod mlp;
pub mod norm;
pub mod pool;
pub mod rope;
pub mod weights;

// Re-export commonly used items
pub use crate::{
    activations::Activation,
    attention::{Attention, KernelKind},
    cache::KvCache,
    context::{task_range, DecoderConfig, DecoderContext},
    dtype::{ActDType, Element, WeightDType},
    matmul::MatmulHelper,
    mlp::Mlp,
    norm::{LayerNorm, Norm, RmsNorm},
    pool::ScratchPool,
    rope::{RopeShape, RotaryEmbedding},
    weights::{RawWeight, WeightBundle, WeightSplit},
};
