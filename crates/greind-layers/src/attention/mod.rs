//! Decoder self-attention: fused QKV projection, rotary post-op, the fused
//! attention kernel family, and the output projection with the
//! tensor-parallel residual contract.
//!
//! The forward pass is a strict pipeline over three `[M, hidden]` buffers:
//!
//! ```text
//! input ──norm──► im_buf ──QKV linear──► qkv_matmul ──attention──► attnSplit
//!                                                        │
//! output ◄──out linear (+ residual on rank 0)────────────┘
//! ```
//!
//! Kernel selection at prefill (`past_seq_len == 0`): long sequences go to
//! the tiled online-softmax kernel, BF16 activations take the fused
//! self-attention fast path, everything else runs the classic fused kernel,
//! which itself picks between M-block tiling and head sharding. Decode steps
//! always run the classic fused kernel.

mod flash;
mod self_bf16;
mod shard;
mod slim;

#[cfg(test)]
mod tests;

pub use shard::splits_for;

use std::marker::PhantomData;

use anyhow::Result;
use rayon::prelude::*;

use crate::cache::KvCache;
use crate::context::DecoderContext;
use crate::dtype::{ActDType, Element};
use crate::norm::{Norm, RmsNorm};
use crate::rope::{RopeShape, RotaryEmbedding};
use crate::weights::{cat_columns, RawWeight, WeightBundle, WeightSplit};

/// Which kernel the dispatcher would run for a given call shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelKind {
    Flash,
    SelfAttnBF16,
    Slim,
    ShardHead,
}

pub struct Attention<A: Element = f32, N: Norm = RmsNorm> {
    layer_id: usize,

    // The responsible heads in the global view. A single instance owns
    // everything: start 0, end = head count.
    start_q_head: usize,
    end_q_head: usize,
    start_kv_head: usize,
    end_kv_head: usize,

    qkv_weight: Option<WeightBundle>,
    qkv_bias: Option<Vec<f32>>,
    out_weight: Option<WeightBundle>,
    out_bias: Option<Vec<f32>>,

    rope: RotaryEmbedding,
    norm: N,

    /// When false, the residual source is the norm output instead of the raw
    /// layer input (the ChatGLM-style wiring).
    input_as_resid: bool,
    /// Scale on the residual; 1.0 uses the plain fused epilogue.
    residual_scale: f32,

    _marker: PhantomData<A>,
}

impl<A: Element, N: Norm> Attention<A, N> {
    pub fn new(layer_id: usize, ctx: &DecoderContext<A>) -> Self {
        let (start_q_head, end_q_head) = ctx.q_head_range();
        let (start_kv_head, end_kv_head) = ctx.kv_head_range();

        Self {
            layer_id,
            start_q_head,
            end_q_head,
            start_kv_head,
            end_kv_head,
            qkv_weight: None,
            qkv_bias: None,
            out_weight: None,
            out_bias: None,
            rope: RotaryEmbedding::new(ctx.config.att_head_size, ctx.config.max_pos_embed),
            norm: N::default(),
            input_as_resid: true,
            residual_scale: 1.0,
            _marker: PhantomData,
        }
    }

    /// ChatGLM-style wiring: residual taken after the norm.
    pub fn with_input_as_resid(mut self, input_as_resid: bool) -> Self {
        self.input_as_resid = input_as_resid;
        self
    }

    pub fn with_residual_scale(mut self, scale: f32) -> Self {
        self.residual_scale = scale;
        self
    }

    fn resp_q_heads(&self) -> usize {
        self.end_q_head - self.start_q_head
    }

    fn resp_kv_heads(&self) -> usize {
        self.end_kv_head - self.start_kv_head
    }

    /// Maps a rank-local query head to its rank-local KV head.
    #[inline]
    fn local_kv_head(&self, local_q: usize, group: usize) -> usize {
        (self.start_q_head + local_q) / group - self.start_kv_head
    }

    /// Converts, splits, and packs the attention weights for this rank.
    ///
    /// `query_w`/`key_w`/`value_w` are full `[hidden, heads * head_size]`
    /// matrices (or transposed when `trans`); this rank's head slices are
    /// concatenated column-wise into one `[hidden, q + 2*kv]` projection.
    /// `out_w` is `[hidden, hidden]`, split horizontally on the rows this
    /// rank's attention output occupies. The QKV bias is kept only when all
    /// three parts are present; the output bias is zeroed on non-master
    /// ranks so the external all-reduce adds it exactly once.
    #[allow(clippy::too_many_arguments)]
    pub fn set_weights(
        &mut self,
        ctx: &DecoderContext<A>,
        query_w: RawWeight,
        key_w: RawWeight,
        value_w: RawWeight,
        out_w: RawWeight,
        query_bias: Option<&[f32]>,
        key_bias: Option<&[f32]>,
        value_bias: Option<&[f32]>,
        out_bias: Option<&[f32]>,
        gamma: &[f32],
        beta: Option<&[f32]>,
        trans: bool,
    ) {
        let hidden = ctx.config.hidden_size;
        let head_size = ctx.config.att_head_size;
        let dtype = ctx.config.weight_dtype;

        let q_cols = self.resp_q_heads() * head_size;
        let kv_cols = self.resp_kv_heads() * head_size;

        let q_conv = ctx.mm.convert_weight(
            trans,
            hidden,
            ctx.config.att_head_num * head_size,
            query_w,
            WeightSplit::Columns {
                offset: self.start_q_head * head_size,
                count: q_cols,
            },
            dtype,
        );
        let kv_split = WeightSplit::Columns {
            offset: self.start_kv_head * head_size,
            count: kv_cols,
        };
        let k_conv = ctx.mm.convert_weight(
            trans,
            hidden,
            ctx.config.kv_head_num * head_size,
            key_w,
            kv_split,
            dtype,
        );
        let v_conv = ctx.mm.convert_weight(
            trans,
            hidden,
            ctx.config.kv_head_num * head_size,
            value_w,
            kv_split,
            dtype,
        );

        let qk = cat_columns(&q_conv, &k_conv);
        let qkv = cat_columns(&qk, &v_conv);
        self.qkv_weight = Some(ctx.mm.pack_weight(qkv));

        // Merged bias, only when every part is present.
        self.qkv_bias = match (query_bias, key_bias, value_bias) {
            (Some(qb), Some(kb), Some(vb)) => {
                let mut bias = Vec::with_capacity(q_cols + 2 * kv_cols);
                bias.extend_from_slice(
                    &qb[self.start_q_head * head_size..self.end_q_head * head_size],
                );
                bias.extend_from_slice(
                    &kb[self.start_kv_head * head_size..self.end_kv_head * head_size],
                );
                bias.extend_from_slice(
                    &vb[self.start_kv_head * head_size..self.end_kv_head * head_size],
                );
                Some(bias)
            }
            _ => None,
        };

        // Output projection: horizontal split over the rows this rank's
        // attention output occupies.
        self.out_weight = Some(ctx.mm.pack_weight(ctx.mm.convert_weight(
            trans,
            hidden,
            hidden,
            out_w,
            WeightSplit::Rows {
                offset: self.start_q_head * head_size,
                count: q_cols,
            },
            dtype,
        )));

        self.out_bias = out_bias.map(|b| {
            if ctx.is_master() {
                b.to_vec()
            } else {
                vec![0.0; b.len()]
            }
        });

        self.norm.set_weight(gamma, beta);
    }

    /// Kernel the dispatcher will pick for the prepared context shape.
    pub fn select_kernel(&self, ctx: &DecoderContext<A>, past_seq_len: usize) -> KernelKind {
        let seq = ctx.input_seq_len;
        if past_seq_len == 0 {
            if seq > ctx.config.flash_thresh {
                return KernelKind::Flash;
            }
            if A::DTYPE == ActDType::BF16 {
                return KernelKind::SelfAttnBF16;
            }
        }
        if shard::should_shard(
            seq,
            ctx.config.num_threads,
            ctx.batch_size,
            self.resp_q_heads(),
        ) {
            KernelKind::ShardHead
        } else {
            KernelKind::Slim
        }
    }

    /// Forward for the whole attention sub-layer over `[M, hidden]` tiles
    /// with row stride `hidden` (`M = batch * input_seq_len`).
    ///
    /// `attn_mask` is additive, shaped `[batch, input_seq_len, total_len]`;
    /// `None` leaves the scores unmasked. `present_key`/`present_value` hold
    /// this layer's cache; positions `[past_seq_len, past_seq_len + S)` are
    /// written during the call.
    #[allow(clippy::too_many_arguments)]
    pub fn forward<C: Element>(
        &self,
        ctx: &mut DecoderContext<A>,
        input: &mut [A],
        im_buf: &mut [A],
        output: &mut [A],
        attn_mask: Option<&[f32]>,
        present_key: &mut KvCache<C>,
        present_value: &mut KvCache<C>,
        past_seq_len: usize,
        use_self_attn: bool,
        do_ln_before: bool,
        position_ids: Option<&[usize]>,
    ) -> Result<()> {
        let hidden = ctx.config.hidden_size;
        let head_size = ctx.config.att_head_size;
        let seq = ctx.input_seq_len;
        let m = ctx.batch_size * seq;

        let q_cols = self.resp_q_heads() * head_size;
        let kv_cols = self.resp_kv_heads() * head_size;
        let qkv_cols = q_cols + 2 * kv_cols;

        present_key.check_capacity(past_seq_len, seq)?;
        present_value.check_capacity(past_seq_len, seq)?;

        log::debug!(
            "attention layer {} forward: m={m} past={past_seq_len} self_attn={use_self_attn}",
            self.layer_id
        );

        // 1. Pre-norm into the intermediate buffer.
        if do_ln_before {
            self.norm
                .forward(input, im_buf, m, hidden, hidden, hidden, ctx.config.epsilon);
        }

        // 2. Fused QKV projection.
        let qkv_weight = self.qkv_weight.as_ref().expect("set_weights must run first");
        let mut qkv = std::mem::take(&mut ctx.qkv_matmul);
        {
            let src: &[A] = if do_ln_before { &*im_buf } else { &*input };
            match &self.qkv_bias {
                Some(bias) => ctx.mm.compute_bias(
                    m, qkv_cols, hidden, 1.0, src, hidden, qkv_weight, &mut qkv, qkv_cols, bias,
                ),
                None => ctx.mm.compute(
                    m, qkv_cols, hidden, 1.0, src, hidden, qkv_weight, &mut qkv, qkv_cols,
                ),
            }
        }

        // 3. Rotary post-op on the Q and K blocks.
        let shape = RopeShape {
            batch: ctx.batch_size,
            seq_len: seq,
            q_heads: self.resp_q_heads(),
            head_size,
            kv_heads: self.resp_kv_heads(),
            max_seq_len: ctx.config.max_seq_length,
            past_seq_len,
        };
        match position_ids {
            Some(ids) => {
                self.rope
                    .forward(&mut qkv, 0, q_cols, qkv_cols, qkv_cols, shape, ids);
            }
            None if ctx.config.max_pos_embed > 0 => {
                // Default position ids continue the cached sequence.
                let ids: Vec<usize> = (past_seq_len..past_seq_len + seq).collect();
                self.rope
                    .forward(&mut qkv, 0, q_cols, qkv_cols, qkv_cols, shape, &ids);
            }
            None => {}
        }

        // 4. Pick the residual source and the attention result buffer.
        let (attn_buf, resid): (&mut [A], &[A]) = if self.input_as_resid {
            (im_buf, &*input)
        } else {
            (input, &*im_buf)
        };

        // 5. Attention kernel. The result lands in the leading `[M, q_cols]`
        // tile of `attn_buf`.
        //
        // The per-layer M-block size lives in the context so the layer that
        // begins a pipeline stage decides it once for everyone.
        if self.layer_id % (ctx.config.layers / ctx.config.pp_size) == 0 {
            ctx.mblock_size = if past_seq_len == 0 {
                slim::mblock_size::<A>(seq, head_size, ctx.config.l2_cache_bytes)
            } else {
                seq
            };
        }

        if past_seq_len == 0 && seq > ctx.config.flash_thresh {
            flash::flash_attention(
                self, ctx, &qkv, attn_buf, attn_mask, present_key, present_value, past_seq_len,
            );
        } else if past_seq_len == 0 && A::DTYPE == ActDType::BF16 {
            self_bf16::self_attention_prefill(
                self, ctx, &qkv, attn_buf, present_key, present_value,
            );
        } else {
            self.fused_attention(
                ctx, &qkv, attn_buf, attn_mask, present_key, present_value, past_seq_len,
            );
        }
        ctx.qkv_matmul = qkv;

        // 6. Output projection; the residual is folded in exactly once, on
        // the master rank.
        let out_weight = self.out_weight.as_ref().expect("set_weights must run first");
        let bias = self.out_bias.as_deref();
        if ctx.is_master() {
            let gamma = self.residual_scale;
            if gamma == 1.0 {
                ctx.mm.compute_residential(
                    m, hidden, q_cols, 1.0, &*attn_buf, q_cols, out_weight, output, hidden, bias,
                    resid, hidden,
                );
            } else {
                ctx.mm.compute_resext(
                    m, hidden, q_cols, 1.0, &*attn_buf, q_cols, out_weight, output, hidden, bias,
                    gamma, resid, hidden,
                );
            }
        } else {
            match bias {
                Some(b) => ctx.mm.compute_bias(
                    m, hidden, q_cols, 1.0, &*attn_buf, q_cols, out_weight, output, hidden, b,
                ),
                None => ctx.mm.compute(
                    m, hidden, q_cols, 1.0, &*attn_buf, q_cols, out_weight, output, hidden,
                ),
            }
        }

        // 7. Post-norm variant normalizes the projected output in place.
        if !do_ln_before {
            let tmp = output.to_vec();
            self.norm
                .forward(&tmp, output, m, hidden, hidden, hidden, ctx.config.epsilon);
        }

        Ok(())
    }

    /// Classic fused attention: eager/lazy KV-cache population, then either
    /// M-block tiling or head sharding.
    #[allow(clippy::too_many_arguments)]
    fn fused_attention<C: Element>(
        &self,
        ctx: &mut DecoderContext<A>,
        qkv: &[A],
        result: &mut [A],
        attn_mask: Option<&[f32]>,
        present_key: &mut KvCache<C>,
        present_value: &mut KvCache<C>,
        past_seq_len: usize,
    ) {
        let seq = ctx.input_seq_len;

        let mut mblock = ctx.mblock_size;
        if mblock == 0 || mblock > seq {
            // A layer ran before its stage leader; fall back to one block.
            mblock = seq;
        }

        let shard_head = shard::should_shard(
            seq,
            ctx.config.num_threads,
            ctx.batch_size,
            self.resp_q_heads(),
        );

        // Pre-copy K/V when several tasks would otherwise race on one head:
        // grouped-query, a split M dimension, or sharded heads.
        let mut kv_copied = false;
        if ctx.config.kv_head_num < ctx.config.att_head_num || mblock != seq || shard_head {
            self.copy_kv_cache(ctx, qkv, present_key, present_value, past_seq_len);
            kv_copied = true;
        }

        if shard_head {
            shard::cross_attn_shard_head(
                self, ctx, qkv, result, attn_mask, present_key, present_value, past_seq_len,
            );
        } else {
            slim::slim_attention(
                self, ctx, qkv, result, attn_mask, present_key, present_value, past_seq_len,
                mblock, kv_copied,
            );
        }
    }

    /// Copies this call's K and V rows into the caches, re-laying
    /// `(batch, seq, cols)` into the cache's `(seq, batch, head)` order.
    fn copy_kv_cache<C: Element>(
        &self,
        ctx: &DecoderContext<A>,
        qkv: &[A],
        present_key: &mut KvCache<C>,
        present_value: &mut KvCache<C>,
        past_seq_len: usize,
    ) {
        let seq = ctx.input_seq_len;
        let batch = ctx.batch_size;
        let head_size = ctx.config.att_head_size;
        let resp_kv = self.resp_kv_heads();
        let q_cols = self.resp_q_heads() * head_size;
        let kv_cols = resp_kv * head_size;
        let qkv_cols = q_cols + 2 * kv_cols;

        let key_shared = present_key.shared();
        let value_shared = present_value.shared();

        (0..batch * resp_kv * seq).into_par_iter().for_each(|task| {
            let b = task / (resp_kv * seq);
            let h = task / seq % resp_kv;
            let s = task % seq;

            let row = (b * seq + s) * qkv_cols;
            let k_src = &qkv[row + q_cols + h * head_size..][..head_size];
            let v_src = &qkv[row + q_cols + kv_cols + h * head_size..][..head_size];

            unsafe {
                let k_dst = key_shared.sequence_ptr(past_seq_len + s, b, h);
                let v_dst = value_shared.sequence_ptr(past_seq_len + s, b, h);
                for j in 0..head_size {
                    *k_dst.add(j) = C::from_f32(k_src[j].to_f32());
                    *v_dst.add(j) = C::from_f32(v_src[j].to_f32());
                }
            }
        });
    }
}

/// Column offsets of the Q/K/V blocks within one fused projection row.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QkvLayout {
    pub q_cols: usize,
    pub kv_cols: usize,
    pub qkv_cols: usize,
}

impl QkvLayout {
    pub(crate) fn of<A: Element, N: Norm>(
        attn: &Attention<A, N>,
        head_size: usize,
    ) -> Self {
        let q_cols = attn.resp_q_heads() * head_size;
        let kv_cols = attn.resp_kv_heads() * head_size;
        Self {
            q_cols,
            kv_cols,
            qkv_cols: q_cols + 2 * kv_cols,
        }
    }

    #[inline]
    pub(crate) fn k_offset(&self) -> usize {
        self.q_cols
    }

    #[inline]
    pub(crate) fn v_offset(&self) -> usize {
        self.q_cols + self.kv_cols
    }
}

/// Additive mask row base for `(batch, src row)`: masks are shaped
/// `[batch, src_len, tgt_len]`.
#[inline]
pub(crate) fn mask_row(
    mask: Option<&[f32]>,
    b: usize,
    src_len: usize,
    tgt_len: usize,
    row: usize,
) -> Option<&[f32]> {
    mask.map(|m| &m[(b * src_len + row) * tgt_len..(b * src_len + row + 1) * tgt_len])
}
