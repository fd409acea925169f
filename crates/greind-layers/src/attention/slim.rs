//! M-block tiled fused attention.
//!
//! Splits the query-length dimension so that one head's BMM1 score tile and
//! both operand tiles stay inside L2, then runs
//! `gemm1 → softmax → gemm2` per `(batch, head, block)` task. Score rows live
//! in per-thread regions of the shared score buffer.

use rayon::prelude::*;

use super::{mask_row, Attention, QkvLayout};
use crate::activations::softmax_row;
use crate::cache::KvCache;
use crate::context::{round_up16, DecoderContext};
use crate::dtype::Element;
use crate::kernels::{small_gemm, small_gemm_transb, SendPtr};
use crate::norm::Norm;

/// Picks the M-block size so the working set of one `(Q·Kᵀ)` tile plus its
/// operands fits the assumed L2 capacity.
pub(crate) fn mblock_size<A: Element>(seq: usize, head_size: usize, l2_bytes: usize) -> usize {
    if seq == 1 {
        return 1;
    }
    let min_val = 6.min(seq);

    let capacity = l2_bytes / std::mem::size_of::<A>();
    let qkv_size = seq * head_size;
    let score_size = seq * seq;

    let splits = if capacity <= 2 * qkv_size {
        1
    } else {
        (2 * qkv_size + score_size).div_ceil(capacity - 2 * qkv_size)
    }
    .max(1);

    seq.div_ceil(splits).clamp(min_val, seq)
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn slim_attention<A: Element, N: Norm, C: Element>(
    attn: &Attention<A, N>,
    ctx: &mut DecoderContext<A>,
    qkv: &[A],
    result: &mut [A],
    attn_mask: Option<&[f32]>,
    present_key: &mut KvCache<C>,
    present_value: &mut KvCache<C>,
    past_seq_len: usize,
    mblock: usize,
    kv_copied: bool,
) {
    let seq = ctx.input_seq_len;
    let batch = ctx.batch_size;
    let head_size = ctx.config.att_head_size;
    let resp_heads = attn.resp_q_heads();
    let group = ctx.config.att_head_num / ctx.config.kv_head_num;
    let att_factor = ctx.config.att_factor;
    let layout = QkvLayout::of(attn, head_size);

    let total_len = past_seq_len + seq;
    let mblock_num = seq.div_ceil(mblock);

    let score_stride = if past_seq_len > 0 {
        round_up16(total_len)
    } else {
        seq
    };

    // Per-thread score regions, one per worker of the ambient pool; spill to
    // the pool allocator when the context scratch is too small.
    let needed = rayon::current_num_threads().max(1) * mblock * score_stride;
    let mut spilled = if needed > ctx.score_capacity() {
        log::debug!("score working set {needed} exceeds context scratch, using pool");
        Some(ctx.pool.take_f32("score_buf", needed))
    } else {
        None
    };
    let score_ptr = SendPtr(match &mut spilled {
        Some(buf) => buf.as_mut_ptr(),
        None => ctx.qk_scores.as_mut_ptr(),
    });

    let key_shared = present_key.shared();
    let value_shared = present_value.shared();
    let result_ptr = SendPtr(result.as_mut_ptr());

    (0..batch * resp_heads * mblock_num)
        .into_par_iter()
        .for_each(|task| {
            let b = task / (resp_heads * mblock_num);
            let i = task / mblock_num % resp_heads;
            let mb = task % mblock_num;

            let start_seq = mb * mblock;
            let end_seq = (start_seq + mblock).min(seq);
            let m = end_seq - start_seq;

            // Lazy path: a single task owns this head, so it copies its own
            // keys before BMM1 and its values before BMM2.
            if !kv_copied {
                for s in 0..seq {
                    let src =
                        &qkv[(b * seq + s) * layout.qkv_cols + layout.k_offset() + i * head_size..]
                            [..head_size];
                    unsafe {
                        let dst = key_shared.sequence_ptr(past_seq_len + s, b, i);
                        for j in 0..head_size {
                            *dst.add(j) = C::from_f32(src[j].to_f32());
                        }
                    }
                }
            }

            let kv_head = attn.local_kv_head(i, group);
            let (key_head, ldb) = key_shared.head_ptr(b, kv_head);

            let tid = rayon::current_thread_index().unwrap_or(0);
            let score = unsafe { score_ptr.ptr().add(tid * mblock * score_stride) };

            // BMM1: Q rows against the whole cached K head.
            let a_off = (b * seq + start_seq) * layout.qkv_cols + i * head_size;
            unsafe {
                small_gemm_transb(
                    qkv.as_ptr().add(a_off),
                    key_head,
                    score,
                    m,
                    total_len,
                    head_size,
                    layout.qkv_cols,
                    ldb,
                    score_stride,
                );
            }

            // Scaled, masked softmax row by row.
            for r in 0..m {
                let row =
                    unsafe { std::slice::from_raw_parts_mut(score.add(r * score_stride), total_len) };
                let mask = mask_row(attn_mask, b, seq, total_len, start_seq + r);
                softmax_row(row, mask, att_factor);
            }

            if !kv_copied {
                for s in 0..seq {
                    let src =
                        &qkv[(b * seq + s) * layout.qkv_cols + layout.v_offset() + i * head_size..]
                            [..head_size];
                    unsafe {
                        let dst = value_shared.sequence_ptr(past_seq_len + s, b, i);
                        for j in 0..head_size {
                            *dst.add(j) = C::from_f32(src[j].to_f32());
                        }
                    }
                }
            }

            // BMM2: softmax rows against the cached V head, into the result
            // tile at this head's column block.
            let (value_head, ldv) = value_shared.head_ptr(b, kv_head);
            let out_off = (b * seq + start_seq) * layout.q_cols + i * head_size;
            unsafe {
                small_gemm(
                    score,
                    value_head,
                    result_ptr.ptr().add(out_off),
                    m,
                    head_size,
                    total_len,
                    score_stride,
                    ldv,
                    layout.q_cols,
                );
            }
        });

    if let Some(buf) = spilled {
        ctx.pool.restore_f32("score_buf", buf);
    }
}
