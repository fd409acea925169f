//! Tiled online-softmax attention for long prefill.
//!
//! Works directly on the fused QKV projection: queries are tiled into
//! `src_blk` row blocks, keys/values into `tgt_blk` column blocks, and each
//! `(batch, head, src block)` task streams over the target blocks with the
//! log-sum-exp update, so no full `[S, T]` score matrix ever materializes.
//!
//! K/V participate in the compute type of the KV cache. When that differs
//! from the activation type, the K/V columns are converted once into a pool
//! buffer with stride `2 * kv_cols`; otherwise the projection buffer is used
//! in place.

use rayon::prelude::*;

use super::{Attention, QkvLayout};
use crate::cache::KvCache;
use crate::context::DecoderContext;
use crate::dtype::{reinterpret_slice, Element};
use crate::kernels::{convert_copy, small_gemm, small_gemm_transb, SendPtr};
use crate::norm::Norm;

#[allow(clippy::too_many_arguments)]
pub(crate) fn flash_attention<A: Element, N: Norm, C: Element>(
    attn: &Attention<A, N>,
    ctx: &mut DecoderContext<A>,
    qkv: &[A],
    result: &mut [A],
    attn_mask: Option<&[f32]>,
    present_key: &mut KvCache<C>,
    present_value: &mut KvCache<C>,
    past_seq_len: usize,
) {
    let seq = ctx.input_seq_len;
    let batch = ctx.batch_size;
    let head_size = ctx.config.att_head_size;
    let group = ctx.config.att_head_num / ctx.config.kv_head_num;
    let scale = ctx.config.att_factor;
    let layout = QkvLayout::of(attn, head_size);
    let tgt_len = past_seq_len + seq;

    // K/V dtype regime: in place when the cache type matches the
    // activations, otherwise a one-shot converted copy.
    let mut converted: Option<Vec<C>> = None;
    let (kv_stride, k_col_base) = if reinterpret_slice::<A, C>(qkv).is_some() {
        (layout.qkv_cols, layout.k_offset())
    } else {
        let kv_stride = 2 * layout.kv_cols;
        let mut buf = C::take_scratch(&mut ctx.pool, "flash_kv_buf", batch * seq * kv_stride);
        {
            let dst = SendPtr(buf.as_mut_ptr());
            (0..batch * seq).into_par_iter().for_each(|row| {
                let src = &qkv[row * layout.qkv_cols + layout.k_offset()..][..kv_stride];
                let out = unsafe {
                    std::slice::from_raw_parts_mut(dst.ptr().add(row * kv_stride), kv_stride)
                };
                convert_copy(out, src);
            });
        }
        converted = Some(buf);
        (kv_stride, 0)
    };

    let kv_base: &[C] = match &converted {
        Some(buf) => buf,
        None => reinterpret_slice::<A, C>(qkv).unwrap(),
    };

    scaled_dp_attention(
        attn, ctx, qkv, kv_base, k_col_base, kv_stride, result, attn_mask, scale, batch, seq,
        tgt_len, head_size, group, layout,
    );

    if let Some(buf) = converted {
        C::restore_scratch(&mut ctx.pool, "flash_kv_buf", buf);
    }

    // Populate the cache for the decode steps that follow.
    attn.copy_kv_cache(ctx, qkv, present_key, present_value, past_seq_len);
}

/// Blocked scaled dot-product attention over the whole batch.
#[allow(clippy::too_many_arguments)]
fn scaled_dp_attention<A: Element, N: Norm, C: Element>(
    attn: &Attention<A, N>,
    ctx: &mut DecoderContext<A>,
    qkv: &[A],
    kv_base: &[C],
    k_col_base: usize,
    kv_stride: usize,
    result: &mut [A],
    attn_mask: Option<&[f32]>,
    scale: f32,
    batch: usize,
    src_len: usize,
    tgt_len: usize,
    head_size: usize,
    group: usize,
    layout: QkvLayout,
) {
    let resp_heads = attn.resp_q_heads();

    // Block sizes from practical experience: query blocks capped at 256 and
    // at the nearest power of two below S/2, target blocks at 512.
    let min_blk = 1usize << (usize::BITS - 1 - (src_len / 2).max(1).leading_zeros());
    let src_blk = 256.min(min_blk);
    let tgt_blk = 512.min(tgt_len);

    let nth = rayon::current_num_threads().max(1);
    let arr_stride = (4 + tgt_blk + head_size) * src_blk;
    let mut thr_buf = ctx.pool.take_f32("thread_buffers", nth * arr_stride);
    let thr_ptr = SendPtr(thr_buf.as_mut_ptr());
    let mut q_buf = C::take_scratch(&mut ctx.pool, "flash_q_buf", nth * src_blk * head_size);
    let q_ptr = SendPtr(q_buf.as_mut_ptr());

    let result_ptr = SendPtr(result.as_mut_ptr());
    let src_blocks = src_len.div_ceil(src_blk);

    (0..batch * resp_heads * src_blocks)
        .into_par_iter()
        .for_each(|task| {
            let b = task / (resp_heads * src_blocks);
            let j = task / src_blocks % resp_heads;
            let mb = task % src_blocks;
            let m_start = mb * src_blk;
            let q_real = src_blk.min(src_len - m_start);

            let tid = rayon::current_thread_index().unwrap_or(0);
            let thr = unsafe { thr_ptr.ptr().add(tid * arr_stride) };
            let (pre_sum, sum, pre_max, max, qk, exp_qkv) = unsafe {
                (
                    std::slice::from_raw_parts_mut(thr, src_blk),
                    std::slice::from_raw_parts_mut(thr.add(src_blk), src_blk),
                    std::slice::from_raw_parts_mut(thr.add(2 * src_blk), src_blk),
                    std::slice::from_raw_parts_mut(thr.add(3 * src_blk), src_blk),
                    std::slice::from_raw_parts_mut(thr.add(4 * src_blk), src_blk * tgt_blk),
                    std::slice::from_raw_parts_mut(
                        thr.add((4 + tgt_blk) * src_blk),
                        src_blk * head_size,
                    ),
                )
            };

            for r in 0..q_real {
                pre_sum[r] = 0.0;
                sum[r] = 0.0;
                pre_max[r] = f32::MIN;
                max[r] = f32::MIN;
            }

            // Convert this task's query rows into the compute type.
            let q_tile = unsafe {
                std::slice::from_raw_parts_mut(
                    q_ptr.ptr().add(tid * src_blk * head_size),
                    q_real * head_size,
                )
            };
            for r in 0..q_real {
                let src = &qkv
                    [(b * src_len + m_start + r) * layout.qkv_cols + j * head_size..][..head_size];
                for (o, s) in q_tile[r * head_size..(r + 1) * head_size]
                    .iter_mut()
                    .zip(src.iter())
                {
                    *o = C::from_f32(s.to_f32());
                }
            }

            // Reset the output tile; the running update rescales it.
            let out = unsafe {
                result_ptr
                    .ptr()
                    .add((b * src_len + m_start) * layout.q_cols + j * head_size)
            };
            for r in 0..q_real {
                for c in 0..head_size {
                    unsafe { *out.add(r * layout.q_cols + c) = A::from_f32(0.0) };
                }
            }

            let kv_local = attn.local_kv_head(j, group);
            let k_head = b * src_len * kv_stride + k_col_base + kv_local * head_size;
            let v_head = k_head + layout.kv_cols;
            let mask_b = attn_mask.map(|m| &m[b * src_len * tgt_len..(b + 1) * src_len * tgt_len]);

            let mut b0 = 0;
            while b0 < tgt_len {
                let kv_real = tgt_blk.min(tgt_len - b0);
                unsafe {
                    incremental_tile_attention(
                        q_tile.as_ptr(),
                        kv_base.as_ptr().add(k_head + b0 * kv_stride),
                        kv_base.as_ptr().add(v_head + b0 * kv_stride),
                        mask_b,
                        m_start,
                        b0,
                        q_real,
                        head_size,
                        kv_real,
                        tgt_len,
                        pre_sum,
                        sum,
                        pre_max,
                        max,
                        scale,
                        qk,
                        exp_qkv,
                        out,
                        head_size,
                        kv_stride,
                        kv_stride,
                        layout.q_cols,
                        tgt_blk,
                    );
                }
                b0 += tgt_blk;
            }

            // Final normalization by the accumulated sum.
            for r in 0..q_real {
                let inv = 1.0 / sum[r];
                for c in 0..head_size {
                    unsafe {
                        let p = out.add(r * layout.q_cols + c);
                        *p = A::from_f32((*p).to_f32() * inv);
                    }
                }
            }
        });

    ctx.pool.restore_f32("thread_buffers", thr_buf);
    C::restore_scratch(&mut ctx.pool, "flash_q_buf", q_buf);
}

/// One target-block step of the streaming log-sum-exp update:
/// rescale the running output by `exp(prev_max - new_max)` and fold in this
/// block's `exp(scores - new_max) · V`.
///
/// # Safety
///
/// The pointers must cover the addressed tiles and be unaliased by other
/// threads for the duration of the call.
#[allow(clippy::too_many_arguments)]
unsafe fn incremental_tile_attention<A: Element, C: Element>(
    q: *const C,
    k: *const C,
    v: *const C,
    mask: Option<&[f32]>,
    m_start: usize,
    b0: usize,
    m: usize,
    head_size: usize,
    kv_real: usize,
    tgt_len: usize,
    pre_sum: &mut [f32],
    sum: &mut [f32],
    pre_max: &mut [f32],
    max: &mut [f32],
    scale: f32,
    qk: &mut [f32],
    exp_qkv: &mut [f32],
    out: *mut A,
    ldq: usize,
    ldk: usize,
    ldv: usize,
    ldo: usize,
    tgt_blk: usize,
) {
    small_gemm_transb(q, k, qk.as_mut_ptr(), m, kv_real, head_size, ldq, ldk, tgt_blk);

    for r in 0..m {
        let row = &mut qk[r * tgt_blk..r * tgt_blk + kv_real];

        // Scale plus additive mask for this row's target columns.
        match mask {
            Some(mask) => {
                let mrow = &mask[(m_start + r) * tgt_len + b0..][..kv_real];
                for (s, &mv) in row.iter_mut().zip(mrow.iter()) {
                    *s = *s * scale + mv;
                }
            }
            None => {
                for s in row.iter_mut() {
                    *s *= scale;
                }
            }
        }

        let block_max = row.iter().fold(f32::MIN, |a, &b| a.max(b));
        let new_max = pre_max[r].max(block_max);
        let alpha = (pre_max[r] - new_max).exp();

        let mut row_sum = 0.0f32;
        for s in row.iter_mut() {
            *s = (*s - new_max).exp();
            row_sum += *s;
        }
        sum[r] = alpha * pre_sum[r] + row_sum;

        // This block's probability-weighted values.
        let pv = &mut exp_qkv[r * head_size..(r + 1) * head_size];
        small_gemm(
            row.as_ptr(),
            v,
            pv.as_mut_ptr(),
            1,
            head_size,
            kv_real,
            tgt_blk,
            ldv,
            head_size,
        );

        // out = alpha * out + pv
        for c in 0..head_size {
            let p = out.add(r * ldo + c);
            *p = A::from_f32(alpha * (*p).to_f32() + pv[c]);
        }

        pre_max[r] = new_max;
        max[r] = new_max;
        pre_sum[r] = sum[r];
    }
}
