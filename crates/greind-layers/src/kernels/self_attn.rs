//! Fused causal self-attention primitive for the prefill fast path.
//!
//! Operates directly on the packed QKV projection output (one row per token,
//! stride `q_stride`/`kv_stride`) and writes K/V into the cache through the
//! supplied destination callbacks while computing the attention output. The
//! mask is implicitly causal; there is no padding-mask input on this path.
//!
//! Only multi-head attention is supported here (one KV head per Q head); the
//! grouped-query case goes through the fused attention kernels instead.

use rayon::prelude::*;

use super::SendPtr;
use crate::activations::softmax_row;
use crate::dtype::Element;

#[allow(clippy::too_many_arguments)]
pub fn self_attention<A, C, FK, FV>(
    output: &mut [A],
    query: &[A],
    key: &[A],
    value: &[A],
    q_heads: usize,
    kv_heads: usize,
    head_size: usize,
    o_stride: usize,
    q_stride: usize,
    kv_stride: usize,
    batch: usize,
    token_sizes: &[usize],
    scale: f32,
    key_dst: FK,
    value_dst: FV,
) where
    A: Element,
    C: Element,
    FK: Fn(usize, usize, usize) -> *mut C + Sync,
    FV: Fn(usize, usize, usize) -> *mut C + Sync,
{
    assert_eq!(
        q_heads, kv_heads,
        "self_attention requires one KV head per Q head (got {q_heads} vs {kv_heads})"
    );
    assert_eq!(token_sizes.len(), batch);

    // Row offset of each batch item in the packed token dimension.
    let mut row_base = vec![0usize; batch];
    for b in 1..batch {
        row_base[b] = row_base[b - 1] + token_sizes[b - 1];
    }

    let out = SendPtr(output.as_mut_ptr());

    (0..batch * q_heads).into_par_iter().for_each(|task| {
        let b = task / q_heads;
        let h = task % q_heads;
        let tokens = token_sizes[b];
        let base = row_base[b];
        let col = h * head_size;

        // Populate the cache for this head first; the compute below reads the
        // projection buffer, so ordering only matters for later layers.
        for seq in 0..tokens {
            let k_src = &key[(base + seq) * kv_stride + col..][..head_size];
            let v_src = &value[(base + seq) * kv_stride + col..][..head_size];
            unsafe {
                let k_dst = std::slice::from_raw_parts_mut(key_dst(b, h, seq), head_size);
                let v_dst = std::slice::from_raw_parts_mut(value_dst(b, h, seq), head_size);
                super::convert_copy(k_dst, k_src);
                super::convert_copy(v_dst, v_src);
            }
        }

        let mut score = vec![0.0f32; tokens];
        for i in 0..tokens {
            let q_row = &query[(base + i) * q_stride + col..][..head_size];

            // Causal: only keys up to and including position i.
            let row = &mut score[..i + 1];
            for (j, s) in row.iter_mut().enumerate() {
                let k_row = &key[(base + j) * kv_stride + col..][..head_size];
                *s = super::dot(q_row, k_row, head_size);
            }
            softmax_row(row, None, scale);

            let o_row = unsafe { out.ptr().add((base + i) * o_stride + col) };
            let mut acc = vec![0.0f32; head_size];
            for (j, &w) in row.iter().enumerate() {
                let v_row = &value[(base + j) * kv_stride + col..][..head_size];
                for (a, v) in acc.iter_mut().zip(v_row.iter()) {
                    *a += w * v.to_f32();
                }
            }
            unsafe {
                for (j, &a) in acc.iter().enumerate() {
                    *o_row.add(j) = A::from_f32(a);
                }
            }
        }
    });
}
