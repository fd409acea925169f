//! Head-sharded single-token attention with an online-softmax merge.
//!
//! When the query length is 1, parallelism across `batch × heads` can leave
//! most of the machine idle. This kernel splits each head's key/value columns
//! into `num_threads / (batch · heads)` shards, computes a partial softmax
//! and partial output per shard, and lets shard 0 of every head merge the
//! partials with the log-sum-exp identity.
//!
//! The rendezvous is a per-shard publication flag: producers store their
//! (max, sum) statistics and release the flag; the reducer acquire-spins on
//! it. The whole team runs on dedicated scoped threads so a spinning reducer
//! can never starve the producers it waits for.

use std::sync::atomic::{AtomicU32, Ordering};

use super::{mask_row, Attention, QkvLayout};
use crate::activations::softmax_with_stats;
use crate::cache::KvCache;
use crate::context::{round_up16, DecoderContext};
use crate::dtype::Element;
use crate::kernels::{small_gemm, small_gemm_transb, SendPtr};
use crate::norm::Norm;

/// Shard count per head for the given worker count; the kernel is only
/// worthwhile (and only runs) when this is at least 2.
pub fn splits_for(num_threads: usize, batch: usize, resp_q_heads: usize) -> usize {
    num_threads / (batch * resp_q_heads)
}

/// Single-token queries with thread supply at least twice the head-level
/// parallelism go to the head-sharded kernel.
pub(crate) fn should_shard(
    seq: usize,
    num_threads: usize,
    batch: usize,
    resp_q_heads: usize,
) -> bool {
    seq == 1 && num_threads >= 2 * batch * resp_q_heads
}

/// Per-shard merge slot, one cacheline each. The producer stores `max` and
/// `sum` before releasing `flag`; `rev_factor` is written and read only by
/// the reducing shard.
#[repr(align(64))]
struct SplitInfo {
    max: AtomicU32,
    sum: AtomicU32,
    flag: AtomicU32,
    rev_factor: AtomicU32,
}

impl SplitInfo {
    fn new() -> Self {
        Self {
            max: AtomicU32::new(0),
            sum: AtomicU32::new(0),
            flag: AtomicU32::new(0),
            rev_factor: AtomicU32::new(0),
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn cross_attn_shard_head<A: Element, N: Norm, C: Element>(
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
    let resp_heads = attn.resp_q_heads();
    let group = ctx.config.att_head_num / ctx.config.kv_head_num;
    let att_factor = ctx.config.att_factor;
    let layout = QkvLayout::of(attn, head_size);

    let total_len = past_seq_len + seq;
    let splits = splits_for(ctx.config.num_threads, batch, resp_heads);

    assert!(splits > 1, "head sharding needs at least 2 splits, got {splits}");
    assert!(
        head_size % 16 == 0,
        "head size {head_size} is not supported by the sharded kernel"
    );

    let nb = total_len.div_ceil(splits);
    let total_tasks = batch * resp_heads * splits;

    let split_info: Vec<SplitInfo> = (0..total_tasks).map(|_| SplitInfo::new()).collect();
    let split_info = &split_info;

    let mut sharded_out = ctx.pool.take_f32("sharded_output", total_tasks * head_size);
    let sharded_ptr = SendPtr(sharded_out.as_mut_ptr());

    let score_stride = if past_seq_len > 0 {
        round_up16(total_len)
    } else {
        seq
    };
    debug_assert!(batch * resp_heads * seq * score_stride <= ctx.score_capacity());
    let score_ptr = SendPtr(ctx.qk_scores.as_mut_ptr());

    let key_shared = present_key.shared();
    let value_shared = present_value.shared();
    let result_ptr = SendPtr(result.as_mut_ptr());

    std::thread::scope(|scope| {
        for task in 0..total_tasks {
            scope.spawn(move || {
                let b = task / (resp_heads * splits);
                let i = task / splits % resp_heads;
                let s = task % splits;

                let head_start = (b * resp_heads + i) * splits;
                let kv_head = attn.local_kv_head(i, group);

                let n_off = s * nb;
                let n = nb.min(total_len.saturating_sub(n_off));

                // Trailing shards can be empty when the history is shorter
                // than the shard grid; they publish neutral statistics.
                if n == 0 {
                    let info = &split_info[task];
                    info.max.store(f32::NEG_INFINITY.to_bits(), Ordering::Relaxed);
                    info.sum.store(0.0f32.to_bits(), Ordering::Relaxed);
                    info.flag.store(1, Ordering::Release);
                    return;
                }

                let (key_head, ldb) = key_shared.head_ptr(b, kv_head);
                let a_off = b * seq * layout.qkv_cols + i * head_size;
                let score = unsafe {
                    score_ptr
                        .ptr()
                        .add((b * resp_heads + i) * seq * score_stride + n_off)
                };

                // Partial scores for this shard's key columns.
                unsafe {
                    small_gemm_transb(
                        qkv.as_ptr().add(a_off),
                        key_head.add(n_off * ldb),
                        score,
                        1,
                        n,
                        head_size,
                        layout.qkv_cols,
                        ldb,
                        score_stride,
                    );
                }

                // Scaled+masked softmax, keeping the pre-normalization
                // statistics for the merge.
                let score_row = unsafe { std::slice::from_raw_parts_mut(score, n) };
                let mask =
                    mask_row(attn_mask, b, seq, total_len, 0).map(|m| &m[n_off..n_off + n]);
                let (max, sum) = softmax_with_stats(score_row, mask, att_factor);

                // Partial output for this shard.
                let (value_head, ldv) = value_shared.head_ptr(b, kv_head);
                let partial = unsafe { sharded_ptr.ptr().add(task * head_size) };
                unsafe {
                    small_gemm(
                        score,
                        value_head.add(n_off * ldv),
                        partial,
                        1,
                        head_size,
                        n,
                        score_stride,
                        ldv,
                        head_size,
                    );
                }

                // Publish the statistics.
                let info = &split_info[task];
                info.max.store(max.to_bits(), Ordering::Relaxed);
                info.sum.store(sum.to_bits(), Ordering::Relaxed);
                info.flag.store(1, Ordering::Release);

                // Shard 0 merges the head once every peer has published.
                if s == 0 {
                    let mut real_max = max;
                    for idx in head_start + 1..head_start + splits {
                        while split_info[idx].flag.load(Ordering::Acquire) == 0 {
                            std::hint::spin_loop();
                        }
                        let peer = f32::from_bits(split_info[idx].max.load(Ordering::Relaxed));
                        if peer > real_max {
                            real_max = peer;
                        }
                    }

                    let mut real_sum = 0.0f32;
                    for idx in head_start..head_start + splits {
                        let split_max =
                            f32::from_bits(split_info[idx].max.load(Ordering::Relaxed));
                        let split_sum =
                            f32::from_bits(split_info[idx].sum.load(Ordering::Relaxed));
                        let rev = (split_max - real_max).exp();
                        split_info[idx].rev_factor.store(rev.to_bits(), Ordering::Relaxed);
                        real_sum += split_sum * rev;
                    }

                    // Accumulate in f32, then store as the activation type.
                    let mut acc = vec![0.0f32; head_size];
                    for idx in head_start..head_start + splits {
                        let rev =
                            f32::from_bits(split_info[idx].rev_factor.load(Ordering::Relaxed));
                        let factor = rev / real_sum;
                        let partial = unsafe {
                            std::slice::from_raw_parts(
                                sharded_ptr.ptr().add(idx * head_size) as *const f32,
                                head_size,
                            )
                        };
                        for (a, &p) in acc.iter_mut().zip(partial.iter()) {
                            *a += factor * p;
                        }
                    }

                    let out = unsafe {
                        result_ptr.ptr().add(b * seq * layout.q_cols + i * head_size)
                    };
                    for (j, &a) in acc.iter().enumerate() {
                        unsafe { *out.add(j) = A::from_f32(a) };
                    }
                }
            });
        }
    });

    ctx.pool.restore_f32("sharded_output", sharded_out);
}
