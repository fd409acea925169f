//! BF16 prefill fast path.
//!
//! When activations and outputs are both BF16, the first forward of a
//! sequence delegates to the fused causal self-attention primitive, which
//! fills the KV cache through destination callbacks while it computes. Only
//! plain multi-head attention qualifies; a grouped-query configuration on
//! this path is a wiring error.

use super::{Attention, QkvLayout};
use crate::cache::KvCache;
use crate::context::DecoderContext;
use crate::dtype::Element;
use crate::kernels::self_attn::self_attention;
use crate::norm::Norm;

pub(crate) fn self_attention_prefill<A: Element, N: Norm, C: Element>(
    attn: &Attention<A, N>,
    ctx: &DecoderContext<A>,
    qkv: &[A],
    result: &mut [A],
    present_key: &mut KvCache<C>,
    present_value: &mut KvCache<C>,
) {
    let resp_q = attn.resp_q_heads();
    let resp_kv = attn.resp_kv_heads();
    assert_eq!(
        resp_q, resp_kv,
        "the BF16 self-attention path requires one KV head per Q head"
    );

    let seq = ctx.input_seq_len;
    let batch = ctx.batch_size;
    let head_size = ctx.config.att_head_size;
    let layout = QkvLayout::of(attn, head_size);
    let token_sizes = vec![seq; batch];

    let key_shared = present_key.shared();
    let value_shared = present_value.shared();

    self_attention(
        result,
        qkv,
        &qkv[layout.k_offset()..],
        &qkv[layout.v_offset()..],
        resp_q,
        resp_kv,
        head_size,
        layout.q_cols,
        layout.qkv_cols,
        layout.qkv_cols,
        batch,
        &token_sizes,
        ctx.config.att_factor,
        move |b, h, s| key_shared.sequence_ptr(s, b, h),
        move |b, h, s| value_shared.sequence_ptr(s, b, h),
    );
}
