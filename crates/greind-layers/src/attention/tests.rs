//! Cross-kernel equivalence and dispatch tests for the attention layer,
//! checked against a naïve reference (matmul + softmax + matmul).

use super::{Attention, KernelKind};
use crate::attention::splits_for;
use crate::cache::KvCache;
use crate::context::{DecoderConfig, DecoderContext};
use crate::dtype::Element;
use crate::norm::rms_norm;
use crate::rope::{RopeShape, RotaryEmbedding};
use crate::weights::RawWeight;
use half::bf16;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const MASK_VALUE: f32 = -1e9;

fn base_config(hidden: usize, q_heads: usize, kv_heads: usize, max_seq: usize) -> DecoderConfig {
    let head_size = hidden / q_heads;
    DecoderConfig {
        hidden_size: hidden,
        intermediate_size: hidden * 2,
        att_head_num: q_heads,
        kv_head_num: kv_heads,
        att_head_size: head_size,
        max_seq_length: max_seq,
        max_pos_embed: 0,
        att_factor: 1.0 / (head_size as f32).sqrt(),
        // Pinned so kernel selection does not depend on the host's cores.
        num_threads: 4,
        ..DecoderConfig::default()
    }
}

struct TestModel {
    cfg: DecoderConfig,
    wq: Vec<f32>,
    wk: Vec<f32>,
    wv: Vec<f32>,
    wo: Vec<f32>,
    gamma: Vec<f32>,
}

fn rand_vec(rng: &mut StdRng, n: usize) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(-0.1f32..0.1)).collect()
}

fn test_model(cfg: DecoderConfig, seed: u64) -> TestModel {
    let mut rng = StdRng::seed_from_u64(seed);
    let h = cfg.hidden_size;
    let hs = cfg.att_head_size;
    let wq = rand_vec(&mut rng, h * cfg.att_head_num * hs);
    let wk = rand_vec(&mut rng, h * cfg.kv_head_num * hs);
    let wv = rand_vec(&mut rng, h * cfg.kv_head_num * hs);
    let wo = rand_vec(&mut rng, h * h);
    let gamma = (0..h).map(|i| 1.0 + (i % 7) as f32 * 0.01).collect();
    TestModel {
        cfg,
        wq,
        wk,
        wv,
        wo,
        gamma,
    }
}

fn naive_matmul(a: &[f32], w: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let a = Array2::from_shape_vec((m, k), a.to_vec()).unwrap();
    let w = Array2::from_shape_vec((k, n), w.to_vec()).unwrap();
    a.dot(&w).into_raw_vec_and_offset().0
}

impl TestModel {
    /// Same weights under a different runtime configuration.
    fn with_cfg(&self, cfg: DecoderConfig) -> TestModel {
        TestModel {
            cfg,
            wq: self.wq.clone(),
            wk: self.wk.clone(),
            wv: self.wv.clone(),
            wo: self.wo.clone(),
            gamma: self.gamma.clone(),
        }
    }

    /// Full causal single-rank forward over `total` tokens per batch item:
    /// norm → projections → (rope) → per-head softmax attention → output
    /// projection + residual. Returns `[batch * total, hidden]`.
    fn reference(&self, tokens: &[f32], batch: usize, total: usize) -> Vec<f32> {
        let h = self.cfg.hidden_size;
        let hs = self.cfg.att_head_size;
        let qh = self.cfg.att_head_num;
        let kvh = self.cfg.kv_head_num;
        let group = qh / kvh;
        let q_cols = qh * hs;
        let kv_cols = kvh * hs;
        let m = batch * total;

        let mut normed = vec![0.0f32; m * h];
        rms_norm(&mut normed, tokens, &self.gamma, m, h, h, h, self.cfg.epsilon);

        let mut q = naive_matmul(&normed, &self.wq, m, h, q_cols);
        let mut k = naive_matmul(&normed, &self.wk, m, h, kv_cols);
        let v = naive_matmul(&normed, &self.wv, m, h, kv_cols);

        if self.cfg.max_pos_embed > 0 {
            let rope = RotaryEmbedding::new(hs, self.cfg.max_pos_embed);
            let ids: Vec<usize> = (0..total).collect();
            let shape = RopeShape {
                batch,
                seq_len: total,
                q_heads: qh,
                head_size: hs,
                kv_heads: kvh,
                max_seq_len: self.cfg.max_seq_length,
                past_seq_len: 0,
            };
            rope.apply(&mut q, 0, q_cols, qh, shape, &ids);
            rope.apply(&mut k, 0, kv_cols, kvh, shape, &ids);
        }

        let mut attn = vec![0.0f32; m * q_cols];
        for b in 0..batch {
            for head in 0..qh {
                let kv_head = head / group;
                for si in 0..total {
                    let q_row = &q[(b * total + si) * q_cols + head * hs..][..hs];

                    let mut scores = vec![0.0f32; si + 1];
                    for (j, s) in scores.iter_mut().enumerate() {
                        let k_row = &k[(b * total + j) * kv_cols + kv_head * hs..][..hs];
                        *s = q_row
                            .iter()
                            .zip(k_row.iter())
                            .map(|(a, b)| a * b)
                            .sum::<f32>()
                            * self.cfg.att_factor;
                    }
                    let max = scores.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
                    let mut sum = 0.0f32;
                    for s in scores.iter_mut() {
                        *s = (*s - max).exp();
                        sum += *s;
                    }

                    let out = &mut attn[(b * total + si) * q_cols + head * hs..][..hs];
                    for (j, &w) in scores.iter().enumerate() {
                        let v_row = &v[(b * total + j) * kv_cols + kv_head * hs..][..hs];
                        for (o, &vv) in out.iter_mut().zip(v_row.iter()) {
                            *o += w / sum * vv;
                        }
                    }
                }
            }
        }

        let proj = naive_matmul(&attn, &self.wo, m, q_cols, h);
        proj.iter()
            .zip(tokens.iter())
            .map(|(p, t)| p + t)
            .collect()
    }
}

struct Harness<A: Element = f32> {
    ctx: DecoderContext<A>,
    attn: Attention<A>,
    key: KvCache<A>,
    value: KvCache<A>,
}

fn harness<A: Element>(model: &TestModel, batch: usize) -> Harness<A> {
    let ctx = DecoderContext::<A>::new(model.cfg.clone());
    let mut attn = Attention::new(0, &ctx);
    attn.set_weights(
        &ctx,
        RawWeight::F32(&model.wq),
        RawWeight::F32(&model.wk),
        RawWeight::F32(&model.wv),
        RawWeight::F32(&model.wo),
        None,
        None,
        None,
        None,
        &model.gamma,
        None,
        false,
    );

    let (start_kv, end_kv) = ctx.kv_head_range();
    let key = KvCache::new(
        model.cfg.max_seq_length,
        batch,
        end_kv - start_kv,
        model.cfg.att_head_size,
    );
    let value = key.clone();

    Harness {
        ctx,
        attn,
        key,
        value,
    }
}

/// `[batch, s, past + s]` additive causal mask.
fn causal_mask(batch: usize, s: usize, past: usize) -> Vec<f32> {
    let t = past + s;
    let mut mask = vec![0.0f32; batch * s * t];
    for b in 0..batch {
        for i in 0..s {
            for j in past + i + 1..t {
                mask[(b * s + i) * t + j] = MASK_VALUE;
            }
        }
    }
    mask
}

fn run<A: Element>(h: &mut Harness<A>, input: &[A], batch: usize, s: usize, past: usize) -> Vec<A> {
    let hidden = h.ctx.config.hidden_size;
    let m = batch * s;
    h.ctx.prepare(batch, s, past);

    let mut inp = input.to_vec();
    let mut im = vec![A::default(); m * hidden];
    let mut out = vec![A::default(); m * hidden];
    let mask = causal_mask(batch, s, past);

    h.attn
        .forward(
            &mut h.ctx,
            &mut inp,
            &mut im,
            &mut out,
            Some(&mask),
            &mut h.key,
            &mut h.value,
            past,
            past == 0,
            true,
            None,
        )
        .unwrap();
    out
}

fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

#[test]
fn prefill_selects_slim_and_matches_reference() {
    // hidden=128, 8 Q heads, 8 KV heads, head size 16, batch=2, S=64.
    let cfg = base_config(128, 8, 8, 128);
    let model = test_model(cfg, 7);
    let batch = 2;
    let s = 64;
    let mut rng = StdRng::seed_from_u64(11);
    let input = rand_vec(&mut rng, batch * s * 128);

    let mut h = harness::<f32>(&model, batch);
    h.ctx.prepare(batch, s, 0);
    assert_eq!(h.attn.select_kernel(&h.ctx, 0), KernelKind::Slim);

    let out = run(&mut h, &input, batch, s, 0);
    let want = model.reference(&input, batch, s);
    let diff = max_abs_diff(&out, &want);
    assert!(diff < 1e-2, "slim prefill drifted from reference: {diff}");
}

#[test]
fn flash_selects_and_matches_slim() {
    let mut cfg = base_config(128, 8, 8, 128);
    cfg.flash_thresh = 16; // force the tiled kernel at S=64
    let model = test_model(cfg, 13);
    let batch = 2;
    let s = 64;
    let mut rng = StdRng::seed_from_u64(17);
    let input = rand_vec(&mut rng, batch * s * 128);

    let mut h = harness::<f32>(&model, batch);
    h.ctx.prepare(batch, s, 0);
    assert_eq!(h.attn.select_kernel(&h.ctx, 0), KernelKind::Flash);

    let out = run(&mut h, &input, batch, s, 0);

    // The stage-leading layer cached the M-block size during prefill.
    assert!(h.ctx.mblock_size > 0, "mblock must be cached at prefill");

    let want = model.reference(&input, batch, s);
    let diff = max_abs_diff(&out, &want);
    assert!(diff < 1e-2, "flash prefill drifted from reference: {diff}");
}

#[test]
fn decode_matches_full_reference() {
    let cfg = base_config(128, 8, 8, 64);
    let model = test_model(cfg, 23);
    let batch = 1;
    let total = 32;
    let mut rng = StdRng::seed_from_u64(29);
    let tokens = rand_vec(&mut rng, batch * total * 128);

    let mut h = harness::<f32>(&model, batch);
    let prefill = &tokens[..batch * (total - 1) * 128];
    let _ = run(&mut h, prefill, batch, total - 1, 0);

    let last = &tokens[batch * (total - 1) * 128..];
    h.ctx.prepare(batch, 1, total - 1);
    assert_eq!(h.attn.select_kernel(&h.ctx, total - 1), KernelKind::Slim);
    let out = run(&mut h, last, batch, 1, total - 1);

    let want = model.reference(&tokens, batch, total);
    let diff = max_abs_diff(&out, &want[(total - 1) * 128..]);
    assert!(diff < 1e-2, "decode drifted from reference: {diff}");
}

#[test]
fn decode_shards_heads_with_surplus_threads() {
    // batch=1, 8 heads, 64 configured workers: 8 shards per head.
    let mut cfg = base_config(128, 8, 8, 64);
    cfg.num_threads = 64;
    let model = test_model(cfg, 31);
    let batch = 1;
    let total = 32;
    let mut rng = StdRng::seed_from_u64(37);
    let tokens = rand_vec(&mut rng, batch * total * 128);

    let mut h = harness::<f32>(&model, batch);
    let _ = run(&mut h, &tokens[..(total - 1) * 128], batch, total - 1, 0);

    h.ctx.prepare(batch, 1, total - 1);
    assert_eq!(
        h.attn.select_kernel(&h.ctx, total - 1),
        KernelKind::ShardHead
    );
    assert_eq!(splits_for(64, batch, 8), 8);

    let out = run(&mut h, &tokens[(total - 1) * 128..], batch, 1, total - 1);

    let want = model.reference(&tokens, batch, total);
    let diff = max_abs_diff(&out, &want[(total - 1) * 128..]);
    assert!(diff < 1e-2, "sharded decode drifted from reference: {diff}");

    // And it agrees with the unsharded kernel bit-for-bit up to merge order.
    let mut cfg1 = model.cfg.clone();
    cfg1.num_threads = 1;
    let model1 = model.with_cfg(cfg1);
    let mut h1 = harness::<f32>(&model1, batch);
    let _ = run(&mut h1, &tokens[..(total - 1) * 128], batch, total - 1, 0);
    h1.ctx.prepare(batch, 1, total - 1);
    assert_eq!(h1.attn.select_kernel(&h1.ctx, total - 1), KernelKind::Slim);
    let out1 = run(&mut h1, &tokens[(total - 1) * 128..], batch, 1, total - 1);

    let diff = max_abs_diff(&out, &out1);
    assert!(diff < 1e-4, "shard and slim decode disagree: {diff}");
}

#[test]
fn grouped_query_shares_kv_heads() {
    // 16 Q heads over 4 KV heads: the cache holds exactly 4 heads and the
    // kernels read head i/4.
    let cfg = base_config(128, 16, 4, 64);
    let model = test_model(cfg, 41);
    let batch = 1;
    let s = 32;
    let mut rng = StdRng::seed_from_u64(43);
    let input = rand_vec(&mut rng, batch * s * 128);

    let mut h = harness::<f32>(&model, batch);
    assert_eq!(h.key.heads(), 4);

    let out = run(&mut h, &input, batch, s, 0);
    let want = model.reference(&input, batch, s);
    let diff = max_abs_diff(&out, &want);
    assert!(diff < 1e-2, "GQA prefill drifted from reference: {diff}");

    // The cache rows are the projected K values (no rotary in this config).
    let hidden = 128;
    let hs = 8;
    let mut normed = vec![0.0f32; batch * s * hidden];
    rms_norm(
        &mut normed,
        &input,
        &model.gamma,
        batch * s,
        hidden,
        hidden,
        hidden,
        model.cfg.epsilon,
    );
    let k_ref = naive_matmul(&normed, &model.wk, batch * s, hidden, 4 * hs);
    for seq in 0..s {
        for head in 0..4 {
            let cached = h.key.sequence(seq, 0, head);
            let want_row = &k_ref[seq * 4 * hs + head * hs..][..hs];
            let diff = max_abs_diff(cached, want_row);
            assert!(diff < 1e-4, "cached K head {head} row {seq} off by {diff}");
        }
    }
}

#[test]
fn two_rank_split_sums_to_single_rank() {
    let cfg = base_config(128, 8, 8, 64);
    let model = test_model(cfg.clone(), 47);
    let batch = 1;
    let s = 16;
    let mut rng = StdRng::seed_from_u64(53);
    let input = rand_vec(&mut rng, batch * s * 128);

    let single = {
        let mut h = harness::<f32>(&model, batch);
        run(&mut h, &input, batch, s, 0)
    };

    let mut rank_sum = vec![0.0f32; single.len()];
    for rank in 0..2 {
        let mut cfg_r = cfg.clone();
        cfg_r.num_split = 2;
        cfg_r.split_idx = rank;
        let model_r = model.with_cfg(cfg_r);
        let mut h = harness::<f32>(&model_r, batch);

        // Rank 0 owns heads [0, 4), rank 1 owns [4, 8).
        assert_eq!(h.ctx.q_head_range(), (rank * 4, rank * 4 + 4));
        assert_eq!(h.key.heads(), 4);

        let out = run(&mut h, &input, batch, s, 0);
        for (acc, v) in rank_sum.iter_mut().zip(out.iter()) {
            *acc += v;
        }
    }

    // The residual was added exactly once (on rank 0), so the plain sum
    // reproduces the single-rank result.
    let diff = max_abs_diff(&rank_sum, &single);
    assert!(diff < 1e-3, "rank partials do not sum to the full result: {diff}");
}

#[test]
fn causal_masking_ignores_future_tokens() {
    let cfg = base_config(64, 4, 4, 32);
    let model = test_model(cfg, 59);
    let batch = 1;
    let s = 8;
    let split = 5;
    let mut rng = StdRng::seed_from_u64(61);
    let input_a = rand_vec(&mut rng, s * 64);
    let mut input_b = input_a.clone();
    // Perturb everything from position `split` on.
    for v in input_b[split * 64..].iter_mut() {
        *v += 0.37;
    }

    let out_a = {
        let mut h = harness::<f32>(&model, batch);
        run(&mut h, &input_a, batch, s, 0)
    };
    let out_b = {
        let mut h = harness::<f32>(&model, batch);
        run(&mut h, &input_b, batch, s, 0)
    };

    let diff = max_abs_diff(&out_a[..split * 64], &out_b[..split * 64]);
    assert!(
        diff < 1e-6,
        "future-token edits leaked into earlier outputs: {diff}"
    );
    let tail = max_abs_diff(&out_a[split * 64..], &out_b[split * 64..]);
    assert!(tail > 1e-3, "perturbation should change later outputs");
}

#[test]
fn kv_cache_is_kernel_independent() {
    // A decode step must not care whether prefill ran tiled or fused.
    let cfg = base_config(128, 8, 8, 64);
    let model_slim = test_model(cfg.clone(), 67);
    let mut cfg_flash = cfg;
    cfg_flash.flash_thresh = 16;
    let model_flash = model_slim.with_cfg(cfg_flash);

    let batch = 1;
    let total = 25;
    let mut rng = StdRng::seed_from_u64(71);
    let tokens = rand_vec(&mut rng, total * 128);
    let prefill = &tokens[..(total - 1) * 128];
    let last = &tokens[(total - 1) * 128..];

    let mut h_slim = harness::<f32>(&model_slim, batch);
    h_slim.ctx.prepare(batch, total - 1, 0);
    assert_eq!(h_slim.attn.select_kernel(&h_slim.ctx, 0), KernelKind::Slim);
    let _ = run(&mut h_slim, prefill, batch, total - 1, 0);

    let mut h_flash = harness::<f32>(&model_flash, batch);
    h_flash.ctx.prepare(batch, total - 1, 0);
    assert_eq!(h_flash.attn.select_kernel(&h_flash.ctx, 0), KernelKind::Flash);
    let _ = run(&mut h_flash, prefill, batch, total - 1, 0);

    let out_slim = run(&mut h_slim, last, batch, 1, total - 1);
    let out_flash = run(&mut h_flash, last, batch, 1, total - 1);

    let diff = max_abs_diff(&out_slim, &out_flash);
    assert!(diff < 1e-4, "cache differs between prefill kernels: {diff}");
}

#[test]
fn bf16_prefill_takes_the_fused_self_attention_path() {
    let cfg = base_config(64, 4, 4, 32);
    let model = test_model(cfg, 73);
    let batch = 1;
    let s = 16;
    let mut rng = StdRng::seed_from_u64(79);
    let input_f32 = rand_vec(&mut rng, s * 64);
    let input: Vec<bf16> = input_f32.iter().map(|&v| bf16::from_f32(v)).collect();

    let mut h = harness::<bf16>(&model, batch);
    h.ctx.prepare(batch, s, 0);
    assert_eq!(h.attn.select_kernel(&h.ctx, 0), KernelKind::SelfAttnBF16);

    let out = run(&mut h, &input, batch, s, 0);
    let out_f32: Vec<f32> = out.iter().map(|v| v.to_f32()).collect();
    let want = model.reference(&input_f32, batch, s);

    let diff = max_abs_diff(&out_f32, &want);
    assert!(diff < 0.05, "bf16 prefill drifted from f32 reference: {diff}");

    // Decode continues through the fused kernel on the cache it built.
    let mut rng = StdRng::seed_from_u64(83);
    let next_f32 = rand_vec(&mut rng, 64);
    let next: Vec<bf16> = next_f32.iter().map(|&v| bf16::from_f32(v)).collect();
    h.ctx.prepare(batch, 1, s);
    assert_eq!(h.attn.select_kernel(&h.ctx, s), KernelKind::Slim);
    let out = run(&mut h, &next, batch, 1, s);

    let mut tokens = input_f32.clone();
    tokens.extend_from_slice(&next_f32);
    let want = model.reference(&tokens, batch, s + 1);
    let out_f32: Vec<f32> = out.iter().map(|v| v.to_f32()).collect();
    let diff = max_abs_diff(&out_f32, &want[s * 64..]);
    assert!(diff < 0.05, "bf16 decode drifted from f32 reference: {diff}");
}

#[test]
fn default_position_ids_continue_the_sequence() {
    let mut cfg = base_config(64, 4, 4, 32);
    cfg.max_pos_embed = 32;
    let model = test_model(cfg, 89);
    let batch = 1;
    let total = 12;
    let mut rng = StdRng::seed_from_u64(97);
    let tokens = rand_vec(&mut rng, total * 64);

    // Prefill + decode with the defaulted position ids ...
    let mut h = harness::<f32>(&model, batch);
    let _ = run(&mut h, &tokens[..(total - 1) * 64], batch, total - 1, 0);
    let out = run(&mut h, &tokens[(total - 1) * 64..], batch, 1, total - 1);

    // ... must equal the rotary-aware full reference.
    let want = model.reference(&tokens, batch, total);
    let diff = max_abs_diff(&out, &want[(total - 1) * 64..]);
    assert!(diff < 1e-2, "default position ids drifted: {diff}");
}

#[test]
fn explicit_position_ids_match_defaults() {
    let mut cfg = base_config(64, 4, 4, 32);
    cfg.max_pos_embed = 32;
    let model = test_model(cfg, 101);
    let batch = 1;
    let s = 8;
    let mut rng = StdRng::seed_from_u64(103);
    let input = rand_vec(&mut rng, s * 64);

    let defaulted = {
        let mut h = harness::<f32>(&model, batch);
        run(&mut h, &input, batch, s, 0)
    };

    let explicit = {
        let mut h = harness::<f32>(&model, batch);
        h.ctx.prepare(batch, s, 0);
        let mut inp = input.clone();
        let mut im = vec![0.0f32; s * 64];
        let mut out = vec![0.0f32; s * 64];
        let mask = causal_mask(batch, s, 0);
        let ids: Vec<usize> = (0..s).collect();
        h.attn
            .forward(
                &mut h.ctx,
                &mut inp,
                &mut im,
                &mut out,
                Some(&mask),
                &mut h.key,
                &mut h.value,
                0,
                true,
                true,
                Some(&ids),
            )
            .unwrap();
        out
    };

    let diff = max_abs_diff(&defaulted, &explicit);
    assert!(diff < 1e-6, "explicit ids must equal the defaults: {diff}");
}

#[test]
fn bf16_kv_cache_with_f32_activations() {
    // Flash must convert K/V into the cache dtype; decode then reads the
    // reduced-precision history through the generic fused kernel.
    let mut cfg = base_config(64, 4, 4, 64);
    cfg.flash_thresh = 16;
    let model = test_model(cfg, 113);
    let batch = 1;
    let total = 33;
    let mut rng = StdRng::seed_from_u64(127);
    let tokens = rand_vec(&mut rng, total * 64);

    let ctx_new = || DecoderContext::<f32>::new(model.cfg.clone());
    let attn_new = |ctx: &DecoderContext<f32>| {
        let mut attn = Attention::<f32>::new(0, ctx);
        attn.set_weights(
            ctx,
            RawWeight::F32(&model.wq),
            RawWeight::F32(&model.wk),
            RawWeight::F32(&model.wv),
            RawWeight::F32(&model.wo),
            None,
            None,
            None,
            None,
            &model.gamma,
            None,
            false,
        );
        attn
    };

    let run_with_cache = |key: &mut KvCache<bf16>, value: &mut KvCache<bf16>| -> Vec<f32> {
        let mut ctx = ctx_new();
        let attn = attn_new(&ctx);

        let s = total - 1;
        ctx.prepare(batch, s, 0);
        assert_eq!(attn.select_kernel(&ctx, 0), KernelKind::Flash);
        let mut inp = tokens[..s * 64].to_vec();
        let mut im = vec![0.0f32; s * 64];
        let mut out = vec![0.0f32; s * 64];
        let mask = causal_mask(batch, s, 0);
        attn.forward(
            &mut ctx, &mut inp, &mut im, &mut out, Some(&mask), key, value, 0, true, true, None,
        )
        .unwrap();

        ctx.prepare(batch, 1, s);
        let mut inp = tokens[s * 64..].to_vec();
        let mut im = vec![0.0f32; 64];
        let mut out = vec![0.0f32; 64];
        let mask = causal_mask(batch, 1, s);
        attn.forward(
            &mut ctx, &mut inp, &mut im, &mut out, Some(&mask), key, value, s, false, true, None,
        )
        .unwrap();
        out
    };

    let mut key = KvCache::<bf16>::new(64, batch, 4, 16);
    let mut value = key.clone();
    let out = run_with_cache(&mut key, &mut value);

    let want = model.reference(&tokens, batch, total);
    let diff = max_abs_diff(&out, &want[(total - 1) * 64..]);
    assert!(diff < 0.05, "bf16 cache decode drifted from reference: {diff}");
}

#[test]
fn output_bias_lands_on_the_master_rank_only() {
    let cfg = base_config(64, 4, 4, 16);
    let model = test_model(cfg.clone(), 151);
    let batch = 1;
    let s = 4;
    let mut rng = StdRng::seed_from_u64(157);
    let input = rand_vec(&mut rng, s * 64);

    let q_bias: Vec<f32> = (0..64).map(|i| i as f32 * 0.01).collect();
    let kv_bias: Vec<f32> = (0..64).map(|i| 0.3 - i as f32 * 0.005).collect();
    let out_bias: Vec<f32> = (0..64).map(|i| (i % 5) as f32 * 0.1).collect();

    let run_rank = |rank: usize, with_out_bias: bool| -> Vec<f32> {
        let mut cfg_r = cfg.clone();
        cfg_r.num_split = 2;
        cfg_r.split_idx = rank;
        let model_r = model.with_cfg(cfg_r);

        let ctx = DecoderContext::<f32>::new(model_r.cfg.clone());
        let mut attn = Attention::<f32>::new(0, &ctx);
        attn.set_weights(
            &ctx,
            RawWeight::F32(&model_r.wq),
            RawWeight::F32(&model_r.wk),
            RawWeight::F32(&model_r.wv),
            RawWeight::F32(&model_r.wo),
            Some(&q_bias),
            Some(&kv_bias),
            Some(&kv_bias),
            with_out_bias.then_some(out_bias.as_slice()),
            &model_r.gamma,
            None,
            false,
        );
        let (start_kv, end_kv) = ctx.kv_head_range();
        let mut h = Harness {
            ctx,
            attn,
            key: KvCache::new(16, batch, end_kv - start_kv, 16),
            value: KvCache::new(16, batch, end_kv - start_kv, 16),
        };
        run(&mut h, &input, batch, s, 0)
    };

    // Rank 0 carries the bias once per row.
    let with_bias = run_rank(0, true);
    let without = run_rank(0, false);
    for r in 0..s {
        for j in 0..64 {
            let diff = with_bias[r * 64 + j] - without[r * 64 + j];
            assert!(
                (diff - out_bias[j]).abs() < 1e-5,
                "master rank bias off at ({r},{j}): {diff}"
            );
        }
    }

    // Other ranks zero the bias so the all-reduce adds it exactly once.
    let with_bias = run_rank(1, true);
    let without = run_rank(1, false);
    let diff = max_abs_diff(&with_bias, &without);
    assert!(diff < 1e-6, "non-master rank must not add the output bias: {diff}");
}

#[test]
fn residual_scale_blends_the_residual() {
    let cfg = base_config(64, 4, 4, 16);
    let model = test_model(cfg, 131);
    let batch = 1;
    let s = 4;
    let mut rng = StdRng::seed_from_u64(137);
    let input = rand_vec(&mut rng, s * 64);

    let base = {
        let mut h = harness::<f32>(&model, batch);
        run(&mut h, &input, batch, s, 0)
    };

    let scaled = {
        let ctx = DecoderContext::<f32>::new(model.cfg.clone());
        let mut attn = Attention::<f32>::new(0, &ctx).with_residual_scale(0.5);
        attn.set_weights(
            &ctx,
            RawWeight::F32(&model.wq),
            RawWeight::F32(&model.wk),
            RawWeight::F32(&model.wv),
            RawWeight::F32(&model.wo),
            None,
            None,
            None,
            None,
            &model.gamma,
            None,
            false,
        );
        let mut h = Harness {
            ctx,
            attn,
            key: KvCache::new(16, batch, 4, 16),
            value: KvCache::new(16, batch, 4, 16),
        };
        run(&mut h, &input, batch, s, 0)
    };

    // Same attention output, half the residual.
    for i in 0..scaled.len() {
        let want = base[i] - 0.5 * input[i];
        assert!(
            (scaled[i] - want).abs() < 1e-5,
            "residual scale off at {i}: {} vs {want}",
            scaled[i]
        );
    }
}

#[test]
fn norm_output_can_serve_as_residual() {
    let cfg = base_config(64, 4, 4, 16);
    let model = test_model(cfg, 139);
    let batch = 1;
    let s = 4;
    let mut rng = StdRng::seed_from_u64(149);
    let input = rand_vec(&mut rng, s * 64);

    let base = {
        let mut h = harness::<f32>(&model, batch);
        run(&mut h, &input, batch, s, 0)
    };

    let post_norm_resid = {
        let ctx = DecoderContext::<f32>::new(model.cfg.clone());
        let mut attn = Attention::<f32>::new(0, &ctx).with_input_as_resid(false);
        attn.set_weights(
            &ctx,
            RawWeight::F32(&model.wq),
            RawWeight::F32(&model.wk),
            RawWeight::F32(&model.wv),
            RawWeight::F32(&model.wo),
            None,
            None,
            None,
            None,
            &model.gamma,
            None,
            false,
        );
        let mut h = Harness {
            ctx,
            attn,
            key: KvCache::new(16, batch, 4, 16),
            value: KvCache::new(16, batch, 4, 16),
        };
        run(&mut h, &input, batch, s, 0)
    };

    // The difference between the two wirings is exactly (norm(x) - x).
    let mut normed = vec![0.0f32; s * 64];
    rms_norm(&mut normed, &input, &model.gamma, s, 64, 64, 64, model.cfg.epsilon);
    for i in 0..base.len() {
        let want = base[i] - input[i] + normed[i];
        assert!(
            (post_norm_resid[i] - want).abs() < 1e-4,
            "norm-residual wiring off at {i}: {} vs {want}",
            post_norm_resid[i]
        );
    }
}

#[test]
fn post_norm_normalizes_the_output_rows() {
    let cfg = base_config(64, 4, 4, 16);
    let mut model = test_model(cfg, 163);
    // Unit gamma makes every post-normed row land at RMS 1.
    model.gamma = vec![1.0; 64];
    let batch = 1;
    let s = 4;
    let mut rng = StdRng::seed_from_u64(167);
    let input = rand_vec(&mut rng, s * 64);

    let mut h = harness::<f32>(&model, batch);
    h.ctx.prepare(batch, s, 0);
    let mut inp = input.clone();
    let mut im = vec![0.0f32; s * 64];
    let mut out = vec![0.0f32; s * 64];
    let mask = causal_mask(batch, s, 0);
    h.attn
        .forward(
            &mut h.ctx,
            &mut inp,
            &mut im,
            &mut out,
            Some(&mask),
            &mut h.key,
            &mut h.value,
            0,
            true,
            false, // post-norm wiring
            None,
        )
        .unwrap();

    for r in 0..s {
        let row = &out[r * 64..(r + 1) * 64];
        let rms = (row.iter().map(|v| v * v).sum::<f32>() / 64.0).sqrt();
        assert!(
            (rms - 1.0).abs() < 1e-3,
            "post-norm row {r} has RMS {rms}, expected 1"
        );
    }
}

#[test]
fn int8_weights_stay_close_to_f32() {
    let cfg = base_config(64, 4, 4, 32);
    let model = test_model(cfg.clone(), 107);
    let batch = 1;
    let s = 16;
    let mut rng = StdRng::seed_from_u64(109);
    let input = rand_vec(&mut rng, s * 64);

    let base = {
        let mut h = harness::<f32>(&model, batch);
        run(&mut h, &input, batch, s, 0)
    };

    let mut cfg_q = cfg;
    cfg_q.weight_dtype = crate::dtype::WeightDType::Int8;
    let model_q = model.with_cfg(cfg_q);
    let quantized = {
        let mut h = harness::<f32>(&model_q, batch);
        run(&mut h, &input, batch, s, 0)
    };

    let diff = max_abs_diff(&base, &quantized);
    assert!(diff < 0.05, "int8 attention drifted too far: {diff}");
}
