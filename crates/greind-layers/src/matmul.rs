//! The projection helper ("mm"): GEMM against a packed [`WeightBundle`] with
//! a small family of fused epilogues.
//!
//! All variants compute `C = epilogue(alpha * A @ W^T)` where `A` is
//! `[m, k]` activations (f32 or bf16) and `W` is a packed bundle with one row
//! per output feature. `beta` is part of the interface but the layers always
//! pass 0, so the accumulator starts cold. Parallelism is over output rows.

use rayon::prelude::*;

use crate::activations::silu;
use crate::dtype::{Element, WeightDType, NF4_LEVELS};
use crate::kernels::{dot, dot_f32};
use crate::weights::{self, RawWeight, WeightBundle, WeightData, WeightSplit};

/// Stateless dispatcher for the projection GEMMs.
///
/// Held by the decoder context so the layers share one entry point, mirroring
/// the helper-handle the context carries in the original design.
#[derive(Debug, Default, Clone, Copy)]
pub struct MatmulHelper;

/// Dot product of one activation row against one packed weight row,
/// folding in the per-column quantization metadata.
#[inline]
fn bundle_dot<I: Element>(a_row: &[I], w: &WeightBundle, out: usize, k: usize) -> f32 {
    match &w.weight.data {
        WeightData::F32(d) => dot_f32(a_row, &d[out * k..out * k + k], k),
        WeightData::BF16(d) => dot(a_row, &d[out * k..out * k + k], k),
        WeightData::F16(d) => {
            let row = &d[out * k..out * k + k];
            let mut acc = 0.0f32;
            for i in 0..k {
                acc += a_row[i].to_f32() * row[i].to_f32();
            }
            acc
        }
        WeightData::Int8(d) => {
            let row = &d[out * k..out * k + k];
            let mut acc_q = 0.0f32;
            let mut acc_a = 0.0f32;
            for i in 0..k {
                let a = a_row[i].to_f32();
                acc_q += a * row[i] as f32;
                acc_a += a;
            }
            w.scale[out] * acc_q + w.zero[out] * acc_a
        }
        WeightData::UInt4x2(d) => {
            let row = &d[out * (k / 2)..(out + 1) * (k / 2)];
            let mut acc_q = 0.0f32;
            let mut acc_a = 0.0f32;
            for (pair, &byte) in row.iter().enumerate() {
                let a0 = a_row[pair * 2].to_f32();
                let a1 = a_row[pair * 2 + 1].to_f32();
                acc_q += a0 * ((byte & 0x0F) as f32 - 8.0);
                acc_q += a1 * ((byte >> 4) as f32 - 8.0);
                acc_a += a0 + a1;
            }
            w.scale[out] * acc_q + w.zero[out] * acc_a
        }
        WeightData::NF4x2(d) => {
            let row = &d[out * (k / 2)..(out + 1) * (k / 2)];
            let mut acc_q = 0.0f32;
            let mut acc_a = 0.0f32;
            for (pair, &byte) in row.iter().enumerate() {
                let a0 = a_row[pair * 2].to_f32();
                let a1 = a_row[pair * 2 + 1].to_f32();
                acc_q += a0 * NF4_LEVELS[(byte & 0x0F) as usize];
                acc_q += a1 * NF4_LEVELS[(byte >> 4) as usize];
                acc_a += a0 + a1;
            }
            w.scale[out] * acc_q + w.zero[out] * acc_a
        }
    }
}

/// Shared GEMM core. The epilogue receives `(row, col, acc, previous C)` and
/// returns the value to store.
#[allow(clippy::too_many_arguments)]
fn gemm<I, O, E>(
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[I],
    lda: usize,
    w: &WeightBundle,
    c: &mut [O],
    ldc: usize,
    epilogue: E,
) where
    I: Element,
    O: Element,
    E: Fn(usize, usize, f32, f32) -> f32 + Sync,
{
    assert_eq!(w.out_features(), n, "weight bundle has wrong output width");
    assert_eq!(w.in_features(), k, "weight bundle has wrong input width");
    assert!(a.len() >= (m - 1) * lda + k);
    assert!(c.len() >= (m - 1) * ldc + n);

    c.par_chunks_mut(ldc)
        .take(m)
        .enumerate()
        .for_each(|(i, c_row)| {
            let a_row = &a[i * lda..i * lda + k];
            for j in 0..n {
                let acc = alpha * bundle_dot(a_row, w, j, k);
                let prev = c_row[j].to_f32();
                c_row[j] = O::from_f32(epilogue(i, j, acc, prev));
            }
        });
}

#[allow(clippy::too_many_arguments)]
impl MatmulHelper {
    /// Plain projection: `C = alpha * A @ W^T`.
    pub fn compute<I: Element, O: Element>(
        &self,
        m: usize,
        n: usize,
        k: usize,
        alpha: f32,
        a: &[I],
        lda: usize,
        w: &WeightBundle,
        c: &mut [O],
        ldc: usize,
    ) {
        gemm(m, n, k, alpha, a, lda, w, c, ldc, |_, _, acc, _| acc);
    }

    /// Projection with bias: `C = alpha * A @ W^T + bias`.
    pub fn compute_bias<I: Element, O: Element>(
        &self,
        m: usize,
        n: usize,
        k: usize,
        alpha: f32,
        a: &[I],
        lda: usize,
        w: &WeightBundle,
        c: &mut [O],
        ldc: usize,
        bias: &[f32],
    ) {
        gemm(m, n, k, alpha, a, lda, w, c, ldc, |_, j, acc, _| {
            acc + bias[j]
        });
    }

    /// Projection with fused SiLU: `C = silu(alpha * A @ W^T)`.
    pub fn compute_silu<I: Element, O: Element>(
        &self,
        m: usize,
        n: usize,
        k: usize,
        alpha: f32,
        a: &[I],
        lda: usize,
        w: &WeightBundle,
        c: &mut [O],
        ldc: usize,
    ) {
        gemm(m, n, k, alpha, a, lda, w, c, ldc, |_, _, acc, _| silu(acc));
    }

    /// Projection multiplied into the existing output:
    /// `C = C ⊙ (alpha * A @ W^T)`.
    pub fn compute_resmul<I: Element, O: Element>(
        &self,
        m: usize,
        n: usize,
        k: usize,
        alpha: f32,
        a: &[I],
        lda: usize,
        w: &WeightBundle,
        c: &mut [O],
        ldc: usize,
    ) {
        gemm(m, n, k, alpha, a, lda, w, c, ldc, |_, _, acc, prev| {
            prev * acc
        });
    }

    /// Projection with residual add: `C = alpha * A @ W^T + R [+ bias]`.
    pub fn compute_residential<I: Element, O: Element, R: Element>(
        &self,
        m: usize,
        n: usize,
        k: usize,
        alpha: f32,
        a: &[I],
        lda: usize,
        w: &WeightBundle,
        c: &mut [O],
        ldc: usize,
        bias: Option<&[f32]>,
        r: &[R],
        ldr: usize,
    ) {
        assert!(r.len() >= (m - 1) * ldr + n);
        gemm(m, n, k, alpha, a, lda, w, c, ldc, |i, j, acc, _| {
            let b = bias.map_or(0.0, |b| b[j]);
            acc + b + r[i * ldr + j].to_f32()
        });
    }

    /// Projection with scaled residual add:
    /// `C = alpha * A @ W^T + gamma * R [+ bias]`.
    pub fn compute_resext<I: Element, O: Element, R: Element>(
        &self,
        m: usize,
        n: usize,
        k: usize,
        alpha: f32,
        a: &[I],
        lda: usize,
        w: &WeightBundle,
        c: &mut [O],
        ldc: usize,
        bias: Option<&[f32]>,
        gamma: f32,
        r: &[R],
        ldr: usize,
    ) {
        assert!(r.len() >= (m - 1) * ldr + n);
        gemm(m, n, k, alpha, a, lda, w, c, ldc, |i, j, acc, _| {
            let b = bias.map_or(0.0, |b| b[j]);
            acc + b + gamma * r[i * ldr + j].to_f32()
        });
    }

    /// Converts a (slice of a) raw weight matrix into tagged storage with
    /// per-column scale/zero/sum metadata. See [`weights::convert_weight`].
    pub fn convert_weight(
        &self,
        trans: bool,
        k: usize,
        n: usize,
        raw: RawWeight,
        split: WeightSplit,
        dtype: WeightDType,
    ) -> WeightBundle {
        weights::convert_weight(trans, k, n, raw, split, dtype)
    }

    /// Packs a converted bundle into the kernel layout. See
    /// [`weights::pack_weight`].
    pub fn pack_weight(&self, converted: WeightBundle) -> WeightBundle {
        weights::pack_weight(converted)
    }
}
