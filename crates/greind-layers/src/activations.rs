//! Activation functions and the attention softmax.

/// Supported MLP activation functions.
///
/// The LLaMA-style MLP only accepts [`Activation::SiLU`]; anything else is a
/// configuration error at weight-loading time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    SiLU,
    Gelu,
    Relu,
}

/// SiLU (swish) activation: `x / (1 + exp(-x))`.
#[inline(always)]
pub fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// In-place softmax of one attention score row.
///
/// Fuses the attention scale and the additive mask lookup:
/// `x_j = score_j * scale + mask_j`, then the usual max-subtracted softmax.
/// `mask` may be `None` for unmasked rows.
pub fn softmax_row(score: &mut [f32], mask: Option<&[f32]>, scale: f32) {
    let mut max = f32::NEG_INFINITY;
    match mask {
        Some(m) => {
            debug_assert!(m.len() >= score.len());
            for (s, &mv) in score.iter_mut().zip(m.iter()) {
                *s = *s * scale + mv;
                if *s > max {
                    max = *s;
                }
            }
        }
        None => {
            for s in score.iter_mut() {
                *s *= scale;
                if *s > max {
                    max = *s;
                }
            }
        }
    }

    let mut sum = 0.0f32;
    for s in score.iter_mut() {
        *s = (*s - max).exp();
        sum += *s;
    }

    let inv = 1.0 / sum;
    for s in score.iter_mut() {
        *s *= inv;
    }
}

/// Softmax of one score shard, keeping the normalization statistics.
///
/// Applies the same scale+mask fusion as [`softmax_row`], writes the
/// *unnormalized* `exp(x_j - max)` values back into `score`, and returns
/// `(max, sum)` so that shards can later be merged with the log-sum-exp
/// identity: partial softmaxes over a column partition combine into the exact
/// global softmax via `exp(shard_max - global_max)` revise factors.
pub fn softmax_with_stats(score: &mut [f32], mask: Option<&[f32]>, scale: f32) -> (f32, f32) {
    let mut max = f32::NEG_INFINITY;
    match mask {
        Some(m) => {
            debug_assert!(m.len() >= score.len());
            for (s, &mv) in score.iter_mut().zip(m.iter()) {
                *s = *s * scale + mv;
                if *s > max {
                    max = *s;
                }
            }
        }
        None => {
            for s in score.iter_mut() {
                *s *= scale;
                if *s > max {
                    max = *s;
                }
            }
        }
    }

    let mut sum = 0.0f32;
    for s in score.iter_mut() {
        *s = (*s - max).exp();
        sum += *s;
    }

    (max, sum)
}
