//! RMS and layer normalization.

use crate::dtype::Element;

/// Normalization applied around the attention block.
///
/// The attention layer is generic over this so model families can pick RMS or
/// classic layer norm without touching the driver.
pub trait Norm: Default + Send + Sync {
    /// Installs the affine parameters. `beta` may be `None` for RMS norm.
    fn set_weight(&mut self, gamma: &[f32], beta: Option<&[f32]>);

    /// Row-wise normalization of an `[rows, cols]` tile with explicit
    /// leading dimensions.
    fn forward<A: Element>(
        &self,
        input: &[A],
        output: &mut [A],
        rows: usize,
        cols: usize,
        in_stride: usize,
        out_stride: usize,
        epsilon: f32,
    );
}

/// Root-mean-square normalization (no re-centering, no beta).
#[derive(Debug, Default, Clone)]
pub struct RmsNorm {
    gamma: Vec<f32>,
}

impl Norm for RmsNorm {
    fn set_weight(&mut self, gamma: &[f32], _beta: Option<&[f32]>) {
        self.gamma = gamma.to_vec();
    }

    fn forward<A: Element>(
        &self,
        input: &[A],
        output: &mut [A],
        rows: usize,
        cols: usize,
        in_stride: usize,
        out_stride: usize,
        epsilon: f32,
    ) {
        assert_eq!(self.gamma.len(), cols, "rms norm weight not set for width {cols}");
        for r in 0..rows {
            let inp = &input[r * in_stride..r * in_stride + cols];
            let out = &mut output[r * out_stride..r * out_stride + cols];
            rms_norm_row(out, inp, &self.gamma, epsilon);
        }
    }
}

/// Classic layer normalization with mean subtraction and beta.
#[derive(Debug, Default, Clone)]
pub struct LayerNorm {
    gamma: Vec<f32>,
    beta: Vec<f32>,
}

impl Norm for LayerNorm {
    fn set_weight(&mut self, gamma: &[f32], beta: Option<&[f32]>) {
        self.gamma = gamma.to_vec();
        self.beta = match beta {
            Some(b) => b.to_vec(),
            None => vec![0.0; gamma.len()],
        };
    }

    fn forward<A: Element>(
        &self,
        input: &[A],
        output: &mut [A],
        rows: usize,
        cols: usize,
        in_stride: usize,
        out_stride: usize,
        epsilon: f32,
    ) {
        assert_eq!(self.gamma.len(), cols, "layer norm weight not set for width {cols}");
        for r in 0..rows {
            let inp = &input[r * in_stride..r * in_stride + cols];
            let out = &mut output[r * out_stride..r * out_stride + cols];

            let mut mean = 0.0f32;
            for v in inp {
                mean += v.to_f32();
            }
            mean /= cols as f32;

            let mut var = 0.0f32;
            for v in inp {
                let d = v.to_f32() - mean;
                var += d * d;
            }
            var /= cols as f32;

            let inv = 1.0 / (var + epsilon).sqrt();
            for j in 0..cols {
                let v = (inp[j].to_f32() - mean) * inv;
                out[j] = A::from_f32(v * self.gamma[j] + self.beta[j]);
            }
        }
    }
}

/// One row of RMS normalization.
#[inline]
fn rms_norm_row<A: Element>(out: &mut [A], inp: &[A], gamma: &[f32], epsilon: f32) {
    let cols = inp.len();
    let mut sum_sq = 0.0f32;
    for v in inp {
        let f = v.to_f32();
        sum_sq += f * f;
    }
    let scale = 1.0 / (sum_sq / cols as f32 + epsilon).sqrt();
    for j in 0..cols {
        out[j] = A::from_f32(inp[j].to_f32() * scale * gamma[j]);
    }
}

/// Standalone strided RMS norm, the form the MLP calls with ε = 1e-6.
#[allow(clippy::too_many_arguments)]
pub fn rms_norm<A: Element>(
    output: &mut [A],
    input: &[A],
    gamma: &[f32],
    rows: usize,
    cols: usize,
    in_stride: usize,
    out_stride: usize,
    epsilon: f32,
) {
    for r in 0..rows {
        let inp = &input[r * in_stride..r * in_stride + cols];
        let out = &mut output[r * out_stride..r * out_stride + cols];
        rms_norm_row(out, inp, gamma, epsilon);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn rms_norm_known_values() {
        let gamma = [1.0f32, 1.0, 1.0];
        let input = [3.0f32, 4.0, 0.0];
        let mut out = [0.0f32; 3];
        rms_norm(&mut out, &input, &gamma, 1, 3, 3, 3, 1e-6);

        let rms = ((9.0 + 16.0) / 3.0f32).sqrt();
        assert_abs_diff_eq!(out[0], 3.0 / rms, epsilon = 1e-4);
        assert_abs_diff_eq!(out[1], 4.0 / rms, epsilon = 1e-4);
        assert_abs_diff_eq!(out[2], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn rms_norm_applies_gamma() {
        let gamma = [2.0f32, 0.5, 1.5];
        let input = [3.0f32, 4.0, 0.0];
        let mut out = [0.0f32; 3];
        rms_norm(&mut out, &input, &gamma, 1, 3, 3, 3, 1e-6);

        let rms = ((9.0 + 16.0) / 3.0f32).sqrt();
        assert_abs_diff_eq!(out[0], 3.0 / rms * 2.0, epsilon = 1e-4);
        assert_abs_diff_eq!(out[1], 4.0 / rms * 0.5, epsilon = 1e-4);
    }

    #[test]
    fn strided_rows_leave_padding_alone() {
        let gamma = [1.0f32, 1.0];
        let input = [1.0f32, 2.0, 99.0, 3.0, 4.0, 99.0];
        let mut out = [7.0f32; 6];
        rms_norm(&mut out, &input, &gamma, 2, 2, 3, 3, 1e-6);
        assert_eq!(out[2], 7.0);
        assert!(out[0] != 7.0 && out[4] != 7.0);
    }

    #[test]
    fn layer_norm_centers_rows() {
        let mut ln = LayerNorm::default();
        ln.set_weight(&[1.0, 1.0, 1.0, 1.0], None);
        let input = [1.0f32, 2.0, 3.0, 4.0];
        let mut out = [0.0f32; 4];
        ln.forward(&input, &mut out, 1, 4, 4, 4, 1e-5);

        let mean: f32 = out.iter().sum::<f32>() / 4.0;
        assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-5);
        assert!(out[3] > out[0]);
    }

    #[test]
    fn trait_object_free_dispatch() {
        let mut rms = RmsNorm::default();
        rms.set_weight(&[1.0; 4], None);
        let input = [0.5f32, -0.5, 1.0, -1.0];
        let mut a = [0.0f32; 4];
        let mut b = [0.0f32; 4];
        rms.forward(&input, &mut a, 1, 4, 4, 4, 1e-6);
        rms_norm(&mut b, &input, &[1.0; 4], 1, 4, 4, 4, 1e-6);
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-7);
        }
    }
}
