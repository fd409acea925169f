//! Rotary position embeddings applied in place to the fused QKV buffer.

use crate::dtype::Element;

/// Shape descriptor for one rotary application, mirroring the post-op
/// contract: `{batch, seq_len, q_heads, head_size, kv_heads, max_seq_len,
/// past_seq_len}`.
#[derive(Debug, Clone, Copy)]
pub struct RopeShape {
    pub batch: usize,
    pub seq_len: usize,
    pub q_heads: usize,
    pub head_size: usize,
    pub kv_heads: usize,
    pub max_seq_len: usize,
    pub past_seq_len: usize,
}

/// Rotary embedding with precomputed cos/sin caches.
///
/// Uses the half-split rotation: dimension pairs `(i, i + head_size/2)` are
/// rotated by `pos * theta^(-2i/head_size)`.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// `[max_pos, head_size / 2]`, row-major.
    cos_cache: Vec<f32>,
    sin_cache: Vec<f32>,
    head_size: usize,
    max_pos: usize,
}

impl RotaryEmbedding {
    pub fn new(head_size: usize, max_pos: usize) -> Self {
        Self::with_theta(head_size, max_pos, 10000.0)
    }

    pub fn with_theta(head_size: usize, max_pos: usize, theta: f32) -> Self {
        let half = head_size / 2;
        let inv_freq: Vec<f32> = (0..half)
            .map(|i| 1.0 / theta.powf((2 * i) as f32 / head_size as f32))
            .collect();

        let mut cos_cache = vec![0.0f32; max_pos * half];
        let mut sin_cache = vec![0.0f32; max_pos * half];
        for pos in 0..max_pos {
            for (i, &f) in inv_freq.iter().enumerate() {
                let angle = pos as f32 * f;
                cos_cache[pos * half + i] = angle.cos();
                sin_cache[pos * half + i] = angle.sin();
            }
        }

        Self {
            cos_cache,
            sin_cache,
            head_size,
            max_pos,
        }
    }

    pub fn max_positions(&self) -> usize {
        self.max_pos
    }

    /// Rotates the Q and K column blocks of the fused projection buffer in
    /// place. `q_offset`/`k_offset` locate the blocks within each row;
    /// `position_ids` holds one absolute position per sequence slot.
    #[allow(clippy::too_many_arguments)]
    pub fn forward<A: Element>(
        &self,
        qkv: &mut [A],
        q_offset: usize,
        k_offset: usize,
        q_stride: usize,
        k_stride: usize,
        shape: RopeShape,
        position_ids: &[usize],
    ) {
        self.apply(qkv, q_offset, q_stride, shape.q_heads, shape, position_ids);
        self.apply(qkv, k_offset, k_stride, shape.kv_heads, shape, position_ids);
    }

    /// Rotates one block of `heads` heads starting at `col_offset` in every
    /// token row.
    pub fn apply<A: Element>(
        &self,
        buf: &mut [A],
        col_offset: usize,
        stride: usize,
        heads: usize,
        shape: RopeShape,
        position_ids: &[usize],
    ) {
        assert!(
            shape.head_size == self.head_size,
            "rope built for head size {}, got {}",
            self.head_size,
            shape.head_size
        );
        assert!(position_ids.len() >= shape.seq_len);
        let half = self.head_size / 2;

        for b in 0..shape.batch {
            for s in 0..shape.seq_len {
                let pos = position_ids[s];
                assert!(pos < self.max_pos, "position {pos} outside rotary cache");
                let cos = &self.cos_cache[pos * half..(pos + 1) * half];
                let sin = &self.sin_cache[pos * half..(pos + 1) * half];
                let row = b * shape.seq_len + s;

                for h in 0..heads {
                    let off = row * stride + col_offset + h * self.head_size;
                    rotate_half(&mut buf[off..off + self.head_size], cos, sin);
                }
            }
        }
    }
}

#[inline]
fn rotate_half<A: Element>(head: &mut [A], cos: &[f32], sin: &[f32]) {
    let half = head.len() / 2;
    for i in 0..half {
        let x0 = head[i].to_f32();
        let x1 = head[i + half].to_f32();
        head[i] = A::from_f32(x0 * cos[i] - x1 * sin[i]);
        head[i + half] = A::from_f32(x1 * cos[i] + x0 * sin[i]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn shape(batch: usize, seq: usize, qh: usize, kh: usize, hs: usize) -> RopeShape {
        RopeShape {
            batch,
            seq_len: seq,
            q_heads: qh,
            head_size: hs,
            kv_heads: kh,
            max_seq_len: 64,
            past_seq_len: 0,
        }
    }

    #[test]
    fn position_zero_is_identity() {
        let rope = RotaryEmbedding::new(8, 16);
        let mut q: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let orig = q.clone();

        rope.apply(&mut q, 0, 8, 1, shape(1, 1, 1, 1, 8), &[0]);
        for (a, b) in q.iter().zip(orig.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn rotation_preserves_norm() {
        let rope = RotaryEmbedding::new(8, 64);
        let mut q: Vec<f32> = (0..8).map(|i| (i as f32 * 0.7).sin()).collect();
        let norm_before: f32 = q.iter().map(|v| v * v).sum();

        rope.apply(&mut q, 0, 8, 1, shape(1, 1, 1, 1, 8), &[13]);
        let norm_after: f32 = q.iter().map(|v| v * v).sum();
        assert_abs_diff_eq!(norm_before, norm_after, epsilon = 1e-4);
    }

    #[test]
    fn relative_rotation_is_position_difference() {
        // <rope(q, p1), rope(k, p2)> depends only on p1 - p2 for a single
        // frequency pair; check with head_size 2.
        let rope = RotaryEmbedding::new(2, 64);
        let dot_at = |p1: usize, p2: usize| {
            let mut q = vec![1.0f32, 0.0];
            let mut k = vec![0.6f32, 0.8];
            rope.apply(&mut q, 0, 2, 1, shape(1, 1, 1, 1, 2), &[p1]);
            rope.apply(&mut k, 0, 2, 1, shape(1, 1, 1, 1, 2), &[p2]);
            q[0] * k[0] + q[1] * k[1]
        };

        assert_abs_diff_eq!(dot_at(5, 3), dot_at(12, 10), epsilon = 1e-5);
        assert_abs_diff_eq!(dot_at(7, 7), dot_at(0, 0), epsilon = 1e-5);
    }

    #[test]
    fn fused_buffer_rotates_q_and_k_blocks_only() {
        // Layout per row: 2 Q heads (8 cols), 1 K head (4 cols), 1 V head
        // (4 cols). V must stay untouched.
        let rope = RotaryEmbedding::new(4, 16);
        let stride = 16;
        let mut qkv: Vec<f32> = (0..stride).map(|i| i as f32 * 0.1).collect();
        let v_before = qkv[12..16].to_vec();
        let k_before = qkv[8..12].to_vec();

        rope.forward(&mut qkv, 0, 8, stride, stride, shape(1, 1, 2, 1, 4), &[3]);

        assert_eq!(&qkv[12..16], v_before.as_slice(), "V block must not rotate");
        assert_ne!(&qkv[8..12], k_before.as_slice(), "K block must rotate");
    }

    #[test]
    fn fused_q_equals_standalone_rotation() {
        let rope = RotaryEmbedding::new(4, 16);
        let stride = 12;
        let mut fused: Vec<f32> = (0..2 * stride).map(|i| (i as f32 * 0.3).cos()).collect();
        let mut q_alone: Vec<f32> = (0..2 * 4)
            .map(|r| fused[(r / 4) * stride + r % 4])
            .collect();

        rope.forward(&mut fused, 0, 4, stride, stride, shape(1, 2, 1, 1, 4), &[5, 6]);
        rope.apply(&mut q_alone, 0, 4, 1, shape(1, 2, 1, 1, 4), &[5, 6]);

        for r in 0..2 {
            for c in 0..4 {
                assert_abs_diff_eq!(fused[r * stride + c], q_alone[r * 4 + c], epsilon = 1e-6);
            }
        }
    }
}
