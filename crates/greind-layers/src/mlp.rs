//! LLaMA-style gated MLP: RMSNorm → SiLU(gate) ⊙ up → down (+ residual).
//!
//! Two forward paths produce identical results:
//! - separate gate and up GEMMs, with SiLU fused into the gate projection and
//!   the element-wise multiply fused into the up projection;
//! - one GEMM against the concatenated gate⊕up weight, followed by a
//!   `silu_sum` pass that combines the two column halves.
//!
//! The concatenated path needs its own `[M, cols]` scratch because the down
//! GEMM consumes a tile whose stride equals its width.
//!
//! Tensor-parallel ranks each own a vertical slice of gate/up and the
//! matching horizontal slice of down; only the master rank folds the residual
//! into its output, so summing all rank outputs yields exactly one residual
//! contribution.

use std::marker::PhantomData;

use crate::activations::{silu, Activation};
use crate::context::{task_range, DecoderContext};
use crate::dtype::Element;
use crate::norm::rms_norm;
use crate::weights::{cat_columns, RawWeight, WeightBundle, WeightSplit};

const RMS_EPS: f32 = 1e-6;

#[derive(Debug, Default)]
pub struct Mlp<A: Element = f32> {
    gate: Option<WeightBundle>,
    up: Option<WeightBundle>,
    cat: Option<WeightBundle>,
    down: Option<WeightBundle>,
    norm_gamma: Vec<f32>,
    _marker: PhantomData<A>,
}

impl<A: Element> Mlp<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Converts, splits, and packs the MLP weights for this rank.
    ///
    /// `gate_w` and `up_w` are `[hidden, intermediate]` (or transposed when
    /// `trans`), split vertically on the intermediate dimension; `down_w` is
    /// `[intermediate, hidden]`, split horizontally on the same range. With
    /// the concatenation hint enabled, gate and up are fused column-wise into
    /// a single packed matrix so the forward pass issues one wider GEMM.
    pub fn set_weights(
        &mut self,
        ctx: &DecoderContext<A>,
        gate_w: RawWeight,
        up_w: RawWeight,
        down_w: RawWeight,
        norm_gamma: &[f32],
        trans: bool,
    ) {
        assert!(
            ctx.config.act_type == Activation::SiLU,
            "unsupported activation {:?} for the gated MLP",
            ctx.config.act_type
        );

        let hidden = ctx.config.hidden_size;
        let im_size = ctx.config.intermediate_size;
        let dtype = ctx.config.weight_dtype;
        let (im_start, im_end) = task_range(im_size, ctx.config.num_split, ctx.config.split_idx);
        let im_cols = im_end - im_start;

        let split = WeightSplit::Columns {
            offset: im_start,
            count: im_cols,
        };
        let gate_conv = ctx.mm.convert_weight(trans, hidden, im_size, gate_w, split, dtype);
        let up_conv = ctx.mm.convert_weight(trans, hidden, im_size, up_w, split, dtype);

        if ctx.config.cat_mlp {
            let cat = cat_columns(&gate_conv, &up_conv);
            self.cat = Some(ctx.mm.pack_weight(cat));
            self.gate = None;
            self.up = None;
        } else {
            self.gate = Some(ctx.mm.pack_weight(gate_conv));
            self.up = Some(ctx.mm.pack_weight(up_conv));
            self.cat = None;
        }

        self.down = Some(ctx.mm.pack_weight(ctx.mm.convert_weight(
            trans,
            im_size,
            hidden,
            down_w,
            WeightSplit::Rows {
                offset: im_start,
                count: im_cols,
            },
            dtype,
        )));

        self.norm_gamma = norm_gamma.to_vec();
    }

    /// Runs the MLP over `[M, hidden]` tiles with explicit leading
    /// dimensions. On the master rank the residual (the raw input) is fused
    /// into the down projection; other ranks emit partial sums for the
    /// caller's all-reduce.
    pub fn forward(
        &self,
        ctx: &mut DecoderContext<A>,
        input: &[A],
        output: &mut [A],
        i_stride: usize,
        o_stride: usize,
        do_ln_before: bool,
    ) {
        let m = ctx.batch_size * ctx.input_seq_len;
        let hidden = ctx.config.hidden_size;
        let down = self.down.as_ref().expect("set_weights must run before forward");
        let im_cols = down.in_features();
        let mm = ctx.mm;

        if do_ln_before {
            rms_norm(
                &mut ctx.norm_buf,
                input,
                &self.norm_gamma,
                m,
                hidden,
                i_stride,
                hidden,
                RMS_EPS,
            );
        }

        let (src, src_stride): (&[A], usize) = if do_ln_before {
            (&ctx.norm_buf, hidden)
        } else {
            (input, i_stride)
        };

        match (&self.cat, &self.gate, &self.up) {
            (None, Some(gate), Some(up)) => {
                // Gate with fused SiLU, then up multiplied into it.
                mm.compute_silu(m, im_cols, hidden, 1.0, src, src_stride, gate, &mut ctx.im_out, im_cols);
                mm.compute_resmul(m, im_cols, hidden, 1.0, src, src_stride, up, &mut ctx.im_out, im_cols);

                self.down_proj(ctx, m, hidden, im_cols, None, input, i_stride, output, o_stride);
            }
            (Some(cat), None, None) => {
                let n = cat.out_features();
                debug_assert_eq!(n, 2 * im_cols);
                mm.compute(m, n, hidden, 1.0, src, src_stride, cat, &mut ctx.im_out, n);

                let mut silu_buf = A::take_scratch(&mut ctx.pool, "mlp_silu", m * im_cols);
                silu_sum(&ctx.im_out, &mut silu_buf, m, im_cols, n);

                self.down_proj(ctx, m, hidden, im_cols, Some(&silu_buf), input, i_stride, output, o_stride);
                A::restore_scratch(&mut ctx.pool, "mlp_silu", silu_buf);
            }
            _ => panic!("mlp weights not initialized"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn down_proj(
        &self,
        ctx: &DecoderContext<A>,
        m: usize,
        hidden: usize,
        im_cols: usize,
        src_override: Option<&[A]>,
        residual: &[A],
        ldr: usize,
        output: &mut [A],
        o_stride: usize,
    ) {
        let down = self.down.as_ref().unwrap();
        let mm = ctx.mm;
        let src = src_override.unwrap_or(&ctx.im_out);

        if ctx.is_master() {
            mm.compute_residential(
                m, hidden, im_cols, 1.0, src, im_cols, down, output, o_stride, None, residual, ldr,
            );
        } else {
            mm.compute(m, hidden, im_cols, 1.0, src, im_cols, down, output, o_stride);
        }
    }
}

/// Combines the two halves of the concatenated gate⊕up GEMM output:
/// `out[j] = silu(fused[j]) * fused[j + cols]`.
fn silu_sum<A: Element>(fused: &[A], out: &mut [A], m: usize, cols: usize, fused_stride: usize) {
    for i in 0..m {
        let row = &fused[i * fused_stride..i * fused_stride + 2 * cols];
        let out_row = &mut out[i * cols..(i + 1) * cols];
        for j in 0..cols {
            let g = row[j].to_f32();
            let u = row[j + cols].to_f32();
            out_row[j] = A::from_f32(silu(g) * u);
        }
    }
}
