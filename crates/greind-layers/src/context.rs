//! Shared per-layer execution context: hyperparameters, tensor-parallel
//! descriptors, and the scratch buffers every decoder layer reuses.

use crate::activations::Activation;
use crate::dtype::{Element, WeightDType};
use crate::matmul::MatmulHelper;
use crate::pool::ScratchPool;

/// Static model/runtime configuration for one decoder stack.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    /// Global number of query heads.
    pub att_head_num: usize,
    /// Global number of key/value heads.
    pub kv_head_num: usize,
    pub att_head_size: usize,
    pub max_seq_length: usize,
    /// Maximum rotary position; 0 disables the default position ids.
    pub max_pos_embed: usize,
    pub epsilon: f32,
    /// Softmax temperature, usually `1 / sqrt(head_size)`.
    pub att_factor: f32,
    pub act_type: Activation,
    /// Tensor-parallel world size.
    pub num_split: usize,
    /// Tensor-parallel rank.
    pub split_idx: usize,
    /// Worker count for sizing per-thread scratch; 0 = use the rayon pool.
    pub num_threads: usize,
    /// Pipeline-parallel stage count.
    pub pp_size: usize,
    /// Total decoder layers (for the stage-leading-layer rule).
    pub layers: usize,
    /// Storage format for projection weights.
    pub weight_dtype: WeightDType,
    /// Concatenate gate⊕up into one GEMM in the MLP.
    pub cat_mlp: bool,
    /// Sequence length above which prefill switches to the tiled
    /// online-softmax kernel.
    pub flash_thresh: usize,
    /// Assumed L2 capacity for the M-block size heuristic.
    pub l2_cache_bytes: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            hidden_size: 0,
            intermediate_size: 0,
            att_head_num: 1,
            kv_head_num: 1,
            att_head_size: 0,
            max_seq_length: 0,
            max_pos_embed: 0,
            epsilon: 1e-6,
            att_factor: 1.0,
            act_type: Activation::SiLU,
            num_split: 1,
            split_idx: 0,
            num_threads: 0,
            pp_size: 1,
            layers: 1,
            weight_dtype: WeightDType::F32,
            cat_mlp: false,
            flash_thresh: 1024,
            l2_cache_bytes: 2 * 1024 * 1024,
        }
    }
}

/// Splits `n` tasks over `splits` ranks, handing the remainder to the leading
/// ranks, and returns this rank's `[start, end)` range.
pub fn task_range(n: usize, splits: usize, split_idx: usize) -> (usize, usize) {
    let base = n / splits;
    let remainder = n % splits;
    if split_idx < remainder {
        let per = base + 1;
        (split_idx * per, split_idx * per + per)
    } else {
        let offset = (base + 1) * remainder;
        let start = offset + (split_idx - remainder) * base;
        (start, start + base)
    }
}

/// Per-layer execution context, generic over the activation element type.
///
/// One context is shared by all layers of a stage; `prepare` must be called
/// before each forward with the incoming batch shape so the scratch buffers
/// cover the current token count.
#[derive(Debug)]
pub struct DecoderContext<A: Element = f32> {
    pub config: DecoderConfig,

    /// Current batch size, set by `prepare`.
    pub batch_size: usize,
    /// Current query length, set by `prepare`.
    pub input_seq_len: usize,

    /// Cached per-layer M-block size. Written only by the layer that begins a
    /// pipeline stage during prefill; read by the rest of the stage.
    pub mblock_size: usize,

    /// Norm output, `[M, hidden]`.
    pub norm_buf: Vec<A>,
    /// MLP intermediate, `[M, 2 * im_split]` in the concatenated path.
    pub im_out: Vec<A>,
    /// Fused QKV projection output, `[M, q_cols + 2 * kv_cols]`.
    pub qkv_matmul: Vec<A>,
    /// Attention score scratch; kernels fall back to the pool when the
    /// working set is larger.
    pub qk_scores: Vec<f32>,

    pub pool: ScratchPool,
    pub mm: MatmulHelper,
}

impl<A: Element> DecoderContext<A> {
    pub fn new(config: DecoderConfig) -> Self {
        let mut config = config;
        if config.num_threads == 0 {
            config.num_threads = rayon::current_num_threads();
        }
        assert!(config.att_head_num % config.kv_head_num == 0,
            "query heads ({}) must be a multiple of kv heads ({})",
            config.att_head_num, config.kv_head_num);

        Self {
            config,
            batch_size: 0,
            input_seq_len: 0,
            mblock_size: 0,
            norm_buf: Vec::new(),
            im_out: Vec::new(),
            qkv_matmul: Vec::new(),
            qk_scores: Vec::new(),
            pool: ScratchPool::new(),
            mm: MatmulHelper,
        }
    }

    /// This rank's query-head range.
    pub fn q_head_range(&self) -> (usize, usize) {
        task_range(self.config.att_head_num, self.config.num_split, self.config.split_idx)
    }

    /// This rank's key/value-head range, derived from the query range.
    pub fn kv_head_range(&self) -> (usize, usize) {
        let (start_q, end_q) = self.q_head_range();
        let expand = self.config.att_head_num / self.config.kv_head_num;
        (start_q / expand, (end_q - 1) / expand + 1)
    }

    /// True on the rank that owns the residual addition.
    pub fn is_master(&self) -> bool {
        self.config.split_idx == 0
    }

    pub fn score_capacity(&self) -> usize {
        self.qk_scores.len()
    }

    /// Sizes the scratch buffers for a forward over `batch` sequences of
    /// `input_seq_len` new tokens with `past_seq_len` cached tokens.
    pub fn prepare(&mut self, batch: usize, input_seq_len: usize, past_seq_len: usize) {
        self.batch_size = batch;
        self.input_seq_len = input_seq_len;

        let m = batch * input_seq_len;
        let hidden = self.config.hidden_size;
        let head_size = self.config.att_head_size;

        let (start_q, end_q) = self.q_head_range();
        let (start_kv, end_kv) = self.kv_head_range();
        let q_cols = (end_q - start_q) * head_size;
        let kv_cols = (end_kv - start_kv) * head_size;

        let (im_start, im_end) =
            task_range(self.config.intermediate_size, self.config.num_split, self.config.split_idx);

        grow(&mut self.norm_buf, m * hidden);
        grow(&mut self.im_out, m * 2 * (im_end - im_start).max(1));
        grow(&mut self.qkv_matmul, m * (q_cols + 2 * kv_cols));

        // Score scratch: enough for the head-shard layout at decode and a
        // moderate slim working set at prefill; larger slim working sets fall
        // back to the pool.
        let total = past_seq_len + input_seq_len;
        let stride = round_up16(total);
        let resp_heads = end_q - start_q;
        let shard_need = batch * resp_heads * input_seq_len * stride;
        let slim_need = self.config.num_threads * input_seq_len.min(256) * stride;
        let need = shard_need.max(slim_need);
        if self.qk_scores.len() < need {
            self.qk_scores.resize(need, 0.0);
        }
    }
}

fn grow<T: Element>(buf: &mut Vec<T>, len: usize) {
    if buf.len() < len {
        buf.resize(len, T::default());
    }
}

#[inline]
pub(crate) fn round_up16(n: usize) -> usize {
    (n + 15) / 16 * 16
}
