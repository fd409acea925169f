//! Packed weight storage with per-column quantization metadata.
//!
//! Weights arrive from the loader as f32 (or pre-quantized int8 with loader
//! scales), get converted into one of the tagged storage formats with
//! per-output-column `scale`/`zero`/`sum` vectors, and are then packed into
//! the kernel layout: one row per output feature, contiguous along the input
//! dimension. A [`WeightBundle`] is immutable once the owning layer's
//! `set_weights` returns.

use half::{bf16, f16};

use crate::dtype::{WeightDType, NF4_LEVELS};

/// Raw weights as handed to `set_weights`.
#[derive(Clone, Copy)]
pub enum RawWeight<'a> {
    F32(&'a [f32]),
    /// Pre-quantized 8-bit storage with loader-provided per-column metadata.
    Int8 {
        data: &'a [i8],
        scale: &'a [f32],
        zero: &'a [f32],
    },
}

/// Which slice of the full matrix this rank is responsible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightSplit {
    None,
    /// Vertical split: a contiguous range of output columns.
    Columns { offset: usize, count: usize },
    /// Horizontal split: a contiguous range of input rows.
    Rows { offset: usize, count: usize },
}

/// Tagged weight element storage.
#[derive(Debug, Clone)]
pub enum WeightData {
    F32(Vec<f32>),
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    Int8(Vec<i8>),
    /// Two offset-binary 4-bit codes per byte.
    UInt4x2(Vec<u8>),
    /// Two normal-float 4-bit codes per byte.
    NF4x2(Vec<u8>),
}

/// A dense weight tile of logical shape `[rows, cols]`, row-major.
///
/// Nibble formats store two values per byte along the column axis, so the
/// physical row length is `cols / 2` bytes and `cols` must be even.
#[derive(Debug, Clone)]
pub struct WeightMatrix {
    pub rows: usize,
    pub cols: usize,
    pub data: WeightData,
}

impl WeightMatrix {
    pub fn dtype(&self) -> WeightDType {
        match &self.data {
            WeightData::F32(_) => WeightDType::F32,
            WeightData::F16(_) => WeightDType::F16,
            WeightData::BF16(_) => WeightDType::BF16,
            WeightData::Int8(_) => WeightDType::Int8,
            WeightData::UInt4x2(_) => WeightDType::UInt4x2,
            WeightData::NF4x2(_) => WeightDType::NF4x2,
        }
    }

    /// Physical length of one row in storage units (elements or bytes).
    pub fn row_len(&self) -> usize {
        self.cols / self.dtype().values_per_byte()
    }

    /// Raw (pre-scale) code value at `(r, c)`.
    ///
    /// Float formats return the stored value; integer formats return the
    /// code, to be combined with the per-column scale/zero by the caller.
    #[inline]
    pub fn code(&self, r: usize, c: usize) -> f32 {
        match &self.data {
            WeightData::F32(d) => d[r * self.cols + c],
            WeightData::F16(d) => d[r * self.cols + c].to_f32(),
            WeightData::BF16(d) => d[r * self.cols + c].to_f32(),
            WeightData::Int8(d) => d[r * self.cols + c] as f32,
            WeightData::UInt4x2(d) => {
                let byte = d[r * (self.cols / 2) + c / 2];
                let q = if c % 2 == 0 { byte & 0x0F } else { byte >> 4 };
                q as f32 - 8.0
            }
            WeightData::NF4x2(d) => {
                let byte = d[r * (self.cols / 2) + c / 2];
                let q = if c % 2 == 0 { byte & 0x0F } else { byte >> 4 };
                NF4_LEVELS[q as usize]
            }
        }
    }

    fn zeroed(rows: usize, cols: usize, dtype: WeightDType) -> Self {
        if dtype.values_per_byte() == 2 {
            assert!(cols % 2 == 0, "nibble-packed weights need an even column count");
        }
        let n = rows * cols / dtype.values_per_byte();
        let data = match dtype {
            WeightDType::F32 => WeightData::F32(vec![0.0; n]),
            WeightDType::F16 => WeightData::F16(vec![f16::ZERO; n]),
            WeightDType::BF16 => WeightData::BF16(vec![bf16::ZERO; n]),
            WeightDType::Int8 => WeightData::Int8(vec![0; n]),
            WeightDType::UInt4x2 => WeightData::UInt4x2(vec![0; n]),
            WeightDType::NF4x2 => WeightData::NF4x2(vec![0; n]),
        };
        Self { rows, cols, data }
    }

    fn set_code(&mut self, r: usize, c: usize, q: u8) {
        let cols = self.cols;
        match &mut self.data {
            WeightData::UInt4x2(d) | WeightData::NF4x2(d) => {
                let byte = &mut d[r * (cols / 2) + c / 2];
                if c % 2 == 0 {
                    *byte = (*byte & 0xF0) | (q & 0x0F);
                } else {
                    *byte = (*byte & 0x0F) | (q << 4);
                }
            }
            _ => unreachable!("set_code is only for nibble formats"),
        }
    }
}

/// A packed weight matrix plus its per-column quantization metadata.
///
/// `scale`/`zero`/`sum` are sized `cols` (one entry per output feature) for
/// integer storage formats and empty otherwise; downstream kernels ignore
/// them for float weights.
#[derive(Debug, Clone)]
pub struct WeightBundle {
    pub weight: WeightMatrix,
    pub scale: Vec<f32>,
    pub zero: Vec<f32>,
    pub sum: Vec<f32>,
}

impl WeightBundle {
    /// Number of output features (rows of the packed layout).
    pub fn out_features(&self) -> usize {
        self.weight.rows
    }

    /// Number of input features (columns of the packed layout).
    pub fn in_features(&self) -> usize {
        self.weight.cols
    }

    /// Effective weight value at packed position `(out, in)`.
    #[inline]
    pub fn value(&self, out: usize, inp: usize) -> f32 {
        let code = self.weight.code(out, inp);
        if self.scale.is_empty() {
            code
        } else {
            self.scale[out] * code + self.zero[out]
        }
    }
}

/// Reads the logical `(k, n)` element of the raw source, honoring the
/// transposed flag: `trans` means the source is stored `[n_total, k_total]`
/// (the PyTorch out×in layout), otherwise `[k_total, n_total]`.
#[inline]
fn raw_value(raw: &RawWeight, trans: bool, k_total: usize, n_total: usize, k: usize, n: usize) -> f32 {
    let idx = if trans { n * k_total + k } else { k * n_total + n };
    match raw {
        RawWeight::F32(d) => d[idx],
        RawWeight::Int8 { data, scale, zero } => scale[n] * data[idx] as f32 + zero[n],
    }
}

/// Converts a (slice of a) raw weight matrix into tagged storage with
/// per-column metadata. The result keeps the `[k, n]` input-major
/// orientation; [`pack_weight`] transposes it into the kernel layout.
pub fn convert_weight(
    trans: bool,
    k_total: usize,
    n_total: usize,
    raw: RawWeight,
    split: WeightSplit,
    dtype: WeightDType,
) -> WeightBundle {
    let (k_off, k_cnt, n_off, n_cnt) = match split {
        WeightSplit::None => (0, k_total, 0, n_total),
        WeightSplit::Columns { offset, count } => (0, k_total, offset, count),
        WeightSplit::Rows { offset, count } => (offset, count, 0, n_total),
    };

    let mut out = WeightMatrix::zeroed(k_cnt, n_cnt, dtype);
    let quantized = dtype.is_quantized();
    let mut scale = vec![0.0f32; if quantized { n_cnt } else { 0 }];
    let zero = vec![0.0f32; if quantized { n_cnt } else { 0 }];
    let mut sum = vec![0.0f32; if quantized { n_cnt } else { 0 }];

    // Column-major fill: quantization parameters are per output column.
    for n in 0..n_cnt {
        let src_n = n_off + n;

        match dtype {
            WeightDType::F32 | WeightDType::F16 | WeightDType::BF16 => {
                for k in 0..k_cnt {
                    let v = raw_value(&raw, trans, k_total, n_total, k_off + k, src_n);
                    match &mut out.data {
                        WeightData::F32(d) => d[k * n_cnt + n] = v,
                        WeightData::F16(d) => d[k * n_cnt + n] = f16::from_f32(v),
                        WeightData::BF16(d) => d[k * n_cnt + n] = bf16::from_f32(v),
                        _ => unreachable!(),
                    }
                }
            }
            WeightDType::Int8 => {
                let mut max_abs = 0.0f32;
                for k in 0..k_cnt {
                    let v = raw_value(&raw, trans, k_total, n_total, k_off + k, src_n);
                    max_abs = max_abs.max(v.abs());
                }
                let s = if max_abs > 0.0 { max_abs / 127.0 } else { 1.0 };
                scale[n] = s;
                let mut col_sum = 0.0f32;
                for k in 0..k_cnt {
                    let v = raw_value(&raw, trans, k_total, n_total, k_off + k, src_n);
                    let q = (v / s).round().clamp(-127.0, 127.0) as i8;
                    match &mut out.data {
                        WeightData::Int8(d) => d[k * n_cnt + n] = q,
                        _ => unreachable!(),
                    }
                    col_sum += s * q as f32;
                }
                sum[n] = col_sum;
            }
            WeightDType::UInt4x2 => {
                let mut max_abs = 0.0f32;
                for k in 0..k_cnt {
                    let v = raw_value(&raw, trans, k_total, n_total, k_off + k, src_n);
                    max_abs = max_abs.max(v.abs());
                }
                let s = if max_abs > 0.0 { max_abs / 7.0 } else { 1.0 };
                scale[n] = s;
                let mut col_sum = 0.0f32;
                for k in 0..k_cnt {
                    let v = raw_value(&raw, trans, k_total, n_total, k_off + k, src_n);
                    let q = ((v / s).round() + 8.0).clamp(0.0, 15.0) as u8;
                    out.set_code(k, n, q);
                    col_sum += s * (q as f32 - 8.0);
                }
                sum[n] = col_sum;
            }
            WeightDType::NF4x2 => {
                let mut max_abs = 0.0f32;
                for k in 0..k_cnt {
                    let v = raw_value(&raw, trans, k_total, n_total, k_off + k, src_n);
                    max_abs = max_abs.max(v.abs());
                }
                let s = if max_abs > 0.0 { max_abs } else { 1.0 };
                scale[n] = s;
                let mut col_sum = 0.0f32;
                for k in 0..k_cnt {
                    let v = raw_value(&raw, trans, k_total, n_total, k_off + k, src_n);
                    let t = v / s;
                    let mut best = 0usize;
                    let mut best_d = f32::INFINITY;
                    for (i, &lvl) in NF4_LEVELS.iter().enumerate() {
                        let d = (t - lvl).abs();
                        if d < best_d {
                            best_d = d;
                            best = i;
                        }
                    }
                    out.set_code(k, n, best as u8);
                    col_sum += s * NF4_LEVELS[best];
                }
                sum[n] = col_sum;
            }
        }
    }

    WeightBundle {
        weight: out,
        scale,
        zero,
        sum,
    }
}

/// Transposes a converted `[k, n]` bundle into the packed `[n, k]` kernel
/// layout (one contiguous row per output feature). Metadata is untouched: it
/// is indexed by output feature either way.
pub fn pack_weight(converted: WeightBundle) -> WeightBundle {
    let src = &converted.weight;
    let (k, n) = (src.rows, src.cols);
    let dtype = src.dtype();

    let mut packed = WeightMatrix::zeroed(n, k, dtype);

    if dtype.values_per_byte() == 2 {
        assert!(k % 2 == 0, "nibble-packed rows need an even input dimension");
        // Nibble transpose goes code by code.
        let bytes = match &src.data {
            WeightData::UInt4x2(s) | WeightData::NF4x2(s) => s.as_slice(),
            _ => unreachable!(),
        };
        for r in 0..k {
            for c in 0..n {
                let byte = bytes[r * (n / 2) + c / 2];
                let q = if c % 2 == 0 { byte & 0x0F } else { byte >> 4 };
                packed.set_code(c, r, q);
            }
        }
    } else {
        match (&src.data, &mut packed.data) {
            (WeightData::F32(s), WeightData::F32(d)) => {
                for r in 0..k {
                    for c in 0..n {
                        d[c * k + r] = s[r * n + c];
                    }
                }
            }
            (WeightData::F16(s), WeightData::F16(d)) => {
                for r in 0..k {
                    for c in 0..n {
                        d[c * k + r] = s[r * n + c];
                    }
                }
            }
            (WeightData::BF16(s), WeightData::BF16(d)) => {
                for r in 0..k {
                    for c in 0..n {
                        d[c * k + r] = s[r * n + c];
                    }
                }
            }
            (WeightData::Int8(s), WeightData::Int8(d)) => {
                for r in 0..k {
                    for c in 0..n {
                        d[c * k + r] = s[r * n + c];
                    }
                }
            }
            _ => unreachable!("convert and pack dtypes always match"),
        }
    }

    WeightBundle {
        weight: packed,
        scale: converted.scale,
        zero: converted.zero,
        sum: converted.sum,
    }
}

/// Concatenates two converted `[k, n]` bundles along the column axis
/// (gate ⊕ up). For nibble formats the per-row copy works on bytes, so the
/// effective stride is halved. Metadata vectors are concatenated to match.
pub fn cat_columns(a: &WeightBundle, b: &WeightBundle) -> WeightBundle {
    assert_eq!(a.weight.rows, b.weight.rows, "cat: row count mismatch");
    assert_eq!(a.weight.dtype(), b.weight.dtype(), "cat: dtype mismatch");

    let k = a.weight.rows;
    let cols = a.weight.cols + b.weight.cols;
    let mut out = WeightMatrix::zeroed(k, cols, a.weight.dtype());

    let a_row = a.weight.row_len();
    let b_row = b.weight.row_len();
    let stride = out.row_len();

    macro_rules! cat_rows {
        ($src_a:expr, $src_b:expr, $dst:expr) => {
            for r in 0..k {
                $dst[r * stride..r * stride + a_row]
                    .copy_from_slice(&$src_a[r * a_row..(r + 1) * a_row]);
                $dst[r * stride + a_row..r * stride + a_row + b_row]
                    .copy_from_slice(&$src_b[r * b_row..(r + 1) * b_row]);
            }
        };
    }

    match (&a.weight.data, &b.weight.data, &mut out.data) {
        (WeightData::F32(x), WeightData::F32(y), WeightData::F32(d)) => cat_rows!(x, y, d),
        (WeightData::F16(x), WeightData::F16(y), WeightData::F16(d)) => cat_rows!(x, y, d),
        (WeightData::BF16(x), WeightData::BF16(y), WeightData::BF16(d)) => cat_rows!(x, y, d),
        (WeightData::Int8(x), WeightData::Int8(y), WeightData::Int8(d)) => cat_rows!(x, y, d),
        (WeightData::UInt4x2(x), WeightData::UInt4x2(y), WeightData::UInt4x2(d)) => {
            cat_rows!(x, y, d)
        }
        (WeightData::NF4x2(x), WeightData::NF4x2(y), WeightData::NF4x2(d)) => cat_rows!(x, y, d),
        _ => unreachable!(),
    }

    let mut scale = a.scale.clone();
    scale.extend_from_slice(&b.scale);
    let mut zero = a.zero.clone();
    zero.extend_from_slice(&b.zero);
    let mut sum = a.sum.clone();
    sum.extend_from_slice(&b.sum);

    WeightBundle {
        weight: out,
        scale,
        zero,
        sum,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(k: usize, n: usize) -> Vec<f32> {
        (0..k * n).map(|i| ((i * 13 % 29) as f32) * 0.07 - 0.9).collect()
    }

    #[test]
    fn convert_pack_roundtrip_f32() {
        let (k, n) = (6, 4);
        let data = raw(k, n);
        let bundle = pack_weight(convert_weight(
            false,
            k,
            n,
            RawWeight::F32(&data),
            WeightSplit::None,
            WeightDType::F32,
        ));

        assert_eq!(bundle.out_features(), n);
        assert_eq!(bundle.in_features(), k);
        for out in 0..n {
            for inp in 0..k {
                assert_eq!(bundle.value(out, inp), data[inp * n + out]);
            }
        }
    }

    #[test]
    fn transposed_source_matches_untransposed() {
        let (k, n) = (5, 3);
        let kn = raw(k, n);
        // Same logical matrix stored [n, k].
        let mut nk = vec![0.0f32; k * n];
        for r in 0..k {
            for c in 0..n {
                nk[c * k + r] = kn[r * n + c];
            }
        }

        let a = pack_weight(convert_weight(
            false,
            k,
            n,
            RawWeight::F32(&kn),
            WeightSplit::None,
            WeightDType::F32,
        ));
        let b = pack_weight(convert_weight(
            true,
            k,
            n,
            RawWeight::F32(&nk),
            WeightSplit::None,
            WeightDType::F32,
        ));

        for out in 0..n {
            for inp in 0..k {
                assert_eq!(a.value(out, inp), b.value(out, inp));
            }
        }
    }

    #[test]
    fn row_and_column_splits() {
        let (k, n) = (8, 6);
        let data = raw(k, n);

        let cols = pack_weight(convert_weight(
            false,
            k,
            n,
            RawWeight::F32(&data),
            WeightSplit::Columns { offset: 2, count: 3 },
            WeightDType::F32,
        ));
        assert_eq!(cols.out_features(), 3);
        assert_eq!(cols.value(0, 0), data[2]); // (k=0, n=2)

        let rows = pack_weight(convert_weight(
            false,
            k,
            n,
            RawWeight::F32(&data),
            WeightSplit::Rows { offset: 4, count: 4 },
            WeightDType::F32,
        ));
        assert_eq!(rows.in_features(), 4);
        assert_eq!(rows.value(1, 0), data[4 * n + 1]); // (k=4, n=1)
    }

    #[test]
    fn int8_quantization_stays_close() {
        let (k, n) = (32, 5);
        let data = raw(k, n);
        let bundle = pack_weight(convert_weight(
            false,
            k,
            n,
            RawWeight::F32(&data),
            WeightSplit::None,
            WeightDType::Int8,
        ));

        assert_eq!(bundle.scale.len(), n);
        for out in 0..n {
            for inp in 0..k {
                let want = data[inp * n + out];
                let got = bundle.value(out, inp);
                assert!(
                    (want - got).abs() < 0.01,
                    "int8 dequant off at ({out},{inp}): {want} vs {got}"
                );
            }
        }
        // Column sums were recorded from the dequantized values.
        let col0: f32 = (0..k).map(|inp| bundle.value(0, inp)).sum();
        assert!((bundle.sum[0] - col0).abs() < 1e-4);
    }

    #[test]
    fn nibble_cat_halves_stride() {
        let (k, n) = (4, 8);
        let gate = raw(k, n);
        let up = raw(k, n);

        let gc = convert_weight(
            false,
            k,
            n,
            RawWeight::F32(&gate),
            WeightSplit::None,
            WeightDType::UInt4x2,
        );
        let uc = convert_weight(
            false,
            k,
            n,
            RawWeight::F32(&up),
            WeightSplit::None,
            WeightDType::UInt4x2,
        );

        let cat = cat_columns(&gc, &uc);
        assert_eq!(cat.weight.cols, 2 * n);
        assert_eq!(cat.weight.row_len(), n); // bytes per row, not elements
        assert_eq!(cat.scale.len(), 2 * n);

        // Left half is the gate, right half the up projection.
        let packed = pack_weight(cat);
        for inp in 0..k {
            assert_eq!(packed.value(0, inp), {
                let g = pack_weight(gc.clone());
                g.value(0, inp)
            });
            assert_eq!(packed.value(n, inp), {
                let u = pack_weight(uc.clone());
                u.value(0, inp)
            });
        }
    }

    #[test]
    fn nf4_uses_table_levels() {
        let (k, n) = (4, 2);
        let data = vec![
            1.0, -1.0, //
            0.5, 0.25, //
            0.0, -0.5, //
            -0.25, 0.1,
        ];
        let bundle = pack_weight(convert_weight(
            false,
            k,
            n,
            RawWeight::F32(&data),
            WeightSplit::None,
            WeightDType::NF4x2,
        ));
        // Extremes map exactly onto the ±1 levels times the column scale.
        assert_eq!(bundle.value(0, 0), 1.0);
        assert_eq!(bundle.value(1, 0), -1.0);
    }
}
