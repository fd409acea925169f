//! Low-level compute primitives shared by the attention and MLP layers.
//!
//! Everything here operates on raw row-major tiles described by a data slice
//! and a leading dimension, the shape the score buffers and the KV cache hand
//! out. Higher-level modules own all shape checking; these loops assume their
//! preconditions hold.

pub mod self_attn;
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub mod x86;

use crate::dtype::Element;

/// Raw pointer wrapper for handing disjoint output tiles to parallel workers.
///
/// Every parallel region in this crate writes non-overlapping `(batch, head,
/// block)` tiles, so sharing the base pointer is sound as long as the task
/// decomposition stays disjoint. Callers uphold that invariant.
#[derive(Debug)]
pub(crate) struct SendPtr<T>(pub *mut T);

unsafe impl<T> Send for SendPtr<T> {}
unsafe impl<T> Sync for SendPtr<T> {}

impl<T> Clone for SendPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SendPtr<T> {}

impl<T> SendPtr<T> {
    #[inline(always)]
    pub fn ptr(self) -> *mut T {
        self.0
    }
}

/// Element-wise convert-copy between activation dtypes.
#[inline]
pub fn convert_copy<S: Element, D: Element>(dst: &mut [D], src: &[S]) {
    debug_assert_eq!(dst.len(), src.len());
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d = D::from_f32(s.to_f32());
    }
}

/// Dot product of two rows in possibly different activation dtypes,
/// accumulated in f32.
#[inline]
pub fn dot<A: Element, B: Element>(a: &[A], b: &[B], k: usize) -> f32 {
    debug_assert!(a.len() >= k && b.len() >= k);

    let mut acc0 = 0.0f32;
    let mut acc1 = 0.0f32;
    let mut acc2 = 0.0f32;
    let mut acc3 = 0.0f32;

    let chunks = k / 4;
    for c in 0..chunks {
        let i = c * 4;
        acc0 += a[i].to_f32() * b[i].to_f32();
        acc1 += a[i + 1].to_f32() * b[i + 1].to_f32();
        acc2 += a[i + 2].to_f32() * b[i + 2].to_f32();
        acc3 += a[i + 3].to_f32() * b[i + 3].to_f32();
    }
    for i in chunks * 4..k {
        acc0 += a[i].to_f32() * b[i].to_f32();
    }

    acc0 + acc1 + acc2 + acc3
}

/// Dot product of an activation row against an f32 row, with an AVX2 fast
/// path when both sides are f32.
#[inline]
pub fn dot_f32<A: Element>(a: &[A], b: &[f32], k: usize) -> f32 {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        if let Some(a_f32) = crate::dtype::reinterpret_slice::<A, f32>(a) {
            if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
                return unsafe { x86::dot_f32_avx2(a_f32.as_ptr(), b.as_ptr(), k) };
            }
        }
    }

    dot(a, b, k)
}

/// `C[M, N] = A[M, K] * B[N, K]^T`, accumulating in f32.
///
/// `B` is row-major with one row per output column, which is exactly the
/// cached-K head view (`ldb` = cache row stride). Used as BMM1 of the fused
/// attention: query rows against cached keys.
///
/// Pointer-based so parallel tasks can address disjoint tiles of a shared
/// buffer without materializing overlapping slices.
///
/// # Safety
///
/// All `m`/`n`/`k` rows addressed through the three pointers and strides
/// must be in bounds, and no other thread may touch the addressed cells
/// during the call.
#[allow(clippy::too_many_arguments)]
pub unsafe fn small_gemm_transb<A: Element, B: Element>(
    a: *const A,
    b: *const B,
    c: *mut f32,
    m: usize,
    n: usize,
    k: usize,
    lda: usize,
    ldb: usize,
    ldc: usize,
) {
    for i in 0..m {
        let a_row = std::slice::from_raw_parts(a.add(i * lda), k);
        let c_row = std::slice::from_raw_parts_mut(c.add(i * ldc), n);
        for (j, out) in c_row.iter_mut().enumerate() {
            let b_row = std::slice::from_raw_parts(b.add(j * ldb), k);
            *out = dot(a_row, b_row, k);
        }
    }
}

/// `C[M, N] = A[M, K] * B[K, N]`, accumulating in f32 and storing as `O`.
///
/// `B` is the cached-V head view (`ldb` = cache row stride). Used as BMM2 of
/// the fused attention: softmax rows against cached values.
///
/// # Safety
///
/// Same contract as [`small_gemm_transb`].
#[allow(clippy::too_many_arguments)]
pub unsafe fn small_gemm<O: Element, B: Element>(
    a: *const f32,
    b: *const B,
    c: *mut O,
    m: usize,
    n: usize,
    k: usize,
    lda: usize,
    ldb: usize,
    ldc: usize,
) {
    debug_assert!(n <= 512, "head size exceeds small_gemm accumulator");
    for i in 0..m {
        let a_row = std::slice::from_raw_parts(a.add(i * lda), k);
        let c_row = std::slice::from_raw_parts_mut(c.add(i * ldc), n);

        let mut acc = [0.0f32; 512];
        let acc = &mut acc[..n];

        for (kk, &w) in a_row.iter().enumerate() {
            let b_row = std::slice::from_raw_parts(b.add(kk * ldb), n);
            for (j, bv) in b_row.iter().enumerate() {
                acc[j] += w * bv.to_f32();
            }
        }

        for (j, out) in c_row.iter_mut().enumerate() {
            *out = O::from_f32(acc[j]);
        }
    }
}
