//! Per-layer key/value cache in `(seq, batch, head)` layout.
//!
//! The sequence-major layout keeps one head's history readable as a single
//! strided matrix (`head()` returns the base slice and the leading
//! dimension), which is what BMM1/BMM2 of the fused attention consume, while
//! decode steps append one `sequence()` row per token.

use anyhow::{bail, Result};

use crate::dtype::Element;
use crate::kernels::SendPtr;

#[derive(Debug, Clone)]
pub struct KvCache<T: Element> {
    data: Vec<T>,
    max_seq: usize,
    batch: usize,
    heads: usize,
    head_size: usize,
}

impl<T: Element> KvCache<T> {
    pub fn new(max_seq: usize, batch: usize, heads: usize, head_size: usize) -> Self {
        Self {
            data: vec![T::default(); max_seq * batch * heads * head_size],
            max_seq,
            batch,
            heads,
            head_size,
        }
    }

    pub fn max_seq(&self) -> usize {
        self.max_seq
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn heads(&self) -> usize {
        self.heads
    }

    pub fn head_size(&self) -> usize {
        self.head_size
    }

    #[inline]
    fn offset(&self, seq: usize, b: usize, h: usize) -> usize {
        ((seq * self.batch + b) * self.heads + h) * self.head_size
    }

    /// One cached row: the head vector stored for `(seq, b, h)`.
    #[inline]
    pub fn sequence(&self, seq: usize, b: usize, h: usize) -> &[T] {
        let off = self.offset(seq, b, h);
        &self.data[off..off + self.head_size]
    }

    #[inline]
    pub fn sequence_mut(&mut self, seq: usize, b: usize, h: usize) -> &mut [T] {
        let off = self.offset(seq, b, h);
        &mut self.data[off..off + self.head_size]
    }

    /// All cached positions of one head as a strided matrix: row `j` lives at
    /// `slice[j * ld .. j * ld + head_size]`.
    #[inline]
    pub fn head(&self, b: usize, h: usize) -> (&[T], usize) {
        let ld = self.batch * self.heads * self.head_size;
        (&self.data[self.offset(0, b, h)..], ld)
    }

    /// Validates that `past + new` tokens fit.
    pub fn check_capacity(&self, past: usize, new: usize) -> Result<()> {
        if past + new > self.max_seq {
            bail!(
                "kv cache overflow: past={} + new={} exceeds capacity {}",
                past,
                new,
                self.max_seq
            );
        }
        Ok(())
    }

    /// Shared handle for parallel regions that write disjoint
    /// `(seq, batch, head)` cells.
    pub(crate) fn shared(&mut self) -> SharedKvCache<T> {
        SharedKvCache {
            ptr: SendPtr(self.data.as_mut_ptr()),
            batch: self.batch,
            heads: self.heads,
            head_size: self.head_size,
        }
    }
}

/// Unsafe parallel view over a [`KvCache`]. Writers must target disjoint
/// cells; the task decompositions in the attention kernels guarantee that.
#[derive(Clone, Copy)]
pub(crate) struct SharedKvCache<T> {
    ptr: SendPtr<T>,
    batch: usize,
    heads: usize,
    head_size: usize,
}

impl<T> SharedKvCache<T> {
    #[inline]
    pub fn sequence_ptr(&self, seq: usize, b: usize, h: usize) -> *mut T {
        let off = ((seq * self.batch + b) * self.heads + h) * self.head_size;
        unsafe { self.ptr.ptr().add(off) }
    }

    /// Base pointer and leading dimension of one head's strided history,
    /// the read side of the BMM kernels.
    #[inline]
    pub fn head_ptr(&self, b: usize, h: usize) -> (*const T, usize) {
        let ld = self.batch * self.heads * self.head_size;
        (self.sequence_ptr(0, b, h) as *const T, ld)
    }
}
