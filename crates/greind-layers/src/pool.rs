//! Grow-only scratch pool keyed by stable names.
//!
//! Buffers are checked out by value and restored after use, so several named
//! buffers can be live at once while each allocation is still reused across
//! calls: a checkout with the same name hands back the same (possibly grown)
//! allocation. A buffer that is never restored simply gets reallocated on the
//! next checkout, which costs speed, not correctness.

use std::collections::HashMap;

use half::bf16;

#[derive(Debug, Default)]
pub struct ScratchPool {
    f32_bufs: HashMap<&'static str, Vec<f32>>,
    bf16_bufs: HashMap<&'static str, Vec<bf16>>,
}

impl ScratchPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks out the named f32 buffer with at least `len` elements,
    /// zero-filled.
    pub fn take_f32(&mut self, name: &'static str, len: usize) -> Vec<f32> {
        let mut buf = self.f32_bufs.remove(name).unwrap_or_default();
        if buf.capacity() < len {
            log::debug!("scratch pool grows '{}' to {} f32 elements", name, len);
        }
        buf.clear();
        buf.resize(len, 0.0);
        buf
    }

    pub fn restore_f32(&mut self, name: &'static str, buf: Vec<f32>) {
        self.f32_bufs.insert(name, buf);
    }

    /// Checks out the named bf16 buffer with at least `len` elements,
    /// zero-filled.
    pub fn take_bf16(&mut self, name: &'static str, len: usize) -> Vec<bf16> {
        let mut buf = self.bf16_bufs.remove(name).unwrap_or_default();
        if buf.capacity() < len {
            log::debug!("scratch pool grows '{}' to {} bf16 elements", name, len);
        }
        buf.clear();
        buf.resize(len, bf16::ZERO);
        buf
    }

    pub fn restore_bf16(&mut self, name: &'static str, buf: Vec<bf16>) {
        self.bf16_bufs.insert(name, buf);
    }
}
