//! In-memory buffering of station samples
//!
//! This module holds the data structures between the network receiver and the
//! processing threads:
//!
//! - [`SparseSet`](sparse_set::SparseSet) records which sample times hold valid data
//! - [`LockedRanges`](locked_ranges::LockedRanges) gives writers and the reader
//!   exclusive access to disjoint parts of the circular array
//! - the synchronizers in [`sync`] pace the writer against the reader
//! - [`BeamletBuffer`](beamlet::BeamletBuffer) ties these together around the
//!   sample storage
//!
//! The storage itself is a [`SampleArray`]: a fixed, aligned allocation that
//! several threads access through disjoint ranges.

pub mod beamlet;
pub mod locked_ranges;
pub mod sparse_set;
pub mod sync;

use bytemuck::Pod;
use std::alloc::{self, Layout};
use std::marker::PhantomData;
use std::ptr::NonNull;

/// Fixed-size, aligned, zero-initialised sample storage
///
/// Callers coordinate access themselves; the buffer does so through
/// [`LockedRanges`](locked_ranges::LockedRanges).
pub(crate) struct SampleArray<S> {
    ptr: NonNull<S>,
    len: usize,
    layout: Layout,
    _marker: PhantomData<S>,
}

unsafe impl<S: Send> Send for SampleArray<S> {}
unsafe impl<S: Send + Sync> Sync for SampleArray<S> {}

impl<S: Pod> SampleArray<S> {
    /// Allocate `len` zeroed samples aligned to at least `alignment` bytes
    pub fn zeroed(len: usize, alignment: usize) -> Self {
        assert!(len > 0, "sample array must not be empty");
        assert!(std::mem::size_of::<S>() > 0, "zero-sized sample type");

        let align = alignment.next_power_of_two().max(std::mem::align_of::<S>());
        let size = len
            .checked_mul(std::mem::size_of::<S>())
            .expect("sample array size overflows usize");
        let layout = Layout::from_size_align(size, align).expect("invalid sample array layout");

        let raw = unsafe { alloc::alloc_zeroed(layout) } as *mut S;
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        };

        Self {
            ptr,
            len,
            layout,
            _marker: PhantomData,
        }
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.len
    }

    /// Alignment of the allocation in bytes
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    /// Shared view of `len` samples at `offset`
    ///
    /// # Safety
    ///
    /// No other thread may write the region for the lifetime of the slice.
    pub unsafe fn region(&self, offset: usize, len: usize) -> &[S] {
        assert!(offset + len <= self.len, "region out of bounds");
        std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len)
    }

    /// Exclusive view of `len` samples at `offset`
    ///
    /// # Safety
    ///
    /// The caller must hold exclusive access to the region for the lifetime
    /// of the slice.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn region_mut(&self, offset: usize, len: usize) -> &mut [S] {
        assert!(offset + len <= self.len, "region out of bounds");
        std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(offset), len)
    }
}

impl<S> Drop for SampleArray<S> {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr() as *mut u8, self.layout) };
    }
}
