// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
A bump (arena) allocator over a fixed-size byte range.

There is no per-object deallocation. Allocations advance an offset; the only
reclamation is a bulk [`LinearHeap::reset`], after which every previously
returned pointer is invalid. Callers own the problem of not dereferencing
stale pointers; in this crate the only caller is the command chunk, which
resets its heap strictly after the deferred-operation chain has been walked.

Overflow is an explicit error, never an out-of-bounds write.
*/

use std::mem::MaybeUninit;
use std::ptr::NonNull;

/// An allocation would have advanced the offset past capacity.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error(
    "linear heap overflow: {requested} bytes (align {align}) at offset {offset}, capacity {capacity}"
)]
pub struct HeapOverflow {
    pub offset: usize,
    pub requested: usize,
    pub align: usize,
    pub capacity: usize,
}

pub struct LinearHeap {
    storage: Box<[MaybeUninit<u8>]>,
    //derived from `storage` once, so that handed-out pointers share one provenance
    base: *mut u8,
    offset: usize,
}

//Safety: `base` points into `storage`, which we own.
unsafe impl Send for LinearHeap {}

impl LinearHeap {
    pub fn new(capacity: usize) -> Self {
        let mut storage = vec![MaybeUninit::uninit(); capacity].into_boxed_slice();
        let base = storage.as_mut_ptr() as *mut u8;
        LinearHeap {
            storage,
            base,
            offset: 0,
        }
    }

    /**
    Returns a pointer to `size` uninitialized bytes at the requested alignment,
    strictly inside the heap's range, advancing the offset.
    */
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, HeapOverflow> {
        debug_assert!(align.is_power_of_two());
        let base_addr = self.base as usize;
        let misalign = (base_addr + self.offset) & (align - 1);
        let adjust = if misalign == 0 { 0 } else { align - misalign };
        let overflow = HeapOverflow {
            offset: self.offset,
            requested: size,
            align,
            capacity: self.storage.len(),
        };
        let start = self.offset.checked_add(adjust).ok_or(overflow)?;
        let end = start.checked_add(size).ok_or(overflow)?;
        if end > self.storage.len() {
            return Err(overflow);
        }
        self.offset = end;
        //safety: start <= capacity, and base is valid for the whole range
        let ptr = unsafe { self.base.add(start) };
        Ok(NonNull::new(ptr).expect("heap base is non-null"))
    }

    /// Allocates space suitable for one `T`, without initializing it.
    pub fn allocate_uninit<T>(&mut self) -> Result<NonNull<T>, HeapOverflow> {
        self.allocate(std::mem::size_of::<T>(), std::mem::align_of::<T>())
            .map(NonNull::cast)
    }

    /**
    Sets the offset back to zero. All previously returned pointers are invalid
    after this call.
    */
    pub fn reset(&mut self) {
        self.offset = 0;
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// True if `ptr` lies inside the currently allocated prefix of the heap.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let base = self.base as usize;
        addr >= base && addr < base + self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_allocations_stay_in_bounds() {
        let mut heap = LinearHeap::new(256);
        let a = heap.allocate(3, 1).unwrap();
        let b = heap.allocate(8, 8).unwrap();
        assert_eq!(b.as_ptr() as usize % 8, 0);
        assert!(heap.contains(a.as_ptr()));
        assert!(heap.contains(b.as_ptr()));
        assert!(heap.offset() <= heap.capacity());
    }

    #[test]
    fn overflow_is_detected_before_corruption() {
        let mut heap = LinearHeap::new(16);
        heap.allocate(12, 1).unwrap();
        let err = heap.allocate(8, 1).unwrap_err();
        assert_eq!(err.offset, 12);
        assert_eq!(err.requested, 8);
        //the failed allocation must not have advanced the offset
        assert_eq!(heap.offset(), 12);
        //and a smaller one still fits
        heap.allocate(4, 1).unwrap();
        assert_eq!(heap.offset(), 16);
    }

    #[test]
    fn reset_invalidates_and_reuses() {
        let mut heap = LinearHeap::new(64);
        let first = heap.allocate(32, 16).unwrap();
        heap.reset();
        assert_eq!(heap.offset(), 0);
        let second = heap.allocate(32, 16).unwrap();
        assert_eq!(first.as_ptr(), second.as_ptr());
    }

    #[test]
    fn typed_allocation_is_aligned() {
        let mut heap = LinearHeap::new(128);
        heap.allocate(1, 1).unwrap();
        let p = heap.allocate_uninit::<u64>().unwrap();
        assert_eq!(p.as_ptr() as usize % std::mem::align_of::<u64>(), 0);
    }
}
