//! Pooled fixed-size buffers and the data descriptors built from them.
//!
//! The pool hands out refcounted [`PoolBuffer`] handles drawn from a
//! lock-free free list. All unsafe code in the crate's data path lives in
//! this module; the public surface is safe.

use std::{
    alloc::Layout,
    collections::VecDeque,
    os::fd::RawFd,
    ptr::NonNull,
    sync::{
        Arc, Mutex,
        atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering, fence},
    },
};

use sockeye_utils::safe_assert;

const SLAB_BUFFERS: usize = 64;
const MAX_SLABS: usize = 4096;
const NIL: u32 = u32::MAX;

/// Buffer headers are followed in memory by their data region; the header
/// size is padded so data starts on a cache-line-friendly boundary.
const HEADER_SIZE: usize = 64;

struct BufferHeader {
    refcount: AtomicUsize,
    /// Free-list link while pooled, `NIL` while allocated.
    next: AtomicU32,
    /// Arena index: `slab * SLAB_BUFFERS + slot`.
    index: u32,
}

#[derive(Debug)]
struct PoolShared {
    buffer_size: usize,
    stride: usize,
    /// Packed `(tag << 32) | index` free-list head. The tag increments on
    /// every successful push and pop, which protects the CAS against ABA
    /// recycling of indices.
    head: AtomicU64,
    slab_table: Box<[AtomicPtr<u8>]>,
    grow: Mutex<usize>,
    num_pooled: AtomicU64,
    num_available: AtomicU64,
}

unsafe impl Send for PoolShared {}
unsafe impl Sync for PoolShared {}

impl PoolShared {
    #[inline]
    fn header_at(&self, index: u32) -> NonNull<BufferHeader> {
        let slab = index as usize / SLAB_BUFFERS;
        let slot = index as usize % SLAB_BUFFERS;
        let base = self.slab_table[slab].load(Ordering::Acquire);
        debug_assert!(!base.is_null());
        unsafe { NonNull::new_unchecked(base.add(slot * self.stride).cast()) }
    }

    #[inline]
    fn data_at(&self, index: u32) -> *mut u8 {
        unsafe { self.header_at(index).as_ptr().cast::<u8>().add(HEADER_SIZE) }
    }

    fn pop_free(&self) -> Option<u32> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let index = (head & u64::from(u32::MAX)) as u32;
            if index == NIL {
                return None;
            }
            let next = unsafe { self.header_at(index).as_ref() }.next.load(Ordering::Relaxed);
            let tag = (head >> 32).wrapping_add(1);
            let replacement = (tag << 32) | u64::from(next);
            if self
                .head
                .compare_exchange_weak(head, replacement, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.num_available.fetch_sub(1, Ordering::Relaxed);
                return Some(index);
            }
        }
    }

    fn push_free(&self, index: u32) {
        let header = unsafe { self.header_at(index).as_ref() };
        loop {
            let head = self.head.load(Ordering::Acquire);
            header.next.store((head & u64::from(u32::MAX)) as u32, Ordering::Relaxed);
            let tag = (head >> 32).wrapping_add(1);
            let replacement = (tag << 32) | u64::from(index);
            if self
                .head
                .compare_exchange_weak(head, replacement, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.num_available.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }

    /// Slow path: appends one slab and links its buffers onto the free list.
    fn grow(&self) {
        let mut next_slab = self.grow.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        // Another thread may have grown (or released) while we waited.
        if (self.head.load(Ordering::Acquire) & u64::from(u32::MAX)) as u32 != NIL {
            return;
        }
        let slab = *next_slab;
        assert!(slab < MAX_SLABS, "buffer pool exhausted its slab table");

        let layout = Layout::from_size_align(self.stride * SLAB_BUFFERS, 64)
            .expect("slab layout");
        let base = unsafe { std::alloc::alloc(layout) };
        assert!(!base.is_null(), "slab allocation failed");

        for slot in 0..SLAB_BUFFERS {
            let index = (slab * SLAB_BUFFERS + slot) as u32;
            let header = unsafe { base.add(slot * self.stride).cast::<BufferHeader>() };
            unsafe {
                header.write(BufferHeader {
                    refcount: AtomicUsize::new(0),
                    next: AtomicU32::new(NIL),
                    index,
                });
            }
        }

        self.slab_table[slab].store(base, Ordering::Release);
        *next_slab += 1;
        self.num_pooled.fetch_add(SLAB_BUFFERS as u64, Ordering::Relaxed);
        for slot in 0..SLAB_BUFFERS {
            self.push_free((slab * SLAB_BUFFERS + slot) as u32);
        }
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.stride * SLAB_BUFFERS, 64)
            .expect("slab layout");
        for slab in self.slab_table.iter() {
            let base = slab.load(Ordering::Acquire);
            if !base.is_null() {
                unsafe { std::alloc::dealloc(base, layout) };
            }
        }
    }
}

/// Fixed-size buffer pool. Cloning shares the same arena.
#[derive(Clone, Debug)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    pub const DEFAULT_BUFFER_SIZE: usize = 4096;

    pub fn new(buffer_size: usize) -> Self {
        let buffer_size = buffer_size.max(1);
        let stride = HEADER_SIZE + buffer_size.next_multiple_of(64);
        let slab_table =
            (0..MAX_SLABS).map(|_| AtomicPtr::new(std::ptr::null_mut())).collect();
        Self {
            shared: Arc::new(PoolShared {
                buffer_size,
                stride,
                head: AtomicU64::new(u64::from(NIL)),
                slab_table,
                grow: Mutex::new(0),
                num_pooled: AtomicU64::new(0),
                num_available: AtomicU64::new(0),
            }),
        }
    }

    /// Size of every buffer this pool hands out.
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    /// Pops a pooled buffer, growing the arena when the free list is empty.
    pub fn allocate(&self) -> PoolBuffer {
        loop {
            if let Some(index) = self.shared.pop_free() {
                let header = unsafe { self.shared.header_at(index).as_ref() };
                safe_assert!(
                    header.refcount.load(Ordering::Relaxed) == 0,
                    "pooled buffer {index} has live references"
                );
                header.refcount.store(1, Ordering::Release);
                header.next.store(NIL, Ordering::Relaxed);
                return PoolBuffer { index, shared: Arc::clone(&self.shared) };
            }
            self.shared.grow();
        }
    }

    /// Total buffers ever drawn into the arena.
    pub fn num_pooled(&self) -> u64 {
        self.shared.num_pooled.load(Ordering::Relaxed)
    }

    /// Buffers currently sitting in the free list.
    pub fn num_available(&self) -> u64 {
        self.shared.num_available.load(Ordering::Relaxed)
    }

    /// Buffers currently held by handles.
    pub fn num_allocated(&self) -> u64 {
        self.num_pooled() - self.num_available()
    }

    pub fn num_bytes_in_use(&self) -> u64 {
        self.num_allocated() * self.shared.buffer_size as u64
    }
}

/// Refcounted handle to one pooled buffer. The buffer returns to the pool
/// when the last handle drops.
pub struct PoolBuffer {
    index: u32,
    shared: Arc<PoolShared>,
}

unsafe impl Send for PoolBuffer {}
unsafe impl Sync for PoolBuffer {}

impl PoolBuffer {
    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.buffer_size
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self.shared.data_at(self.index), self.shared.buffer_size)
        }
    }

    /// Mutable access requires a unique handle; a shared buffer is frozen.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        let header = unsafe { self.shared.header_at(self.index).as_ref() };
        if header.refcount.load(Ordering::Acquire) != 1 {
            return None;
        }
        Some(unsafe {
            std::slice::from_raw_parts_mut(
                self.shared.data_at(self.index),
                self.shared.buffer_size,
            )
        })
    }

    pub(crate) fn data_ptr(&self) -> *mut u8 {
        self.shared.data_at(self.index)
    }
}

impl Clone for PoolBuffer {
    fn clone(&self) -> Self {
        let header = unsafe { self.shared.header_at(self.index).as_ref() };
        header.refcount.fetch_add(1, Ordering::Relaxed);
        Self { index: self.index, shared: Arc::clone(&self.shared) }
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        let header = unsafe { self.shared.header_at(self.index).as_ref() };
        if header.refcount.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            self.shared.push_free(self.index);
        }
    }
}

impl std::fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("index", &self.index)
            .field("capacity", &self.shared.buffer_size)
            .finish()
    }
}

/// One readable window into a pooled buffer.
#[derive(Clone, Debug)]
pub struct BlobSlice {
    pub(crate) buffer: PoolBuffer,
    pub(crate) offset: usize,
    pub(crate) len: usize,
}

impl BlobSlice {
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer.as_slice()[self.offset..self.offset + self.len]
    }
}

/// An ordered sequence of buffer slices with a logical length.
///
/// Appending and erasing preserve slice boundaries; erasing leading bytes
/// reclaims fully consumed slices (their buffers drop back to the pool).
#[derive(Clone, Debug, Default)]
pub struct Blob {
    slices: VecDeque<BlobSlice>,
    length: usize,
}

impl Blob {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.length
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    #[inline]
    pub fn num_slices(&self) -> usize {
        self.slices.len()
    }

    /// Appends the window `[offset, offset + len)` of `buffer`.
    pub fn append_buffer(&mut self, buffer: PoolBuffer, offset: usize, len: usize) {
        safe_assert!(offset + len <= buffer.capacity(), "blob slice exceeds buffer capacity");
        if len == 0 {
            return;
        }
        self.length += len;
        self.slices.push_back(BlobSlice { buffer, offset, len });
    }

    /// Copies `bytes` into freshly allocated pool buffers.
    pub fn append_bytes(&mut self, pool: &BufferPool, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let mut buffer = pool.allocate();
            let take = bytes.len().min(buffer.capacity());
            buffer.as_mut_slice().expect("fresh buffer is unique")[..take]
                .copy_from_slice(&bytes[..take]);
            self.append_buffer(buffer, 0, take);
            bytes = &bytes[take..];
        }
    }

    /// Drops the first `count` bytes, releasing fully consumed slices.
    pub fn erase_front(&mut self, mut count: usize) {
        count = count.min(self.length);
        self.length -= count;
        while count > 0 {
            let front = self.slices.front_mut().expect("length tracks slices");
            if count >= front.len {
                count -= front.len;
                self.slices.pop_front();
            } else {
                front.offset += count;
                front.len -= count;
                count = 0;
            }
        }
    }

    /// Splits off the first `count` bytes into a new blob, sharing buffers.
    pub fn split_front(&mut self, mut count: usize) -> Blob {
        count = count.min(self.length);
        let mut front = Blob::new();
        while count > 0 {
            let slice = self.slices.front_mut().expect("length tracks slices");
            if count >= slice.len {
                count -= slice.len;
                self.length -= slice.len;
                front.length += slice.len;
                front.slices.push_back(self.slices.pop_front().expect("non-empty"));
            } else {
                front.append_buffer(slice.buffer.clone(), slice.offset, count);
                slice.offset += count;
                slice.len -= count;
                self.length -= count;
                count = 0;
            }
        }
        front
    }

    /// Appends all of `other`'s slices.
    pub fn append_blob(&mut self, other: Blob) {
        self.length += other.length;
        self.slices.extend(other.slices);
    }

    pub fn iter_slices(&self) -> impl Iterator<Item = &[u8]> {
        self.slices.iter().map(BlobSlice::as_slice)
    }

    pub fn copy_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.length);
        for slice in self.iter_slices() {
            out.extend_from_slice(slice);
        }
        out
    }
}

/// A region of an open file: descriptor, starting offset, bytes remaining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRegion {
    pub fd: RawFd,
    pub offset: u64,
    pub remaining: u64,
}

/// The payload of a send entry or receive completion.
#[derive(Debug, Clone)]
pub enum Data {
    Bytes(Vec<u8>),
    Blob(Blob),
    File(FileRegion),
}

impl Data {
    /// Logical length: the sum over slices, or the remaining file bytes.
    pub fn len(&self) -> usize {
        match self {
            Data::Bytes(bytes) => bytes.len(),
            Data::Blob(blob) => blob.len(),
            Data::File(region) => region.remaining as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops the first `count` bytes.
    pub fn erase_front(&mut self, count: usize) {
        match self {
            Data::Bytes(bytes) => {
                bytes.drain(..count.min(bytes.len()));
            }
            Data::Blob(blob) => blob.erase_front(count),
            Data::File(region) => {
                let count = (count as u64).min(region.remaining);
                region.offset += count;
                region.remaining -= count;
            }
        }
    }

    /// Flattens in-memory data for inspection; file regions yield nothing.
    pub fn copy_to_vec(&self) -> Vec<u8> {
        match self {
            Data::Bytes(bytes) => bytes.clone(),
            Data::Blob(blob) => blob.copy_to_vec(),
            Data::File(_) => Vec::new(),
        }
    }
}

impl From<Vec<u8>> for Data {
    fn from(value: Vec<u8>) -> Self {
        Data::Bytes(value)
    }
}

impl From<&[u8]> for Data {
    fn from(value: &[u8]) -> Self {
        Data::Bytes(value.to_vec())
    }
}

impl From<Blob> for Data {
    fn from(value: Blob) -> Self {
        Data::Blob(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_counts_balance() {
        let pool = BufferPool::new(1024);
        assert_eq!(pool.num_pooled(), 0);

        let a = pool.allocate();
        let b = pool.allocate();
        assert_eq!(pool.num_allocated(), 2);
        assert_eq!(pool.num_allocated() + pool.num_available(), pool.num_pooled());
        assert_eq!(pool.num_bytes_in_use(), 2048);

        drop(a);
        drop(b);
        assert_eq!(pool.num_allocated(), 0);
        assert_eq!(pool.num_allocated() + pool.num_available(), pool.num_pooled());
    }

    #[test]
    fn buffers_recycle_through_the_free_list() {
        let pool = BufferPool::new(64);
        let first = pool.allocate();
        let pooled_after_first = pool.num_pooled();
        drop(first);

        for _ in 0..1000 {
            let buffer = pool.allocate();
            drop(buffer);
        }
        // Recycling must not grow the arena.
        assert_eq!(pool.num_pooled(), pooled_after_first);
    }

    #[test]
    fn clone_freezes_buffer() {
        let pool = BufferPool::new(64);
        let mut buffer = pool.allocate();
        buffer.as_mut_slice().unwrap()[0] = 7;

        let shared = buffer.clone();
        assert!(buffer.as_mut_slice().is_none());
        assert_eq!(shared.as_slice()[0], 7);

        drop(shared);
        assert!(buffer.as_mut_slice().is_some());
    }

    #[test]
    fn concurrent_allocate_release() {
        let pool = BufferPool::new(32);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    let a = pool.allocate();
                    let b = pool.allocate();
                    drop(a);
                    drop(b);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.num_allocated(), 0);
        assert_eq!(pool.num_available(), pool.num_pooled());
    }

    #[test]
    fn blob_append_and_erase_preserve_length() {
        let pool = BufferPool::new(16);
        let mut blob = Blob::new();
        let payload: Vec<u8> = (0..50u8).collect();
        blob.append_bytes(&pool, &payload);

        assert_eq!(blob.len(), 50);
        assert_eq!(blob.num_slices(), 4);
        assert_eq!(blob.copy_to_vec(), payload);

        blob.erase_front(20);
        assert_eq!(blob.len(), 30);
        // First 16-byte slice fully consumed, second trimmed to 12 bytes.
        assert_eq!(blob.num_slices(), 3);
        assert_eq!(blob.copy_to_vec(), payload[20..]);
    }

    #[test]
    fn blob_split_front_shares_buffers() {
        let pool = BufferPool::new(16);
        let mut blob = Blob::new();
        let payload: Vec<u8> = (0..40u8).collect();
        blob.append_bytes(&pool, &payload);

        let head = blob.split_front(24);
        assert_eq!(head.len(), 24);
        assert_eq!(blob.len(), 16);
        assert_eq!(head.copy_to_vec(), payload[..24]);
        assert_eq!(blob.copy_to_vec(), payload[24..]);
    }

    #[test]
    fn data_erase_front_advances_file_region() {
        let mut data = Data::File(FileRegion { fd: 3, offset: 100, remaining: 50 });
        assert_eq!(data.len(), 50);
        data.erase_front(20);
        match data {
            Data::File(region) => {
                assert_eq!(region.offset, 120);
                assert_eq!(region.remaining, 30);
            }
            _ => unreachable!(),
        }
    }
}
