//! First-fit allocation over raw OS page mappings.
//!
//! Every block is its own anonymous mapping, with a fixed 16-byte header
//! just ahead of the payload. Released interior blocks are flagged and
//! reused in place; only the chain tail is ever physically returned to the
//! OS. Blocks are never split or coalesced, and a block keeps its capacity
//! for life.

#![allow(clippy::missing_safety_doc)]

use core::{
  alloc::{GlobalAlloc, Layout},
  fmt,
  mem::{align_of, size_of},
  ptr::{self, NonNull, null_mut},
};
use std::sync::{Mutex, MutexGuard, PoisonError};

// =============================================================================
// Constants
// =============================================================================

/// Bytes reserved ahead of every payload for the in-mapping block header.
const BLOCK_HEADER_SIZE: usize = 16;
/// Magic number to identify valid BlockHeaders
const BLOCK_MAGIC: u32 = 0x4D41_5031; // "MAP1"

/// Maximum concurrently live blocks per context. One block per mapping, so
/// this caps bookkeeping, not payload bytes.
const BLOCK_CAPACITY: usize = 16384;

/// Sentinel slot index: empty chain, tail's `next`, end of the vacant list.
const SLOT_NONE: u32 = u32::MAX;

/// Largest payload alignment served. Mapping bases are at least page
/// aligned, so any power of two up to this is reachable by front padding.
const MAX_ALIGN: usize = 4096;

/// Bytes of the entry-table mapping.
const TABLE_BYTES: usize = BLOCK_CAPACITY * size_of::<BlockEntry>();

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(size_of::<BlockHeader>() == BLOCK_HEADER_SIZE);
const _: () = assert!(align_of::<BlockHeader>() <= BLOCK_HEADER_SIZE);
const _: () = assert!(size_of::<BlockEntry>() == 24);
const _: () = assert!(BLOCK_CAPACITY < SLOT_NONE as usize);
const _: () = assert!(TABLE_BYTES % 4096 == 0);
const _: () = assert!(MAX_ALIGN.is_power_of_two() && MAX_ALIGN >= BLOCK_HEADER_SIZE);
const _: () = assert!(MAX_ALIGN <= u16::MAX as usize); // pad fits BlockEntry.pad

// =============================================================================
// Errors
// =============================================================================

/// Failure modes of the allocation API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
  /// A zero size or element count was passed where a positive value is
  /// required.
  ZeroSize,
  /// The request, including header overhead or `count * elem_size`, does not
  /// fit in `usize`.
  Overflow,
  /// The OS refused the mapping, or the block table is full.
  OutOfMemory,
}

impl fmt::Display for AllocError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      AllocError::ZeroSize => f.write_str("zero-size allocation request"),
      AllocError::Overflow => f.write_str("allocation size overflows usize"),
      AllocError::OutOfMemory => f.write_str("out of memory"),
    }
  }
}

impl std::error::Error for AllocError {}

// =============================================================================
// Types
// =============================================================================

/// In-mapping block metadata. Sits in the `BLOCK_HEADER_SIZE` bytes just
/// ahead of the payload.
#[repr(C)]
struct BlockHeader {
  /// Magic number for validation.
  magic: u32,
  /// Owning entry in the block table.
  slot: u32,
  /// Payload bytes (mirror of the entry's size).
  size: usize,
}

/// Authoritative block bookkeeping. Lives in the context-owned table, never
/// inside the mapping it describes.
#[repr(C)]
struct BlockEntry {
  /// Mapping base. Null marks a vacant slot.
  base: *mut u8,
  /// Payload bytes. Fixed at creation; reuse never shrinks it.
  size: usize,
  /// Next block in creation order, or the vacant-list link.
  next: u32,
  /// Payload offset from `base`: 16 by default, the requested alignment for
  /// over-aligned blocks. The header fills the last 16 pad bytes.
  pad: u16,
  /// Reusable by a future acquire.
  is_free: bool,
}

// =============================================================================
// Platform
// =============================================================================

unsafe fn map_pages(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn unmap_pages(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

// =============================================================================
// Chain
// =============================================================================

/// Mutable allocator state: the block table plus the chain endpoints.
///
/// The table is a flat array of `BLOCK_CAPACITY` entries in a dedicated
/// mapping, created on first use. Bookkeeping never touches the process
/// heap, so the allocator can stand in for it.
struct Chain {
  /// Entry-table mapping. Null until the first acquire.
  entries: *mut BlockEntry,
  /// Head of the vacant-slot list threaded through `next`.
  vacant: u32,
  /// Slots handed out so far. Entries at or above this index are untouched.
  high: u32,
  /// Oldest live block.
  head: u32,
  /// Most recently created live block. Only this one is ever unmapped.
  tail: u32,
}

// Raw pointers keep Chain from being Send automatically. All access goes
// through the owning MapAlloc's mutex.
unsafe impl Send for Chain {}

impl Chain {
  const fn new() -> Self {
    Chain {
      entries: null_mut(),
      vacant: SLOT_NONE,
      high: 0,
      head: SLOT_NONE,
      tail: SLOT_NONE,
    }
  }

  fn entry(&self, slot: u32) -> &BlockEntry {
    debug_assert!(slot < self.high);
    unsafe { &*self.entries.add(slot as usize) }
  }

  fn entry_mut(&mut self, slot: u32) -> &mut BlockEntry {
    debug_assert!(slot < self.high);
    unsafe { &mut *self.entries.add(slot as usize) }
  }

  /// Maps the entry table on first use.
  fn ensure_table(&mut self) -> Result<(), AllocError> {
    if !self.entries.is_null() {
      return Ok(());
    }
    let raw = unsafe { map_pages(TABLE_BYTES) };
    if raw.is_null() {
      return Err(AllocError::OutOfMemory);
    }
    self.entries = raw.cast();
    Ok(())
  }

  /// Takes a vacant slot, recycled first, fresh otherwise.
  fn take_slot(&mut self) -> Option<u32> {
    if self.vacant != SLOT_NONE {
      let slot = self.vacant;
      self.vacant = self.entry(slot).next;
      return Some(slot);
    }
    if (self.high as usize) < BLOCK_CAPACITY {
      let slot = self.high;
      self.high += 1;
      return Some(slot);
    }
    None
  }

  /// Returns a slot to the vacant list.
  fn vacate_slot(&mut self, slot: u32) {
    let vacant = self.vacant;
    let e = self.entry_mut(slot);
    e.base = null_mut();
    e.size = 0;
    e.pad = 0;
    e.is_free = false;
    e.next = vacant;
    self.vacant = slot;
  }

  /// First-fit scan: earliest free block with capacity for `size` whose
  /// payload sits on an `align` boundary, or None.
  fn find_free(&self, size: usize, align: usize) -> Option<u32> {
    let mut slot = self.head;
    while slot != SLOT_NONE {
      let e = self.entry(slot);
      if e.is_free && e.size >= size && (e.base as usize + e.pad as usize) % align == 0 {
        return Some(slot);
      }
      slot = e.next;
    }
    None
  }

  /// Appends a freshly created block at the tail.
  fn push_tail(&mut self, slot: u32) {
    self.entry_mut(slot).next = SLOT_NONE;
    if self.head == SLOT_NONE {
      self.head = slot;
    } else {
      let tail = self.tail;
      self.entry_mut(tail).next = slot;
    }
    self.tail = slot;
  }

  /// Unlinks the current tail and names its predecessor the new tail.
  fn detach_tail(&mut self) {
    let old = self.tail;
    debug_assert!(old != SLOT_NONE);
    if self.head == old {
      self.head = SLOT_NONE;
      self.tail = SLOT_NONE;
      return;
    }
    let mut slot = self.head;
    while self.entry(slot).next != old {
      slot = self.entry(slot).next;
    }
    self.entry_mut(slot).next = SLOT_NONE;
    self.tail = slot;
  }

  /// Recovers the owning slot for a payload pointer, cross-checking the
  /// in-mapping header against the table. None for pointers this context
  /// does not currently own.
  unsafe fn resolve(&self, payload: *mut u8) -> Option<u32> {
    let header = unsafe { payload.sub(BLOCK_HEADER_SIZE).cast::<BlockHeader>().read() };
    if header.magic != BLOCK_MAGIC || header.slot >= self.high {
      return None;
    }
    let e = self.entry(header.slot);
    if e.base.is_null() || e.is_free {
      return None;
    }
    if unsafe { e.base.add(e.pad as usize) } != payload {
      return None;
    }
    debug_assert!(e.size == header.size);
    Some(header.slot)
  }
}

// =============================================================================
// MapAlloc
// =============================================================================

/// A first-fit allocator over raw OS page mappings.
///
/// Every block lives in its own anonymous mapping, with a 16-byte header
/// ahead of the payload. Blocks form a creation-ordered chain: release flags
/// interior blocks for in-place reuse and physically unmaps only the chain
/// tail, so a long-lived early block pins nothing but its own pages.
///
/// All methods serialize on one internal lock. `new` is const, so contexts
/// work as statics; [`global`] is a shared one.
pub struct MapAlloc {
  inner: Mutex<Chain>,
}

impl MapAlloc {
  /// Creates an empty allocator. No pages are mapped until the first
  /// acquire.
  pub const fn new() -> Self {
    MapAlloc {
      inner: Mutex::new(Chain::new()),
    }
  }

  fn chain(&self) -> MutexGuard<'_, Chain> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Allocates `size` bytes, reusing the earliest sufficiently large free
  /// block before mapping fresh pages.
  ///
  /// Reused blocks keep their original (possibly larger) capacity and carry
  /// stale contents. Payloads are 16-byte aligned.
  pub fn malloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
    self.malloc_aligned(size, BLOCK_HEADER_SIZE)
  }

  /// Allocation core. `align` beyond the 16-byte default moves the payload
  /// to `align` bytes past the page-aligned mapping base; the header always
  /// occupies the 16 bytes just ahead of the payload.
  fn malloc_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
    debug_assert!(align.is_power_of_two() && align <= MAX_ALIGN);
    if size == 0 {
      return Err(AllocError::ZeroSize);
    }
    let pad = align.max(BLOCK_HEADER_SIZE);

    let mut chain = self.chain();

    if let Some(slot) = chain.find_free(size, pad) {
      let e = chain.entry_mut(slot);
      e.is_free = false;
      let payload = unsafe { e.base.add(e.pad as usize) };
      return Ok(unsafe { NonNull::new_unchecked(payload) });
    }

    let total = pad.checked_add(size).ok_or(AllocError::Overflow)?;
    chain.ensure_table()?;
    let Some(slot) = chain.take_slot() else {
      return Err(AllocError::OutOfMemory);
    };

    let base = unsafe { map_pages(total) };
    if base.is_null() {
      chain.vacate_slot(slot);
      return Err(AllocError::OutOfMemory);
    }

    unsafe {
      base
        .add(pad - BLOCK_HEADER_SIZE)
        .cast::<BlockHeader>()
        .write(BlockHeader {
          magic: BLOCK_MAGIC,
          slot,
          size,
        });
    }

    let e = chain.entry_mut(slot);
    e.base = base;
    e.size = size;
    e.pad = pad as u16;
    e.is_free = false;
    chain.push_tail(slot);

    Ok(unsafe { NonNull::new_unchecked(base.add(pad)) })
  }

  /// Allocates a zero-filled array of `count` elements of `elem_size` bytes
  /// each.
  ///
  /// The total is `count * elem_size` with overflow checking. The fill
  /// covers the whole request even when a larger free block is reused.
  pub fn calloc(&self, count: usize, elem_size: usize) -> Result<NonNull<u8>, AllocError> {
    if count == 0 || elem_size == 0 {
      return Err(AllocError::ZeroSize);
    }
    let total = count.checked_mul(elem_size).ok_or(AllocError::Overflow)?;
    let ptr = self.malloc(total)?;
    unsafe { ptr::write_bytes(ptr.as_ptr(), 0, total) };
    Ok(ptr)
  }

  /// Resizes the block at `ptr` to hold at least `new_size` bytes.
  ///
  /// A null `ptr` or a zero `new_size` makes this exactly `malloc(new_size)`;
  /// in particular `realloc(p, 0)` fails with [`AllocError::ZeroSize`] and
  /// leaves `p` live. A request within the block's recorded capacity returns
  /// `ptr` unchanged. Growing copies the recorded capacity worth of bytes
  /// into a new block and releases the old one; on failure the old block is
  /// untouched and still owned by the caller.
  ///
  /// # Safety
  /// A non-null `ptr` must have been returned by this allocator and not yet
  /// released. When the result is a different address, `ptr` is invalidated.
  pub unsafe fn realloc(&self, ptr: *mut u8, new_size: usize) -> Result<NonNull<u8>, AllocError> {
    unsafe { self.realloc_aligned(ptr, new_size, BLOCK_HEADER_SIZE) }
  }

  /// Resize core. A moved payload is placed with `align`; an in-place result
  /// keeps the placement `ptr` was created with.
  unsafe fn realloc_aligned(
    &self,
    ptr: *mut u8,
    new_size: usize,
    align: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    if ptr.is_null() || new_size == 0 {
      return self.malloc_aligned(new_size, align);
    }

    let old_size = {
      let chain = self.chain();
      let Some(slot) = (unsafe { chain.resolve(ptr) }) else {
        debug_assert!(false, "realloc of a pointer not owned by this allocator");
        return Err(AllocError::OutOfMemory);
      };
      let size = chain.entry(slot).size;
      if size >= new_size {
        return Ok(unsafe { NonNull::new_unchecked(ptr) });
      }
      size
    };

    // The caller owns `ptr` exclusively, so its block cannot change between
    // the lookup above and the release below.
    let new_ptr = self.malloc_aligned(new_size, align)?;
    unsafe {
      ptr::copy_nonoverlapping(ptr, new_ptr.as_ptr(), old_size);
      self.free(ptr);
    }
    Ok(new_ptr)
  }

  /// Releases the block at `ptr`.
  ///
  /// The chain tail is physically unmapped and its slot recycled; any other
  /// block is flagged for reuse with its pages kept mapped. Null is a no-op.
  ///
  /// # Safety
  /// A non-null `ptr` must have been returned by this allocator and must not
  /// be used after this call. Releasing the same pointer twice is a caller
  /// defect. Debug builds assert while the stale header is still readable; a
  /// pointer whose pages already went back to the OS faults on the header
  /// read in any build.
  pub unsafe fn free(&self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }

    let mut chain = self.chain();
    let Some(slot) = (unsafe { chain.resolve(ptr) }) else {
      debug_assert!(false, "free of a pointer not owned by this allocator");
      return;
    };

    if slot == chain.tail {
      chain.detach_tail();
      let (base, total) = {
        let e = chain.entry(slot);
        (e.base, e.pad as usize + e.size)
      };
      unsafe { unmap_pages(base, total) };
      chain.vacate_slot(slot);
    } else {
      chain.entry_mut(slot).is_free = true;
    }
  }
}

impl Default for MapAlloc {
  fn default() -> Self {
    Self::new()
  }
}

impl Drop for MapAlloc {
  /// Context teardown: every still-mapped block and the table go back to
  /// the OS. Outstanding payload pointers are invalidated.
  fn drop(&mut self) {
    let chain = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
    if chain.entries.is_null() {
      return;
    }
    for slot in 0..chain.high {
      let e = chain.entry(slot);
      if !e.base.is_null() {
        unsafe { unmap_pages(e.base, e.pad as usize + e.size) };
      }
    }
    unsafe { unmap_pages(chain.entries.cast(), TABLE_BYTES) };
  }
}

// =============================================================================
// Global instance
// =============================================================================

static GLOBAL: MapAlloc = MapAlloc::new();

/// The process-wide context shared by [`GlobalMapAlloc`] and the C API.
/// Starts empty; its first acquire maps the block table.
pub fn global() -> &'static MapAlloc {
  &GLOBAL
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// Adapter driving the [`global`] context as the Rust global allocator.
///
/// Alignments up to the page size are served by padding the payload away
/// from the page-aligned mapping base; anything larger is refused with
/// null. Zero-size layouts get a dangling, well-aligned pointer that
/// `dealloc` recognizes and skips.
pub struct GlobalMapAlloc;

unsafe impl GlobalAlloc for GlobalMapAlloc {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if layout.size() == 0 {
      return layout.align() as *mut u8;
    }
    if layout.align() > MAX_ALIGN {
      return null_mut();
    }
    match global().malloc_aligned(layout.size(), layout.align()) {
      Ok(p) => p.as_ptr(),
      Err(_) => null_mut(),
    }
  }

  unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
    if layout.size() == 0 {
      return;
    }
    unsafe { global().free(ptr) };
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() > MAX_ALIGN {
      return null_mut();
    }
    if layout.size() == 0 {
      // The old "allocation" was the dangling zero-size marker.
      return unsafe { self.alloc(Layout::from_size_align_unchecked(new_size, layout.align())) };
    }
    if new_size == 0 {
      // A zero new_size is outside the trait contract.
      return null_mut();
    }
    match unsafe { global().realloc_aligned(ptr, new_size, layout.align()) } {
      Ok(p) => p.as_ptr(),
      Err(_) => null_mut(),
    }
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.size() == 0 {
      return layout.align() as *mut u8;
    }
    if layout.align() > MAX_ALIGN {
      return null_mut();
    }
    if layout.align() <= BLOCK_HEADER_SIZE {
      return match global().calloc(1, layout.size()) {
        Ok(p) => p.as_ptr(),
        Err(_) => null_mut(),
      };
    }
    // Over-aligned requests may reuse a dirty block; wipe by hand.
    match global().malloc_aligned(layout.size(), layout.align()) {
      Ok(p) => {
        unsafe { ptr::write_bytes(p.as_ptr(), 0, layout.size()) };
        p.as_ptr()
      }
      Err(_) => null_mut(),
    }
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  match global().malloc(size) {
    Ok(p) => p.as_ptr(),
    Err(_) => null_mut(),
  }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  match global().calloc(nmemb, size) {
    Ok(p) => p.as_ptr(),
    Err(_) => null_mut(),
  }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  match unsafe { global().realloc(ptr, size) } {
    Ok(p) => p.as_ptr(),
    Err(_) => null_mut(),
  }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  unsafe { global().free(ptr) };
}

// =============================================================================
// Tests
// =============================================================================
