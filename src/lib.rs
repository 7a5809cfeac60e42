#![allow(clippy::missing_safety_doc)]

//! A concurrent memory allocator built from 64KB spans.
//!
//! Spans are carved into per-size-class blocks; the owning span of any block
//! is recovered by masking the address, so free paths never consult a map.
//! Each thread binds to an arena (its own in [`ThreadLocalHandler`] mode, a
//! pooled one under [`SharedHandler`]); foreign frees ride lock-free
//! deferred lists, and emptied spans flow through per-arena and global
//! caches before the backing pages are returned.
//!
//! ```no_run
//! use spanalloc::{Allocator, Config, PageAllocator, ThreadLocalHandler};
//!
//! #[global_allocator]
//! static ALLOC: Allocator = Allocator::<PageAllocator, ThreadLocalHandler>::new(Config::DEFAULT);
//! ```

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull, null_mut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

mod arena;
mod backing;
mod classes;
mod config;
mod global_cache;
mod handler;
mod queue;
mod span;

pub use crate::arena::{Arena, ArenaMode, Shared, SingleThreaded, ThreadLocal};
pub use crate::backing::{BackingAllocator, PageAllocator};
pub use crate::classes::{LARGE_MAX, MEDIUM_MAX, PAGE_SIZE, SMALL_MAX, SPAN_MAX, SPAN_SIZE};
pub use crate::config::Config;
pub use crate::handler::{
  ArenaHandler, LocalMode, MAX_HANDLER_SLOTS, SharedHandler, ThreadLocalHandler,
};

use crate::classes::{SMALL_GRANULARITY, align_up};
use crate::span::Span;

// =============================================================================
// Facade
// =============================================================================

/// The allocator facade: computes the size regime and forwards to an arena.
///
/// Thread-safe for any handler; `Drop` (or [`Allocator::deinit`]) returns
/// every reusable span to the backing allocator and reports what is still
/// mapped.
pub struct Allocator<B: BackingAllocator = PageAllocator, H: ArenaHandler = ThreadLocalHandler> {
  config: Config,
  backing: B,
  handler: H,
  huge_count: AtomicUsize,
  torn_down: AtomicBool,
}

/// Pooled-arena flavor: any thread may serve any arena under its writer lock.
pub type SharedAllocator<B = PageAllocator> = Allocator<B, SharedHandler>;
/// Single-threaded flavor: same structure minus the cross-thread machinery.
pub type SingleThreadedAllocator<B = PageAllocator> =
  Allocator<B, ThreadLocalHandler<SingleThreaded>>;

impl Allocator {
  pub const fn new(config: Config) -> Self {
    Allocator::with_parts(config, PageAllocator, ThreadLocalHandler::new())
  }
}

impl SharedAllocator {
  pub const fn new(config: Config) -> Self {
    Allocator::with_parts(config, PageAllocator, SharedHandler::new())
  }
}

impl SingleThreadedAllocator {
  pub const fn new(config: Config) -> Self {
    Allocator::with_parts(config, PageAllocator, ThreadLocalHandler::new())
  }
}

impl<B: BackingAllocator, H: ArenaHandler> Allocator<B, H> {
  pub const fn with_parts(config: Config, backing: B, handler: H) -> Self {
    Allocator {
      config,
      backing,
      handler,
      huge_count: AtomicUsize::new(0),
      torn_down: AtomicBool::new(false),
    }
  }

  // ===========================================================================
  // Allocation
  // ===========================================================================

  pub fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
    let size = layout.size().max(1);
    let align = layout.align();
    if align <= SMALL_GRANULARITY {
      if size > LARGE_MAX {
        return self.allocate_huge(size);
      }
      return self.with_arena(|arena| unsafe { arena.allocate(size, &self.config, &self.backing) });
    }
    self.allocate_aligned(size, align)
  }

  /// Over-aligned requests allocate `size + align` and slide the pointer up;
  /// the span remembers that block starts left the class stride.
  fn allocate_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
    if align >= SPAN_SIZE {
      return None; // alignment ceiling; the span mask could not recover it
    }
    let padded = size.checked_add(align)?;
    if padded > LARGE_MAX {
      // Backing pages satisfy up to page alignment; finer placement would
      // not be recoverable at free time.
      return if align <= PAGE_SIZE { self.allocate_huge(size) } else { None };
    }
    let block =
      self.with_arena(|arena| unsafe { arena.allocate(padded, &self.config, &self.backing) })?;
    let addr = block.as_ptr() as usize;
    let aligned = align_up(addr, align);
    if aligned != addr {
      let span = unsafe { &*Span::of_block(block.as_ptr()) };
      span.aligned_blocks.store(true, Ordering::Relaxed);
    }
    NonNull::new(aligned as *mut u8)
  }

  /// Huge requests bypass spans entirely: one backing reservation per
  /// allocation, dispatched by the caller's size from then on.
  #[inline(never)]
  fn allocate_huge(&self, size: usize) -> Option<NonNull<u8>> {
    let alloc_size = huge_alloc_size(size)?;
    let ptr = self.backing.raw_alloc(alloc_size, PAGE_SIZE)?;
    self.huge_count.fetch_add(1, Ordering::Relaxed);
    Some(ptr)
  }

  fn with_arena<R>(&self, f: impl FnOnce(&Arena<H::Mode>) -> Option<R>) -> Option<R> {
    let arena = self.handler.acquire_arena(&self.config, &self.backing)?;
    let result = f(unsafe { arena.as_ref() });
    self.handler.release_arena(arena);
    result
  }

  // ===========================================================================
  // Free
  // ===========================================================================

  /// `layout` is a hint: the span recovered from the address is canonical,
  /// except for huge pointers, which have no span and trust the size.
  pub unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
    let size = layout.size().max(1);
    if is_huge_request(size, layout.align()) {
      unsafe { self.free_huge(ptr, size) };
      return;
    }
    let span_ptr = Span::of_block(ptr.as_ptr());
    let span = unsafe { &*span_ptr };
    let arena = unsafe { &*(span.arena.get() as *const Arena<H::Mode>) };
    if span.class.get().block_max == 1 {
      unsafe { arena.free_one_block_span(span_ptr, &self.config, &self.backing) };
      return;
    }
    let block = span.block_start_of(ptr.as_ptr() as usize);
    if arena.try_acquire() {
      unsafe { arena.free_block_owned(span, block) };
      arena.release();
    } else {
      unsafe { arena.free_block_foreign(span, block) };
    }
  }

  unsafe fn free_huge(&self, ptr: NonNull<u8>, size: usize) {
    let Some(alloc_size) = huge_alloc_size(size) else {
      debug_assert!(false, "freeing a huge allocation that could not exist");
      return;
    };
    unsafe { self.backing.raw_free(ptr, alloc_size, PAGE_SIZE) };
    self.huge_count.fetch_sub(1, Ordering::Relaxed);
  }

  // ===========================================================================
  // Resize
  // ===========================================================================

  /// In-place grow/shrink. Succeeds iff the new size fits the block (small/
  /// medium), the span's reservation slice (one-block spans), or the
  /// page-granular ceiling of the current reservation (huge).
  pub unsafe fn resize(
    &self,
    ptr: NonNull<u8>,
    old_size: usize,
    new_size: usize,
    align: usize,
  ) -> bool {
    let old_size = old_size.max(1);
    let new_size = new_size.max(1);
    if ptr.as_ptr() as usize % align != 0 {
      return false;
    }
    if is_huge_request(old_size, align) {
      // Nearest page-aligned ceiling of the existing reservation. The new
      // size must stay in the huge regime or later frees would go span
      // hunting in headerless memory.
      let capacity = ((old_size - 1) / PAGE_SIZE) * PAGE_SIZE + PAGE_SIZE;
      return new_size <= capacity && is_huge_request(new_size, align);
    }

    let span = unsafe { &*Span::of_block(ptr.as_ptr()) };
    let addr = ptr.as_ptr() as usize;
    let offset = addr - span.block_start_of(addr);
    let class = span.class.get();
    let capacity = if class.block_max > 1 {
      class.block_size as usize
    } else {
      span.alloc_size.get() - (span.data_start() - span.initial_ptr.get() as usize)
    };
    offset + new_size <= capacity
  }

  /// In-place remap: the pointer survives iff `resize` would succeed;
  /// otherwise the caller allocates, copies and frees.
  pub unsafe fn remap(
    &self,
    ptr: NonNull<u8>,
    old_size: usize,
    new_size: usize,
    align: usize,
  ) -> Option<NonNull<u8>> {
    if unsafe { self.resize(ptr, old_size, new_size, align) } {
      Some(ptr)
    } else {
      None
    }
  }

  /// Bytes actually reserved behind `ptr`.
  pub unsafe fn usable_size(&self, ptr: NonNull<u8>, size: usize, align: usize) -> usize {
    let size = size.max(1);
    if is_huge_request(size, align) {
      return huge_alloc_size(size).unwrap_or(size);
    }
    let span = unsafe { &*Span::of_block(ptr.as_ptr()) };
    let addr = ptr.as_ptr() as usize;
    let offset = addr - span.block_start_of(addr);
    let class = span.class.get();
    if class.block_max > 1 {
      class.block_size as usize - offset
    } else {
      span.alloc_size.get() - (span.data_start() - span.initial_ptr.get() as usize) - offset
    }
  }

  // ===========================================================================
  // Accounting & teardown
  // ===========================================================================

  /// Spans currently mapped for this allocator (cached ones included).
  pub fn mapped_spans(&self) -> usize {
    self.handler.mapped_spans()
  }

  /// Live huge allocations.
  pub fn huge_allocations(&self) -> usize {
    self.huge_count.load(Ordering::Relaxed)
  }

  /// Tear down now and report what stayed mapped: spans with live blocks
  /// plus unfreed huge allocations. Zero means every allocation came back.
  pub fn deinit(self) -> usize {
    self.deinit_inner()
  }

  fn deinit_inner(&self) -> usize {
    if self.torn_down.swap(true, Ordering::AcqRel) {
      return 0;
    }
    let spans = unsafe { self.handler.deinit(&self.config, &self.backing) };
    let huge = self.huge_count.load(Ordering::Relaxed);
    if self.config.report_leaks && (spans > 0 || huge > 0) {
      log::warn!(
        "allocator torn down with {spans} spans and {huge} huge allocations still mapped"
      );
    } else {
      log::debug!("allocator torn down clean");
    }
    spans + huge
  }
}

impl<B: BackingAllocator, H: ArenaHandler> Drop for Allocator<B, H> {
  fn drop(&mut self) {
    self.deinit_inner();
  }
}

// =============================================================================
// Regime helpers
// =============================================================================

/// Huge-regime predicate; alloc and free must agree on it, which is why it
/// keys on the same `(size, align)` pair the caller passed both times.
#[inline(always)]
fn is_huge_request(size: usize, align: usize) -> bool {
  if align <= SMALL_GRANULARITY {
    size > LARGE_MAX
  } else {
    size.saturating_add(align) > LARGE_MAX
  }
}

#[inline(always)]
fn huge_alloc_size(size: usize) -> Option<usize> {
  size.checked_add(PAGE_SIZE - 1).map(|s| s & !(PAGE_SIZE - 1))
}

// =============================================================================
// GlobalAlloc
// =============================================================================

unsafe impl<B: BackingAllocator, H: ArenaHandler> GlobalAlloc for Allocator<B, H> {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    self
      .allocate(layout)
      .map(|p| p.as_ptr())
      .unwrap_or(null_mut())
  }

  unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
    if let Some(ptr) = NonNull::new(ptr) {
      unsafe { self.deallocate(ptr, layout) };
    }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    let Some(old_ptr) = NonNull::new(ptr) else {
      return unsafe {
        self.alloc(Layout::from_size_align_unchecked(new_size.max(1), layout.align()))
      };
    };
    if new_size == 0 {
      unsafe { self.deallocate(old_ptr, layout) };
      return null_mut();
    }

    if unsafe { self.resize(old_ptr, layout.size(), new_size, layout.align()) } {
      return ptr;
    }

    let new_ptr =
      unsafe { self.alloc(Layout::from_size_align_unchecked(new_size, layout.align())) };
    if !new_ptr.is_null() {
      unsafe {
        ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
        self.deallocate(old_ptr, layout);
      }
    }
    new_ptr
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) }
    }
    ptr
  }
}
