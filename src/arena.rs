//! Arenas: per-thread (or pooled) owners of spans.
//!
//! An arena routes requests by size regime, keeps per-class partial-span
//! lists, reconciles foreign frees, and sources spans through a tiered cache
//! hierarchy before falling back to the backing allocator.

use core::cell::Cell;
use core::marker::PhantomData;
use core::mem::size_of;
use core::ptr::{NonNull, null_mut};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crate::backing::BackingAllocator;
use crate::classes::{
  LARGE_CLASS_COUNT, LARGE_MAX, MEDIUM_MAX, PAGE_SIZE, SIZE_CLASS_COUNT, SPAN_MAX, SPAN_SIZE,
  SizeClass, align_up, size_class_of, span_class_of, span_count_of,
};
use crate::config::Config;
use crate::global_cache::GlobalSpanCache;
use crate::handler::thread_id_u32;
use crate::queue::{BoundedMpmcQueue, BoundedMpscQueue};
use crate::span::{DeferredSpanList, FREE_LIST_NULL, Span, SpanList};

// =============================================================================
// Modes
// =============================================================================

/// Compile-time arena flavor. The handler strategies and the single-thread
/// relaxation monomorphize through this instead of branching at runtime.
pub trait ArenaMode: 'static {
  /// Arenas are pooled; ownership is taken with the writer lock.
  const SHARED: bool;
  /// Foreign threads may free into this arena.
  const THREAD_SAFE: bool;
}

/// One arena per thread; the writer lock degenerates to a thread-id check.
pub enum ThreadLocal {}
/// Arenas are shared through a pool and acquired per operation.
pub enum Shared {}
/// Single-threaded client; like `ThreadLocal` minus cross-thread traffic.
pub enum SingleThreaded {}

impl ArenaMode for ThreadLocal {
  const SHARED: bool = false;
  const THREAD_SAFE: bool = true;
}
impl ArenaMode for Shared {
  const SHARED: bool = true;
  const THREAD_SAFE: bool = true;
}
impl ArenaMode for SingleThreaded {
  const SHARED: bool = false;
  const THREAD_SAFE: bool = false;
}

/// Map-cache buckets are keyed by span count, clamped into the last bucket;
/// consumers read the actual count before carving.
const MAP_CACHE_KEYS: usize = LARGE_CLASS_COUNT + 2;

// =============================================================================
// Arena
// =============================================================================

#[repr(C)]
pub struct Arena<M: ArenaMode> {
  writer_lock: AtomicBool,
  thread_id: Cell<u32>,
  chunk_size: usize,
  /// Per-class spans with free capacity, owner-managed.
  partial_spans: [SpanList; SIZE_CLASS_COUNT],
  /// Per-class spans transitioned full→not-full by foreign threads.
  deferred_partial_spans: [DeferredSpanList; SIZE_CLASS_COUNT],
  /// Single spans ready for rebinding. Foreign threads may push here.
  span_cache: BoundedMpmcQueue<*mut Span>,
  /// Multi-span spans by slot count; foreign producers, owner consumer.
  large_cache: [BoundedMpscQueue<*mut Span>; LARGE_CLASS_COUNT - 1],
  /// Freshly mapped spans awaiting carving, keyed by slot count.
  map_cache: [SpanList; MAP_CACHE_KEYS],
  /// Handler-wide count of mapped spans (leak accounting).
  span_counter: *const AtomicUsize,
  /// Null for shared-mode arenas.
  global_cache: *const GlobalSpanCache,
  pub(crate) next_arena: AtomicPtr<Arena<M>>,
  _mode: PhantomData<M>,
}

unsafe impl<M: ArenaMode> Send for Arena<M> {}
unsafe impl<M: ArenaMode> Sync for Arena<M> {}

impl<M: ArenaMode> Arena<M> {
  /// Bytes of backing memory one arena needs: the struct plus all ring
  /// buffers, page-granular.
  pub(crate) fn chunk_bytes(config: &Config) -> usize {
    align_up(
      size_of::<Arena<M>>()
        + BoundedMpmcQueue::<*mut Span>::buf_bytes(config.cache_limit)
        + (LARGE_CLASS_COUNT - 1)
          * BoundedMpscQueue::<*mut Span>::buf_bytes(config.large_cache_limit),
      PAGE_SIZE,
    )
  }

  /// Lay an arena out over `chunk` (at least `chunk_bytes` big, page
  /// aligned), carving the ring storage from the same chunk.
  pub(crate) unsafe fn init_at(
    chunk: *mut u8,
    chunk_size: usize,
    config: &Config,
    thread_id: u32,
    span_counter: *const AtomicUsize,
    global_cache: *const GlobalSpanCache,
  ) -> *mut Arena<M> {
    let arena = chunk as *mut Arena<M>;
    let mut buf = unsafe { chunk.add(size_of::<Arena<M>>()) };
    let span_cache = unsafe { BoundedMpmcQueue::init(buf, config.cache_limit) };
    buf = unsafe { buf.add(BoundedMpmcQueue::<*mut Span>::buf_bytes(config.cache_limit)) };
    let large_cache = core::array::from_fn(|_| {
      let queue = unsafe { BoundedMpscQueue::init(buf, config.large_cache_limit) };
      buf = unsafe {
        buf.add(BoundedMpscQueue::<*mut Span>::buf_bytes(config.large_cache_limit))
      };
      queue
    });
    unsafe {
      arena.write(Arena {
        writer_lock: AtomicBool::new(false),
        thread_id: Cell::new(thread_id),
        chunk_size,
        partial_spans: [const { SpanList::new() }; SIZE_CLASS_COUNT],
        deferred_partial_spans: [const { DeferredSpanList::new() }; SIZE_CLASS_COUNT],
        span_cache,
        large_cache,
        map_cache: [const { SpanList::new() }; MAP_CACHE_KEYS],
        span_counter,
        global_cache,
        next_arena: AtomicPtr::new(null_mut()),
        _mode: PhantomData,
      });
    }
    arena
  }

  pub(crate) unsafe fn create<B: BackingAllocator>(
    config: &Config,
    backing: &B,
    thread_id: u32,
    span_counter: *const AtomicUsize,
    global_cache: *const GlobalSpanCache,
  ) -> Option<*mut Arena<M>> {
    let size = Self::chunk_bytes(config);
    let chunk = backing.raw_alloc(size, PAGE_SIZE)?;
    Some(unsafe {
      Self::init_at(chunk.as_ptr(), size, config, thread_id, span_counter, global_cache)
    })
  }

  /// Release the arena's own storage. All spans must already be drained.
  pub(crate) unsafe fn destroy<B: BackingAllocator>(arena: *mut Arena<M>, backing: &B) {
    let size = unsafe { (*arena).chunk_size };
    unsafe {
      backing.raw_free(NonNull::new_unchecked(arena as *mut u8), size, PAGE_SIZE);
    }
  }

  // ===========================================================================
  // Ownership
  // ===========================================================================

  /// Non-blocking owner-role test. Shared mode: test-and-set on the writer
  /// lock. Thread-local mode: the bound thread already is the owner.
  #[inline]
  pub(crate) fn try_acquire(&self) -> bool {
    if !M::THREAD_SAFE {
      return true;
    }
    if M::SHARED {
      self
        .writer_lock
        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
    } else {
      self.thread_id.get() == thread_id_u32()
    }
  }

  #[inline]
  pub(crate) fn release(&self) {
    if M::SHARED {
      self.writer_lock.store(false, Ordering::Release);
    }
  }

  #[inline]
  fn counter(&self) -> &AtomicUsize {
    unsafe { &*self.span_counter }
  }

  #[inline]
  fn global(&self) -> Option<&GlobalSpanCache> {
    unsafe { self.global_cache.as_ref() }
  }

  #[inline]
  fn as_opaque(&self) -> *mut () {
    self as *const Self as *mut ()
  }

  // ===========================================================================
  // Allocation routing
  // ===========================================================================

  /// Route by regime. Huge requests never reach an arena.
  pub(crate) unsafe fn allocate<B: BackingAllocator>(
    &self,
    size: usize,
    config: &Config,
    backing: &B,
  ) -> Option<NonNull<u8>> {
    debug_assert!(size >= 1 && size <= LARGE_MAX);
    if size <= MEDIUM_MAX {
      unsafe { self.allocate_to_span(size_class_of(size), config, backing) }
    } else if size <= SPAN_MAX {
      unsafe { self.allocate_one_span(config, backing) }
    } else {
      unsafe { self.allocate_to_large_span(span_count_of(size), config, backing) }
    }
  }

  unsafe fn allocate_to_span<B: BackingAllocator>(
    &self,
    class: SizeClass,
    config: &Config,
    backing: &B,
  ) -> Option<NonNull<u8>> {
    let idx = class.class_idx as usize;
    if let Some(block) = unsafe { self.allocate_from_partials(idx) } {
      return Some(block);
    }
    unsafe { self.allocate_generic(class, config, backing) }
  }

  /// Serve from the head of the class's partial list, retiring spans that
  /// turn out to be full.
  unsafe fn allocate_from_partials(&self, idx: usize) -> Option<NonNull<u8>> {
    let list = &self.partial_spans[idx];
    loop {
      let head = list.head();
      if head.is_null() {
        return None;
      }
      let span = unsafe { &*head };
      if span.free_list.get() == FREE_LIST_NULL
        && span.deferred_frees.load(Ordering::Relaxed) > 0
      {
        unsafe { span.claim_deferred() };
      }
      if let Some(block) = unsafe { span.allocate_block() } {
        return Some(block);
      }

      // Capacity exhausted: mark full and retire. The swap orders with a
      // racing foreign clear, so re-check for a deferred free that landed
      // while we flipped; exactly one side republishes the span.
      unsafe { list.remove(head) };
      span.full.swap(true, Ordering::AcqRel);
      if span.deferred_frees.load(Ordering::Relaxed) > 0 && span.clear_full() {
        unsafe {
          span.claim_deferred();
          list.push_head(head);
        }
      }
    }
  }

  #[inline(never)]
  unsafe fn allocate_generic<B: BackingAllocator>(
    &self,
    class: SizeClass,
    config: &Config,
    backing: &B,
  ) -> Option<NonNull<u8>> {
    let idx = class.class_idx as usize;

    // Reclaim spans foreign threads un-fulled since the last miss.
    if unsafe { self.drain_deferred_partials(idx) } {
      if let Some(block) = unsafe { self.allocate_from_partials(idx) } {
        return Some(block);
      }
    }

    let span = unsafe { self.span_from_cache_or_new(config, backing) }?;
    let span_ref = unsafe { &*span };
    span_ref.init_for_class(class, self.as_opaque());
    unsafe { self.partial_spans[idx].push_head(span) };
    unsafe { span_ref.allocate_block() }
  }

  /// One swap takes the whole foreign-freed chain; relink it locally.
  unsafe fn drain_deferred_partials(&self, idx: usize) -> bool {
    let mut span = self.deferred_partial_spans[idx].take_all();
    if span.is_null() {
      return false;
    }
    while !span.is_null() {
      let next = unsafe { (*span).next.get() };
      unsafe { self.partial_spans[idx].push_head(span) };
      span = next;
    }
    true
  }

  unsafe fn allocate_one_span<B: BackingAllocator>(
    &self,
    config: &Config,
    backing: &B,
  ) -> Option<NonNull<u8>> {
    let span = unsafe { self.span_from_cache_or_new(config, backing) }?;
    let span_ref = unsafe { &*span };
    debug_assert!(span_ref.span_count.get() == 1);
    span_ref.init_for_class(span_class_of(1), self.as_opaque());
    unsafe { span_ref.allocate_block() }
  }

  unsafe fn allocate_to_large_span<B: BackingAllocator>(
    &self,
    count: usize,
    config: &Config,
    backing: &B,
  ) -> Option<NonNull<u8>> {
    debug_assert!((2..=LARGE_CLASS_COUNT).contains(&count));
    let overhead = (count as f64 * config.large_span_overhead_mul) as usize;
    let max_count = (count + overhead).min(LARGE_CLASS_COUNT);

    let span = match unsafe { self.large_span_from_caches(count, max_count, config, backing) } {
      Some(span) => span,
      None => unsafe { self.map_fresh_large(count, config, backing) }?,
    };
    let span_ref = unsafe { &*span };
    span_ref.init_for_class(span_class_of(span_ref.span_count.get() as usize), self.as_opaque());
    unsafe { span_ref.allocate_block() }
  }

  // ===========================================================================
  // Span sourcing
  // ===========================================================================

  /// The single-span sourcing ladder: own cache, harvested empties, map
  /// cache, split large, global cache, fresh mapping.
  unsafe fn span_from_cache_or_new<B: BackingAllocator>(
    &self,
    config: &Config,
    backing: &B,
  ) -> Option<*mut Span> {
    if let Some(span) = self.span_cache.try_read() {
      return Some(unsafe { self.take_single(span, config, backing) });
    }
    if let Some(span) = unsafe { self.harvest_empty_spans(config, backing) } {
      return Some(span);
    }
    if let Some(span) = unsafe { self.single_from_map_cache(config, backing) } {
      return Some(span);
    }
    if config.split_large_spans_to_one {
      for queue in &self.large_cache {
        if let Some(span) = unsafe { queue.try_read() } {
          return Some(unsafe { self.take_single(span, config, backing) });
        }
      }
    }
    if let Some(global) = self.global() {
      if let Some(span) = global.pop_single() {
        return Some(unsafe { self.take_single(span, config, backing) });
      }
    }
    unsafe { self.map_fresh_single(config, backing) }
  }

  /// Reduce a cached span to one slot, putting any tail back into the
  /// hierarchy. Single caches may hold recycled multi-slot spans.
  unsafe fn take_single<B: BackingAllocator>(
    &self,
    span: *mut Span,
    config: &Config,
    backing: &B,
  ) -> *mut Span {
    if unsafe { (*span).span_count.get() } > 1 {
      let rest = unsafe { (*span).split_first_spans_returning_remaining(1) };
      unsafe { self.stash_spans(rest, config, backing) };
    }
    span
  }

  unsafe fn single_from_map_cache<B: BackingAllocator>(
    &self,
    config: &Config,
    backing: &B,
  ) -> Option<*mut Span> {
    for bucket in &self.map_cache {
      let span = unsafe { bucket.pop_head() };
      if !span.is_null() {
        return Some(unsafe { self.take_single(span, config, backing) });
      }
    }
    None
  }

  /// Park spans that are mapped but not yet bound to a class.
  unsafe fn stash_spans<B: BackingAllocator>(&self, span: *mut Span, config: &Config, backing: &B) {
    let count = unsafe { (*span).span_count.get() as usize };
    if count == 1 {
      unsafe { self.cache_span_or_free(span, config, backing) };
    } else {
      let key = count.min(MAP_CACHE_KEYS - 1);
      unsafe { self.map_cache[key].push_head(span) };
    }
  }

  unsafe fn large_span_from_caches<B: BackingAllocator>(
    &self,
    count: usize,
    max_count: usize,
    config: &Config,
    backing: &B,
  ) -> Option<*mut Span> {
    // Exact or acceptably oversized from the own large caches.
    for c in count..=max_count {
      if let Some(span) = unsafe { self.large_cache[c - 2].try_read() } {
        return Some(span);
      }
    }

    // Freshly mapped spans big enough to carve.
    for key in count..MAP_CACHE_KEYS {
      let span = unsafe { self.map_cache[key].pop_head() };
      if span.is_null() {
        continue;
      }
      let have = unsafe { (*span).span_count.get() as usize };
      if have > max_count {
        let rest = unsafe { (*span).split_first_spans_returning_remaining(count) };
        unsafe { self.stash_spans(rest, config, backing) };
      }
      return Some(span);
    }

    // Split a bigger cached span, remainder re-cached as single or large.
    if config.split_large_spans_to_large {
      for c in (max_count + 1)..=LARGE_CLASS_COUNT {
        if let Some(span) = unsafe { self.large_cache[c - 2].try_read() } {
          let rest = unsafe { (*span).split_first_spans_returning_remaining(count) };
          if unsafe { (*rest).span_count.get() } == 1 {
            unsafe { self.cache_span_or_free(rest, config, backing) };
          } else {
            unsafe { self.cache_large_span_or_free(rest, false, config, backing) };
          }
          return Some(span);
        }
      }
    }

    if let Some(global) = self.global() {
      for c in count..=max_count {
        if let Some(span) = global.pop_large(c) {
          return Some(span);
        }
      }
    }
    None
  }

  /// Demote fully-freed spans from the partial lists into the single cache,
  /// keeping one for the caller. Running this twice back to back finds
  /// nothing the second time.
  unsafe fn harvest_empty_spans<B: BackingAllocator>(
    &self,
    config: &Config,
    backing: &B,
  ) -> Option<*mut Span> {
    let mut kept: *mut Span = null_mut();
    for list in &self.partial_spans {
      let mut cursor = list.head();
      while !cursor.is_null() {
        let next = unsafe { (*cursor).next.get() };
        let span = unsafe { &*cursor };
        if span.deferred_frees.load(Ordering::Relaxed) > 0 {
          unsafe { span.claim_deferred() };
        }
        if span.block_count.get() == 0 {
          unsafe { list.remove(cursor) };
          if kept.is_null() {
            kept = cursor;
          } else {
            unsafe { self.cache_span_or_free(cursor, config, backing) };
          }
        }
        cursor = next;
      }
    }
    (!kept.is_null()).then_some(kept)
  }

  // ===========================================================================
  // Mapping
  // ===========================================================================

  /// One backing reservation, span-aligned by front padding. A reservation
  /// that lands aligned keeps the padding slack as a bonus span.
  #[inline(never)]
  unsafe fn map_spans<B: BackingAllocator>(
    &self,
    desired: usize,
    config: &Config,
    backing: &B,
  ) -> Option<*mut Span> {
    let count = desired
      .max(config.map_alloc_count)
      .max((PAGE_SIZE / SPAN_SIZE).max(1));
    let alloc_size = (count + 1) * SPAN_SIZE;
    let raw = backing.raw_alloc(alloc_size, PAGE_SIZE)?;
    let base = align_up(raw.as_ptr() as usize, SPAN_SIZE);
    let usable = if base == raw.as_ptr() as usize { count + 1 } else { count };
    self.counter().fetch_add(usable, Ordering::Relaxed);
    Some(unsafe { Span::initialize_mapped(base as *mut u8, raw.as_ptr(), alloc_size, usable) })
  }

  unsafe fn map_fresh_single<B: BackingAllocator>(
    &self,
    config: &Config,
    backing: &B,
  ) -> Option<*mut Span> {
    let mut pre_carve = config.span_alloc_count.max(1);
    let span = unsafe { self.map_spans(pre_carve, config, backing) }?;
    let mut rest = null_mut();
    if unsafe { (*span).span_count.get() } > 1 {
      rest = unsafe { (*span).split_first_spans_returning_remaining(1) };
    }
    pre_carve -= 1;
    // Pre-carve singles into the cache so the next misses stay cheap.
    while pre_carve > 0 && !rest.is_null() {
      if unsafe { (*rest).span_count.get() } == 1 {
        unsafe { self.cache_span_or_free(rest, config, backing) };
        rest = null_mut();
        break;
      }
      let tail = unsafe { (*rest).split_first_spans_returning_remaining(1) };
      unsafe { self.cache_span_or_free(rest, config, backing) };
      rest = tail;
      pre_carve -= 1;
    }
    if !rest.is_null() {
      unsafe { self.stash_spans(rest, config, backing) };
    }
    Some(span)
  }

  unsafe fn map_fresh_large<B: BackingAllocator>(
    &self,
    count: usize,
    config: &Config,
    backing: &B,
  ) -> Option<*mut Span> {
    let span = unsafe { self.map_spans(count, config, backing) }?;
    if unsafe { (*span).span_count.get() as usize } > count {
      let rest = unsafe { (*span).split_first_spans_returning_remaining(count) };
      unsafe { self.stash_spans(rest, config, backing) };
    }
    Some(span)
  }

  // ===========================================================================
  // Free paths
  // ===========================================================================

  /// Owner free of a small/medium block. A span the owner un-fulls goes
  /// straight back to its partial list; empties stay until harvested.
  pub(crate) unsafe fn free_block_owned(&self, span: &Span, block: usize) {
    unsafe { span.free_block(block) };
    // `full` is only set by the owner, so the cheap guard load cannot miss
    // our own store; the swap still decides the episode against foreigners.
    if span.full.load(Ordering::Relaxed) && span.clear_full() {
      let idx = span.class.get().class_idx as usize;
      unsafe { self.partial_spans[idx].push_head(span as *const Span as *mut Span) };
    }
  }

  /// Foreign free of a small/medium block: deferred push, then at most one
  /// republish per full episode.
  pub(crate) unsafe fn free_block_foreign(&self, span: &Span, block: usize) {
    unsafe { span.push_deferred(block) };
    if span.clear_full() {
      let idx = span.class.get().class_idx as usize;
      unsafe {
        self.deferred_partial_spans[idx].push(span as *const Span as *mut Span);
      }
    }
  }

  /// Free a one-block span (single or multi-slot). Safe from any thread:
  /// the span is reachable only by the freeing caller, and the caches it
  /// lands in are concurrent.
  pub(crate) unsafe fn free_one_block_span<B: BackingAllocator>(
    &self,
    span: *mut Span,
    config: &Config,
    backing: &B,
  ) {
    let span_ref = unsafe { &*span };
    debug_assert!(span_ref.class.get().block_max == 1);
    debug_assert!(span_ref.block_count.get() == 1, "double free of span block");
    span_ref.block_count.set(0);
    if span_ref.span_count.get() == 1 {
      unsafe { self.cache_span_or_free(span, config, backing) };
    } else {
      unsafe {
        self.cache_large_span_or_free(span, config.recycle_large_spans, config, backing)
      };
    }
  }

  // ===========================================================================
  // Cache-or-release policy
  // ===========================================================================

  pub(crate) unsafe fn cache_span_or_free<B: BackingAllocator>(
    &self,
    span: *mut Span,
    _config: &Config,
    backing: &B,
  ) {
    if self.span_cache.try_write(span) {
      return;
    }
    if let Some(global) = self.global() {
      if global.push_single(span) {
        return;
      }
    }
    unsafe { self.free_span_to_backing(span, backing) };
  }

  pub(crate) unsafe fn cache_large_span_or_free<B: BackingAllocator>(
    &self,
    span: *mut Span,
    recycle: bool,
    _config: &Config,
    backing: &B,
  ) {
    let count = unsafe { (*span).span_count.get() as usize };
    debug_assert!((2..=LARGE_CLASS_COUNT).contains(&count));
    if self.large_cache[count - 2].try_write(span) {
      return;
    }
    if let Some(global) = self.global() {
      if global.push_large(span) {
        return;
      }
    }
    // Recycle bin: evicted large spans ride the single cache and get split
    // by whoever pulls them.
    if recycle && self.span_cache.try_write(span) {
      return;
    }
    unsafe { self.free_span_to_backing(span, backing) };
  }

  unsafe fn free_span_to_backing<B: BackingAllocator>(&self, span: *mut Span, backing: &B) {
    let span_ref = unsafe { &*span };
    self
      .counter()
      .fetch_sub(span_ref.span_count.get() as usize, Ordering::Relaxed);
    let initial = span_ref.initial_ptr.get();
    let size = span_ref.alloc_size.get();
    unsafe { backing.raw_free(NonNull::new_unchecked(initial), size, PAGE_SIZE) };
  }

  // ===========================================================================
  // Teardown
  // ===========================================================================

  /// Settle every reachable span and release the empty ones. Spans with
  /// live blocks are left mapped; the counter reports them as leaked.
  pub(crate) unsafe fn deinit<B: BackingAllocator>(&self, backing: &B) {
    for idx in 0..SIZE_CLASS_COUNT {
      unsafe { self.drain_deferred_partials(idx) };
    }
    for list in &self.partial_spans {
      let mut cursor = list.head();
      while !cursor.is_null() {
        let next = unsafe { (*cursor).next.get() };
        let span = unsafe { &*cursor };
        if span.deferred_frees.load(Ordering::Relaxed) > 0 {
          unsafe { span.claim_deferred() };
        }
        if span.block_count.get() == 0 {
          unsafe {
            list.remove(cursor);
            self.free_span_to_backing(cursor, backing);
          }
        }
        cursor = next;
      }
    }
    while let Some(span) = self.span_cache.try_read() {
      unsafe { self.free_span_to_backing(span, backing) };
    }
    for queue in &self.large_cache {
      while let Some(span) = unsafe { queue.try_read() } {
        unsafe { self.free_span_to_backing(span, backing) };
      }
    }
    for bucket in &self.map_cache {
      loop {
        let span = unsafe { bucket.pop_head() };
        if span.is_null() {
          break;
        }
        unsafe { self.free_span_to_backing(span, backing) };
      }
    }
  }
}
