//! Thread→arena binding.
//!
//! Two strategies: one arena per thread (uncontended, cross-thread frees go
//! through the deferred paths), or a shared pool where every operation
//! acquires an arena with a try-lock and a dispatcher word spreads threads
//! across the pool.

use core::cell::UnsafeCell;
use core::ptr::{NonNull, null, null_mut};
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::arena::{Arena, ArenaMode, Shared, SingleThreaded, ThreadLocal};
use crate::backing::BackingAllocator;
use crate::classes::{PAGE_SIZE, align_up};
use crate::config::Config;
use crate::global_cache::GlobalSpanCache;

// =============================================================================
// Thread ids and handler slots
// =============================================================================

/// Each thread gets a different id. 0 is reserved for "no thread" (TLS
/// already torn down); arena owners always have ids >= 1.
pub(crate) fn thread_id_u32() -> u32 {
  thread_local! {
    static TID: u32 = {
      static CTR: AtomicU32 = AtomicU32::new(1);
      CTR.fetch_add(1, Ordering::Relaxed) // Uniqueness only, not synchronization
    };
  }
  TID.try_with(|&id| id).unwrap_or(0)
}

/// Hard limit on concurrently created handlers. Slots are claimed with a
/// fetch-add and never reclaimed, so a process creating handlers in a loop
/// eventually panics here; the stale TLS entries of dead handlers stay
/// harmless precisely because their slots are never reissued.
pub const MAX_HANDLER_SLOTS: usize = 256;

static HANDLER_SLOTS: AtomicUsize = AtomicUsize::new(0);

fn claim_handler_slot() -> usize {
  let slot = HANDLER_SLOTS.fetch_add(1, Ordering::Relaxed);
  assert!(
    slot < MAX_HANDLER_SLOTS,
    "allocator handler slots exhausted ({MAX_HANDLER_SLOTS}); slots are never reclaimed"
  );
  slot
}

thread_local! {
  /// Per-thread arena cache, one entry per handler slot.
  static ARENA_SLOTS: UnsafeCell<[*mut (); MAX_HANDLER_SLOTS]> =
    const { UnsafeCell::new([null_mut(); MAX_HANDLER_SLOTS]) };
}

fn tls_arena(slot: usize) -> *mut () {
  ARENA_SLOTS
    .try_with(|slots| unsafe { (*slots.get())[slot] })
    .unwrap_or(null_mut())
}

fn tls_set_arena(slot: usize, arena: *mut ()) {
  let _ = ARENA_SLOTS.try_with(|slots| unsafe { (*slots.get())[slot] = arena });
}

// =============================================================================
// Handler trait
// =============================================================================

/// Binds the calling thread to an arena for one operation (or for the
/// thread's lifetime in thread-local mode).
pub trait ArenaHandler {
  type Mode: ArenaMode;

  /// Arena the current thread may mutate right now. Shared mode returns it
  /// with the writer lock held; pair every success with `release_arena`.
  fn acquire_arena<B: BackingAllocator>(
    &self,
    config: &Config,
    backing: &B,
  ) -> Option<NonNull<Arena<Self::Mode>>>;

  fn release_arena(&self, arena: NonNull<Arena<Self::Mode>>);

  /// Spans currently mapped across all arenas.
  fn mapped_spans(&self) -> usize;

  /// Settle all arenas and release their storage.
  ///
  /// # Safety
  ///
  /// Caller must guarantee no other thread touches this handler's arenas
  /// again (drop-time only). Returns the spans still mapped (leaks).
  unsafe fn deinit<B: BackingAllocator>(&self, config: &Config, backing: &B) -> usize;
}

/// Modes served by the thread-local handler.
pub trait LocalMode: ArenaMode {}
impl LocalMode for ThreadLocal {}
impl LocalMode for SingleThreaded {}

// =============================================================================
// Thread-local handler
// =============================================================================

struct ThreadLocalState<M: ArenaMode> {
  slot: usize,
  /// Backing chunk holding the span counter and the global cache.
  chunk: *mut u8,
  chunk_size: usize,
  span_counter: *const AtomicUsize,
  global: *const GlobalSpanCache,
  /// All arenas ever created, for teardown. Lock-free push.
  arenas: AtomicPtr<Arena<M>>,
}

unsafe impl<M: ArenaMode> Send for ThreadLocalState<M> {}
unsafe impl<M: ArenaMode> Sync for ThreadLocalState<M> {}

/// One arena per calling thread, created on first use. The writer lock is a
/// no-op; cross-thread frees ride the deferred paths, and evicted spans meet
/// in a process-wide cache.
pub struct ThreadLocalHandler<M: LocalMode = ThreadLocal> {
  state: OnceLock<ThreadLocalState<M>>,
}

impl<M: LocalMode> ThreadLocalHandler<M> {
  pub const fn new() -> Self {
    ThreadLocalHandler { state: OnceLock::new() }
  }

  fn state<B: BackingAllocator>(&self, config: &Config, backing: &B) -> &ThreadLocalState<M> {
    self.state.get_or_init(|| {
      config.validate();
      let slot = claim_handler_slot();

      // Counter first, global cache behind it (128-byte offset keeps the
      // cache's padded fields aligned). Single-threaded clients have
      // nothing to share, so they skip the global cache entirely.
      let global_bytes = if M::THREAD_SAFE { GlobalSpanCache::chunk_bytes(config) } else { 0 };
      let chunk_size = align_up(128 + global_bytes, PAGE_SIZE);
      let chunk = backing
        .raw_alloc(chunk_size, PAGE_SIZE)
        .expect("handler state mapping failed")
        .as_ptr();
      let span_counter = chunk as *const AtomicUsize;
      unsafe { (chunk as *mut AtomicUsize).write(AtomicUsize::new(0)) };
      let global = if M::THREAD_SAFE {
        unsafe { GlobalSpanCache::init(chunk.add(128), config) as *const GlobalSpanCache }
      } else {
        null()
      };

      ThreadLocalState {
        slot,
        chunk,
        chunk_size,
        span_counter,
        global,
        arenas: AtomicPtr::new(null_mut()),
      }
    })
  }
}

impl<M: LocalMode> Default for ThreadLocalHandler<M> {
  fn default() -> Self {
    Self::new()
  }
}

impl<M: LocalMode> ArenaHandler for ThreadLocalHandler<M> {
  type Mode = M;

  fn acquire_arena<B: BackingAllocator>(
    &self,
    config: &Config,
    backing: &B,
  ) -> Option<NonNull<Arena<M>>> {
    let tid = thread_id_u32();
    if tid == 0 {
      return None; // TLS teardown
    }
    let state = self.state(config, backing);

    let cached = tls_arena(state.slot) as *mut Arena<M>;
    if !cached.is_null() {
      return NonNull::new(cached);
    }

    let arena =
      unsafe { Arena::<M>::create(config, backing, tid, state.span_counter, state.global) }?;
    // Publish for teardown before handing it to the thread.
    let mut head = state.arenas.load(Ordering::Relaxed);
    loop {
      unsafe { (*arena).next_arena.store(head, Ordering::Relaxed) };
      match state.arenas.compare_exchange_weak(
        head,
        arena,
        Ordering::Release,
        Ordering::Relaxed,
      ) {
        Ok(_) => break,
        Err(cur) => head = cur,
      }
    }
    tls_set_arena(state.slot, arena as *mut ());
    NonNull::new(arena)
  }

  fn release_arena(&self, _arena: NonNull<Arena<M>>) {}

  fn mapped_spans(&self) -> usize {
    match self.state.get() {
      Some(state) => unsafe { (*state.span_counter).load(Ordering::Relaxed) },
      None => 0,
    }
  }

  unsafe fn deinit<B: BackingAllocator>(&self, _config: &Config, backing: &B) -> usize {
    let Some(state) = self.state.get() else {
      return 0;
    };

    let mut arena = state.arenas.swap(null_mut(), Ordering::Acquire);
    while !arena.is_null() {
      let next = unsafe { (*arena).next_arena.load(Ordering::Relaxed) };
      unsafe {
        (*arena).deinit(backing);
        Arena::destroy(arena, backing);
      }
      arena = next;
    }

    if let Some(global) = unsafe { state.global.as_ref() } {
      global.drain(|span| unsafe {
        let span_ref = &*span;
        (*state.span_counter)
          .fetch_sub(span_ref.span_count.get() as usize, Ordering::Relaxed);
        backing.raw_free(
          NonNull::new_unchecked(span_ref.initial_ptr.get()),
          span_ref.alloc_size.get(),
          PAGE_SIZE,
        );
      });
    }

    let leaked = unsafe { (*state.span_counter).load(Ordering::Relaxed) };
    unsafe {
      backing.raw_free(
        NonNull::new_unchecked(state.chunk),
        state.chunk_size,
        PAGE_SIZE,
      );
    }
    leaked
  }
}

// =============================================================================
// Shared handler
// =============================================================================

/// A batch of arenas carved from one reservation, chained on growth.
struct ArenasSet {
  next: AtomicPtr<ArenasSet>,
  len: usize,
  chunk_size: usize,
}

struct SharedState {
  slot: usize,
  chunk: *mut u8,
  chunk_size: usize,
  span_counter: *const AtomicUsize,
  sets: AtomicPtr<ArenasSet>,
  /// `(index << 32) | capacity`; incremented by `1 << 32` per lookup so an
  /// index wrap can never corrupt the capacity half.
  dispatcher: AtomicU64,
  /// Guards set-chain growth only; never taken on the hot path.
  grow_lock: Mutex<()>,
}

unsafe impl Send for SharedState {}
unsafe impl Sync for SharedState {}

/// Fixed pool of arenas shared by all threads; each operation picks one via
/// the dispatcher and takes its writer lock.
pub struct SharedHandler {
  state: OnceLock<SharedState>,
}

fn set_arena(set: *mut ArenasSet, index: usize, stride: usize) -> *mut Arena<Shared> {
  unsafe { (set as *mut u8).add(PAGE_SIZE + index * stride) as *mut Arena<Shared> }
}

unsafe fn set_create<B: BackingAllocator>(
  config: &Config,
  backing: &B,
  len: usize,
  span_counter: *const AtomicUsize,
) -> Option<*mut ArenasSet> {
  let stride = Arena::<Shared>::chunk_bytes(config);
  let chunk_size = PAGE_SIZE + len * stride;
  let chunk = backing.raw_alloc(chunk_size, PAGE_SIZE)?;
  let set = chunk.as_ptr() as *mut ArenasSet;
  unsafe {
    set.write(ArenasSet {
      next: AtomicPtr::new(null_mut()),
      len,
      chunk_size,
    });
    for i in 0..len {
      Arena::<Shared>::init_at(
        chunk.as_ptr().add(PAGE_SIZE + i * stride),
        stride,
        config,
        0,
        span_counter,
        null(),
      );
    }
  }
  Some(set)
}

impl SharedHandler {
  pub const fn new() -> Self {
    SharedHandler { state: OnceLock::new() }
  }

  fn state<B: BackingAllocator>(&self, config: &Config, backing: &B) -> &SharedState {
    self.state.get_or_init(|| {
      config.validate();
      let slot = claim_handler_slot();

      let chunk_size = PAGE_SIZE;
      let chunk = backing
        .raw_alloc(chunk_size, PAGE_SIZE)
        .expect("handler state mapping failed")
        .as_ptr();
      let span_counter = chunk as *const AtomicUsize;
      unsafe { (chunk as *mut AtomicUsize).write(AtomicUsize::new(0)) };

      let batch = config.shared_arena_batch_size;
      let first = unsafe { set_create(config, backing, batch, span_counter) }
        .expect("arena set mapping failed");

      SharedState {
        slot,
        chunk,
        chunk_size,
        span_counter,
        sets: AtomicPtr::new(first),
        dispatcher: AtomicU64::new(batch as u64),
        grow_lock: Mutex::new(()),
      }
    })
  }

  /// All arenas are busy (or the dispatcher raced past the published chain):
  /// retry the whole pool under the growth lock, then double it.
  #[inline(never)]
  fn create_arena<B: BackingAllocator>(
    &self,
    state: &SharedState,
    config: &Config,
    backing: &B,
  ) -> Option<NonNull<Arena<Shared>>> {
    let _guard = state.grow_lock.lock();
    let stride = Arena::<Shared>::chunk_bytes(config);

    // A lock holder may have grown the pool while we waited.
    let mut set = state.sets.load(Ordering::Acquire);
    while !set.is_null() {
      let set_ref = unsafe { &*set };
      for i in 0..set_ref.len {
        let arena = set_arena(set, i, stride);
        if unsafe { (*arena).try_acquire() } {
          tls_set_arena(state.slot, arena as *mut ());
          return NonNull::new(arena);
        }
      }
      set = set_ref.next.load(Ordering::Acquire);
    }

    // Double the pool so the dispatcher mask stays a power of two.
    let dispatcher = state.dispatcher.load(Ordering::Relaxed);
    let capacity = dispatcher as u32 as usize;
    let new_set = unsafe { set_create(config, backing, capacity, state.span_counter) }?;
    let arena = set_arena(new_set, 0, stride);
    let acquired = unsafe { (*arena).try_acquire() };
    debug_assert!(acquired, "fresh arena must be free");

    let mut tail = state.sets.load(Ordering::Relaxed);
    unsafe {
      while !(*tail).next.load(Ordering::Relaxed).is_null() {
        tail = (*tail).next.load(Ordering::Relaxed);
      }
      (*tail).next.store(new_set, Ordering::Release);
    }
    let index_half = state.dispatcher.load(Ordering::Relaxed) & !0xFFFF_FFFF;
    state
      .dispatcher
      .store(index_half | (capacity as u64 * 2), Ordering::Release);

    tls_set_arena(state.slot, arena as *mut ());
    NonNull::new(arena)
  }
}

impl Default for SharedHandler {
  fn default() -> Self {
    Self::new()
  }
}

impl ArenaHandler for SharedHandler {
  type Mode = Shared;

  fn acquire_arena<B: BackingAllocator>(
    &self,
    config: &Config,
    backing: &B,
  ) -> Option<NonNull<Arena<Shared>>> {
    let state = self.state(config, backing);

    // Last arena this thread held is usually free again.
    let cached = tls_arena(state.slot) as *mut Arena<Shared>;
    if !cached.is_null() && unsafe { (*cached).try_acquire() } {
      return NonNull::new(cached);
    }

    let dispatcher = state.dispatcher.fetch_add(1 << 32, Ordering::Relaxed);
    let index = (dispatcher >> 32) as usize;
    let capacity = dispatcher as u32 as usize;
    let masked = index & (capacity - 1);

    let stride = Arena::<Shared>::chunk_bytes(config);
    let mut remaining = masked;
    let mut set = state.sets.load(Ordering::Acquire);
    while !set.is_null() {
      let set_ref = unsafe { &*set };
      if remaining < set_ref.len {
        let arena = set_arena(set, remaining, stride);
        if unsafe { (*arena).try_acquire() } {
          tls_set_arena(state.slot, arena as *mut ());
          return NonNull::new(arena);
        }
        break;
      }
      remaining -= set_ref.len;
      set = set_ref.next.load(Ordering::Acquire);
    }

    self.create_arena(state, config, backing)
  }

  fn release_arena(&self, arena: NonNull<Arena<Shared>>) {
    unsafe { arena.as_ref() }.release();
  }

  fn mapped_spans(&self) -> usize {
    match self.state.get() {
      Some(state) => unsafe { (*state.span_counter).load(Ordering::Relaxed) },
      None => 0,
    }
  }

  unsafe fn deinit<B: BackingAllocator>(&self, config: &Config, backing: &B) -> usize {
    let Some(state) = self.state.get() else {
      return 0;
    };
    let stride = Arena::<Shared>::chunk_bytes(config);

    let mut set = state.sets.swap(null_mut(), Ordering::Acquire);
    while !set.is_null() {
      let set_ref = unsafe { &*set };
      let next = set_ref.next.load(Ordering::Relaxed);
      for i in 0..set_ref.len {
        unsafe { (*set_arena(set, i, stride)).deinit(backing) };
      }
      unsafe {
        backing.raw_free(
          NonNull::new_unchecked(set as *mut u8),
          set_ref.chunk_size,
          PAGE_SIZE,
        );
      }
      set = next;
    }

    let leaked = unsafe { (*state.span_counter).load(Ordering::Relaxed) };
    unsafe {
      backing.raw_free(
        NonNull::new_unchecked(state.chunk),
        state.chunk_size,
        PAGE_SIZE,
      );
    }
    leaked
  }
}
