//! Process-wide span cache shared by all arenas of a thread-local handler.
//!
//! Arenas overflow into it before resorting to a backing free and consult it
//! before mapping fresh memory. Shared-mode handlers skip it: their arenas
//! already share per-arena caches through the pool.

use crate::classes::LARGE_CLASS_COUNT;
use crate::config::Config;
use crate::queue::BoundedMpmcQueue;
use crate::span::Span;

pub(crate) struct GlobalSpanCache {
  single: BoundedMpmcQueue<*mut Span>,
  large: [BoundedMpmcQueue<*mut Span>; LARGE_CLASS_COUNT - 1],
}

impl GlobalSpanCache {
  fn single_capacity(config: &Config) -> usize {
    (config.cache_limit * config.global_cache_multiplier).next_power_of_two()
  }

  fn large_capacity(config: &Config) -> usize {
    (config.large_cache_limit * config.global_cache_multiplier).next_power_of_two()
  }

  /// Bytes of raw memory `init` needs: the struct itself plus every ring's
  /// cell storage.
  pub fn chunk_bytes(config: &Config) -> usize {
    core::mem::size_of::<GlobalSpanCache>()
      + BoundedMpmcQueue::<*mut Span>::buf_bytes(Self::single_capacity(config))
      + (LARGE_CLASS_COUNT - 1)
        * BoundedMpmcQueue::<*mut Span>::buf_bytes(Self::large_capacity(config))
  }

  /// `chunk` must point to `chunk_bytes(config)` zeroable bytes with pointer
  /// alignment, owned for the cache's whole lifetime.
  pub unsafe fn init(chunk: *mut u8, config: &Config) -> *mut GlobalSpanCache {
    let single_cap = Self::single_capacity(config);
    let large_cap = Self::large_capacity(config);
    let cache = chunk as *mut GlobalSpanCache;
    let mut buf = unsafe { chunk.add(core::mem::size_of::<GlobalSpanCache>()) };
    let single = unsafe { BoundedMpmcQueue::init(buf, single_cap) };
    buf = unsafe { buf.add(BoundedMpmcQueue::<*mut Span>::buf_bytes(single_cap)) };
    let large = core::array::from_fn(|_| {
      let queue = unsafe { BoundedMpmcQueue::init(buf, large_cap) };
      buf = unsafe { buf.add(BoundedMpmcQueue::<*mut Span>::buf_bytes(large_cap)) };
      queue
    });
    unsafe {
      (&raw mut (*cache).single).write(single);
      (&raw mut (*cache).large).write(large);
    }
    cache
  }

  pub fn push_single(&self, span: *mut Span) -> bool {
    self.single.try_write(span)
  }

  pub fn pop_single(&self) -> Option<*mut Span> {
    self.single.try_read()
  }

  /// Indexed by the span's own slot count.
  pub fn push_large(&self, span: *mut Span) -> bool {
    let count = unsafe { (*span).span_count.get() as usize };
    debug_assert!((2..=LARGE_CLASS_COUNT).contains(&count));
    self.large[count - 2].try_write(span)
  }

  pub fn pop_large(&self, span_count: usize) -> Option<*mut Span> {
    self.large[span_count - 2].try_read()
  }

  /// Hand every cached span to `release`. Deinit only.
  pub fn drain(&self, mut release: impl FnMut(*mut Span)) {
    while let Some(span) = self.single.try_read() {
      release(span);
    }
    for queue in &self.large {
      while let Some(span) = queue.try_read() {
        release(span);
      }
    }
  }
}
