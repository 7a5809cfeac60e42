//! Bounded lock-free rings used by the span caches.
//!
//! Sequence-cell design: each cell carries a ticket that encodes whether it
//! is ready to be written or read at a given position. `try_write` and
//! `try_read` perform at most one CAS and never block.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

#[repr(C)]
pub(crate) struct QueueCell<T> {
  seq: AtomicUsize,
  value: UnsafeCell<MaybeUninit<T>>,
}

/// Multi-producer multi-consumer bounded ring. Cell storage is carved out of
/// backing memory by the owner; the queue never allocates.
pub(crate) struct BoundedMpmcQueue<T> {
  buf: *mut QueueCell<T>,
  mask: usize,
  enqueue_pos: CachePadded<AtomicUsize>,
  dequeue_pos: CachePadded<AtomicUsize>,
}

// Carries raw span pointers; the cells themselves are always transferred
// through acquire/release sequence updates.
unsafe impl<T> Send for BoundedMpmcQueue<T> {}
unsafe impl<T> Sync for BoundedMpmcQueue<T> {}

impl<T: Copy> BoundedMpmcQueue<T> {
  pub const fn buf_bytes(capacity: usize) -> usize {
    capacity * core::mem::size_of::<QueueCell<T>>()
  }

  /// `buf` must point to `buf_bytes(capacity)` writable bytes aligned for
  /// `QueueCell<T>`, owned by the caller for the queue's whole lifetime.
  /// `capacity` must be a power of two.
  pub unsafe fn init(buf: *mut u8, capacity: usize) -> Self {
    debug_assert!(capacity.is_power_of_two() && capacity > 1);
    let cells = buf as *mut QueueCell<T>;
    for i in 0..capacity {
      unsafe {
        let cell = cells.add(i);
        (*cell).seq = AtomicUsize::new(i);
      }
    }
    Self {
      buf: cells,
      mask: capacity - 1,
      enqueue_pos: CachePadded::new(AtomicUsize::new(0)),
      dequeue_pos: CachePadded::new(AtomicUsize::new(0)),
    }
  }

  pub fn try_write(&self, value: T) -> bool {
    let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
    loop {
      let cell = unsafe { &*self.buf.add(pos & self.mask) };
      let seq = cell.seq.load(Ordering::Acquire);
      let dif = seq as isize - pos as isize;
      if dif == 0 {
        if self
          .enqueue_pos
          .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
          .is_ok()
        {
          unsafe { (*cell.value.get()).write(value) };
          cell.seq.store(pos + 1, Ordering::Release);
          return true;
        }
        pos = self.enqueue_pos.load(Ordering::Relaxed);
      } else if dif < 0 {
        return false; // full
      } else {
        pos = self.enqueue_pos.load(Ordering::Relaxed);
      }
    }
  }

  pub fn try_read(&self) -> Option<T> {
    let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
    loop {
      let cell = unsafe { &*self.buf.add(pos & self.mask) };
      let seq = cell.seq.load(Ordering::Acquire);
      let dif = seq as isize - (pos + 1) as isize;
      if dif == 0 {
        if self
          .dequeue_pos
          .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
          .is_ok()
        {
          let value = unsafe { (*cell.value.get()).assume_init() };
          cell.seq.store(pos + self.mask + 1, Ordering::Release);
          return Some(value);
        }
        pos = self.dequeue_pos.load(Ordering::Relaxed);
      } else if dif < 0 {
        return None; // empty
      } else {
        pos = self.dequeue_pos.load(Ordering::Relaxed);
      }
    }
  }
}

/// Multi-producer single-consumer bounded ring. The consumer position is a
/// plain cell: only the queue's owner reads, so no atomic is needed there.
pub(crate) struct BoundedMpscQueue<T> {
  buf: *mut QueueCell<T>,
  mask: usize,
  enqueue_pos: CachePadded<AtomicUsize>,
  dequeue_pos: UnsafeCell<usize>,
}

unsafe impl<T> Send for BoundedMpscQueue<T> {}
unsafe impl<T> Sync for BoundedMpscQueue<T> {}

impl<T: Copy> BoundedMpscQueue<T> {
  pub const fn buf_bytes(capacity: usize) -> usize {
    capacity * core::mem::size_of::<QueueCell<T>>()
  }

  /// Same contract as [`BoundedMpmcQueue::init`].
  pub unsafe fn init(buf: *mut u8, capacity: usize) -> Self {
    debug_assert!(capacity.is_power_of_two() && capacity > 1);
    let cells = buf as *mut QueueCell<T>;
    for i in 0..capacity {
      unsafe {
        let cell = cells.add(i);
        (*cell).seq = AtomicUsize::new(i);
      }
    }
    Self {
      buf: cells,
      mask: capacity - 1,
      enqueue_pos: CachePadded::new(AtomicUsize::new(0)),
      dequeue_pos: UnsafeCell::new(0),
    }
  }

  pub fn try_write(&self, value: T) -> bool {
    let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
    loop {
      let cell = unsafe { &*self.buf.add(pos & self.mask) };
      let seq = cell.seq.load(Ordering::Acquire);
      let dif = seq as isize - pos as isize;
      if dif == 0 {
        if self
          .enqueue_pos
          .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
          .is_ok()
        {
          unsafe { (*cell.value.get()).write(value) };
          cell.seq.store(pos + 1, Ordering::Release);
          return true;
        }
        pos = self.enqueue_pos.load(Ordering::Relaxed);
      } else if dif < 0 {
        return false;
      } else {
        pos = self.enqueue_pos.load(Ordering::Relaxed);
      }
    }
  }

  /// Only the single consumer may call this.
  pub unsafe fn try_read(&self) -> Option<T> {
    let pos = unsafe { *self.dequeue_pos.get() };
    let cell = unsafe { &*self.buf.add(pos & self.mask) };
    let seq = cell.seq.load(Ordering::Acquire);
    if seq != pos + 1 {
      return None; // next cell not yet published
    }
    let value = unsafe { (*cell.value.get()).assume_init() };
    cell.seq.store(pos + self.mask + 1, Ordering::Release);
    unsafe { *self.dequeue_pos.get() = pos + 1 };
    Some(value)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::sync::atomic::AtomicBool;

  fn cell_storage<T>(capacity: usize) -> Vec<u64> {
    let bytes = capacity * core::mem::size_of::<QueueCell<T>>();
    vec![0u64; bytes / 8 + 1]
  }

  #[test]
  fn mpmc_write_read_round() {
    let mut storage = cell_storage::<usize>(8);
    let q = unsafe { BoundedMpmcQueue::<usize>::init(storage.as_mut_ptr() as *mut u8, 8) };

    assert_eq!(q.try_read(), None);
    for i in 0..8 {
      assert!(q.try_write(i));
    }
    assert!(!q.try_write(99), "ring should be full");
    for i in 0..8 {
      assert_eq!(q.try_read(), Some(i));
    }
    assert_eq!(q.try_read(), None);
  }

  #[test]
  fn mpmc_wraps() {
    let mut storage = cell_storage::<usize>(4);
    let q = unsafe { BoundedMpmcQueue::<usize>::init(storage.as_mut_ptr() as *mut u8, 4) };
    for round in 0..10 {
      assert!(q.try_write(round));
      assert_eq!(q.try_read(), Some(round));
    }
  }

  // Every enqueued value is dequeued exactly once by the single consumer.
  #[test]
  fn mpsc_exactly_once() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 10_000;
    const CAP: usize = 64;

    struct Ring(BoundedMpscQueue<usize>, Vec<u64>);
    unsafe impl Sync for Ring {}

    let mut storage = cell_storage::<usize>(CAP);
    let q = unsafe { BoundedMpscQueue::<usize>::init(storage.as_mut_ptr() as *mut u8, CAP) };
    let ring = Arc::new(Ring(q, storage));
    let done = Arc::new(AtomicBool::new(false));

    let consumer = {
      let ring = Arc::clone(&ring);
      let done = Arc::clone(&done);
      std::thread::spawn(move || {
        let mut seen = vec![0u32; PRODUCERS * PER_PRODUCER];
        loop {
          match unsafe { ring.0.try_read() } {
            Some(v) => seen[v] += 1,
            None => {
              if done.load(Ordering::Acquire) {
                while let Some(v) = unsafe { ring.0.try_read() } {
                  seen[v] += 1;
                }
                break;
              }
              std::hint::spin_loop();
            }
          }
        }
        seen
      })
    };

    let producers: Vec<_> = (0..PRODUCERS)
      .map(|p| {
        let ring = Arc::clone(&ring);
        std::thread::spawn(move || {
          for i in 0..PER_PRODUCER {
            let v = p * PER_PRODUCER + i;
            while !ring.0.try_write(v) {
              std::hint::spin_loop();
            }
          }
        })
      })
      .collect();

    for p in producers {
      p.join().unwrap();
    }
    done.store(true, Ordering::Release);

    let seen = consumer.join().unwrap();
    for (v, &count) in seen.iter().enumerate() {
      assert_eq!(count, 1, "value {v} dequeued {count} times");
    }
  }
}
