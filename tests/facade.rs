//! End-to-end behavior of the allocator facade.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Mutex;

use spanalloc::{
  Allocator, BackingAllocator, Config, LARGE_MAX, PAGE_SIZE, PageAllocator, ThreadLocal,
  ThreadLocalHandler,
};

fn layout(size: usize, align: usize) -> Layout {
  Layout::from_size_align(size, align).unwrap()
}

#[test]
fn small_blocks_round_trip_and_leak_nothing() {
  let alloc = Allocator::<PageAllocator, ThreadLocalHandler>::new(Config::DEFAULT);
  let l = layout(8, 8);

  let blocks: Vec<_> = (0..513).map(|_| alloc.allocate(l).unwrap()).collect();
  for (i, a) in blocks.iter().enumerate() {
    for b in &blocks[i + 1..] {
      let (a, b) = (a.as_ptr() as usize, b.as_ptr() as usize);
      assert!(a + 8 <= b || b + 8 <= a, "blocks overlap");
    }
  }

  for block in blocks.iter().rev() {
    unsafe { alloc.deallocate(*block, l) };
  }
  let again = alloc.allocate(l).unwrap();
  unsafe { alloc.deallocate(again, l) };

  assert_eq!(alloc.deinit(), 0);
}

#[test]
fn medium_grow_keeps_pointer_within_block() {
  let alloc = Allocator::<PageAllocator, ThreadLocalHandler>::new(Config::DEFAULT);
  let l = layout(8182, 8);
  let p = alloc.allocate(l).unwrap();
  unsafe {
    for i in 0..8182 {
      *p.as_ptr().add(i) = (i % 251) as u8;
    }

    // 8182 lands in the 8192-byte class: growing to the block edge is free.
    assert!(alloc.resize(p, 8182, 8192, 8));
    assert_eq!(alloc.remap(p, 8182, 8192, 8), Some(p));

    // One byte past the block cannot stay in place...
    assert!(!alloc.resize(p, 8192, 8193, 8));
    assert!(alloc.remap(p, 8192, 8193, 8).is_none());

    // ...so the caller moves it, and the old bytes must survive the copy.
    let q = alloc.allocate(layout(8193, 8)).unwrap();
    std::ptr::copy_nonoverlapping(p.as_ptr(), q.as_ptr(), 8192);
    alloc.deallocate(p, layout(8192, 8));
    for i in 0..8182 {
      assert_eq!(*q.as_ptr().add(i), (i % 251) as u8);
    }
    alloc.deallocate(q, layout(8193, 8));
  }
  assert_eq!(alloc.deinit(), 0);
}

#[test]
fn huge_resize_uses_page_ceiling() {
  let alloc = Allocator::<PageAllocator, ThreadLocalHandler>::new(Config::DEFAULT);
  let size = LARGE_MAX + 1;
  let l = layout(size, 8);
  let p = alloc.allocate(l).unwrap();

  // In-place growth reaches exactly the next page boundary, no further.
  let ceiling = ((size - 1) / PAGE_SIZE) * PAGE_SIZE + PAGE_SIZE;
  unsafe {
    assert!(alloc.resize(p, size, ceiling, 8));
    assert!(!alloc.resize(p, size, ceiling + 1, 8));
    assert_eq!(alloc.usable_size(p, size, 8), ceiling);
    alloc.deallocate(p, layout(ceiling, 8));
  }
  assert_eq!(alloc.deinit(), 0);
}

#[test]
fn over_aligned_blocks_are_disjoint() {
  let alloc = Allocator::<PageAllocator, ThreadLocalHandler>::new(Config::DEFAULT);
  let l = layout(192, 64);
  let blocks: Vec<_> = (0..3).map(|_| alloc.allocate(l).unwrap()).collect();

  for (i, p) in blocks.iter().enumerate() {
    assert_eq!(p.as_ptr() as usize % 64, 0);
    unsafe { p.as_ptr().write_bytes(i as u8 + 1, 192) };
  }
  for (i, p) in blocks.iter().enumerate() {
    for off in [0, 100, 191] {
      assert_eq!(unsafe { *p.as_ptr().add(off) }, i as u8 + 1, "ranges overlap");
    }
  }
  for p in blocks {
    unsafe { alloc.deallocate(p, l) };
  }
  assert_eq!(alloc.deinit(), 0);
}

#[test]
fn foreign_freed_block_returns_to_owner() {
  let alloc = Allocator::<PageAllocator, ThreadLocalHandler>::new(Config::DEFAULT);
  let l = layout(64, 8);

  let p = alloc.allocate(l).unwrap();
  let addr = p.as_ptr() as usize;

  // Another thread frees the block; it lands on the span's deferred list.
  std::thread::scope(|scope| {
    scope
      .spawn(|| unsafe { alloc.deallocate(NonNull::new(addr as *mut u8).unwrap(), l) })
      .join()
      .unwrap();
  });

  // The owner reconciles once its local free list runs dry and eventually
  // hands the same block out again.
  let mut held = Vec::new();
  let mut reused = false;
  for _ in 0..200_000 {
    let q = alloc.allocate(l).unwrap();
    if q.as_ptr() as usize == addr {
      reused = true;
      unsafe { alloc.deallocate(q, l) };
      break;
    }
    held.push(q);
  }
  assert!(reused, "foreign-freed block never came back to the owner");
  for q in held {
    unsafe { alloc.deallocate(q, l) };
  }
  assert_eq!(alloc.deinit(), 0);
}

// A backing allocator that hands out deliberately span-misaligned regions
// filled with junk. If the huge path ever derived a span header from one of
// these pointers it would read unmapped or garbage memory; the pair check
// additionally pins the exact round-trip contract.
struct PoisonBacking {
  inner: PageAllocator,
  live: Mutex<Vec<(usize, usize)>>,
}

impl PoisonBacking {
  const fn new() -> Self {
    PoisonBacking { inner: PageAllocator, live: Mutex::new(Vec::new()) }
  }
}

impl BackingAllocator for PoisonBacking {
  fn raw_alloc(&self, size: usize, page_align: usize) -> Option<NonNull<u8>> {
    let ptr = self.inner.raw_alloc(size, page_align)?;
    unsafe { ptr.as_ptr().write_bytes(0xbd, size) };
    self.live.lock().unwrap().push((ptr.as_ptr() as usize, size));
    Some(ptr)
  }

  unsafe fn raw_free(&self, ptr: NonNull<u8>, size: usize, page_align: usize) {
    let mut live = self.live.lock().unwrap();
    let pos = live
      .iter()
      .position(|&(base, len)| {
        // Exact pair, or a page-bounded slice of a recorded reservation
        // (split spans release their own slice).
        let addr = ptr.as_ptr() as usize;
        addr >= base && addr + size <= base + len
      })
      .expect("freeing memory the backing allocator never handed out");
    let (base, len) = live[pos];
    if ptr.as_ptr() as usize == base && size == len {
      live.swap_remove(pos);
    }
    drop(live);
    unsafe { self.inner.raw_free(ptr, size, page_align) };
  }
}

#[test]
fn huge_path_never_touches_span_headers() {
  let alloc = Allocator::with_parts(
    Config::DEFAULT,
    PoisonBacking::new(),
    ThreadLocalHandler::<ThreadLocal>::new(),
  );
  let size = LARGE_MAX + 1;
  let l = layout(size, 8);

  for round in 0..4 {
    let p = alloc.allocate(l).unwrap();
    unsafe {
      // The region arrives poisoned: the allocator wrote no header into it.
      assert_eq!(*p.as_ptr(), 0xbd);
      assert_eq!(*p.as_ptr().add(size - 1), 0xbd);
      p.as_ptr().write_bytes(round as u8, size);
      alloc.deallocate(p, l);
    }
  }
  assert_eq!(alloc.huge_allocations(), 0);
  assert_eq!(alloc.deinit(), 0);
}

#[test]
fn usable_size_covers_each_regime() {
  let alloc = Allocator::<PageAllocator, ThreadLocalHandler>::new(Config::DEFAULT);
  unsafe {
    let small = alloc.allocate(layout(24, 8)).unwrap();
    assert_eq!(alloc.usable_size(small, 24, 8), 32);

    let medium = alloc.allocate(layout(3000, 8)).unwrap();
    assert_eq!(alloc.usable_size(medium, 3000, 8), 3072);

    let large = alloc.allocate(layout(100_000, 8)).unwrap();
    assert!(alloc.usable_size(large, 100_000, 8) >= 100_000);

    alloc.deallocate(small, layout(24, 8));
    alloc.deallocate(medium, layout(3000, 8));
    alloc.deallocate(large, layout(100_000, 8));
  }
  assert_eq!(alloc.deinit(), 0);
}

#[test]
fn shared_mode_round_trip() {
  use spanalloc::SharedAllocator;

  let alloc = SharedAllocator::new(Config::DEFAULT);
  std::thread::scope(|scope| {
    for _ in 0..4 {
      scope.spawn(|| {
        let l = layout(256, 8);
        let mut held: Vec<usize> = Vec::new();
        for _ in 0..2_000 {
          let p = alloc.allocate(l).unwrap();
          held.push(p.as_ptr() as usize);
          if held.len() > 16 {
            let addr = held.swap_remove(0);
            unsafe { alloc.deallocate(NonNull::new(addr as *mut u8).unwrap(), l) };
          }
        }
        for addr in held {
          unsafe { alloc.deallocate(NonNull::new(addr as *mut u8).unwrap(), l) };
        }
      });
    }
  });
  assert_eq!(alloc.deinit(), 0);
}
