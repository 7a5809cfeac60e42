use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::mpsc;

use rand::distributions::{Distribution, Uniform};
use rand::{Rng, RngCore, SeedableRng};
use spanalloc::{Allocator, Config, PageAllocator, ThreadLocalHandler};
use test_env_log::test;

/// A held allocation: address, layout, and the byte it was filled with.
struct Slot {
  addr: usize,
  layout: Layout,
  fill: u8,
}

fn verify_and_free(alloc: &Allocator, slot: Slot) {
  let ptr = slot.addr as *mut u8;
  unsafe {
    for off in [0, slot.layout.size() / 2, slot.layout.size() - 1] {
      assert_eq!(
        *ptr.add(off),
        slot.fill,
        "block at {ptr:p} (size {}) was clobbered",
        slot.layout.size()
      );
    }
    alloc.deallocate(NonNull::new(ptr).unwrap(), slot.layout);
  }
}

#[test]
fn parallel_random_alloc_free() {
  const THREADS: usize = 4;
  const ITERATIONS: usize = 20_000;

  let alloc = Allocator::<PageAllocator, ThreadLocalHandler>::new(Config::DEFAULT);
  let seed: u64 = rand::thread_rng().next_u64();
  log::info!("parallel stress seed {seed}");

  std::thread::scope(|scope| {
    for t in 0..THREADS {
      let alloc = &alloc;
      scope.spawn(move || {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed.wrapping_add(t as u64));
        let sizes = Uniform::new_inclusive(1usize, 2048);
        let mut held: Vec<Slot> = Vec::new();

        for i in 0..ITERATIONS {
          if held.len() > 64 || (rng.gen_bool(0.4) && !held.is_empty()) {
            let slot = held.swap_remove(rng.gen_range(0..held.len()));
            verify_and_free(alloc, slot);
          } else {
            // Mostly small blocks, with occasional medium and large ones to
            // keep every regime under contention.
            let size = match i % 97 {
              0 => 100_000,
              1 => 9_000,
              _ => sizes.sample(&mut rng),
            };
            let layout = Layout::from_size_align(size, 8).unwrap();
            let ptr = alloc.allocate(layout).expect("allocation failed under stress");
            let fill = (t as u8) << 5 | (i % 31) as u8;
            unsafe { ptr.as_ptr().write_bytes(fill, size) };
            held.push(Slot { addr: ptr.as_ptr() as usize, layout, fill });
          }
        }
        for slot in held.drain(..) {
          verify_and_free(alloc, slot);
        }
      });
    }
  });

  assert_eq!(alloc.deinit(), 0, "stress run leaked spans");
}

#[test]
fn producer_consumer_frees_are_reclaimed() {
  const PAIRS: usize = 2;
  const MESSAGES: usize = 30_000;

  let alloc = Allocator::<PageAllocator, ThreadLocalHandler>::new(Config::DEFAULT);
  let seed: u64 = rand::thread_rng().next_u64();
  log::info!("producer/consumer seed {seed}");

  std::thread::scope(|scope| {
    for pair in 0..PAIRS {
      let (tx, rx) = mpsc::channel::<Slot>();
      let alloc_tx = &alloc;
      let alloc_rx = &alloc;

      scope.spawn(move || {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed.wrapping_add(pair as u64));
        let sizes = Uniform::new_inclusive(1usize, 1024);
        for i in 0..MESSAGES {
          let size = sizes.sample(&mut rng);
          let layout = Layout::from_size_align(size, 8).unwrap();
          let ptr = alloc_tx.allocate(layout).expect("producer allocation failed");
          let fill = (i % 251) as u8;
          unsafe { ptr.as_ptr().write_bytes(fill, size) };
          tx.send(Slot { addr: ptr.as_ptr() as usize, layout, fill }).unwrap();
        }
      });

      // Every block crosses a thread boundary before it is freed, so each
      // free takes the deferred path back to the producer's arena.
      scope.spawn(move || {
        for slot in rx {
          verify_and_free(alloc_rx, slot);
        }
      });
    }
  });

  assert_eq!(alloc.deinit(), 0, "cross-thread frees leaked spans");
}
