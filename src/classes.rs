//! Size-class geometry: span layout constants and the size→class mapping.

// =============================================================================
// Geometry
// =============================================================================

pub const SPAN_SIZE_BITS: usize = 16;
/// Unit of carving and caching. Every span base is aligned to this.
pub const SPAN_SIZE: usize = 1 << SPAN_SIZE_BITS; // 64KB
pub const SPAN_ALIGN_MASK: usize = !(SPAN_SIZE - 1);
/// Header sits at offset 0 of every span; blocks start past it.
pub const SPAN_HEADER_SIZE: usize = 128; // 2 cache lines
pub const SPAN_EFFECTIVE_SIZE: usize = SPAN_SIZE - SPAN_HEADER_SIZE;

pub const PAGE_SIZE: usize = 4096;

pub const SMALL_GRANULARITY_SHIFT: usize = 4;
pub const SMALL_GRANULARITY: usize = 1 << SMALL_GRANULARITY_SHIFT; // 16B
pub const SMALL_MAX: usize = 2048;
pub const SMALL_CLASS_COUNT: usize = SMALL_MAX / SMALL_GRANULARITY; // 128

pub const MEDIUM_GRANULARITY_SHIFT: usize = 8;
pub const MEDIUM_GRANULARITY: usize = 1 << MEDIUM_GRANULARITY_SHIFT; // 256B
pub const MEDIUM_MAX: usize = SPAN_SIZE / 2;
pub const MEDIUM_CLASS_COUNT: usize = (MEDIUM_MAX - SMALL_MAX) / MEDIUM_GRANULARITY; // 120

/// Total number of multi-block (small + medium) size classes.
pub const SIZE_CLASS_COUNT: usize = SMALL_CLASS_COUNT + MEDIUM_CLASS_COUNT;

/// Largest request served by a single span holding exactly one block.
pub const SPAN_MAX: usize = SPAN_EFFECTIVE_SIZE;

/// Multi-span spans cover `[2, LARGE_CLASS_COUNT]` consecutive span slots.
pub const LARGE_CLASS_COUNT: usize = 32;
pub const LARGE_MAX: usize = LARGE_CLASS_COUNT * SPAN_SIZE - SPAN_HEADER_SIZE;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(SPAN_SIZE.is_power_of_two());
const _: () = assert!(PAGE_SIZE.is_power_of_two() && PAGE_SIZE < SPAN_SIZE);
const _: () = assert!(SMALL_GRANULARITY.is_power_of_two());
const _: () = assert!(SMALL_GRANULARITY >= core::mem::size_of::<usize>());
const _: () = assert!(SMALL_MAX % SMALL_GRANULARITY == 0);
const _: () = assert!(MEDIUM_MAX % MEDIUM_GRANULARITY == 0);
const _: () = assert!(MEDIUM_MAX < SPAN_MAX);
const _: () = assert!(SPAN_HEADER_SIZE % SMALL_GRANULARITY == 0);
const _: () = assert!(SIZE_CLASS_COUNT == 248);
const _: () = assert!(LARGE_CLASS_COUNT >= 2);

// =============================================================================
// Size Classes
// =============================================================================

/// Layout of one span once bound to a class: block stride and capacity.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SizeClass {
  pub block_size: u32,
  pub block_max: u16,
  pub class_idx: u16,
}

/// Class index reserved for one-block spans (single and multi-span).
pub const SPAN_CLASS_IDX: u16 = SIZE_CLASS_COUNT as u16;

/// Convert a small/medium request size to its class index (inverse of
/// `class_block_size`). Callers guarantee `1 <= size <= MEDIUM_MAX`.
#[inline(always)]
pub const fn size_class_index(size: usize) -> usize {
  if size <= SMALL_MAX {
    (size - 1) >> SMALL_GRANULARITY_SHIFT
  } else {
    SMALL_CLASS_COUNT + ((size - SMALL_MAX - 1) >> MEDIUM_GRANULARITY_SHIFT)
  }
}

/// Block stride for a small/medium class index.
#[inline(always)]
pub const fn class_block_size(class_idx: usize) -> usize {
  if class_idx < SMALL_CLASS_COUNT {
    (class_idx + 1) << SMALL_GRANULARITY_SHIFT
  } else {
    SMALL_MAX + ((class_idx - SMALL_CLASS_COUNT + 1) << MEDIUM_GRANULARITY_SHIFT)
  }
}

/// Full class triple for a small/medium request.
#[inline(always)]
pub fn size_class_of(size: usize) -> SizeClass {
  let idx = size_class_index(size);
  let block_size = class_block_size(idx);
  SizeClass {
    block_size: block_size as u32,
    block_max: (SPAN_EFFECTIVE_SIZE / block_size) as u16,
    class_idx: idx as u16,
  }
}

/// Class for a one-block span covering `span_count` consecutive span slots.
#[inline(always)]
pub fn span_class_of(span_count: usize) -> SizeClass {
  SizeClass {
    block_size: (span_count * SPAN_SIZE - SPAN_HEADER_SIZE) as u32,
    block_max: 1,
    class_idx: SPAN_CLASS_IDX + (span_count as u16 - 1),
  }
}

/// Number of consecutive span slots needed for a large request.
#[inline(always)]
pub const fn span_count_of(size: usize) -> usize {
  (size + SPAN_HEADER_SIZE).div_ceil(SPAN_SIZE)
}

const _: () = assert!(class_block_size(0) == SMALL_GRANULARITY);
const _: () = assert!(class_block_size(SMALL_CLASS_COUNT - 1) == SMALL_MAX);
const _: () = assert!(class_block_size(SMALL_CLASS_COUNT) == SMALL_MAX + MEDIUM_GRANULARITY);
const _: () = assert!(class_block_size(SIZE_CLASS_COUNT - 1) == MEDIUM_MAX);
const _: () = assert!(span_count_of(SPAN_MAX + 1) == 2);
const _: () = assert!(span_count_of(LARGE_MAX) == LARGE_CLASS_COUNT);

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}
