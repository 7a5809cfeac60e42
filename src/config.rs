//! Tuning knobs. Cache capacities size ring buffers at arena init, so they
//! must be powers of two greater than one.

/// Runtime configuration for an allocator instance.
///
/// The handler strategy and single-thread relaxations are type-level choices
/// (see the mode markers in `handler`), not fields here.
#[derive(Clone, Copy, Debug)]
pub struct Config {
  /// Singles pre-carved (and cached) when a fresh mapping serves a
  /// one-span request.
  pub span_alloc_count: usize,
  /// Lower bound on spans per backing reservation.
  pub map_alloc_count: usize,
  /// Per-arena single-span cache capacity.
  pub cache_limit: usize,
  /// Per-arena large cache capacity (per large class).
  pub large_cache_limit: usize,
  /// Global cache capacity = per-arena capacity times this.
  pub global_cache_multiplier: usize,
  /// Acceptable oversize ratio when serving large requests from cache.
  pub large_span_overhead_mul: f64,
  /// Pull a cached large span and split it when sourcing singles.
  pub split_large_spans_to_one: bool,
  /// Split bigger cached large spans when sourcing large spans.
  pub split_large_spans_to_large: bool,
  /// Route evicted large spans through the single-span cache.
  pub recycle_large_spans: bool,
  /// Arenas per set in shared mode.
  pub shared_arena_batch_size: usize,
  /// Log spans still mapped when the allocator is dropped.
  pub report_leaks: bool,
}

impl Config {
  pub const DEFAULT: Config = Config {
    span_alloc_count: 4,
    map_alloc_count: 8,
    cache_limit: 64,
    large_cache_limit: 16,
    global_cache_multiplier: 2,
    large_span_overhead_mul: 0.5,
    split_large_spans_to_one: true,
    split_large_spans_to_large: true,
    recycle_large_spans: true,
    shared_arena_batch_size: 4,
    report_leaks: true,
  };

  pub(crate) fn validate(&self) {
    debug_assert!(self.span_alloc_count >= 1);
    debug_assert!(self.map_alloc_count >= 1);
    debug_assert!(self.cache_limit.is_power_of_two() && self.cache_limit > 1);
    debug_assert!(self.large_cache_limit.is_power_of_two() && self.large_cache_limit > 1);
    debug_assert!(self.global_cache_multiplier >= 1);
    debug_assert!(self.large_span_overhead_mul >= 0.0);
    debug_assert!(self.shared_arena_batch_size.is_power_of_two());
  }
}

impl Default for Config {
  fn default() -> Self {
    Config::DEFAULT
  }
}
