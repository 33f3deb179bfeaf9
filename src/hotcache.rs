//! Hot-words dictionary cache.
//!
//! Frequency-driven lookup acceleration: a small array of word ids probed
//! before the dictionary scan, promotion once a word's execution heat
//! crosses a threshold, and round-robin LRU eviction when full. Every
//! lookup records its latency into Q48.16 accumulators from which the
//! posterior summaries and the cache-vs-bucket speedup estimate are
//! derived without floating point.

use std::fmt::Write as _;

use crate::dict::{Dictionary, WordId};
use crate::fixed::{self, Fixed, ONE};
use crate::host::HostServices;

/// Cache capacity in entries.
pub const CACHE_CAPACITY: usize = 64;

/// Execution heat (Q48.16) a word must exceed to be promoted.
pub const HEAT_PROMOTION_THRESHOLD: Fixed = 10 << 16;

const Z95: Fixed = 128_431; // 1.96
const Z99: Fixed = 168_888; // 2.576
const SQRT2: Fixed = 92_681; // 1.414

/// Latency accumulators for one lookup distribution.
#[derive(Debug, Clone, Copy)]
pub struct LatencyStats {
    pub samples: u64,
    /// Sum of latencies, Q48.16 nanoseconds.
    pub sum_q48: Fixed,
    /// Sum of squared latencies, Q48.16.
    pub sq_sum_q48: Fixed,
    pub min_ns: i64,
    pub max_ns: i64,
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self {
            samples: 0,
            sum_q48: 0,
            sq_sum_q48: 0,
            min_ns: i64::MAX,
            max_ns: i64::MIN,
        }
    }
}

impl LatencyStats {
    fn record(&mut self, elapsed_ns: i64) {
        self.samples += 1;
        self.sum_q48 = self.sum_q48.saturating_add(elapsed_ns << 16);
        self.sq_sum_q48 = self
            .sq_sum_q48
            .saturating_add(elapsed_ns.saturating_mul(elapsed_ns) << 16);
        self.min_ns = self.min_ns.min(elapsed_ns);
        self.max_ns = self.max_ns.max(elapsed_ns);
    }
}

/// Lookup and cache-management counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub total_lookups: u64,
    pub cache_hits: u64,
    pub bucket_hits: u64,
    pub misses: u64,
    pub promotions: u64,
    pub evictions: u64,
    pub bucket_reorders: u64,
    pub cache_hit: LatencyStats,
    pub bucket_search: LatencyStats,
}

/// Posterior summary of one latency distribution, everything Q48.16.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyPosterior {
    pub sample_count: u64,
    pub mean_ns_q48: Fixed,
    pub variance_q48: Fixed,
    pub stddev_ns_q48: Fixed,
    pub median_ns_q48: Fixed,
    pub credible_lower_95: Fixed,
    pub credible_upper_95: Fixed,
    pub credible_lower_99: Fixed,
    pub credible_upper_99: Fixed,
}

/// Posterior over the bucket-mean / cache-mean ratio.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpeedupEstimate {
    pub speedup_q48: Fixed,
    pub credible_lower_95_q48: Fixed,
    pub credible_upper_95_q48: Fixed,
    /// P(speedup > 1.1), Q48.16 in [0, ONE].
    pub probability_gt_10pct_q48: Fixed,
    /// P(speedup > 2.0), Q48.16 in [0, ONE].
    pub probability_gt_double_q48: Fixed,
}

/// Posterior for `stats`, or the zero posterior when it has no samples.
#[must_use]
pub fn posterior(stats: &LatencyStats) -> LatencyPosterior {
    let n = stats.samples;
    if n == 0 {
        return LatencyPosterior::default();
    }

    let mean = stats.sum_q48 / n as Fixed;
    let mean_sq = fixed::mul(mean, mean);
    let variance = (stats.sq_sum_q48 / n as Fixed - mean_sq).max(0);
    let stddev = fixed::sqrt(variance);

    let se = fixed::div(stddev, fixed::sqrt(fixed::from_int(n as i64)));
    let margin_95 = fixed::mul(Z95, se);
    let margin_99 = fixed::mul(Z99, se);

    LatencyPosterior {
        sample_count: n,
        mean_ns_q48: mean,
        variance_q48: variance,
        stddev_ns_q48: stddev,
        median_ns_q48: fixed::from_int((stats.min_ns + stats.max_ns) / 2),
        credible_lower_95: (mean - margin_95).max(0),
        credible_upper_95: mean + margin_95,
        credible_lower_99: (mean - margin_99).max(0),
        credible_upper_99: mean + margin_99,
    }
}

fn exceedance_probability(speedup: Fixed, target: Fixed, se_log: Fixed) -> Fixed {
    if se_log == 0 {
        return if speedup > target { ONE } else { 0 };
    }
    // P(true ratio > target) via the z-score of the log-ratio.
    let z = fixed::div(fixed::ln(speedup) - fixed::ln(target), se_log);
    (ONE + fixed::erf(fixed::div(z, SQRT2))) >> 1
}

/// Delta-method speedup posterior, bucket mean over cache mean.
#[must_use]
pub fn speedup_estimate(stats: &CacheStats) -> SpeedupEstimate {
    if stats.cache_hit.samples == 0 || stats.bucket_search.samples == 0 {
        return SpeedupEstimate {
            speedup_q48: ONE,
            ..SpeedupEstimate::default()
        };
    }

    let cache = posterior(&stats.cache_hit);
    let bucket = posterior(&stats.bucket_search);
    let cache_mean = cache.mean_ns_q48.max(1);
    let bucket_mean = bucket.mean_ns_q48.max(1);

    let speedup = fixed::div(bucket_mean, cache_mean);

    let se_cache = fixed::div(cache.stddev_ns_q48, fixed::from_int(stats.cache_hit.samples as i64));
    let se_bucket = fixed::div(
        bucket.stddev_ns_q48,
        fixed::from_int(stats.bucket_search.samples as i64),
    );
    let rel_cache = fixed::div(se_cache, cache_mean);
    let rel_bucket = fixed::div(se_bucket, bucket_mean);
    let se_log = fixed::sqrt(fixed::mul(rel_cache, rel_cache) + fixed::mul(rel_bucket, rel_bucket));
    let se_speedup = fixed::mul(speedup, se_log);

    let margin_95 = fixed::mul(Z95, se_speedup);

    SpeedupEstimate {
        speedup_q48: speedup,
        credible_lower_95_q48: (speedup - margin_95).max(0),
        credible_upper_95_q48: speedup + margin_95,
        probability_gt_10pct_q48: exceedance_probability(speedup, 72_090, se_log), // 1.1
        probability_gt_double_q48: exceedance_probability(speedup, 2 * ONE, se_log),
    }
}

impl CacheStats {
    /// Human-readable report. The only place Q48.16 values become floats.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let total = self.cache_hits + self.bucket_hits + self.misses;
        out.push_str("Hot-words cache statistics\n");
        if total == 0 {
            out.push_str("  no lookups performed\n");
            return out;
        }

        let pct = |n: u64| 100.0 * n as f64 / total as f64;
        let _ = writeln!(out, "  lookups:     {total}");
        let _ = writeln!(out, "  cache hits:  {} ({:.2}%)", self.cache_hits, pct(self.cache_hits));
        let _ = writeln!(out, "  bucket hits: {} ({:.2}%)", self.bucket_hits, pct(self.bucket_hits));
        let _ = writeln!(out, "  misses:      {} ({:.2}%)", self.misses, pct(self.misses));

        for (label, stats) in [("cache hit", &self.cache_hit), ("bucket search", &self.bucket_search)] {
            if stats.samples == 0 {
                continue;
            }
            let post = posterior(stats);
            let _ = writeln!(
                out,
                "  {label} latency ({} samples): min {} ns, avg {:.3} ns, max {} ns, stddev {:.3} ns",
                stats.samples,
                stats.min_ns,
                fixed::to_f64(post.mean_ns_q48),
                stats.max_ns,
                fixed::to_f64(post.stddev_ns_q48),
            );
            let _ = writeln!(
                out,
                "    95% CI [{:.3}, {:.3}] ns, 99% CI [{:.3}, {:.3}] ns",
                fixed::to_f64(post.credible_lower_95),
                fixed::to_f64(post.credible_upper_95),
                fixed::to_f64(post.credible_lower_99),
                fixed::to_f64(post.credible_upper_99),
            );
        }

        if self.cache_hit.samples > 0 && self.bucket_search.samples > 0 {
            let est = speedup_estimate(self);
            let _ = writeln!(
                out,
                "  speedup: {:.2}x (95% CI [{:.2}, {:.2}]), P(>1.1x) = {:.3}, P(>2x) = {:.3}",
                fixed::to_f64(est.speedup_q48),
                fixed::to_f64(est.credible_lower_95_q48),
                fixed::to_f64(est.credible_upper_95_q48),
                fixed::to_f64(est.probability_gt_10pct_q48),
                fixed::to_f64(est.probability_gt_double_q48),
            );
        }

        let _ = writeln!(
            out,
            "  promotions: {}, evictions: {}, reorders: {}",
            self.promotions, self.evictions, self.bucket_reorders
        );
        out
    }
}

/// The cache proper: word ids, an LRU cursor and the statistics record.
#[derive(Debug)]
pub struct HotCache {
    enabled: bool,
    slots: Vec<WordId>,
    lru: usize,
    pub stats: CacheStats,
}

impl HotCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: true,
            slots: Vec::with_capacity(CACHE_CAPACITY),
            lru: 0,
            stats: CacheStats::default(),
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn contains(&self, id: WordId) -> bool {
        self.slots.contains(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn reset_stats(&mut self) {
        self.stats = CacheStats::default();
    }

    /// Dictionary lookup through the cache.
    ///
    /// A hit in either tier bumps the entry's execution heat; a bucket hit
    /// hot enough afterwards is promoted into the cache.
    pub fn find(
        &mut self,
        dict: &mut Dictionary,
        host: &dyn HostServices,
        name: &[u8],
    ) -> Option<WordId> {
        if !self.enabled {
            let id = dict.probe(name)?;
            dict.entry_mut(id).execution_heat += ONE;
            return Some(id);
        }

        let start = host.monotonic_ns();
        self.stats.total_lookups += 1;
        #[cfg(debug_assertions)]
        self.validate(dict);

        for &id in &self.slots {
            let entry = dict.entry(id);
            if entry.visible() && entry.matches(name) {
                self.stats.cache_hits += 1;
                let elapsed = (host.monotonic_ns() - start) as i64;
                self.stats.cache_hit.record(elapsed);
                dict.entry_mut(id).execution_heat += ONE;
                return Some(id);
            }
        }

        if let Some(id) = dict.probe(name) {
            self.stats.bucket_hits += 1;
            let elapsed = (host.monotonic_ns() - start) as i64;
            self.stats.bucket_search.record(elapsed);
            dict.entry_mut(id).execution_heat += ONE;
            if dict.entry(id).execution_heat > HEAT_PROMOTION_THRESHOLD {
                self.promote(id);
            }
            return Some(id);
        }

        self.stats.misses += 1;
        None
    }

    /// Insert `id`, evicting the LRU cursor slot when full. Duplicate
    /// promotion is a no-op.
    pub fn promote(&mut self, id: WordId) {
        if self.slots.contains(&id) {
            return;
        }
        if self.slots.len() >= CACHE_CAPACITY {
            self.slots[self.lru] = id;
            self.lru = (self.lru + 1) % CACHE_CAPACITY;
            self.stats.evictions += 1;
            return;
        }
        self.slots.push(id);
        self.stats.promotions += 1;
    }

    /// Reorder the dictionary probe order by heat.
    pub fn reorder_bucket(&mut self, dict: &mut Dictionary) {
        dict.reorder_by_heat();
        self.stats.bucket_reorders += 1;
    }

    /// Drop cached ids at or above `fence` (after FORGET).
    pub fn purge_from(&mut self, fence: usize) {
        self.slots.retain(|&id| (id as usize) < fence);
        self.lru = 0;
    }

    /// Debug validation: every cached id must be reachable from the
    /// dictionary head.
    #[cfg(debug_assertions)]
    pub fn validate(&self, dict: &Dictionary) {
        for &id in &self.slots {
            debug_assert!(dict.owns(id), "cached word {id} not in dictionary");
        }
    }
}

impl Default for HotCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::WordFunc;
    use crate::host::CapturingHost;
    use crate::vm::Vm;

    fn nop(_: &mut Vm) {}

    fn dict_of(n: usize) -> Dictionary {
        let mut dict = Dictionary::new();
        for i in 0..n {
            let name = format!("W{i}");
            dict.create(name.as_bytes(), WordFunc::Primitive(nop), 0, 0)
                .unwrap();
        }
        dict
    }

    #[test]
    fn lookup_records_hits_and_misses() {
        let mut dict = dict_of(4);
        let mut cache = HotCache::new();
        let host = CapturingHost::new();

        assert_eq!(Some(2), cache.find(&mut dict, &host, b"W2"));
        assert_eq!(1, cache.stats.bucket_hits);
        assert_eq!(1, cache.stats.bucket_search.samples);
        assert!(cache.stats.bucket_search.min_ns > 0);

        assert_eq!(None, cache.find(&mut dict, &host, b"NOPE"));
        assert_eq!(1, cache.stats.misses);
        assert_eq!(2, cache.stats.total_lookups);
    }

    #[test]
    fn promotion_after_threshold_then_cache_hits() {
        let mut dict = dict_of(1);
        let mut cache = HotCache::new();
        let host = CapturingHost::new();

        // Ten lookups leave the heat exactly at the threshold.
        for _ in 0..10 {
            cache.find(&mut dict, &host, b"W0").unwrap();
        }
        assert!(!cache.contains(0));
        assert_eq!(0, cache.stats.promotions);

        // The eleventh pushes it over and promotes.
        cache.find(&mut dict, &host, b"W0").unwrap();
        assert!(cache.contains(0));
        assert_eq!(1, cache.stats.promotions);

        let hits_before = cache.stats.cache_hits;
        cache.find(&mut dict, &host, b"W0").unwrap();
        assert_eq!(hits_before + 1, cache.stats.cache_hits);
    }

    #[test]
    fn eviction_follows_lru_cursor() {
        let mut dict = dict_of(CACHE_CAPACITY + 3);
        let mut cache = HotCache::new();

        for id in 0..CACHE_CAPACITY as WordId {
            cache.promote(id);
        }
        assert_eq!(CACHE_CAPACITY, cache.len());
        assert_eq!(CACHE_CAPACITY as u64, cache.stats.promotions);

        cache.promote(CACHE_CAPACITY as WordId);
        assert_eq!(CACHE_CAPACITY, cache.len());
        assert_eq!(1, cache.stats.evictions);
        assert!(!cache.contains(0));
        assert!(cache.contains(CACHE_CAPACITY as WordId));

        cache.promote(CACHE_CAPACITY as WordId + 1);
        assert!(!cache.contains(1));

        // Duplicate promotion is a no-op.
        let evictions = cache.stats.evictions;
        cache.promote(CACHE_CAPACITY as WordId);
        assert_eq!(evictions, cache.stats.evictions);

        assert!(dict.len() > CACHE_CAPACITY);
        #[cfg(debug_assertions)]
        cache.validate(&dict);
    }

    #[test]
    fn smudged_cached_word_is_skipped() {
        let mut dict = dict_of(2);
        let mut cache = HotCache::new();
        let host = CapturingHost::new();
        cache.promote(1);
        dict.entry_mut(1).flags |= crate::dict::WordFlags::SMUDGED;
        assert_eq!(None, cache.find(&mut dict, &host, b"W1"));
    }

    #[test]
    fn posterior_matches_synthetic_samples() {
        let mut stats = LatencyStats::default();
        for ns in [100i64, 200, 300] {
            stats.record(ns);
        }
        let post = posterior(&stats);
        assert_eq!(3, post.sample_count);
        assert_eq!(fixed::from_int(200), post.mean_ns_q48);
        // variance = E[X^2] - E[X]^2 = 46666.67 - 40000
        let var = fixed::to_f64(post.variance_q48);
        assert!((var - 6666.6).abs() < 10.0, "variance {var}");
        assert!(post.credible_lower_95 <= post.mean_ns_q48);
        assert!(post.credible_upper_95 >= post.mean_ns_q48);
        assert!(post.credible_upper_99 >= post.credible_upper_95);
    }

    #[test]
    fn posterior_of_empty_stats_is_zero() {
        let post = posterior(&LatencyStats::default());
        assert_eq!(0, post.sample_count);
        assert_eq!(0, post.mean_ns_q48);
    }

    #[test]
    fn speedup_tracks_mean_ratio() {
        let mut stats = CacheStats::default();
        for _ in 0..50 {
            stats.cache_hit.record(100);
            stats.bucket_search.record(300);
        }
        let est = speedup_estimate(&stats);
        let speedup = fixed::to_f64(est.speedup_q48);
        assert!((speedup - 3.0).abs() < 0.01, "speedup {speedup}");
        // Zero variance: the ratio is certainly above both targets.
        assert_eq!(ONE, est.probability_gt_10pct_q48);
        assert_eq!(ONE, est.probability_gt_double_q48);
    }

    #[test]
    fn summary_renders_without_samples() {
        let stats = CacheStats::default();
        assert!(stats.summary().contains("no lookups"));
    }
}
