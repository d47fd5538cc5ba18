// =============================================================================
// Indicator Cache — memoised outputs keyed by spec and series version
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::{IndicatorOutput, IndicatorRequest, IndicatorSpec};
use crate::error::ValidationError;
use crate::market_data::candle_series::CandleSeries;

/// Holds one output per indicator spec, tagged with the series version it
/// was computed from. A lookup against a newer version recomputes and
/// replaces the entry.
#[derive(Debug, Default)]
pub struct IndicatorCache {
    entries: HashMap<IndicatorSpec, (u64, Arc<IndicatorOutput>)>,
    computations: u64,
}

impl IndicatorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `request` and return its output for the current state of
    /// `series`, computing it only if no entry exists for this version.
    pub fn get(
        &mut self,
        request: &IndicatorRequest,
        series: &CandleSeries,
    ) -> Result<Arc<IndicatorOutput>, ValidationError> {
        let spec = request.validate()?;
        Ok(self.get_spec(spec, series))
    }

    /// Same as [`get`](Self::get) for a `NAME(a,b)` configuration string.
    pub fn get_str(
        &mut self,
        config: &str,
        series: &CandleSeries,
    ) -> Result<Arc<IndicatorOutput>, ValidationError> {
        let request = IndicatorRequest::parse(config)?;
        self.get(&request, series)
    }

    pub fn get_spec(&mut self, spec: IndicatorSpec, series: &CandleSeries) -> Arc<IndicatorOutput> {
        let version = series.version();
        if let Some((cached_version, output)) = self.entries.get(&spec) {
            if *cached_version == version {
                return Arc::clone(output);
            }
        }

        let output = Arc::new(spec.compute(&series.to_vec()));
        self.computations += 1;
        debug!(indicator = %spec, version, len = series.len(), "indicator computed");

        self.entries.insert(spec, (version, Arc::clone(&output)));
        output
    }

    /// Number of computations performed since creation.
    pub fn computations(&self) -> u64 {
        self.computations
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::IndicatorKind;
    use crate::market_data::candle_series::Candle;

    fn series(n: i64) -> CandleSeries {
        let mut s = CandleSeries::new(100);
        for i in 0..n {
            let c = 100.0 + i as f64;
            s.merge(Candle::new(i * 60_000, c, c + 1.0, c - 1.0, c, 1.0));
        }
        s
    }

    #[test]
    fn repeated_lookup_returns_same_arc() {
        let s = series(10);
        let mut cache = IndicatorCache::new();
        let request = IndicatorRequest::new(IndicatorKind::Ma);

        let a = cache.get(&request, &s).unwrap();
        let b = cache.get(&request, &s).unwrap();
        let c = cache.get_str("ma(5)", &s).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
        assert_eq!(cache.computations(), 1);
    }

    #[test]
    fn mutation_invalidates_entry() {
        let mut s = series(10);
        let mut cache = IndicatorCache::new();

        let before = cache.get_str("EMA(3)", &s).unwrap();
        s.merge(Candle::new(10 * 60_000, 110.0, 111.0, 109.0, 110.0, 1.0));
        let after = cache.get_str("EMA(3)", &s).unwrap();

        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(cache.computations(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(after.lines()[0].len(), 11);
    }

    #[test]
    fn stale_merge_keeps_entry() {
        let mut s = series(5);
        let mut cache = IndicatorCache::new();
        let before = cache.get_str("RSI(2)", &s).unwrap();
        s.merge(Candle::new(0, 1.0, 1.0, 1.0, 1.0, 1.0));
        let after = cache.get_str("RSI(2)", &s).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn distinct_specs_are_cached_separately() {
        let s = series(30);
        let mut cache = IndicatorCache::new();
        cache.get_str("BOLL(20,2)", &s).unwrap();
        cache.get_str("BOLL(20,2.5)", &s).unwrap();
        cache.get_str("BOLL", &s).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.computations(), 2);

        cache.clear();
        assert!(cache.is_empty());
        cache.get_str("BOLL", &s).unwrap();
        assert_eq!(cache.computations(), 3);
    }

    #[test]
    fn invalid_request_is_not_computed() {
        let s = series(5);
        let mut cache = IndicatorCache::new();
        assert!(cache.get_str("MA(0)", &s).is_err());
        assert!(cache.get_str("NOPE", &s).is_err());
        assert_eq!(cache.computations(), 0);
    }
}
