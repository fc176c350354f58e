//! Parallel cache warm-up.
//!
//! Builds every (instrument, granularity) series a session will need before
//! the clock starts. Keys are deduplicated first so no two workers ever
//! write the same cache file. A failing key is reported and skipped; it
//! never stops the others.

use rayon::prelude::*;
use std::collections::HashSet;
use tracing::{info, warn};

use driftlab_core::calendar::Granularity;
use driftlab_core::data::{BarRequest, CacheKey};
use driftlab_core::domain::{Instrument, QuotePair};
use driftlab_core::PriceResolver;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrefetchReport {
    /// Keys now cached, with their bar counts.
    pub loaded: Vec<(CacheKey, usize)>,
    /// Keys that could not be built, with the reason.
    pub failed: Vec<(CacheKey, String)>,
    /// Instruments that could not form a pair with the quote.
    pub invalid: Vec<(Instrument, String)>,
}

impl PrefetchReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.invalid.is_empty()
    }
}

/// Fetch and cache every requested series on the rayon pool.
pub fn prefetch_parallel(
    resolver: &PriceResolver,
    instruments: &[Instrument],
    quote: &Instrument,
    granularities: &[Granularity],
) -> PrefetchReport {
    let mut report = PrefetchReport::default();
    let mut seen = HashSet::new();
    let mut requests: Vec<BarRequest> = Vec::new();

    for instrument in instruments {
        let pair = match QuotePair::new(instrument.clone(), quote.clone()) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(symbol = %instrument, error = %e, "skipping prefetch for invalid pair");
                report.invalid.push((instrument.clone(), e.to_string()));
                continue;
            }
        };
        for &granularity in granularities {
            let request = resolver.request_for(pair.clone(), granularity);
            if seen.insert(request.cache_key()) {
                requests.push(request);
            }
        }
    }

    let results: Vec<(CacheKey, Result<usize, String>)> = requests
        .par_iter()
        .map(|request| {
            let key = request.cache_key();
            let result = resolver
                .store()
                .fetch_and_cache(request, resolver.source(), resolver.calendar())
                .map(|series| series.len())
                .map_err(|e| e.to_string());
            (key, result)
        })
        .collect();

    for (key, result) in results {
        match result {
            Ok(bars) => report.loaded.push((key, bars)),
            Err(reason) => {
                warn!(key = %key, reason = %reason, "prefetch failed");
                report.failed.push((key, reason));
            }
        }
    }
    report.loaded.sort();
    report.failed.sort();

    info!(
        loaded = report.loaded.len(),
        failed = report.failed.len(),
        invalid = report.invalid.len(),
        "prefetch finished"
    );
    report
}
