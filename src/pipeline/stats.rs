//! Pipeline counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of what a pipeline has done so far
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    /// Requests pulled from the queue and handed to a fetch task
    pub dispatched: u64,
    /// Transport round trips that produced a response
    pub fetched: u64,
    /// Placeholder results produced without a network response
    pub synthesized: u64,
    /// Transport calls that failed
    pub transport_errors: u64,
    /// Admissions refused by the resource throttle
    pub denied: u64,
    /// Requests sent back to the queue by a request middleware
    pub retry_requested: u64,
    /// Requests discarded by a request middleware
    pub dropped: u64,
    /// Results filtered out by a response middleware
    pub discarded: u64,
    /// Follow-up requests produced by the spider
    pub expanded: u64,
    /// Spider invocations that failed
    pub extraction_errors: u64,
    /// Follow-up requests newly admitted to the queue
    pub published: u64,
    /// Queue admissions that failed
    pub publish_errors: u64,
    /// Internal bookkeeping defects detected
    pub invariant_violations: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) dispatched: AtomicU64,
    pub(crate) fetched: AtomicU64,
    pub(crate) synthesized: AtomicU64,
    pub(crate) transport_errors: AtomicU64,
    pub(crate) denied: AtomicU64,
    pub(crate) retry_requested: AtomicU64,
    pub(crate) dropped: AtomicU64,
    pub(crate) discarded: AtomicU64,
    pub(crate) expanded: AtomicU64,
    pub(crate) extraction_errors: AtomicU64,
    pub(crate) published: AtomicU64,
    pub(crate) publish_errors: AtomicU64,
    pub(crate) invariant_violations: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PipelineStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PipelineStats {
            dispatched: load(&self.dispatched),
            fetched: load(&self.fetched),
            synthesized: load(&self.synthesized),
            transport_errors: load(&self.transport_errors),
            denied: load(&self.denied),
            retry_requested: load(&self.retry_requested),
            dropped: load(&self.dropped),
            discarded: load(&self.discarded),
            expanded: load(&self.expanded),
            extraction_errors: load(&self.extraction_errors),
            published: load(&self.published),
            publish_errors: load(&self.publish_errors),
            invariant_violations: load(&self.invariant_violations),
        }
    }
}
