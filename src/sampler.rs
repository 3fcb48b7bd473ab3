//! Sampling decisions.
//!
//! The [`Sampler`] decides, once per trace and before any work is recorded,
//! whether a new local root is sent to the reporter. The decision is a
//! function of the trace id alone, so every participant that shares the
//! configuration reaches the same verdict without coordination.

use std::fmt::Debug;

/// Decides whether a new trace is recorded.
///
/// Consistency rule: two calls with the same trace id always return the same
/// answer, and any two samplers with the same ratio agree on every id.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Sampler {
    /// Record every trace.
    AlwaysOn,
    /// Record no trace.
    AlwaysOff,
    /// Record the given fraction of traces, chosen deterministically from the
    /// low 64 bits of the trace id. Ratios at or below zero record nothing;
    /// ratios at or above one record everything.
    TraceIdRatioBased(f64),
}

impl Sampler {
    pub fn is_sampled(&self, trace_id: u64) -> bool {
        match self {
            Sampler::AlwaysOn => true,
            Sampler::AlwaysOff => false,
            Sampler::TraceIdRatioBased(ratio) => {
                if *ratio >= 1.0 {
                    return true;
                }
                let bound = (ratio.max(0.0) * (1u64 << 63) as f64) as u64;
                // Shifting out the low bit spreads ids generated with any
                // distribution evenly across [0, 2^63).
                (trace_id >> 1) < bound
            }
        }
    }
}

/// A per-request sampling override consulted before the trace-id sampler.
///
/// `try_sample` returns `None` to abstain, deferring to the next decision
/// source. Any `Fn(&T) -> Option<bool>` works directly.
pub trait SamplerFunction<T>: Send + Sync {
    fn try_sample(&self, arg: &T) -> Option<bool>;
}

impl<T, F> SamplerFunction<T> for F
where
    F: Fn(&T) -> Option<bool> + Send + Sync,
{
    fn try_sample(&self, arg: &T) -> Option<bool> {
        self(arg)
    }
}

/// A [`SamplerFunction`] that always abstains.
pub fn defer_decision<T>() -> impl SamplerFunction<T> {
    |_: &T| None
}
