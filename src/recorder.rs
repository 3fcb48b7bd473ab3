//! The registry of in-flight spans.
//!
//! [`PendingSpans`] maps span identity to mutable state. The terminal
//! transitions (`finish`, `abandon`, `flush`) all go through an atomic
//! removal, so a span identity is handed to the reporter at most once no
//! matter how many handles race.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::clock::{Clock, TickClock};
use crate::context::TraceContext;
use crate::mutable_span::MutableSpan;
use crate::reporter::Reporter;

/// Span identity: the registry key. `shared` distinguishes a server span
/// from the client span whose id it reuses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct SpanKey {
    trace_id_high: u64,
    trace_id: u64,
    span_id: u64,
    shared: bool,
}

impl From<&TraceContext> for SpanKey {
    fn from(context: &TraceContext) -> Self {
        SpanKey {
            trace_id_high: context.trace_id_high(),
            trace_id: context.trace_id(),
            span_id: context.span_id(),
            shared: context.shared(),
        }
    }
}

/// State of one in-flight span: a clock anchored at allocation and the
/// accumulating fields.
#[derive(Debug)]
pub(crate) struct PendingSpan {
    clock: TickClock,
    state: Mutex<MutableSpan>,
}

impl PendingSpan {
    /// Epoch micros read from this span's own clock. Monotone within the
    /// span, so durations cannot go negative.
    pub(crate) fn current_time_micros(&self) -> u64 {
        self.clock.current_time_micros()
    }

    /// Runs `f` under the state lock. A poisoned lock still yields the
    /// state: span fields stay usable after a panicking instrumentation
    /// thread.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut MutableSpan) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }
}

/// Dead weak entries are swept out after this many allocations.
const SWEEP_INTERVAL: usize = 64;

/// Concurrent identity registry with at-most-once report on removal.
///
/// The registry holds its spans weakly: the allocation lives as long as some
/// [`Span`](crate::Span) handle does. An identity whose handles all dropped
/// without a terminal call leaves a dead entry behind, swept out
/// periodically, so the registry cannot grow without bound.
#[derive(Debug)]
pub(crate) struct PendingSpans {
    spans: DashMap<SpanKey, Weak<PendingSpan>>,
    clock: Arc<dyn Clock>,
    reporter: Arc<dyn Reporter>,
    allocations: AtomicUsize,
}

impl PendingSpans {
    pub(crate) fn new(clock: Arc<dyn Clock>, reporter: Arc<dyn Reporter>) -> Self {
        PendingSpans {
            spans: DashMap::new(),
            clock,
            reporter,
            allocations: AtomicUsize::new(0),
        }
    }

    /// The state for this identity, allocating on first use. All handles to
    /// the same identity share one allocation; a dead entry is replaced. The
    /// state starts blank: timing begins when something stamps a start
    /// timestamp, not here.
    pub(crate) fn get_or_create(&self, context: &TraceContext) -> Arc<PendingSpan> {
        let key = SpanKey::from(context);
        if let Some(existing) = self.get(context) {
            return existing;
        }
        self.maybe_sweep();
        match self.spans.entry(key) {
            Entry::Occupied(mut occupied) => match occupied.get().upgrade() {
                Some(existing) => existing,
                None => {
                    let fresh = self.allocate();
                    occupied.insert(Arc::downgrade(&fresh));
                    fresh
                }
            },
            Entry::Vacant(vacant) => {
                let fresh = self.allocate();
                vacant.insert(Arc::downgrade(&fresh));
                fresh
            }
        }
    }

    fn allocate(&self) -> Arc<PendingSpan> {
        let clock = TickClock::anchored(self.clock.as_ref());
        Arc::new(PendingSpan { clock, state: Mutex::new(MutableSpan::new()) })
    }

    fn maybe_sweep(&self) {
        let count = self.allocations.fetch_add(1, Ordering::Relaxed);
        if count % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            self.spans.retain(|_, pending| pending.strong_count() != 0);
        }
    }

    pub(crate) fn get(&self, context: &TraceContext) -> Option<Arc<PendingSpan>> {
        self.spans
            .get(&SpanKey::from(context))
            .and_then(|entry| entry.value().upgrade())
    }

    /// Removes the span and reports it with a finish timestamp. Zero means
    /// "read the span's clock now". Whatever the source, a started span
    /// finishes at least one microsecond after it started.
    ///
    /// Only the caller that wins the removal reports; later calls for the
    /// same identity are no-ops.
    pub(crate) fn finish(&self, context: &TraceContext, finish_timestamp: u64) {
        let Some((_, weak)) = self.spans.remove(&SpanKey::from(context)) else {
            return;
        };
        let Some(pending) = weak.upgrade() else {
            return;
        };
        let span = pending.with_state(|state| {
            let mut finish = finish_timestamp;
            if finish == 0 {
                finish = pending.current_time_micros();
            }
            if state.start_timestamp != 0 && finish <= state.start_timestamp {
                finish = state.start_timestamp + 1;
            }
            state.finish_timestamp = finish;
            state.clone()
        });
        self.report(context, &span);
    }

    /// Removes the span without reporting it.
    pub(crate) fn abandon(&self, context: &TraceContext) {
        self.spans.remove(&SpanKey::from(context));
    }

    /// Removes the span and reports it as-is, with no finish timestamp: the
    /// collector sees an incomplete span rather than nothing.
    pub(crate) fn flush(&self, context: &TraceContext) {
        let removed = self.spans.remove(&SpanKey::from(context));
        if let Some(pending) = removed.and_then(|(_, weak)| weak.upgrade()) {
            let span = pending.with_state(|state| state.clone());
            self.report(context, &span);
        }
    }

    fn report(&self, context: &TraceContext, span: &MutableSpan) {
        if let Err(err) = self.reporter.report(context, span) {
            crate::weft_warn!(
                name: "recorder.report_failed",
                trace_id = context.trace_id_string(),
                span_id = context.span_id_string(),
                error = err.to_string()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::reporter::{InMemoryReporter, NoopReporter, ReportError};
    use std::thread;

    fn registry(reporter: Arc<dyn Reporter>) -> PendingSpans {
        PendingSpans::new(Arc::new(SystemClock), reporter)
    }

    fn context() -> TraceContext {
        TraceContext::builder().trace_id(1).span_id(2).build()
    }

    #[test]
    fn handles_share_one_allocation() {
        let spans = registry(Arc::new(NoopReporter));
        let first = spans.get_or_create(&context());
        let second = spans.get_or_create(&context());
        assert!(Arc::ptr_eq(&first, &second));

        // the shared flag separates the two sides of an rpc
        let server = context().to_builder().shared(true).build();
        let third = spans.get_or_create(&server);
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn finish_reports_once_despite_racing_handles() {
        let reporter = InMemoryReporter::new();
        let spans = Arc::new(registry(Arc::new(reporter.clone())));
        let pending = spans.get_or_create(&context());

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let spans = Arc::clone(&spans);
                thread::spawn(move || spans.finish(&context(), 0))
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        drop(pending);

        assert_eq!(reporter.finished_spans().len(), 1);
    }

    #[test]
    fn finish_clamps_duration_to_a_microsecond() {
        let reporter = InMemoryReporter::new();
        let spans = registry(Arc::new(reporter.clone()));
        let pending = spans.get_or_create(&context());
        pending.with_state(|state| state.start_timestamp = 1_000);

        // explicit finish before the start must not yield a negative duration
        spans.finish(&context(), 500);
        let finished = reporter.finished_spans();
        assert_eq!(finished[0].1.finish_timestamp, 1_001);
    }

    #[test]
    fn abandon_reports_nothing() {
        let reporter = InMemoryReporter::new();
        let spans = registry(Arc::new(reporter.clone()));
        let _pending = spans.get_or_create(&context());
        spans.abandon(&context());
        spans.finish(&context(), 0);
        assert!(reporter.finished_spans().is_empty());
    }

    #[test]
    fn flush_reports_without_finish_timestamp() {
        let reporter = InMemoryReporter::new();
        let spans = registry(Arc::new(reporter.clone()));
        let pending = spans.get_or_create(&context());
        pending.with_state(|state| state.start_timestamp = 1_000);
        spans.flush(&context());

        let finished = reporter.finished_spans();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].1.start_timestamp, 1_000);
        assert_eq!(finished[0].1.finish_timestamp, 0);
    }

    #[test]
    fn dropped_handles_leave_the_registry() {
        let spans = registry(Arc::new(NoopReporter));
        drop(spans.get_or_create(&context()));
        // the dead entry lingers until a sweep catches it
        assert!(spans.spans.contains_key(&SpanKey::from(&context())));

        for span_id in 100..100 + 2 * SWEEP_INTERVAL as u64 {
            let other = TraceContext::builder().trace_id(1).span_id(span_id).build();
            drop(spans.get_or_create(&other));
            spans.abandon(&other);
        }

        assert!(!spans.spans.contains_key(&SpanKey::from(&context())));
    }

    #[test]
    fn a_dead_entry_is_replaced_on_reuse() {
        let reporter = InMemoryReporter::new();
        let spans = registry(Arc::new(reporter.clone()));
        drop(spans.get_or_create(&context()));

        // same identity, new life: the dead entry is swapped for fresh state
        let revived = spans.get_or_create(&context());
        revived.with_state(|state| state.name = Some("retry".to_string()));
        spans.finish(&context(), 0);
        assert_eq!(reporter.finished_spans()[0].1.name.as_deref(), Some("retry"));

        // all handles gone before the terminal call: nothing left to report
        drop(spans.get_or_create(&context()));
        spans.finish(&context(), 0);
        assert_eq!(reporter.finished_spans().len(), 1);
    }

    #[test]
    fn reporter_errors_are_swallowed() {
        #[derive(Debug)]
        struct FailingReporter;

        impl Reporter for FailingReporter {
            fn report(&self, _: &TraceContext, _: &MutableSpan) -> Result<(), ReportError> {
                Err(ReportError::Closed)
            }
        }

        let spans = registry(Arc::new(FailingReporter));
        let _pending = spans.get_or_create(&context());
        spans.finish(&context(), 0);
        // the removal already happened, a second finish is a no-op
        assert!(spans.get(&context()).is_none());
    }
}
