//! The public span handle.

use std::fmt;
use std::sync::Arc;

use crate::context::TraceContext;
use crate::mutable_span::Kind;
use crate::recorder::{PendingSpan, PendingSpans};

/// A handle to one operation being timed and annotated.
///
/// Handles for an unsampled context are no-ops: every call returns without
/// touching shared state, so instrumentation costs nothing when the trace is
/// dropped. Two handles to the same context write to the same underlying
/// state.
///
/// Dropping a handle does nothing. Call [`finish`](Self::finish) (or
/// [`abandon`](Self::abandon)/[`flush`](Self::flush)) to end the span; a
/// span never ended is simply never reported.
pub struct Span {
    context: TraceContext,
    inner: SpanInner,
}

enum SpanInner {
    Noop,
    Real { pending: Arc<PendingSpan>, recorder: Arc<PendingSpans> },
}

impl Span {
    pub(crate) fn noop(context: TraceContext) -> Self {
        Span { context, inner: SpanInner::Noop }
    }

    pub(crate) fn real(
        context: TraceContext,
        pending: Arc<PendingSpan>,
        recorder: Arc<PendingSpans>,
    ) -> Self {
        Span { context, inner: SpanInner::Real { pending, recorder } }
    }

    pub fn context(&self) -> &TraceContext {
        &self.context
    }

    /// True when this handle records nothing.
    pub fn is_noop(&self) -> bool {
        matches!(self.inner, SpanInner::Noop)
    }

    fn with_state(&self, f: impl FnOnce(&mut crate::mutable_span::MutableSpan)) {
        if let SpanInner::Real { pending, .. } = &self.inner {
            pending.with_state(f);
        }
    }

    /// Records the start timestamp from the span's clock. Spans come back
    /// from the tracer un-started; one finished without ever starting is
    /// reported without a start timestamp. Calling this again moves the
    /// start.
    pub fn start(&self) -> &Self {
        if let SpanInner::Real { pending, .. } = &self.inner {
            let timestamp = pending.current_time_micros();
            pending.with_state(|state| state.start_timestamp = timestamp);
        }
        self
    }

    pub fn start_with_timestamp(&self, timestamp_micros: u64) -> &Self {
        self.with_state(|state| state.start_timestamp = timestamp_micros);
        self
    }

    /// Names the operation, like `get /users/{id}`. Last call wins.
    pub fn name(&self, name: impl Into<String>) -> &Self {
        let name = name.into();
        self.with_state(|state| state.name = Some(name));
        self
    }

    pub fn kind(&self, kind: Kind) -> &Self {
        self.with_state(|state| state.kind = Some(kind));
        self
    }

    /// Tags the span. Re-tagging a key overwrites its value.
    pub fn tag(&self, key: impl Into<String>, value: impl Into<String>) -> &Self {
        let key = key.into();
        let value = value.into();
        self.with_state(|state| state.tag(key, value));
        self
    }

    /// Records an event at the current time.
    pub fn annotate(&self, value: impl Into<String>) -> &Self {
        if let SpanInner::Real { pending, .. } = &self.inner {
            let timestamp = pending.current_time_micros();
            let value = value.into();
            pending.with_state(|state| state.annotate(timestamp, value));
        }
        self
    }

    pub fn annotate_at(&self, timestamp_micros: u64, value: impl Into<String>) -> &Self {
        let value = value.into();
        self.with_state(|state| state.annotate(timestamp_micros, value));
        self
    }

    pub fn error(&self, message: impl Into<String>) -> &Self {
        let message = message.into();
        self.with_state(|state| state.error = Some(message));
        self
    }

    /// Names the remote side of an RPC, like `grpc-user-service`.
    pub fn remote_service_name(&self, name: impl Into<String>) -> &Self {
        let name = name.into();
        self.with_state(|state| state.remote_service_name = Some(name));
        self
    }

    /// Ends the span at the current time and hands it to the reporter.
    ///
    /// Only the first terminal call for a span identity has an effect;
    /// later finishes, and any mutation after one, are no-ops.
    pub fn finish(&self) {
        if let SpanInner::Real { recorder, .. } = &self.inner {
            recorder.finish(&self.context, 0);
        }
    }

    pub fn finish_with_timestamp(&self, timestamp_micros: u64) {
        if let SpanInner::Real { recorder, .. } = &self.inner {
            recorder.finish(&self.context, timestamp_micros);
        }
    }

    /// Forgets the span without reporting it, as when the work it was
    /// tracking never actually ran.
    pub fn abandon(&self) {
        if let SpanInner::Real { recorder, .. } = &self.inner {
            recorder.abandon(&self.context);
        }
    }

    /// Reports the span as-is, without a finish timestamp. For spans whose
    /// end this process will never observe.
    pub fn flush(&self) {
        if let SpanInner::Real { recorder, .. } = &self.inner {
            recorder.flush(&self.context);
        }
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_noop() { "NoopSpan" } else { "RealSpan" };
        write!(f, "{kind}({})", self.context)
    }
}
