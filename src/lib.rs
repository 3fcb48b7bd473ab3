//! Distributed tracing instrumentation: trace contexts, spans, sampling and
//! B3 wire propagation.
//!
//! `weft` is the in-process half of a tracing system. It models a trace as
//! immutable [`TraceContext`] values derived through a [`Tracer`], records
//! timing and annotations on [`Span`] handles, and moves contexts across
//! process boundaries through pluggable
//! [`Propagation`](propagation::Propagation) formats. Finished spans are
//! handed to a [`Reporter`]; what happens to them after that is out of
//! scope here.
//!
//! ```
//! use std::sync::Arc;
//! use weft::{InMemoryReporter, Kind, Sampler, Tracing};
//!
//! let reporter = Arc::new(InMemoryReporter::new());
//! let tracing = Tracing::builder()
//!     .reporter(reporter.clone())
//!     .sampler(Sampler::TraceIdRatioBased(1.0))
//!     .build();
//! let tracer = tracing.tracer();
//!
//! let span = tracer.new_trace();
//! span.start().name("get /users").kind(Kind::Server).tag("http.status_code", "200");
//! {
//!     let _scope = tracer.with_span_in_scope(Some(&span));
//!     let child = tracer.next_span();
//!     child.start().name("sql query").finish();
//! }
//! span.finish();
//!
//! assert_eq!(reporter.finished_spans().len(), 2);
//! ```
//!
//! Unsampled traces still carry valid contexts; their span handles are
//! no-ops, so instrumentation never needs a sampling check of its own.
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_debug_implementations)]

pub mod baggage;
mod clock;
mod context;
mod current;
mod hex;
mod internal_logging;
mod mutable_span;
pub mod propagation;
mod recorder;
mod reporter;
mod sampler;
mod span;
mod tracer;

pub use clock::{Clock, SystemClock};
pub use context::{
    ContextBuildError, Extracted, ExtractedKind, SamplingFlags, TraceContext,
    TraceContextBuilder, TraceFlags, TraceIdContext,
};
pub use current::{
    wrap, CurrentTraceContext, Scope, StrictCurrentTraceContext, ThreadLocalCurrentTraceContext,
};
pub use mutable_span::{Kind, MutableSpan};
pub use reporter::{InMemoryReporter, NoopReporter, ReportError, Reporter};
pub use sampler::{defer_decision, Sampler, SamplerFunction};
pub use span::Span;
pub use tracer::{current_tracer, Tracer, Tracing, TracingBuilder};

#[cfg(feature = "internal-logs")]
#[doc(hidden)]
pub mod _private {
    pub use tracing::{debug, warn};
}
