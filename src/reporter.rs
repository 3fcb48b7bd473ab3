//! Span hand-off to the collection pipeline.
//!
//! The recorder calls [`Reporter::report`] at most once per span identity,
//! after the span has already left the registry. A reporter failure is the
//! reporter's problem: the recorder logs it and moves on.

use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::context::TraceContext;
use crate::mutable_span::MutableSpan;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReportError {
    /// The collection pipeline is shut down.
    #[error("reporter is closed")]
    Closed,
    #[error("report failed: {0}")]
    Other(String),
}

/// Receives finished span data.
///
/// Implementations must tolerate concurrent calls and must not block for
/// long: `report` runs inline on whatever application thread finished the
/// span. Queue-and-flush belongs inside the reporter.
pub trait Reporter: Send + Sync + std::fmt::Debug {
    fn report(&self, context: &TraceContext, span: &MutableSpan) -> Result<(), ReportError>;
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn report(&self, _context: &TraceContext, _span: &MutableSpan) -> Result<(), ReportError> {
        Ok(())
    }
}

/// Collects reported spans in memory, for tests and examples.
#[derive(Clone, Debug, Default)]
pub struct InMemoryReporter {
    spans: Arc<Mutex<Vec<(TraceContext, MutableSpan)>>>,
}

impl InMemoryReporter {
    pub fn new() -> Self {
        InMemoryReporter::default()
    }

    /// Everything reported so far, in arrival order.
    pub fn finished_spans(&self) -> Vec<(TraceContext, MutableSpan)> {
        self.spans
            .lock()
            .map(|spans| spans.clone())
            .unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut spans) = self.spans.lock() {
            spans.clear();
        }
    }
}

impl Reporter for InMemoryReporter {
    fn report(&self, context: &TraceContext, span: &MutableSpan) -> Result<(), ReportError> {
        self.spans
            .lock()
            .map_err(|_| ReportError::Closed)?
            .push((context.clone(), span.clone()));
        Ok(())
    }
}
