//! Context propagation across process boundaries.
//!
//! A [`Propagation`] writes a [`TraceContext`] into a carrier (request
//! headers, message attributes) through an [`Injector`], and recovers
//! whatever shape the carrier held through an [`Extractor`]. Extraction is
//! total: malformed peer data degrades to a weaker
//! [`Extracted`](crate::context::Extracted) shape, never an error.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::context::{Extracted, TraceContext};

mod b3;
mod composite;

pub use b3::{B3Encoding, B3Propagation};
pub use composite::{CompositePropagation, CompositePropagationFactory};

/// Write-side carrier access.
pub trait Injector {
    /// Sets a key/value pair, replacing any prior value for the key.
    fn set(&mut self, key: &str, value: String);
}

/// Read-side carrier access. Key lookup is case-insensitive, matching HTTP
/// header semantics.
pub trait Extractor {
    fn get(&self, key: &str) -> Option<Cow<'_, str>>;

    /// All keys present in the carrier, for diagnostics.
    fn keys(&self) -> Vec<&str>;
}

impl Injector for HashMap<String, String> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_lowercase(), value);
    }
}

impl Extractor for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<Cow<'_, str>> {
        self.get(&key.to_lowercase()).map(|value| Cow::Borrowed(value.as_str()))
    }

    fn keys(&self) -> Vec<&str> {
        self.keys().map(|key| key.as_str()).collect()
    }
}

/// One wire format: a fixed key set plus inject/extract over it.
pub trait Propagation: Send + Sync + Debug {
    /// The carrier keys this format reads and writes. Fixed for the life of
    /// the instance, so callers can pre-register them.
    fn keys(&self) -> &[String];

    fn inject(&self, context: &TraceContext, injector: &mut dyn Injector);

    fn extract(&self, extractor: &dyn Extractor) -> Extracted;
}

/// Builds a [`Propagation`] and advertises the format's capabilities, which
/// the tracer consults when deriving contexts.
pub trait PropagationFactory: Send + Sync + Debug {
    fn create(&self) -> Arc<dyn Propagation>;

    /// Whether the format can transmit a span id reused on both sides of an
    /// RPC. Formats that cannot force `join_span` to degrade to a child.
    fn supports_join(&self) -> bool {
        false
    }

    /// Whether the format needs 128-bit trace ids.
    fn requires_128bit_trace_id(&self) -> bool {
        false
    }

    /// Hook run once per context derivation, after identifiers and sampling
    /// are final. Factories that carry propagated fields use it to bind
    /// state to the new identity. Must be idempotent.
    fn decorate(&self, context: TraceContext) -> TraceContext {
        context
    }
}
