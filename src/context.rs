//! Trace context model.
//!
//! A [`TraceContext`] holds the identifiers and sampling state propagated in
//! and out of process. It is immutable: derivation (child spans, decoration)
//! always produces a new value, so a parent can never observe a child's
//! mutations. Equality and hashing are defined over the span *identity*
//! `(trace_id_high, trace_id, span_id, shared)` only, because that identity
//! is the key of the span registry.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{BitAnd, BitOr, Not};
use std::sync::Arc;

use thiserror::Error;

use crate::hex::{parse_lower_hex_u64, push_hex_u64, trace_id_string};

/// Flags carried by a [`TraceContext`].
///
/// `sampled` is tri-state: the SAMPLED bit is only meaningful when
/// SAMPLED_SET is present, so "no decision yet" survives propagation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TraceFlags(u16);

impl TraceFlags {
    pub(crate) const SAMPLED_SET: TraceFlags = TraceFlags(1 << 0);
    pub(crate) const SAMPLED: TraceFlags = TraceFlags(1 << 1);
    pub(crate) const DEBUG: TraceFlags = TraceFlags(1 << 2);
    pub(crate) const SHARED: TraceFlags = TraceFlags(1 << 3);
    pub(crate) const SAMPLED_LOCAL: TraceFlags = TraceFlags(1 << 4);
    pub(crate) const LOCAL_ROOT: TraceFlags = TraceFlags(1 << 5);

    /// Returns the sampling decision, or `None` when no decision was made.
    pub fn sampled(&self) -> Option<bool> {
        if !self.contains(Self::SAMPLED_SET) {
            None
        } else {
            Some(self.contains(Self::SAMPLED))
        }
    }

    /// True when this trace must be kept regardless of sampler configuration.
    pub fn debug(&self) -> bool {
        self.contains(Self::DEBUG)
    }

    pub(crate) fn contains(&self, other: TraceFlags) -> bool {
        (*self & other) == other
    }

    /// Returns a copy with the sampling decision replaced.
    pub(crate) fn with_sampled(self, sampled: Option<bool>) -> Self {
        match sampled {
            None => self & !(Self::SAMPLED_SET | Self::SAMPLED),
            Some(true) => self | Self::SAMPLED_SET | Self::SAMPLED,
            Some(false) => (self | Self::SAMPLED_SET) & !Self::SAMPLED,
        }
    }

    /// Returns a copy with the debug flag replaced. Debug implies sampled.
    pub(crate) fn with_debug(self, debug: bool) -> Self {
        if debug {
            self | Self::DEBUG | Self::SAMPLED_SET | Self::SAMPLED
        } else {
            self & !Self::DEBUG
        }
    }

    pub(crate) fn with_shared(self, shared: bool) -> Self {
        if shared {
            self | Self::SHARED
        } else {
            self & !Self::SHARED
        }
    }
}

impl BitAnd for TraceFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl BitOr for TraceFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl Not for TraceFlags {
    type Output = Self;

    fn not(self) -> Self::Output {
        Self(!self.0)
    }
}

/// Sampling state without trace identifiers, as extracted from carriers that
/// only transmitted a decision (for example a bare `X-B3-Sampled` header).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SamplingFlags {
    flags: TraceFlags,
}

impl SamplingFlags {
    /// No decision at all.
    pub const EMPTY: SamplingFlags = SamplingFlags { flags: TraceFlags(0) };
    /// Decided: record this trace.
    pub const SAMPLED: SamplingFlags = SamplingFlags {
        flags: TraceFlags(TraceFlags::SAMPLED_SET.0 | TraceFlags::SAMPLED.0),
    };
    /// Decided: drop this trace.
    pub const NOT_SAMPLED: SamplingFlags = SamplingFlags { flags: TraceFlags::SAMPLED_SET };
    /// Force-keep, overriding downstream samplers.
    pub const DEBUG: SamplingFlags = SamplingFlags {
        flags: TraceFlags(
            TraceFlags::DEBUG.0 | TraceFlags::SAMPLED_SET.0 | TraceFlags::SAMPLED.0,
        ),
    };

    pub fn sampled(&self) -> Option<bool> {
        self.flags.sampled()
    }

    pub fn debug(&self) -> bool {
        self.flags.debug()
    }

    pub(crate) fn flags(&self) -> TraceFlags {
        self.flags
    }

    pub(crate) fn from_states(sampled: Option<bool>, debug: bool) -> Self {
        SamplingFlags { flags: TraceFlags(0).with_sampled(sampled).with_debug(debug) }
    }
}

/// An opaque value propagated through a trace in a context's extra list.
pub type ExtraValue = Arc<dyn Any + Send + Sync>;

/// Concatenates two extra lists, keeping duplicates. A derivation merges
/// extracted and parent extras this way so decoration still sees every
/// instance; whatever it does not consolidate is dropped afterwards by
/// [`TraceContext::with_deduped_extra`].
pub(crate) fn concat_extra(first: &[ExtraValue], second: &[ExtraValue]) -> Vec<ExtraValue> {
    let mut merged: Vec<ExtraValue> = Vec::with_capacity(first.len() + second.len());
    merged.extend(first.iter().cloned());
    merged.extend(second.iter().cloned());
    merged
}

/// Concatenates two extra lists, keeping only the earliest occurrence of
/// each runtime type. The first list wins on duplicates.
pub(crate) fn concat_extra_dedup(first: &[ExtraValue], second: &[ExtraValue]) -> Vec<ExtraValue> {
    let mut merged: Vec<ExtraValue> = Vec::with_capacity(first.len() + second.len());
    let mut seen: Vec<TypeId> = Vec::with_capacity(first.len() + second.len());
    for value in first.iter().chain(second.iter()) {
        let type_id = (**value).type_id();
        if !seen.contains(&type_id) {
            seen.push(type_id);
            merged.push(Arc::clone(value));
        }
    }
    merged
}

/// Failure to build a [`TraceContext`] directly.
///
/// Only reachable through builder misuse: the [`Tracer`](crate::Tracer)
/// always backfills missing identifiers before building.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ContextBuildError {
    #[error("trace context missing trace_id")]
    MissingTraceId,
    #[error("trace context missing span_id")]
    MissingSpanId,
}

/// Trace identifiers and sampling state propagated in and out of process.
#[derive(Clone)]
pub struct TraceContext {
    flags: TraceFlags,
    trace_id_high: u64,
    trace_id: u64,
    parent_id: u64,
    span_id: u64,
    local_root_id: u64,
    extra: Arc<Vec<ExtraValue>>,
}

impl TraceContext {
    pub fn builder() -> TraceContextBuilder {
        TraceContextBuilder::default()
    }

    pub(crate) fn new_internal(
        flags: TraceFlags,
        trace_id_high: u64,
        trace_id: u64,
        local_root_id: u64,
        parent_id: u64,
        span_id: u64,
        extra: Arc<Vec<ExtraValue>>,
    ) -> Self {
        TraceContext { flags, trace_id_high, trace_id, parent_id, span_id, local_root_id, extra }
    }

    /// High 64 bits of the trace id. Zero means 64-bit trace ids are in use.
    pub fn trace_id_high(&self) -> u64 {
        self.trace_id_high
    }

    /// Low 64 bits of the trace id, set on every span within the trace.
    pub fn trace_id(&self) -> u64 {
        self.trace_id
    }

    /// Identifier of this span within the trace. Never zero.
    pub fn span_id(&self) -> u64 {
        self.span_id
    }

    /// The parent's span id, or `None` for a root span.
    pub fn parent_id(&self) -> Option<u64> {
        if self.parent_id != 0 {
            Some(self.parent_id)
        } else {
            None
        }
    }

    pub(crate) fn parent_id_raw(&self) -> u64 {
        self.parent_id
    }

    /// Span id of the nearest ancestor that started a new tracing island in
    /// this process. Zero only for contexts built outside the tracer.
    pub fn local_root_id(&self) -> u64 {
        self.local_root_id
    }

    /// True when this span started a new tracing island in this process.
    pub fn is_local_root(&self) -> bool {
        self.flags.contains(TraceFlags::LOCAL_ROOT)
    }

    /// The sampling decision, or `None` when none was made yet.
    pub fn sampled(&self) -> Option<bool> {
        self.flags.sampled()
    }

    /// True when this trace must be kept regardless of sampler configuration.
    pub fn debug(&self) -> bool {
        self.flags.debug()
    }

    /// True when this span id is reused by both sides of an RPC.
    pub fn shared(&self) -> bool {
        self.flags.contains(TraceFlags::SHARED)
    }

    /// True when this span records locally even if `sampled` is false.
    pub fn sampled_local(&self) -> bool {
        self.flags.contains(TraceFlags::SAMPLED_LOCAL)
    }

    pub(crate) fn flags(&self) -> TraceFlags {
        self.flags
    }

    /// The ordered list of opaque propagated values.
    pub(crate) fn extra(&self) -> &Arc<Vec<ExtraValue>> {
        &self.extra
    }

    /// Returns the extra value of the given type, if present.
    ///
    /// Decoration consolidates duplicates, so at most one value per type is
    /// observable through this lookup.
    pub fn find_extra<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.extra.iter().find_map(|value| Arc::clone(value).downcast::<T>().ok())
    }

    /// Returns a copy of this context with the extra list replaced.
    pub(crate) fn with_extra(&self, extra: Arc<Vec<ExtraValue>>) -> Self {
        let mut next = self.clone();
        next.extra = extra;
        next
    }

    /// Keeps only the earliest extra value of each runtime type, returning
    /// the context untouched (same allocation) when nothing needs dropping.
    pub(crate) fn with_deduped_extra(self) -> Self {
        let mut seen: Vec<TypeId> = Vec::with_capacity(self.extra.len());
        let unique = self.extra.iter().all(|value| {
            let type_id = (**value).type_id();
            if seen.contains(&type_id) {
                false
            } else {
                seen.push(type_id);
                true
            }
        });
        if unique {
            return self;
        }
        let deduped = concat_extra_dedup(&self.extra, &[]);
        self.with_extra(Arc::new(deduped))
    }

    /// Returns a copy of this context with one more extra value appended.
    pub(crate) fn with_appended_extra(&self, value: ExtraValue) -> Self {
        let mut extra = Vec::with_capacity(self.extra.len() + 1);
        extra.extend(self.extra.iter().cloned());
        extra.push(value);
        self.with_extra(Arc::new(extra))
    }

    /// The hex representation of the trace id: 32 characters for 128-bit
    /// traces, 16 otherwise.
    pub fn trace_id_string(&self) -> String {
        trace_id_string(self.trace_id_high, self.trace_id)
    }

    /// The zero-padded 16 character hex representation of the span id.
    pub fn span_id_string(&self) -> String {
        let mut out = String::with_capacity(16);
        push_hex_u64(&mut out, self.span_id);
        out
    }

    pub fn to_builder(&self) -> TraceContextBuilder {
        TraceContextBuilder {
            flags: self.flags,
            trace_id_high: self.trace_id_high,
            trace_id: self.trace_id,
            parent_id: self.parent_id,
            span_id: self.span_id,
            local_root_id: self.local_root_id,
            extra: self.extra.as_ref().clone(),
        }
    }
}

impl PartialEq for TraceContext {
    fn eq(&self, other: &Self) -> bool {
        self.trace_id_high == other.trace_id_high
            && self.trace_id == other.trace_id
            && self.span_id == other.span_id
            && self.shared() == other.shared()
    }
}

impl Eq for TraceContext {}

impl Hash for TraceContext {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.trace_id_high.hash(state);
        self.trace_id.hash(state);
        self.span_id.hash(state);
        self.shared().hash(state);
    }
}

impl fmt::Display for TraceContext {
    /// Renders `{traceId}/{spanId}` in zero-padded lower-hex.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.trace_id_string(), self.span_id_string())
    }
}

impl fmt::Debug for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Builds a [`TraceContext`] from primitives or lower-hex wire text.
#[derive(Clone, Default)]
pub struct TraceContextBuilder {
    flags: TraceFlags,
    trace_id_high: u64,
    trace_id: u64,
    parent_id: u64,
    span_id: u64,
    local_root_id: u64,
    extra: Vec<ExtraValue>,
}

impl fmt::Debug for TraceContextBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceContextBuilder")
            .field("trace_id_high", &self.trace_id_high)
            .field("trace_id", &self.trace_id)
            .field("parent_id", &self.parent_id)
            .field("span_id", &self.span_id)
            .field("flags", &self.flags)
            .field("extra_len", &self.extra.len())
            .finish()
    }
}

impl TraceContextBuilder {
    pub fn trace_id_high(mut self, trace_id_high: u64) -> Self {
        self.trace_id_high = trace_id_high;
        self
    }

    pub fn trace_id(mut self, trace_id: u64) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn span_id(mut self, span_id: u64) -> Self {
        self.span_id = span_id;
        self
    }

    /// `None` marks a root span.
    pub fn parent_id(mut self, parent_id: Option<u64>) -> Self {
        self.parent_id = parent_id.unwrap_or(0);
        self
    }

    /// `None` clears any prior decision.
    pub fn sampled(mut self, sampled: Option<bool>) -> Self {
        self.flags = self.flags.with_sampled(sampled);
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.flags = self.flags.with_debug(debug);
        self
    }

    pub fn shared(mut self, shared: bool) -> Self {
        self.flags = self.flags.with_shared(shared);
        self
    }

    pub fn add_extra<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.extra.push(Arc::new(value));
        self
    }

    pub(crate) fn sampling_flags(mut self, sampling: SamplingFlags) -> Self {
        self.flags = self.flags | sampling.flags();
        self
    }

    /// Parses a 1-32 character lower-hex trace id, filling both halves.
    ///
    /// Returns `false` on malformed input, leaving the builder's trace id
    /// zero. Callers check the result instead of catching anything.
    pub fn parse_trace_id(&mut self, value: &str) -> bool {
        let length = value.len();
        if length == 0 || length > 32 {
            crate::weft_debug!(name: "context.trace_id_length", length = length);
            return false;
        }
        // left-most characters, if any, are the high bits; a zero high half
        // is valid (a 64-bit id padded to 128), so check those characters
        // rather than the parsed value
        if length > 16 {
            let (high, low) = value.split_at(length - 16);
            if !high.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
                crate::weft_debug!(name: "context.trace_id_not_lower_hex");
                return false;
            }
            let trace_id = parse_lower_hex_u64(low);
            if trace_id == 0 {
                crate::weft_debug!(name: "context.trace_id_not_lower_hex");
                return false;
            }
            self.trace_id_high = parse_lower_hex_u64(high);
            self.trace_id = trace_id;
            return true;
        }
        let trace_id = parse_lower_hex_u64(value);
        if trace_id == 0 {
            crate::weft_debug!(name: "context.trace_id_not_lower_hex");
            return false;
        }
        self.trace_id = trace_id;
        true
    }

    /// The trace id halves parsed or set so far.
    pub(crate) fn trace_id_parts(&self) -> (u64, u64) {
        (self.trace_id_high, self.trace_id)
    }

    /// Parses a 1-16 character lower-hex span id. Returns `false` and leaves
    /// the field zero on malformed input.
    pub fn parse_span_id(&mut self, value: &str) -> bool {
        if value.is_empty() || value.len() > 16 {
            crate::weft_debug!(name: "context.span_id_length", length = value.len());
            return false;
        }
        let span_id = parse_lower_hex_u64(value);
        if span_id == 0 {
            crate::weft_debug!(name: "context.span_id_not_lower_hex");
            return false;
        }
        self.span_id = span_id;
        true
    }

    /// Parses an optional parent id. An absent parent is valid (`true`).
    pub fn parse_parent_id(&mut self, value: Option<&str>) -> bool {
        let Some(value) = value else { return true };
        if value.is_empty() || value.len() > 16 {
            crate::weft_debug!(name: "context.parent_id_length", length = value.len());
            return false;
        }
        let parent_id = parse_lower_hex_u64(value);
        if parent_id == 0 {
            crate::weft_debug!(name: "context.parent_id_not_lower_hex");
            return false;
        }
        self.parent_id = parent_id;
        true
    }

    /// Like [`build`](Self::build), but returns the failure instead of
    /// panicking.
    pub fn try_build(self) -> Result<TraceContext, ContextBuildError> {
        if self.trace_id == 0 {
            return Err(ContextBuildError::MissingTraceId);
        }
        if self.span_id == 0 {
            return Err(ContextBuildError::MissingSpanId);
        }
        Ok(TraceContext {
            flags: self.flags,
            trace_id_high: self.trace_id_high,
            trace_id: self.trace_id,
            parent_id: self.parent_id,
            span_id: self.span_id,
            local_root_id: self.local_root_id,
            extra: Arc::new(self.extra),
        })
    }

    /// # Panics
    ///
    /// When `trace_id` or `span_id` is zero. This is direct builder misuse:
    /// tracer-derived contexts always have both backfilled.
    pub fn build(self) -> TraceContext {
        match self.try_build() {
            Ok(context) => context,
            Err(err) => panic!("{err}"),
        }
    }
}

/// Trace id and sampling state extracted without a span id, for formats that
/// can transmit a trace id alone.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TraceIdContext {
    flags: TraceFlags,
    trace_id_high: u64,
    trace_id: u64,
}

impl TraceIdContext {
    pub fn new(trace_id_high: u64, trace_id: u64, sampling: SamplingFlags) -> Self {
        TraceIdContext { flags: sampling.flags(), trace_id_high, trace_id }
    }

    pub fn trace_id_high(&self) -> u64 {
        self.trace_id_high
    }

    pub fn trace_id(&self) -> u64 {
        self.trace_id
    }

    pub fn sampled(&self) -> Option<bool> {
        self.flags.sampled()
    }

    pub fn debug(&self) -> bool {
        self.flags.debug()
    }

    pub(crate) fn flags(&self) -> TraceFlags {
        self.flags
    }
}

impl fmt::Display for TraceIdContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&trace_id_string(self.trace_id_high, self.trace_id))
    }
}

impl fmt::Debug for TraceIdContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Which shape an extractor recovered from a carrier.
#[derive(Clone, Debug)]
pub enum ExtractedKind {
    /// Explicit trace and span ids were present.
    Context(TraceContext),
    /// Only a trace id was present.
    TraceId(TraceIdContext),
    /// At most a sampling decision was present.
    Flags(SamplingFlags),
}

/// The result of [`Propagation::extract`](crate::propagation::Propagation::extract):
/// a full context, a trace id, or bare sampling flags, whichever the carrier
/// held, plus any extracted extra values not yet bound to an identity.
#[derive(Clone)]
pub struct Extracted {
    kind: ExtractedKind,
    extra: Vec<ExtraValue>,
}

impl Extracted {
    /// Nothing extracted: empty sampling flags and no extra.
    pub fn empty() -> Self {
        Extracted { kind: ExtractedKind::Flags(SamplingFlags::EMPTY), extra: Vec::new() }
    }

    pub fn from_context(context: TraceContext) -> Self {
        Extracted { kind: ExtractedKind::Context(context), extra: Vec::new() }
    }

    pub fn from_trace_id(trace_id_context: TraceIdContext) -> Self {
        Extracted { kind: ExtractedKind::TraceId(trace_id_context), extra: Vec::new() }
    }

    pub fn from_flags(sampling: SamplingFlags) -> Self {
        Extracted { kind: ExtractedKind::Flags(sampling), extra: Vec::new() }
    }

    /// True when neither identifiers, a decision, nor extra were recovered.
    pub fn is_empty(&self) -> bool {
        matches!(self.kind, ExtractedKind::Flags(flags) if flags == SamplingFlags::EMPTY)
            && self.extra.is_empty()
    }

    pub fn context(&self) -> Option<&TraceContext> {
        match &self.kind {
            ExtractedKind::Context(context) => Some(context),
            _ => None,
        }
    }

    pub fn trace_id_context(&self) -> Option<&TraceIdContext> {
        match &self.kind {
            ExtractedKind::TraceId(trace_id_context) => Some(trace_id_context),
            _ => None,
        }
    }

    pub fn sampled(&self) -> Option<bool> {
        match &self.kind {
            ExtractedKind::Context(context) => context.sampled(),
            ExtractedKind::TraceId(trace_id_context) => trace_id_context.sampled(),
            ExtractedKind::Flags(sampling) => sampling.sampled(),
        }
    }

    pub fn kind(&self) -> &ExtractedKind {
        &self.kind
    }

    /// Attaches an extracted extra value. When a full context was extracted
    /// the value lands directly in its `extra` list; otherwise it is carried
    /// until the tracer binds it during derivation.
    pub fn add_extra<T: Any + Send + Sync>(&mut self, value: T) {
        self.add_extra_value(Arc::new(value));
    }

    pub(crate) fn add_extra_value(&mut self, value: ExtraValue) {
        match &mut self.kind {
            ExtractedKind::Context(context) => *context = context.with_appended_extra(value),
            _ => self.extra.push(value),
        }
    }

    pub(crate) fn into_parts(self) -> (ExtractedKind, Vec<ExtraValue>) {
        (self.kind, self.extra)
    }
}

impl fmt::Debug for Extracted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Extracted");
        match &self.kind {
            ExtractedKind::Context(context) => dbg.field("context", context),
            ExtractedKind::TraceId(trace_id_context) => dbg.field("trace_id", trace_id_context),
            ExtractedKind::Flags(sampling) => dbg.field("flags", sampling),
        };
        dbg.field("extra_len", &self.extra.len()).finish()
    }
}
