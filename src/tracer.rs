//! Span creation and the [`Tracing`] component bundle.
//!
//! The [`Tracer`] turns parents, extracted headers, or nothing at all into
//! [`Span`] handles. Every derivation funnels through one decoration step
//! that backfills identifiers, runs the sampler exactly once per local root,
//! assigns the local root, and lets the propagation factory bind its state
//! to the new identity.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::clock::{Clock, SystemClock};
use crate::context::{
    concat_extra, ExtraValue, Extracted, ExtractedKind, SamplingFlags, TraceContext, TraceFlags,
};
use crate::current::{CurrentTraceContext, Scope, ThreadLocalCurrentTraceContext};
use crate::propagation::{B3Propagation, Propagation, PropagationFactory};
use crate::recorder::PendingSpans;
use crate::reporter::{NoopReporter, Reporter};
use crate::sampler::{Sampler, SamplerFunction};
use crate::span::Span;

thread_local! {
    static ID_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_os_rng());
}

/// A non-zero pseudorandom 64-bit id.
fn next_id() -> u64 {
    ID_RNG.with(|rng| {
        let mut rng = rng.borrow_mut();
        loop {
            let id: u64 = rng.random();
            if id != 0 {
                return id;
            }
        }
    })
}

/// Creates and derives spans. Cheap to clone: all clones share the same
/// registry, sampler and configuration.
#[derive(Clone, Debug)]
pub struct Tracer {
    propagation_factory: Arc<dyn PropagationFactory>,
    pending_spans: Arc<PendingSpans>,
    sampler: Sampler,
    current_trace_context: Arc<dyn CurrentTraceContext>,
    trace_id_128bit: bool,
    supports_join: bool,
    always_sample_local: bool,
    noop: Arc<AtomicBool>,
}

impl Tracer {
    /// A span with no parent: a new trace.
    pub fn new_trace(&self) -> Span {
        self.to_decorated_span(self.decorate_context(
            TraceFlags::default(),
            0,
            0,
            0,
            0,
            0,
            Arc::new(Vec::new()),
        ))
    }

    /// A span whose parent is `parent`, in the same trace. The child is
    /// never shared, whatever the parent was.
    pub fn new_child(&self, parent: &TraceContext) -> Span {
        self.to_decorated_span(self.decorate_context(
            parent.flags().with_shared(false),
            parent.trace_id_high(),
            parent.trace_id(),
            parent.local_root_id(),
            parent.span_id(),
            0,
            Arc::clone(parent.extra()),
        ))
    }

    /// Continues the incoming span on this side of the RPC, sharing its span
    /// id, timed against this process's clock.
    ///
    /// When the propagation format (or configuration) cannot carry a span id
    /// across the wire, joining would orphan the server side, so this
    /// degrades to [`new_child`](Self::new_child).
    pub fn join_span(&self, context: &TraceContext) -> Span {
        if !self.supports_join {
            return self.new_child(context);
        }
        self.to_decorated_span(self.decorate_context(
            context.flags().with_shared(true),
            context.trace_id_high(),
            context.trace_id(),
            context.local_root_id(),
            context.parent_id_raw(),
            context.span_id(),
            Arc::clone(context.extra()),
        ))
    }

    /// The next span implied by extraction: a child when a full context came
    /// over the wire, a new root on the extracted trace id or flags
    /// otherwise. A flags-only extraction defers to the span in scope, if
    /// any, keeping the in-progress decision.
    pub fn next_span_from(&self, extracted: Extracted) -> Span {
        let (kind, extra) = extracted.into_parts();
        match kind {
            ExtractedKind::Context(context) => self.new_child(&context),
            ExtractedKind::TraceId(trace_id_context) => {
                self.to_decorated_span(self.decorate_context(
                    trace_id_context.flags(),
                    trace_id_context.trace_id_high(),
                    trace_id_context.trace_id(),
                    0,
                    0,
                    0,
                    Arc::new(extra),
                ))
            }
            ExtractedKind::Flags(sampling) => match self.current_trace_context.get() {
                Some(parent) => self.to_decorated_span(self.decorate_context(
                    parent.flags().with_shared(false),
                    parent.trace_id_high(),
                    parent.trace_id(),
                    parent.local_root_id(),
                    parent.span_id(),
                    0,
                    Arc::new(concat_extra(&extra, parent.extra())),
                )),
                None => self.to_decorated_span(self.decorate_context(
                    sampling.flags(),
                    0,
                    0,
                    0,
                    0,
                    0,
                    Arc::new(extra),
                )),
            },
        }
    }

    /// A child of the span in scope, or a new trace when none is.
    pub fn next_span(&self) -> Span {
        match self.current_trace_context.get() {
            Some(parent) => self.new_child(&parent),
            None => self.new_trace(),
        }
    }

    /// Like [`next_span`](Self::next_span), consulting `sampler_function`
    /// for new local roots. An existing scope keeps its decision; an
    /// abstaining function falls back to the configured sampler.
    pub fn next_span_with<T>(
        &self,
        sampler_function: &dyn SamplerFunction<T>,
        arg: &T,
    ) -> Span {
        if let Some(parent) = self.current_trace_context.get() {
            return self.new_child(&parent);
        }
        let sampling = SamplingFlags::from_states(sampler_function.try_sample(arg), false);
        self.to_decorated_span(self.decorate_context(
            sampling.flags(),
            0,
            0,
            0,
            0,
            0,
            Arc::new(Vec::new()),
        ))
    }

    /// A handle for an existing context, decorating it first if it never
    /// passed through this tracer (a zero local root marks that).
    pub fn to_span(&self, context: TraceContext) -> Span {
        let decorated = if context.local_root_id() != 0 {
            context
        } else {
            self.decorate_context(
                context.flags(),
                context.trace_id_high(),
                context.trace_id(),
                0,
                context.parent_id_raw(),
                context.span_id(),
                Arc::clone(context.extra()),
            )
        };
        self.to_decorated_span(decorated)
    }

    /// A handle to the span in scope, or `None` when no span is.
    pub fn current_span(&self) -> Option<Span> {
        let context = self.current_trace_context.get()?;
        if self.is_noop(&context) {
            return Some(Span::noop(context));
        }
        let pending = self.pending_spans.get_or_create(&context);
        Some(Span::real(context, pending, Arc::clone(&self.pending_spans)))
    }

    /// The context of the span in scope, if any.
    pub fn current_context(&self) -> Option<TraceContext> {
        self.current_trace_context.get()
    }

    /// Makes `span` current (or, with `None`, hides any current span) until
    /// the returned scope closes.
    pub fn with_span_in_scope(&self, span: Option<&Span>) -> Scope {
        self.current_trace_context
            .maybe_scope(span.map(|span| span.context().clone()))
    }

    fn is_noop(&self, context: &TraceContext) -> bool {
        if self.noop.load(Ordering::Relaxed) {
            return true;
        }
        !context.sampled_local() && context.sampled() != Some(true)
    }

    /// Spans come back un-started: timing begins at [`Span::start`], not at
    /// creation, so allocation cost never counts against the operation.
    fn to_decorated_span(&self, context: TraceContext) -> Span {
        if self.is_noop(&context) {
            return Span::noop(context);
        }
        let pending = self.pending_spans.get_or_create(&context);
        Span::real(context, pending, Arc::clone(&self.pending_spans))
    }

    /// The single derivation step behind every span-creating operation.
    ///
    /// Backfills the span id, then the trace id, decides sampling when no
    /// decision arrived (clearing `shared`, since nobody upstream can be
    /// reporting a span id we just invented a decision for), assigns the
    /// local root, and finally lets the propagation factory bind its state.
    /// Duplicate extra types the factory did not consolidate are dropped
    /// afterwards, earliest kept.
    fn decorate_context(
        &self,
        mut flags: TraceFlags,
        mut trace_id_high: u64,
        mut trace_id: u64,
        mut local_root_id: u64,
        parent_id: u64,
        mut span_id: u64,
        extra: Arc<Vec<ExtraValue>>,
    ) -> TraceContext {
        if self.always_sample_local {
            flags = flags | TraceFlags::SAMPLED_LOCAL;
        }
        if span_id == 0 {
            span_id = next_id();
        }
        if trace_id == 0 {
            trace_id = span_id;
            trace_id_high = if self.trace_id_128bit { next_id() } else { 0 };
        }
        if !flags.contains(TraceFlags::SAMPLED_SET) {
            flags = flags
                .with_sampled(Some(self.sampler.is_sampled(trace_id)))
                .with_shared(false);
        }
        if local_root_id == 0 {
            local_root_id = span_id;
            flags = flags | TraceFlags::LOCAL_ROOT;
        } else {
            flags = flags & !TraceFlags::LOCAL_ROOT;
        }
        self.propagation_factory
            .decorate(TraceContext::new_internal(
                flags,
                trace_id_high,
                trace_id,
                local_root_id,
                parent_id,
                span_id,
                extra,
            ))
            .with_deduped_extra()
    }
}

/// Everything needed to trace in one place: the tracer, the wire codec and
/// the in-process context plumbing, built once and shared.
#[derive(Debug)]
pub struct Tracing {
    tracer: Tracer,
    propagation: Arc<dyn Propagation>,
    current_trace_context: Arc<dyn CurrentTraceContext>,
    noop: Arc<AtomicBool>,
}

static CURRENT_TRACING: Mutex<Option<Weak<Tracing>>> = Mutex::new(None);

impl Tracing {
    pub fn builder() -> TracingBuilder {
        TracingBuilder::default()
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// The codec built from the configured propagation factory.
    pub fn propagation(&self) -> &Arc<dyn Propagation> {
        &self.propagation
    }

    pub fn current_trace_context(&self) -> &Arc<dyn CurrentTraceContext> {
        &self.current_trace_context
    }

    /// Turns all tracers of this instance into no-ops, for teardown windows
    /// where instrumented code still runs but nothing should record.
    pub fn set_noop(&self, noop: bool) {
        self.noop.store(noop, Ordering::Relaxed);
    }

    /// Registers this instance as the process default, for instrumentation
    /// that cannot be handed a `Tracing` explicitly. The first registration
    /// wins; returns whether this one took effect. Dropping a registered
    /// instance clears the slot.
    pub fn register_as_current(self: &Arc<Self>) -> bool {
        let mut current = CURRENT_TRACING
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if current.as_ref().is_some_and(|existing| existing.upgrade().is_some()) {
            crate::weft_warn!(name: "tracing.already_registered");
            return false;
        }
        *current = Some(Arc::downgrade(self));
        true
    }

    /// The registered process default, if one is alive.
    pub fn current() -> Option<Arc<Tracing>> {
        CURRENT_TRACING
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }
}

impl Drop for Tracing {
    fn drop(&mut self) {
        let mut current = CURRENT_TRACING
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(registered) = current.as_ref() {
            if std::ptr::eq(registered.as_ptr(), self) {
                *current = None;
            }
        }
    }
}

/// A tracer from the registered [`Tracing`], if one is alive.
pub fn current_tracer() -> Option<Tracer> {
    Tracing::current().map(|tracing| tracing.tracer().clone())
}

/// Assembles a [`Tracing`] instance. Every collaborator has a production
/// default: B3 propagation over thread-local scoping, sampling everything,
/// reporting nowhere.
#[derive(Debug)]
pub struct TracingBuilder {
    clock: Arc<dyn Clock>,
    reporter: Arc<dyn Reporter>,
    propagation_factory: Arc<dyn PropagationFactory>,
    sampler: Sampler,
    current_trace_context: Arc<dyn CurrentTraceContext>,
    trace_id_128bit: bool,
    supports_join: bool,
    always_sample_local: bool,
}

impl Default for TracingBuilder {
    fn default() -> Self {
        TracingBuilder {
            clock: Arc::new(SystemClock),
            reporter: Arc::new(NoopReporter),
            propagation_factory: Arc::new(B3Propagation::default()),
            sampler: Sampler::AlwaysOn,
            current_trace_context: Arc::new(ThreadLocalCurrentTraceContext),
            trace_id_128bit: false,
            supports_join: true,
            always_sample_local: false,
        }
    }
}

impl TracingBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn propagation_factory(mut self, factory: Arc<dyn PropagationFactory>) -> Self {
        self.propagation_factory = factory;
        self
    }

    pub fn sampler(mut self, sampler: Sampler) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn current_trace_context(mut self, current: Arc<dyn CurrentTraceContext>) -> Self {
        self.current_trace_context = current;
        self
    }

    /// Generate 128-bit trace ids for new traces.
    pub fn trace_id_128bit(mut self, trace_id_128bit: bool) -> Self {
        self.trace_id_128bit = trace_id_128bit;
        self
    }

    /// Allow [`Tracer::join_span`] to share incoming span ids. Also requires
    /// a propagation format that can carry them.
    pub fn supports_join(mut self, supports_join: bool) -> Self {
        self.supports_join = supports_join;
        self
    }

    /// Record every span in this process even when unsampled, for tools
    /// that consume spans locally without reporting them upstream.
    pub fn always_sample_local(mut self, always_sample_local: bool) -> Self {
        self.always_sample_local = always_sample_local;
        self
    }

    pub fn build(self) -> Arc<Tracing> {
        let noop = Arc::new(AtomicBool::new(false));
        let pending_spans =
            Arc::new(PendingSpans::new(Arc::clone(&self.clock), self.reporter));
        let tracer = Tracer {
            supports_join: self.supports_join && self.propagation_factory.supports_join(),
            trace_id_128bit: self.trace_id_128bit
                || self.propagation_factory.requires_128bit_trace_id(),
            propagation_factory: Arc::clone(&self.propagation_factory),
            pending_spans,
            sampler: self.sampler,
            current_trace_context: Arc::clone(&self.current_trace_context),
            always_sample_local: self.always_sample_local,
            noop: Arc::clone(&noop),
        };
        Arc::new(Tracing {
            tracer,
            propagation: self.propagation_factory.create(),
            current_trace_context: self.current_trace_context,
            noop,
        })
    }
}
