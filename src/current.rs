//! Scoped propagation of the current trace context within a process.
//!
//! A [`CurrentTraceContext`] answers "which span is this code running
//! inside?". Setting the current context returns a [`Scope`] guard that
//! restores the previous value when dropped. Scopes are not `Send`: a scope
//! closes on the thread that opened it, always.

use std::cell::RefCell;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::context::TraceContext;

/// Guard that restores the previously current context when dropped or
/// explicitly closed.
#[must_use = "dropping a scope immediately restores the previous context"]
pub struct Scope {
    restore: Option<Box<dyn FnOnce()>>,
    // *const () strips Send and Sync: a scope must close where it opened
    _not_send: PhantomData<*const ()>,
}

impl Scope {
    /// A scope that restores nothing on close.
    pub fn noop() -> Self {
        Scope { restore: None, _not_send: PhantomData }
    }

    fn restoring(restore: impl FnOnce() + 'static) -> Self {
        Scope { restore: Some(Box::new(restore)), _not_send: PhantomData }
    }

    /// Closes now instead of at end of block.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        if let Some(restore) = self.restore.take() {
            restore();
        }
    }
}

impl Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope").field("noop", &self.restore.is_none()).finish()
    }
}

/// Stores and retrieves the context current to this thread of execution.
pub trait CurrentTraceContext: Send + Sync + Debug {
    /// The context current on the calling thread, if any.
    fn get(&self) -> Option<TraceContext>;

    /// Makes `context` current (or clears it with `None`) until the
    /// returned scope closes.
    fn new_scope(&self, context: Option<TraceContext>) -> Scope;

    /// Like [`new_scope`](Self::new_scope), but returns a no-op scope when
    /// `context` is already current, keeping redundant nesting free.
    fn maybe_scope(&self, context: Option<TraceContext>) -> Scope {
        if self.get() == context {
            Scope::noop()
        } else {
            self.new_scope(context)
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<TraceContext>> = const { RefCell::new(None) };
}

/// The default implementation: one slot per thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadLocalCurrentTraceContext;

impl CurrentTraceContext for ThreadLocalCurrentTraceContext {
    fn get(&self) -> Option<TraceContext> {
        CURRENT.with(|current| current.borrow().clone())
    }

    fn new_scope(&self, context: Option<TraceContext>) -> Scope {
        let previous = CURRENT.with(|current| current.replace(context));
        Scope::restoring(move || {
            CURRENT.with(|current| *current.borrow_mut() = previous);
        })
    }
}

/// Decorator that detects scopes closed out of nesting order.
///
/// Misuse is logged, never fatal: the inner scope still restores what it
/// saved, which is the least surprising recovery. Cross-thread close cannot
/// happen at all, since [`Scope`] is not `Send`.
#[derive(Clone, Debug, Default)]
pub struct StrictCurrentTraceContext<C> {
    inner: C,
}

impl<C: CurrentTraceContext + Clone + 'static> StrictCurrentTraceContext<C> {
    pub fn new(inner: C) -> Self {
        StrictCurrentTraceContext { inner }
    }
}

impl<C: CurrentTraceContext + Clone + 'static> CurrentTraceContext
    for StrictCurrentTraceContext<C>
{
    fn get(&self) -> Option<TraceContext> {
        self.inner.get()
    }

    fn new_scope(&self, context: Option<TraceContext>) -> Scope {
        let expected = context.clone();
        let observer = self.inner.clone();
        let inner_scope = self.inner.new_scope(context);
        Scope::restoring(move || {
            if observer.get() != expected {
                crate::weft_warn!(
                    name: "scope.closed_out_of_order",
                    expected = expected.map(|c| c.to_string()).unwrap_or_default(),
                    found = observer.get().map(|c| c.to_string()).unwrap_or_default()
                );
            }
            drop(inner_scope);
        })
    }
}

/// Adapts a closure to run with the context current at wrap time.
///
/// Use this to hand work to another thread or executor without losing the
/// trace: capture happens here, re-binding happens inside the returned
/// closure wherever it ends up running.
pub fn wrap<R>(
    current: &Arc<dyn CurrentTraceContext>,
    f: impl FnOnce() -> R,
) -> impl FnOnce() -> R {
    let current = Arc::clone(current);
    let captured = current.get();
    move || {
        let _scope = current.maybe_scope(captured);
        f()
    }
}
