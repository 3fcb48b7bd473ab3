//! Propagated fields ("baggage"): request-scoped string values carried
//! alongside the trace context, in and out of process.
//!
//! The field set is fixed when the [`BaggagePropagation`] factory is built.
//! Values live in a [`BaggageFields`] instance stored in the context's extra
//! list. Instances are claimed by one span identity; deriving a context with
//! a different identity copies the values first, so writes after a fork are
//! only visible on the branch that made them.

use std::any::Any;
use std::sync::{Arc, RwLock};

use crate::context::{ExtraValue, Extracted, TraceContext};
use crate::propagation::{Extractor, Injector, Propagation, PropagationFactory};

/// Values for a fixed set of field names, claimed by one span identity.
///
/// Reads take a read lock and clone one string. Writes copy the whole value
/// vector and swap it in, so a reader never observes a torn update.
#[derive(Debug)]
pub struct BaggageFields {
    names: Arc<Vec<String>>,
    state: RwLock<BaggageState>,
}

#[derive(Debug)]
struct BaggageState {
    trace_id: u64,
    span_id: u64,
    values: Arc<Vec<Option<String>>>,
}

impl BaggageFields {
    fn unclaimed(names: Arc<Vec<String>>) -> Self {
        let values = Arc::new(vec![None; names.len()]);
        BaggageFields { names, state: RwLock::new(BaggageState { trace_id: 0, span_id: 0, values }) }
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|candidate| candidate.eq_ignore_ascii_case(name))
    }

    pub fn get(&self, name: &str) -> Option<String> {
        let index = self.index_of(name)?;
        let state = self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.values.get(index).and_then(|value| value.clone())
    }

    pub fn put(&self, name: &str, value: Option<String>) {
        let Some(index) = self.index_of(name) else {
            crate::weft_debug!(name: "baggage.unknown_field", field = name.to_string());
            return;
        };
        let mut state = self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.values[index] == value {
            return;
        }
        let mut values = state.values.as_ref().clone();
        values[index] = value;
        state.values = Arc::new(values);
    }

    /// Claims this instance for the given identity. Succeeds when unclaimed
    /// or already claimed by the same identity.
    fn try_claim(&self, trace_id: u64, span_id: u64) -> bool {
        let mut state = self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.trace_id == 0 && state.span_id == 0 {
            state.trace_id = trace_id;
            state.span_id = span_id;
            return true;
        }
        state.trace_id == trace_id && state.span_id == span_id
    }

    fn is_claimed_by(&self, trace_id: u64, span_id: u64) -> bool {
        let state = self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.trace_id == trace_id && state.span_id == span_id
    }

    /// A new instance claimed by `(trace_id, span_id)` holding a snapshot of
    /// the current values. The snapshot shares storage until either side
    /// writes.
    fn copy_for(&self, trace_id: u64, span_id: u64) -> BaggageFields {
        let values = {
            let state = self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(&state.values)
        };
        BaggageFields {
            names: Arc::clone(&self.names),
            state: RwLock::new(BaggageState { trace_id, span_id, values }),
        }
    }

    /// Fills each unset field from `other`, never overwriting a set one.
    fn put_all_if_absent(&self, other: &BaggageFields) {
        for name in other.names.iter() {
            if self.get(name).is_none() {
                if let Some(value) = other.get(name) {
                    self.put(name, Some(value));
                }
            }
        }
    }
}

/// Value of a propagated field, or `None` when the context carries no
/// baggage or the field is unset.
pub fn get(context: &TraceContext, name: &str) -> Option<String> {
    context.find_extra::<BaggageFields>()?.get(name)
}

/// Sets a propagated field on the context's baggage. A no-op when the
/// context was not derived through a [`BaggagePropagation`].
pub fn put(context: &TraceContext, name: &str, value: impl Into<String>) {
    match context.find_extra::<BaggageFields>() {
        Some(fields) => fields.put(name, Some(value.into())),
        None => {
            crate::weft_debug!(name: "baggage.context_without_fields", field = name.to_string());
        }
    }
}

/// Wraps another [`PropagationFactory`], adding a fixed set of propagated
/// fields transported as one carrier key per field.
#[derive(Debug)]
pub struct BaggagePropagation {
    delegate: Arc<dyn PropagationFactory>,
    field_names: Arc<Vec<String>>,
}

impl BaggagePropagation {
    /// Field names are lowercased: they double as carrier keys, and HTTP
    /// header names compare case-insensitively.
    pub fn new<I, S>(delegate: Arc<dyn PropagationFactory>, field_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let field_names = field_names
            .into_iter()
            .map(|name| name.into().to_lowercase())
            .collect::<Vec<_>>();
        BaggagePropagation { delegate, field_names: Arc::new(field_names) }
    }
}

impl PropagationFactory for BaggagePropagation {
    fn create(&self) -> Arc<dyn Propagation> {
        let delegate = self.delegate.create();
        let mut keys = delegate.keys().to_vec();
        keys.extend(self.field_names.iter().cloned());
        Arc::new(BaggageCodec { delegate, field_names: Arc::clone(&self.field_names), keys })
    }

    fn supports_join(&self) -> bool {
        self.delegate.supports_join()
    }

    fn requires_128bit_trace_id(&self) -> bool {
        self.delegate.requires_128bit_trace_id()
    }

    /// Binds baggage to the new identity. A derivation can carry several
    /// instances (extracted headers plus an in-process parent); the earliest
    /// wins per field and the rest fill whatever it left unset, leaving one
    /// instance behind. Idempotent: a context whose fields are already
    /// claimed by its own identity passes through untouched, so repeated
    /// decoration cannot fork state.
    fn decorate(&self, context: TraceContext) -> TraceContext {
        let context = self.delegate.decorate(context);
        let trace_id = context.trace_id();
        let span_id = context.span_id();

        let instances: Vec<Arc<BaggageFields>> = context
            .extra()
            .iter()
            .filter_map(|value| Arc::clone(value).downcast::<BaggageFields>().ok())
            .collect();

        match instances.as_slice() {
            [] => {
                let fields = BaggageFields::unclaimed(Arc::clone(&self.field_names));
                fields.try_claim(trace_id, span_id);
                context.with_appended_extra(Arc::new(fields))
            }
            [only] if only.is_claimed_by(trace_id, span_id) => context,
            [only] if only.try_claim(trace_id, span_id) => context,
            [first, rest @ ..] => {
                let consolidated = Arc::new(first.copy_for(trace_id, span_id));
                for other in rest {
                    consolidated.put_all_if_absent(other);
                }
                let mut replaced: Vec<ExtraValue> = Vec::with_capacity(context.extra().len());
                let mut placed = false;
                for value in context.extra().iter() {
                    if value.is::<BaggageFields>() {
                        if !placed {
                            replaced.push(Arc::clone(&consolidated) as ExtraValue);
                            placed = true;
                        }
                    } else {
                        replaced.push(Arc::clone(value));
                    }
                }
                context.with_extra(Arc::new(replaced))
            }
        }
    }
}

#[derive(Debug)]
struct BaggageCodec {
    delegate: Arc<dyn Propagation>,
    field_names: Arc<Vec<String>>,
    keys: Vec<String>,
}

impl Propagation for BaggageCodec {
    fn keys(&self) -> &[String] {
        &self.keys
    }

    fn inject(&self, context: &TraceContext, injector: &mut dyn Injector) {
        self.delegate.inject(context, injector);
        if let Some(fields) = context.find_extra::<BaggageFields>() {
            for name in self.field_names.iter() {
                if let Some(value) = fields.get(name) {
                    injector.set(name, value);
                }
            }
        }
    }

    fn extract(&self, extractor: &dyn Extractor) -> Extracted {
        let mut extracted = self.delegate.extract(extractor);
        // attached unclaimed, and only when the carrier held a field: an
        // empty result must stay empty so composite extraction can keep
        // trying later formats
        let mut fields: Option<BaggageFields> = None;
        for name in self.field_names.iter() {
            if let Some(value) = extractor.get(name) {
                let instance = fields
                    .get_or_insert_with(|| BaggageFields::unclaimed(Arc::clone(&self.field_names)));
                instance.put(name, Some(value.into_owned()));
            }
        }
        if let Some(fields) = fields {
            extracted.add_extra_value(Arc::new(fields) as Arc<dyn Any + Send + Sync>);
        }
        extracted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagation::B3Propagation;
    use std::collections::HashMap;

    fn factory() -> BaggagePropagation {
        BaggagePropagation::new(Arc::new(B3Propagation::default()), ["User-Id", "request-id"])
    }

    fn context(span_id: u64) -> TraceContext {
        TraceContext::builder().trace_id(1).span_id(span_id).build()
    }

    #[test]
    fn field_names_are_case_insensitive() {
        let fields = BaggageFields::unclaimed(Arc::new(vec!["user-id".to_string()]));
        fields.put("User-Id", Some("romeo".to_string()));
        assert_eq!(fields.get("USER-ID").as_deref(), Some("romeo"));
        assert_eq!(fields.get("unknown"), None);
    }

    #[test]
    fn decorate_claims_fresh_fields() {
        let decorated = factory().decorate(context(2));
        put(&decorated, "user-id", "romeo");
        assert_eq!(get(&decorated, "user-id").as_deref(), Some("romeo"));

        // same identity: repeated decoration returns the same extra
        // allocation, so it cannot fork the state
        let again = factory().decorate(decorated.clone());
        assert!(Arc::ptr_eq(again.extra(), decorated.extra()));
        put(&again, "request-id", "r-1");
        assert_eq!(get(&decorated, "request-id").as_deref(), Some("r-1"));
    }

    #[test]
    fn decorate_copies_for_a_new_identity() {
        let propagation_factory = factory();
        let parent = propagation_factory.decorate(context(2));
        put(&parent, "user-id", "romeo");

        // a child shares the parent's extra until decoration rebinds it
        let child = propagation_factory
            .decorate(context(3).with_extra(Arc::clone(parent.extra())));
        assert_eq!(get(&child, "user-id").as_deref(), Some("romeo"));

        put(&child, "user-id", "juliet");
        assert_eq!(get(&child, "user-id").as_deref(), Some("juliet"));
        assert_eq!(get(&parent, "user-id").as_deref(), Some("romeo"));
    }

    #[test]
    fn put_without_fields_is_a_quiet_no_op() {
        let bare = context(2);
        put(&bare, "user-id", "romeo");
        assert_eq!(get(&bare, "user-id"), None);
    }

    #[test]
    fn decorate_consolidates_extracted_and_parent_fields() {
        let propagation_factory = factory();
        let parent = propagation_factory.decorate(context(2));
        put(&parent, "request-id", "r-1");
        put(&parent, "user-id", "capulet");

        let from_wire = BaggageFields::unclaimed(Arc::new(vec![
            "user-id".to_string(),
            "request-id".to_string(),
        ]));
        from_wire.put("user-id", Some("romeo".to_string()));

        // extracted instance first, parent's second, as a derivation merges
        let mut extra: Vec<ExtraValue> = vec![Arc::new(from_wire)];
        extra.extend(parent.extra().iter().cloned());
        let child = propagation_factory.decorate(context(3).with_extra(Arc::new(extra)));

        // the wire value wins, the parent fills what the carrier left unset
        assert_eq!(get(&child, "user-id").as_deref(), Some("romeo"));
        assert_eq!(get(&child, "request-id").as_deref(), Some("r-1"));
        let instances = child
            .extra()
            .iter()
            .filter(|value| value.is::<BaggageFields>())
            .count();
        assert_eq!(instances, 1);
        // the parent keeps its own values
        assert_eq!(get(&parent, "user-id").as_deref(), Some("capulet"));
    }

    #[test]
    fn extract_of_an_empty_carrier_stays_empty() {
        let propagation = factory().create();
        let extracted = propagation.extract(&HashMap::<String, String>::new());
        assert!(extracted.is_empty());
    }

    #[test]
    fn put_all_if_absent_never_overwrites() {
        let names = Arc::new(vec!["a".to_string(), "b".to_string()]);
        let target = BaggageFields::unclaimed(Arc::clone(&names));
        target.put("a", Some("kept".to_string()));
        let source = BaggageFields::unclaimed(names);
        source.put("a", Some("ignored".to_string()));
        source.put("b", Some("filled".to_string()));

        target.put_all_if_absent(&source);
        assert_eq!(target.get("a").as_deref(), Some("kept"));
        assert_eq!(target.get("b").as_deref(), Some("filled"));
    }

    #[test]
    fn codec_round_trips_fields() {
        let propagation = factory().create();
        let context = factory().decorate(context(2));
        put(&context, "user-id", "romeo");

        let mut carrier = HashMap::new();
        propagation.inject(&context, &mut carrier);
        assert_eq!(Extractor::get(&carrier, "user-id").as_deref(), Some("romeo"));
        assert_eq!(Extractor::get(&carrier, "request-id"), None);

        let extracted = propagation.extract(&carrier);
        let incoming = extracted.context().expect("context");
        let fields = incoming.find_extra::<BaggageFields>().expect("fields");
        assert_eq!(fields.get("user-id").as_deref(), Some("romeo"));
    }

    #[test]
    fn codec_keys_cover_delegate_and_fields() {
        let propagation = factory().create();
        let keys = propagation.keys();
        assert!(keys.iter().any(|key| key == "X-B3-TraceId"));
        assert!(keys.iter().any(|key| key == "user-id"));
        assert!(keys.iter().any(|key| key == "request-id"));
    }
}
