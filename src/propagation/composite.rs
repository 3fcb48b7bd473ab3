//! Composition of multiple wire formats.

use std::sync::Arc;

use crate::context::{Extracted, TraceContext};
use crate::propagation::{Extractor, Injector, Propagation, PropagationFactory};

/// Runs several formats as one: injection writes the primary (first)
/// format, extraction returns the first non-empty result in registration
/// order.
///
/// Order the strongest format first. A later format is only consulted when
/// an earlier one recovered nothing at all, so a weaker shape from a
/// preferred format (say, bare sampling flags) still wins over a full
/// context from a less preferred one.
#[derive(Debug)]
pub struct CompositePropagation {
    propagations: Vec<Arc<dyn Propagation>>,
    keys: Vec<String>,
}

impl CompositePropagation {
    pub fn new(propagations: Vec<Arc<dyn Propagation>>) -> Self {
        let mut keys = Vec::new();
        for propagation in &propagations {
            for key in propagation.keys() {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }
        CompositePropagation { propagations, keys }
    }
}

impl Propagation for CompositePropagation {
    fn keys(&self) -> &[String] {
        &self.keys
    }

    fn inject(&self, context: &TraceContext, injector: &mut dyn Injector) {
        if let Some(primary) = self.propagations.first() {
            primary.inject(context, injector);
        }
    }

    fn extract(&self, extractor: &dyn Extractor) -> Extracted {
        for propagation in &self.propagations {
            let extracted = propagation.extract(extractor);
            if !extracted.is_empty() {
                return extracted;
            }
        }
        Extracted::empty()
    }
}

/// Factory counterpart of [`CompositePropagation`]. Capabilities are the
/// conjunction for join (all formats must carry the span id) and the
/// disjunction for 128-bit trace ids (any format needing them wins).
#[derive(Debug)]
pub struct CompositePropagationFactory {
    factories: Vec<Arc<dyn PropagationFactory>>,
}

impl CompositePropagationFactory {
    pub fn new(factories: Vec<Arc<dyn PropagationFactory>>) -> Self {
        CompositePropagationFactory { factories }
    }
}

impl PropagationFactory for CompositePropagationFactory {
    fn create(&self) -> Arc<dyn Propagation> {
        Arc::new(CompositePropagation::new(
            self.factories.iter().map(|factory| factory.create()).collect(),
        ))
    }

    fn supports_join(&self) -> bool {
        !self.factories.is_empty() && self.factories.iter().all(|factory| factory.supports_join())
    }

    fn requires_128bit_trace_id(&self) -> bool {
        self.factories.iter().any(|factory| factory.requires_128bit_trace_id())
    }

    fn decorate(&self, context: TraceContext) -> TraceContext {
        self.factories
            .iter()
            .fold(context, |context, factory| factory.decorate(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagation::{B3Encoding, B3Propagation};
    use std::collections::HashMap;

    fn both() -> CompositePropagation {
        CompositePropagation::new(vec![
            Arc::new(B3Propagation::new(B3Encoding::SingleHeader)),
            Arc::new(B3Propagation::new(B3Encoding::MultipleHeaders)),
        ])
    }

    #[test]
    fn keys_are_deduplicated_in_order() {
        let composite = CompositePropagation::new(vec![
            Arc::new(B3Propagation::new(B3Encoding::SingleHeader)),
            Arc::new(B3Propagation::new(B3Encoding::SingleHeader)),
        ]);
        assert_eq!(composite.keys(), ["b3".to_string()]);
    }

    #[test]
    fn inject_writes_the_primary_format_only() {
        let context = TraceContext::builder().trace_id(1).span_id(2).build();
        let mut injected = HashMap::new();
        both().inject(&context, &mut injected);
        assert!(Extractor::get(&injected, "b3").is_some());
        assert!(Extractor::get(&injected, "X-B3-TraceId").is_none());
    }

    #[test]
    fn extract_returns_first_non_empty() {
        // single header carries only a decision, multi a full context;
        // single is registered first so its weaker shape wins
        let mut extractor = HashMap::new();
        Injector::set(&mut extractor, "b3", "0".to_string());
        Injector::set(&mut extractor, "X-B3-TraceId", "2a".to_string());
        Injector::set(&mut extractor, "X-B3-SpanId", "4d2".to_string());

        let extracted = both().extract(&extractor);
        assert!(extracted.context().is_none());
        assert_eq!(extracted.sampled(), Some(false));

        assert!(both().extract(&HashMap::new()).is_empty());
    }

    #[test]
    fn factory_capabilities_combine() {
        let factory = CompositePropagationFactory::new(vec![
            Arc::new(B3Propagation::default()) as Arc<dyn PropagationFactory>,
            Arc::new(B3Propagation::new(B3Encoding::SingleHeader)),
        ]);
        assert!(factory.supports_join());
        assert!(!factory.requires_128bit_trace_id());
        assert!(!CompositePropagationFactory::new(vec![]).supports_join());
    }
}
