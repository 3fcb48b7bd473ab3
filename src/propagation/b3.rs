//! The B3 propagation format, in its multi-header and single-header
//! encodings.
//!
//! Multi-header spreads the context over `X-B3-TraceId`, `X-B3-SpanId`,
//! `X-B3-ParentSpanId`, `X-B3-Sampled` and `X-B3-Flags`. Single-header packs
//! the same data into one `b3` value:
//!
//! ```text
//! b3: {traceId}-{spanId}[-{samplingState}[-{parentSpanId}]]
//! b3: {samplingState}              // decision only, no identifiers
//! ```
//!
//! where the sampling state is `1`, `0` or `d` (debug, which implies `1`).
//! Extraction reads the single header first and falls back to multi. Either
//! encoding can be chosen for injection; both are always understood.

use std::sync::Arc;

use crate::context::{Extracted, SamplingFlags, TraceContext, TraceIdContext};
use crate::hex::push_hex_u64;
use crate::propagation::{Extractor, Injector, Propagation, PropagationFactory};

const B3_SINGLE_HEADER: &str = "b3";
const TRACE_ID_HEADER: &str = "X-B3-TraceId";
const SPAN_ID_HEADER: &str = "X-B3-SpanId";
const PARENT_SPAN_ID_HEADER: &str = "X-B3-ParentSpanId";
const SAMPLED_HEADER: &str = "X-B3-Sampled";
const FLAGS_HEADER: &str = "X-B3-Flags";

/// Which encoding [`B3Propagation`] writes. Both are always read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum B3Encoding {
    #[default]
    MultipleHeaders,
    SingleHeader,
}

/// B3 codec and its factory. Supports join: the span id crosses the wire,
/// so a server can share its client's span.
#[derive(Clone, Debug)]
pub struct B3Propagation {
    encoding: B3Encoding,
    keys: Vec<String>,
}

impl Default for B3Propagation {
    fn default() -> Self {
        B3Propagation::new(B3Encoding::default())
    }
}

impl B3Propagation {
    pub fn new(encoding: B3Encoding) -> Self {
        let keys = match encoding {
            B3Encoding::MultipleHeaders => vec![
                TRACE_ID_HEADER.to_string(),
                SPAN_ID_HEADER.to_string(),
                PARENT_SPAN_ID_HEADER.to_string(),
                SAMPLED_HEADER.to_string(),
                FLAGS_HEADER.to_string(),
            ],
            B3Encoding::SingleHeader => vec![B3_SINGLE_HEADER.to_string()],
        };
        B3Propagation { encoding, keys }
    }

    fn inject_single(&self, context: &TraceContext, injector: &mut dyn Injector) {
        let mut value = String::with_capacity(68);
        value.push_str(&context.trace_id_string());
        value.push('-');
        push_hex_u64(&mut value, context.span_id());
        // the parent field is only valid after a sampling token
        let token = if context.debug() {
            Some('d')
        } else {
            context.sampled().map(|sampled| if sampled { '1' } else { '0' })
        };
        if let Some(token) = token {
            value.push('-');
            value.push(token);
            if let Some(parent_id) = context.parent_id() {
                value.push('-');
                push_hex_u64(&mut value, parent_id);
            }
        }
        injector.set(B3_SINGLE_HEADER, value);
    }

    fn inject_multi(&self, context: &TraceContext, injector: &mut dyn Injector) {
        injector.set(TRACE_ID_HEADER, context.trace_id_string());
        injector.set(SPAN_ID_HEADER, context.span_id_string());
        if let Some(parent_id) = context.parent_id() {
            let mut value = String::with_capacity(16);
            push_hex_u64(&mut value, parent_id);
            injector.set(PARENT_SPAN_ID_HEADER, value);
        }
        if context.debug() {
            injector.set(FLAGS_HEADER, "1".to_string());
        } else if let Some(sampled) = context.sampled() {
            injector.set(SAMPLED_HEADER, if sampled { "1" } else { "0" }.to_string());
        }
    }

    /// Parses the single-header encoding. `None` means the value was
    /// malformed and multi-header extraction should be attempted instead.
    fn extract_single(value: &str) -> Option<Extracted> {
        if value.len() == 1 {
            let sampling = match value.as_bytes()[0] {
                b'0' => SamplingFlags::NOT_SAMPLED,
                b'1' => SamplingFlags::SAMPLED,
                b'd' => SamplingFlags::DEBUG,
                _ => {
                    crate::weft_debug!(name: "b3.single_sampling_token", value = value.to_string());
                    return None;
                }
            };
            return Some(Extracted::from_flags(sampling));
        }

        let mut fields = value.splitn(4, '-');
        let mut builder = TraceContext::builder();
        if !builder.parse_trace_id(fields.next()?) {
            return None;
        }
        if !builder.parse_span_id(fields.next()?) {
            return None;
        }
        if let Some(sampling) = fields.next() {
            match sampling {
                "0" => builder = builder.sampled(Some(false)),
                "1" => builder = builder.sampled(Some(true)),
                "d" => builder = builder.debug(true),
                _ => {
                    crate::weft_debug!(name: "b3.single_sampling_token", value = sampling.to_string());
                    return None;
                }
            }
            if !builder.parse_parent_id(fields.next()) {
                return None;
            }
        }
        // identifiers parsed above, so build cannot fail
        builder.try_build().ok().map(Extracted::from_context)
    }

    fn extract_multi(&self, extractor: &dyn Extractor) -> Extracted {
        let sampled = extractor.get(SAMPLED_HEADER).and_then(|value| match value.as_ref() {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            other => {
                crate::weft_debug!(name: "b3.sampled_header", value = other.to_string());
                None
            }
        });
        let debug = extractor.get(FLAGS_HEADER).is_some_and(|value| value == "1");
        let sampling = SamplingFlags::from_states(sampled, debug);

        let mut builder = TraceContext::builder().sampling_flags(sampling);
        let trace_id_ok = extractor
            .get(TRACE_ID_HEADER)
            .is_some_and(|value| builder.parse_trace_id(&value));
        if !trace_id_ok {
            return Extracted::from_flags(sampling);
        }

        let span_id_ok = extractor
            .get(SPAN_ID_HEADER)
            .is_some_and(|value| builder.parse_span_id(&value));
        if !span_id_ok {
            let (trace_id_high, trace_id) = builder.trace_id_parts();
            return Extracted::from_trace_id(TraceIdContext::new(trace_id_high, trace_id, sampling));
        }

        if !builder.parse_parent_id(extractor.get(PARENT_SPAN_ID_HEADER).as_deref()) {
            // a bad parent invalidates the whole set
            return Extracted::from_flags(sampling);
        }

        match builder.try_build() {
            Ok(context) => Extracted::from_context(context),
            Err(_) => Extracted::from_flags(sampling),
        }
    }
}

impl Propagation for B3Propagation {
    fn keys(&self) -> &[String] {
        &self.keys
    }

    fn inject(&self, context: &TraceContext, injector: &mut dyn Injector) {
        match self.encoding {
            B3Encoding::MultipleHeaders => self.inject_multi(context, injector),
            B3Encoding::SingleHeader => self.inject_single(context, injector),
        }
    }

    fn extract(&self, extractor: &dyn Extractor) -> Extracted {
        if let Some(value) = extractor.get(B3_SINGLE_HEADER) {
            if let Some(extracted) = Self::extract_single(&value) {
                return extracted;
            }
        }
        self.extract_multi(extractor)
    }
}

impl PropagationFactory for B3Propagation {
    fn create(&self) -> Arc<dyn Propagation> {
        Arc::new(self.clone())
    }

    fn supports_join(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn multi() -> B3Propagation {
        B3Propagation::new(B3Encoding::MultipleHeaders)
    }

    fn single() -> B3Propagation {
        B3Propagation::new(B3Encoding::SingleHeader)
    }

    fn carrier(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_lowercase(), value.to_string()))
            .collect()
    }

    fn context() -> TraceContext {
        TraceContext::builder()
            .trace_id_high(0x463a_c35c_9f64_13ad)
            .trace_id(0x4848_5a39_53bb_6124)
            .parent_id(Some(0x0020_0000_0000_0000))
            .span_id(0x0000_0000_0000_04d2)
            .sampled(Some(true))
            .build()
    }

    #[test]
    fn injects_multi_headers() {
        let mut injected = HashMap::new();
        multi().inject(&context(), &mut injected);

        assert_eq!(
            Extractor::get(&injected, TRACE_ID_HEADER).as_deref(),
            Some("463ac35c9f6413ad48485a3953bb6124")
        );
        assert_eq!(
            Extractor::get(&injected, SPAN_ID_HEADER).as_deref(),
            Some("00000000000004d2")
        );
        assert_eq!(
            Extractor::get(&injected, PARENT_SPAN_ID_HEADER).as_deref(),
            Some("0020000000000000")
        );
        assert_eq!(Extractor::get(&injected, SAMPLED_HEADER).as_deref(), Some("1"));
        assert_eq!(Extractor::get(&injected, FLAGS_HEADER), None);
    }

    #[test]
    fn injects_debug_as_flags_without_sampled() {
        let debug = context().to_builder().debug(true).build();
        let mut injected = HashMap::new();
        multi().inject(&debug, &mut injected);
        assert_eq!(Extractor::get(&injected, FLAGS_HEADER).as_deref(), Some("1"));
        assert_eq!(Extractor::get(&injected, SAMPLED_HEADER), None);
    }

    #[test]
    fn injects_single_header() {
        let mut injected = HashMap::new();
        single().inject(&context(), &mut injected);
        assert_eq!(
            Extractor::get(&injected, "b3").as_deref(),
            Some("463ac35c9f6413ad48485a3953bb6124-00000000000004d2-1-0020000000000000")
        );
    }

    #[test]
    fn single_omits_parent_without_sampling_token() {
        let undecided = context().to_builder().sampled(None).build();
        let mut injected = HashMap::new();
        single().inject(&undecided, &mut injected);
        assert_eq!(
            Extractor::get(&injected, "b3").as_deref(),
            Some("463ac35c9f6413ad48485a3953bb6124-00000000000004d2")
        );
    }

    #[test]
    fn extracts_multi_headers() {
        let extractor = carrier(&[
            (TRACE_ID_HEADER, "463ac35c9f6413ad48485a3953bb6124"),
            (SPAN_ID_HEADER, "00000000000004d2"),
            (PARENT_SPAN_ID_HEADER, "0020000000000000"),
            (SAMPLED_HEADER, "1"),
        ]);
        let extracted = multi().extract(&extractor);
        let got = extracted.context().expect("full context");
        assert_eq!(*got, context());
        assert_eq!(got.parent_id(), Some(0x0020_0000_0000_0000));
        assert_eq!(got.sampled(), Some(true));
    }

    #[test]
    fn extracts_single_header_variants() {
        #[rustfmt::skip]
        let cases: &[(&str, Option<bool>, bool)] = &[
            ("48485a3953bb6124-00000000000004d2",      None,        false),
            ("48485a3953bb6124-00000000000004d2-1",    Some(true),  false),
            ("48485a3953bb6124-00000000000004d2-0",    Some(false), false),
            ("48485a3953bb6124-00000000000004d2-d",    Some(true),  true),
        ];
        for (value, sampled, debug) in cases {
            let extracted = single().extract(&carrier(&[("b3", value)]));
            let got = extracted.context().unwrap_or_else(|| panic!("{value:?}"));
            assert_eq!(got.trace_id(), 0x4848_5a39_53bb_6124);
            assert_eq!(got.span_id(), 0x04d2);
            assert_eq!(got.sampled(), *sampled, "{value:?}");
            assert_eq!(got.debug(), *debug, "{value:?}");
        }
    }

    #[test]
    fn extracts_canonical_single_header() {
        let extracted =
            single().extract(&carrier(&[("b3", "463ac35c9f6413ad-48485a3953bb6124-1")]));
        let got = extracted.context().expect("full context");
        assert_eq!(got.trace_id(), 0x463a_c35c_9f64_13ad);
        assert_eq!(got.span_id(), 0x4848_5a39_53bb_6124);
        assert_eq!(got.sampled(), Some(true));
        assert_eq!(got.parent_id(), None);
    }

    #[test]
    fn extracts_single_header_with_parent() {
        let extracted = single().extract(&carrier(&[(
            "b3",
            "48485a3953bb6124-00000000000004d2-1-0020000000000000",
        )]));
        let got = extracted.context().expect("full context");
        assert_eq!(got.parent_id(), Some(0x0020_0000_0000_0000));
    }

    #[test]
    fn extracts_sampling_only_single_header() {
        for (value, sampled, debug) in [("0", Some(false), false), ("1", Some(true), false), ("d", Some(true), true)] {
            let extracted = single().extract(&carrier(&[("b3", value)]));
            assert!(extracted.context().is_none());
            assert_eq!(extracted.sampled(), sampled);
            if debug {
                assert!(matches!(
                    extracted.kind(),
                    crate::context::ExtractedKind::Flags(flags) if flags.debug()
                ));
            }
        }
    }

    #[test]
    fn trace_id_without_span_id_extracts_trace_id_context() {
        let extractor = carrier(&[
            (TRACE_ID_HEADER, "48485a3953bb6124"),
            (SAMPLED_HEADER, "0"),
        ]);
        let extracted = multi().extract(&extractor);
        assert!(extracted.context().is_none());
        let trace_id_context = extracted.trace_id_context().expect("trace id context");
        assert_eq!(trace_id_context.trace_id(), 0x4848_5a39_53bb_6124);
        assert_eq!(trace_id_context.sampled(), Some(false));
    }

    #[test]
    fn malformed_identifiers_degrade_to_flags() {
        #[rustfmt::skip]
        let cases: &[&[(&str, &str)]] = &[
            &[(TRACE_ID_HEADER, "not_hex"), (SPAN_ID_HEADER, "4d2"), (SAMPLED_HEADER, "1")],
            &[(TRACE_ID_HEADER, "2a"), (SPAN_ID_HEADER, "4d2"), (PARENT_SPAN_ID_HEADER, "nope"), (SAMPLED_HEADER, "1")],
        ];
        for headers in cases {
            let extracted = multi().extract(&carrier(headers));
            assert!(extracted.context().is_none(), "{headers:?}");
            assert_eq!(extracted.sampled(), Some(true), "{headers:?}");
        }
    }

    #[test]
    fn malformed_single_header_falls_back_to_multi() {
        let extractor = carrier(&[
            ("b3", "garbage"),
            (TRACE_ID_HEADER, "2a"),
            (SPAN_ID_HEADER, "4d2"),
        ]);
        let extracted = single().extract(&extractor);
        let got = extracted.context().expect("multi fallback");
        assert_eq!(got.trace_id(), 42);
    }

    #[test]
    fn nothing_extracts_to_empty() {
        let extracted = multi().extract(&carrier(&[]));
        assert!(extracted.is_empty());
    }

    #[test]
    fn sampled_header_accepts_legacy_words() {
        for (value, expected) in [("true", Some(true)), ("false", Some(false)), ("junk", None)] {
            let extracted = multi().extract(&carrier(&[(SAMPLED_HEADER, value)]));
            assert_eq!(extracted.sampled(), expected, "{value:?}");
        }
    }
}
