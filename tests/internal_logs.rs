//! Self-diagnostics route through the `tracing` facade without disturbing
//! the instrumented code path.

use weft::TraceContext;

#[test]
fn rejected_wire_input_logs_and_degrades() {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        let mut builder = TraceContext::builder();
        // malformed peer data is a diagnostic, never a failure
        assert!(!builder.parse_trace_id("not-hex"));
        assert!(!builder.parse_span_id("NOPE"));
        assert!(builder.parse_trace_id("2a"));
        assert!(builder.parse_span_id("4d2"));
        let context = builder.build();
        assert_eq!(context.trace_id(), 42);
    });
}
