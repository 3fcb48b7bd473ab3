//! Properties that only show up under contention.

use std::sync::Arc;
use std::thread;

use weft::{wrap, InMemoryReporter, Tracing};

#[test]
fn racing_finishes_report_exactly_once() {
    let reporter = InMemoryReporter::new();
    let tracing = Tracing::builder().reporter(Arc::new(reporter.clone())).build();

    for _ in 0..50 {
        let span = Arc::new(tracing.tracer().new_trace());
        let threads: Vec<_> = (0..4)
            .map(|worker| {
                let span = Arc::clone(&span);
                thread::spawn(move || {
                    span.tag(format!("worker.{worker}"), "done");
                    span.finish();
                })
            })
            .collect();
        for handle in threads {
            handle.join().unwrap();
        }
    }

    assert_eq!(reporter.finished_spans().len(), 50);
    reporter.reset();
}

#[test]
fn handles_on_different_threads_write_one_span() {
    let reporter = InMemoryReporter::new();
    let tracing = Tracing::builder().reporter(Arc::new(reporter.clone())).build();
    let tracer = tracing.tracer().clone();

    let span = tracer.new_trace();
    let context = span.context().clone();
    let worker = {
        let tracer = tracer.clone();
        thread::spawn(move || {
            tracer.to_span(context).tag("thread", "worker").annotate("cs");
        })
    };
    worker.join().unwrap();
    span.finish();

    let finished = reporter.finished_spans();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].1.get_tag("thread"), Some("worker"));
    assert_eq!(finished[0].1.annotations.len(), 1);
}

#[test]
fn wrap_restores_the_trace_on_a_pool_thread() {
    let reporter = InMemoryReporter::new();
    let tracing = Tracing::builder().reporter(Arc::new(reporter.clone())).build();
    let tracer = tracing.tracer().clone();

    let parent = tracer.new_trace();
    let task = {
        let _scope = tracer.with_span_in_scope(Some(&parent));
        let tracer = tracer.clone();
        wrap(tracing.current_trace_context(), move || {
            // the child sees the captured parent, not the pool thread's state
            let child = tracer.next_span();
            let parent_id = child.context().parent_id();
            child.finish();
            parent_id
        })
    };

    let parent_seen_on_worker = thread::spawn(task).join().unwrap();
    assert_eq!(parent_seen_on_worker, Some(parent.context().span_id()));
    // the pool thread itself ends up back where it started
    assert_eq!(tracer.current_context(), None);

    parent.finish();
    assert_eq!(reporter.finished_spans().len(), 2);
}
