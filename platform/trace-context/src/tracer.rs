use std::fmt;
use std::time::Instant;

use opentelemetry::trace::{
    SpanContext, SpanId, Status, TraceContextExt, Tracer as _, TracerProvider as _,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::trace::{self as sdktrace, TracerProvider};
use opentelemetry_sdk::Resource;

/// Explicit tracer handle
///
/// Construct one per process and clone it into every component that
/// starts spans. Cloning is cheap: the SDK tracer shares its provider.
#[derive(Clone)]
pub struct Tracer {
    sdk: Option<sdktrace::Tracer>,
}

impl Tracer {
    /// A tracer backed by an SDK provider for `service_name`
    ///
    /// Root spans start a new sampled trace; children follow their
    /// parent's sampling decision. No exporter is attached.
    pub fn new(service_name: impl Into<String>) -> Self {
        let service_name = service_name.into();
        let provider = TracerProvider::builder()
            .with_resource(Resource::new(vec![KeyValue::new(
                "service.name",
                service_name.clone(),
            )]))
            .build();
        Self::with_provider(&provider, service_name)
    }

    /// A tracer on a caller-built provider, e.g. one with an exporter
    pub fn with_provider(provider: &TracerProvider, service_name: impl Into<String>) -> Self {
        Self {
            sdk: Some(provider.tracer(service_name.into())),
        }
    }

    /// A tracer whose spans carry an invalid context
    ///
    /// Useful when tracing is switched off: spans still log through
    /// `tracing`, but serialize to an empty `traceparent`.
    pub fn disabled() -> Self {
        Self { sdk: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.sdk.is_some()
    }

    /// Start a span, continuing `parent` when it is a valid context
    ///
    /// A child inherits the parent's trace id and sampled flag. Without a
    /// parent a new sampled trace is started.
    pub fn start_span(&self, name: &'static str, parent: Option<&SpanContext>) -> Span {
        let parent = parent.filter(|p| p.is_valid());

        let otel = self.sdk.as_ref().map(|tracer| {
            let cx = match parent {
                Some(parent) => Context::new().with_remote_span_context(parent.clone()),
                None => Context::new(),
            };
            tracer.start_with_context(name, &cx)
        });

        let context = otel
            .as_ref()
            .map(|span| opentelemetry::trace::Span::span_context(span).clone())
            .unwrap_or_else(SpanContext::empty_context);

        let inner = tracing::info_span!(
            "span",
            otel.name = name,
            trace_id = %context.trace_id(),
            span_id = %context.span_id(),
            parent_span_id = tracing::field::Empty,
            error = tracing::field::Empty,
        );
        if let Some(parent) = parent {
            inner.record("parent_span_id", tracing::field::display(parent.span_id()));
        }

        Span {
            name,
            context,
            parent: parent.map(|p| p.span_id()),
            otel,
            inner,
            started: Instant::now(),
            failed: false,
            ended: false,
        }
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// A unit of traced work
///
/// Wraps an SDK span and mirrors it onto a `tracing` span so log lines
/// emitted inside carry the trace and span ids. Ended explicitly with
/// [`Span::end`] or implicitly on drop.
pub struct Span {
    name: &'static str,
    context: SpanContext,
    parent: Option<SpanId>,
    otel: Option<sdktrace::Span>,
    inner: tracing::Span,
    started: Instant,
    failed: bool,
    ended: bool,
}

impl Span {
    pub fn context(&self) -> &SpanContext {
        &self.context
    }

    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.parent
    }

    /// The `tracing` span mirroring this span, for `Instrument`
    pub fn tracing_span(&self) -> &tracing::Span {
        &self.inner
    }

    pub fn set_attribute(&mut self, key: &'static str, value: impl fmt::Display) {
        if let Some(span) = self.otel.as_mut() {
            opentelemetry::trace::Span::set_attribute(span, KeyValue::new(key, value.to_string()));
        }
    }

    /// Mark the span as failed, recording the error as an `exception` event
    pub fn record_error(&mut self, error: &dyn fmt::Display) {
        let message = error.to_string();
        if let Some(span) = self.otel.as_mut() {
            opentelemetry::trace::Span::add_event(
                span,
                "exception",
                vec![KeyValue::new("exception.message", message.clone())],
            );
            opentelemetry::trace::Span::set_status(span, Status::error(message));
        }
        self.failed = true;
        self.inner.record("error", true);
    }

    pub fn end(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;

        if let Some(span) = self.otel.as_mut() {
            opentelemetry::trace::Span::end(span);
        }

        let duration_ms = self.started.elapsed().as_millis() as u64;
        tracing::debug!(
            parent: &self.inner,
            span = self.name,
            duration_ms,
            status = if self.failed { "error" } else { "ok" },
            "span ended"
        );
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        self.finish();
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("name", &self.name)
            .field("context", &self.context)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse;
    use opentelemetry_sdk::export::trace::SpanData;
    use opentelemetry_sdk::testing::trace::InMemorySpanExporter;

    const PARENT: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

    fn recording_tracer() -> (Tracer, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::default();
        let provider = TracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        (Tracer::with_provider(&provider, "svc"), exporter)
    }

    fn attribute(span: &SpanData, key: &str) -> Option<String> {
        span.attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| kv.value.as_str().into_owned())
    }

    #[test]
    fn test_root_span_starts_new_sampled_trace() {
        let tracer = Tracer::new("svc");
        let span = tracer.start_span("root", None);

        assert!(span.context().is_valid());
        assert!(span.context().is_sampled());
        assert!(!span.context().is_remote());
        assert!(span.parent_span_id().is_none());
    }

    #[test]
    fn test_child_continues_parent_trace() {
        let parent = parse(PARENT).unwrap();
        let tracer = Tracer::new("svc");
        let child = tracer.start_span("child", Some(&parent));

        assert_eq!(child.context().trace_id(), parent.trace_id());
        assert_ne!(child.context().span_id(), parent.span_id());
        assert_eq!(child.parent_span_id(), Some(parent.span_id()));
    }

    #[test]
    fn test_invalid_parent_is_ignored() {
        let tracer = Tracer::new("svc");
        let invalid = SpanContext::empty_context();
        let span = tracer.start_span("orphan", Some(&invalid));

        assert!(span.context().is_valid());
        assert!(span.parent_span_id().is_none());
    }

    #[test]
    fn test_disabled_tracer_produces_invalid_spans() {
        let tracer = Tracer::disabled();
        let parent = parse(PARENT).unwrap();
        let span = tracer.start_span("noop", Some(&parent));

        assert!(!tracer.is_enabled());
        assert!(!span.context().is_valid());
    }

    #[test]
    fn test_ended_span_is_exported_with_parent_and_attributes() {
        let (tracer, exporter) = recording_tracer();
        let parent = parse(PARENT).unwrap();

        let mut span = tracer.start_span("work", Some(&parent));
        span.set_attribute("events.count", 3);
        span.set_attribute("event.type", "order.created");
        let span_id = span.context().span_id();
        span.end();

        let finished = exporter.get_finished_spans().unwrap();
        assert_eq!(finished.len(), 1);

        let exported = &finished[0];
        assert_eq!(exported.name, "work");
        assert_eq!(exported.span_context.span_id(), span_id);
        assert_eq!(exported.span_context.trace_id(), parent.trace_id());
        assert_eq!(exported.parent_span_id, parent.span_id());
        assert_eq!(attribute(exported, "events.count").as_deref(), Some("3"));
        assert_eq!(attribute(exported, "event.type").as_deref(), Some("order.created"));
        assert_eq!(exported.status, Status::Unset);
    }

    #[test]
    fn test_recorded_error_sets_status_and_exception_event() {
        let (tracer, exporter) = recording_tracer();

        let mut span = tracer.start_span("failing", None);
        span.record_error(&"boom");
        drop(span);

        let finished = exporter.get_finished_spans().unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].status, Status::error("boom"));
        assert!(finished[0].events.iter().any(|e| e.name == "exception"));
    }

    #[test]
    fn test_unsampled_parent_is_not_exported() {
        let (tracer, exporter) = recording_tracer();
        let parent = parse("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-00").unwrap();

        let span = tracer.start_span("quiet", Some(&parent));
        assert!(span.context().is_valid());
        assert!(!span.context().is_sampled());
        span.end();

        assert!(exporter.get_finished_spans().unwrap().is_empty());
    }
}
