//! W3C `traceparent` serialization and parsing

use opentelemetry::trace::{SpanContext, SpanId, TraceFlags, TraceId, TraceState};

use crate::tracer::Span;

const SUPPORTED_VERSION: &str = "00";

/// Serialize a span's identity as a `traceparent` string
///
/// Returns an empty string when the span context is invalid (e.g. spans
/// from a disabled tracer).
pub fn serialize(span: &Span) -> String {
    to_traceparent(span.context())
}

fn to_traceparent(context: &SpanContext) -> String {
    if !context.is_valid() {
        return String::new();
    }

    format!(
        "{}-{}-{}-{}",
        SUPPORTED_VERSION,
        context.trace_id(),
        context.span_id(),
        if context.is_sampled() { "01" } else { "00" }
    )
}

/// Parse a `traceparent` string into a remote parent context
///
/// Returns `None` for an empty string, a field count other than four, an
/// unsupported version, ids of the wrong length or containing non-hex
/// characters, and all-zero ids. The sampled flag is the low bit of the
/// flags field read as hex, so `"1"`, `"01"` and `"03"` are all sampled;
/// flags that are not hex count as not sampled.
pub fn parse(traceparent: &str) -> Option<SpanContext> {
    if traceparent.is_empty() {
        return None;
    }

    let parts: Vec<&str> = traceparent.split('-').collect();
    let [version, trace_id, span_id, flags] = parts.as_slice() else {
        return None;
    };

    if *version != SUPPORTED_VERSION {
        return None;
    }

    // from_hex alone accepts short input and a leading '+'
    if !is_hex_of_len(trace_id, 32) || !is_hex_of_len(span_id, 16) {
        return None;
    }
    let trace_id = TraceId::from_hex(trace_id).ok()?;
    let span_id = SpanId::from_hex(span_id).ok()?;

    let trace_flags = if low_bit_set(flags) {
        TraceFlags::SAMPLED
    } else {
        TraceFlags::NOT_SAMPLED
    };

    let context = SpanContext::new(trace_id, span_id, trace_flags, true, TraceState::default());
    context.is_valid().then_some(context)
}

fn is_hex_of_len(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| b.is_ascii_hexdigit())
}

fn low_bit_set(flags: &str) -> bool {
    if flags.is_empty() || !flags.bytes().all(|b| b.is_ascii_hexdigit()) {
        return false;
    }
    flags
        .chars()
        .last()
        .and_then(|digit| digit.to_digit(16))
        .map(|digit| digit & 0x01 == 0x01)
        .unwrap_or(false)
}
