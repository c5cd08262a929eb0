//! # Trace Context
//!
//! Carries a distributed trace across the asynchronous outbox/inbox
//! boundary. Spans are identified by a W3C trace-context string
//! (`traceparent`):
//!
//! ```text
//! 00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01
//! ^^ ^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^ ^^^^^^^^^^^^^^^^ ^^
//! |  trace id (32 hex)                span id (16 hex) flags (01 = sampled)
//! version
//! ```
//!
//! Telemetry must never break the business path: serializing an invalid
//! span yields an empty string and parsing malformed input yields `None`.
//!
//! The [`Tracer`] is an explicit handle over an OpenTelemetry SDK tracer
//! provider, created once per process and passed to every component that
//! starts spans. Span and id types are the `opentelemetry` ones.

mod propagation;
mod tracer;

pub use opentelemetry::trace::{SpanContext, SpanId, TraceFlags, TraceId};
pub use propagation::{parse, serialize};
pub use tracer::{Span, Tracer};
