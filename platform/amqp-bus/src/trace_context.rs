//! W3C trace context propagation over message headers
//!
//! The trace context is an explicit value. Nothing here reads an ambient
//! "current span": the producer receives the active context as a parameter
//! and the consumer rebuilds it from the delivery headers. Messaging spans are
//! created without a `tracing` parent and linked with
//! [`OpenTelemetrySpanExt::set_parent`], so when the host installs a
//! `tracing-opentelemetry` layer the producer and consumer spans land in one
//! trace.
//!
//! Header encoding is done by the OpenTelemetry [`TraceContextPropagator`]
//! through [`Injector`]/[`Extractor`] adapters over [`MessageHeaders`].

use crate::envelope::MessageHeaders;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{SpanContext, TraceContextExt, TraceFlags, TraceState};
use opentelemetry::Context;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{IdGenerator, RandomIdGenerator};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::field::{display, Empty};
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// W3C Trace Context header name
pub const TRACEPARENT_HEADER: &str = "traceparent";

const MESSAGING_SYSTEM: &str = "rabbitmq";

/// A span position inside a distributed trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext(SpanContext);

impl TraceContext {
    /// Start a brand new, sampled trace
    pub fn new_root() -> Self {
        let ids = RandomIdGenerator::default();
        Self(SpanContext::new(
            ids.new_trace_id(),
            ids.new_span_id(),
            TraceFlags::SAMPLED,
            false,
            TraceState::default(),
        ))
    }

    /// A new span in the same trace, parented by `self`
    pub fn child(&self) -> Self {
        Self(SpanContext::new(
            self.0.trace_id(),
            RandomIdGenerator::default().new_span_id(),
            self.0.trace_flags(),
            false,
            self.0.trace_state().clone(),
        ))
    }

    /// Wrap an OpenTelemetry span context; `None` when it is invalid
    pub fn from_span_context(span_context: SpanContext) -> Option<Self> {
        span_context.is_valid().then_some(Self(span_context))
    }

    pub fn span_context(&self) -> &SpanContext {
        &self.0
    }

    /// An OpenTelemetry context with `self` as the remote parent
    pub fn to_otel_context(&self) -> Context {
        Context::new().with_remote_span_context(self.0.clone())
    }

    /// Parse a `traceparent` value: `{version}-{trace_id}-{span_id}-{flags}`
    pub fn parse(value: &str) -> Option<Self> {
        let cx = TraceContextPropagator::new().extract(&TraceparentValue(value));
        Self::from_span_context(cx.span().span_context().clone())
    }

    /// Serialize as a `traceparent` value
    pub fn to_traceparent(&self) -> String {
        let mut carrier: HashMap<String, String> = HashMap::new();
        TraceContextPropagator::new().inject_context(&self.to_otel_context(), &mut carrier);
        carrier.remove(TRACEPARENT_HEADER).unwrap_or_default()
    }

    pub fn trace_id(&self) -> String {
        self.0.trace_id().to_string()
    }

    pub fn span_id(&self) -> String {
        self.0.span_id().to_string()
    }

    pub fn is_sampled(&self) -> bool {
        self.0.is_sampled()
    }

    /// Whether `self` and `other` belong to the same trace
    pub fn same_trace(&self, other: &TraceContext) -> bool {
        self.0.trace_id() == other.0.trace_id()
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_traceparent())
    }
}

impl FromStr for TraceContext {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("invalid traceparent: {s}"))
    }
}

/// Adapter for injecting W3C Trace Context into message headers
struct HeadersInjector<'a>(&'a mut MessageHeaders);

impl Injector for HeadersInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        // tracestate is not carried on the wire
        if key.eq_ignore_ascii_case(TRACEPARENT_HEADER) {
            self.0.traceparent = Some(value.into_bytes());
        }
    }
}

/// Adapter for extracting W3C Trace Context from message headers
struct HeadersExtractor<'a>(&'a MessageHeaders);

impl Extractor for HeadersExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        if !key.eq_ignore_ascii_case(TRACEPARENT_HEADER) {
            return None;
        }
        std::str::from_utf8(self.0.traceparent.as_deref()?).ok()
    }

    fn keys(&self) -> Vec<&str> {
        if self.0.traceparent.is_some() {
            vec![TRACEPARENT_HEADER]
        } else {
            Vec::new()
        }
    }
}

/// A bare `traceparent` value seen as a carrier
struct TraceparentValue<'a>(&'a str);

impl Extractor for TraceparentValue<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        key.eq_ignore_ascii_case(TRACEPARENT_HEADER).then_some(self.0)
    }

    fn keys(&self) -> Vec<&str> {
        vec![TRACEPARENT_HEADER]
    }
}

/// Write the active trace into the headers. No-op when no trace is active.
pub fn inject(headers: &mut MessageHeaders, active: Option<&TraceContext>) {
    if let Some(context) = active {
        TraceContextPropagator::new()
            .inject_context(&context.to_otel_context(), &mut HeadersInjector(headers));
    }
}

/// Read the trace carried by the headers, if any
///
/// Missing, non-UTF-8 and malformed values all yield `None`; the caller
/// starts a fresh root trace in that case.
pub fn extract(headers: &MessageHeaders) -> Option<TraceContext> {
    let cx = TraceContextPropagator::new().extract(&HeadersExtractor(headers));
    TraceContext::from_span_context(cx.span().span_context().clone())
}

/// A messaging span together with its explicit trace position
#[derive(Debug, Clone)]
pub struct MessagingSpan {
    span: Span,
    context: TraceContext,
    parent: Option<TraceContext>,
}

impl MessagingSpan {
    /// The `tracing` span; enter it or `instrument` work with it
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// This span's own trace context
    pub fn context(&self) -> &TraceContext {
        &self.context
    }

    /// The remote or local parent, `None` for a root span
    pub fn parent(&self) -> Option<&TraceContext> {
        self.parent.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn record_success(&self) {
        self.span.record("otel.status_code", "OK");
    }

    pub fn record_error(&self, error: &dyn fmt::Display) {
        self.span.record("otel.status_code", "ERROR");
        self.span.record("error.message", display(error));
    }
}

/// Start a producer span as a child of `active`, or as a new root
pub fn start_producer_span(
    name: &str,
    active: Option<&TraceContext>,
    exchange: &str,
    routing_key: &str,
    payload_size: usize,
) -> MessagingSpan {
    let span = tracing::info_span!(
        parent: None,
        "messaging.publish",
        otel.name = %name,
        otel.kind = "producer",
        otel.status_code = Empty,
        error.message = Empty,
        messaging.system = MESSAGING_SYSTEM,
        messaging.operation = "publish",
        messaging.destination = %exchange,
        messaging.rabbitmq.routing_key = %routing_key,
        messaging.message.payload_size_bytes = payload_size,
        trace_id = Empty,
        span_id = Empty,
        parent_span_id = Empty,
    );

    link(span, active.cloned())
}

/// Start a consumer span as a child of the trace carried by `headers`,
/// or as a new root when the headers carry none
pub fn start_consumer_span(
    name: &str,
    headers: &MessageHeaders,
    exchange: &str,
    routing_key: &str,
) -> MessagingSpan {
    let span = tracing::info_span!(
        parent: None,
        "messaging.receive",
        otel.name = %name,
        otel.kind = "consumer",
        otel.status_code = Empty,
        error.message = Empty,
        messaging.system = MESSAGING_SYSTEM,
        messaging.operation = "receive",
        messaging.destination = %exchange,
        messaging.rabbitmq.routing_key = %routing_key,
        trace_id = Empty,
        span_id = Empty,
        parent_span_id = Empty,
    );

    link(span, extract(headers))
}

/// Parent `span` and settle its own trace position
///
/// With an OpenTelemetry layer installed the span's position is the one the
/// layer assigned. Without one a child (or root) position is minted so the
/// headers and log fields still carry a usable trace.
fn link(span: Span, parent: Option<TraceContext>) -> MessagingSpan {
    if let Some(parent) = &parent {
        let _ = span.set_parent(parent.to_otel_context());
        span.record("parent_span_id", display(parent.span_id()));
    }

    let context = TraceContext::from_span_context(span.context().span().span_context().clone())
        .unwrap_or_else(|| match &parent {
            Some(parent) => parent.child(),
            None => TraceContext::new_root(),
        });
    span.record("trace_id", display(context.trace_id()));
    span.record("span_id", display(context.span_id()));

    MessagingSpan {
        span,
        context,
        parent,
    }
}
