//! # Message Envelope
//!
//! Transport-level types shared by every broker implementation.
//!
//! The envelope is not a domain entity: it carries an already-serialized
//! body, the routing information the exchange needs, and the typed header
//! set. Only one header is recognized (`traceparent`), so headers are a
//! struct with a named field rather than an open key/value map.

use crate::trace_context::TRACEPARENT_HEADER;

/// Exchange routing type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
        }
    }
}

/// Properties an exchange is declared with
///
/// Declaration is idempotent as long as every declarer uses the same
/// properties; the producer and the worker both build their spec through
/// [`ExchangeSpec::topic`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeSpec {
    /// A durable, non-auto-deleted topic exchange
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
            auto_delete: false,
        }
    }
}

/// Recognized message headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    /// Raw bytes of the W3C `traceparent` value
    pub traceparent: Option<Vec<u8>>,
}

impl MessageHeaders {
    pub fn is_empty(&self) -> bool {
        self.traceparent.is_none()
    }

    /// Header key/value pairs as they go on the wire
    pub fn entries(&self) -> Vec<(&'static str, &[u8])> {
        self.traceparent
            .as_deref()
            .map(|value| vec![(TRACEPARENT_HEADER, value)])
            .unwrap_or_default()
    }
}

/// An outbound message, ready for the exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub exchange: String,
    pub routing_key: String,
    /// UTF-8 JSON body
    pub body: Vec<u8>,
    pub headers: MessageHeaders,
}

impl MessageEnvelope {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            body,
            headers: MessageHeaders::default(),
        }
    }

    pub fn with_headers(mut self, headers: MessageHeaders) -> Self {
        self.headers = headers;
        self
    }
}

/// A message pushed by the broker to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped tag used to settle this delivery
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub headers: MessageHeaders,
}
