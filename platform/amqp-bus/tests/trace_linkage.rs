use amqp_bus::trace_context::{inject, start_consumer_span, start_producer_span};
use amqp_bus::{
    Broker, DeliveryContext, DomainEvent, EventHandler, EventProducer, InMemoryBroker,
    MessageHeaders, TraceContext, Worker, WorkerConfig, WorkerState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::trace::{SpanKind, TracerProvider as _};
use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider, SpanData};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;

struct Otel {
    provider: SdkTracerProvider,
    exporter: InMemorySpanExporter,
}

impl Otel {
    fn install() -> (Self, impl tracing::Subscriber + Send + Sync) {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let tracer = provider.tracer("amqp-bus-tests");
        let subscriber =
            tracing_subscriber::registry().with(tracing_opentelemetry::layer().with_tracer(tracer));
        (Self { provider, exporter }, subscriber)
    }

    fn finished(&self, name: &str) -> SpanData {
        self.provider.force_flush().expect("flush");
        self.exporter
            .get_finished_spans()
            .expect("finished spans")
            .into_iter()
            .find(|span| span.name == name)
            .unwrap_or_else(|| panic!("span {name} was not exported"))
    }
}

#[test]
fn test_consumer_span_joins_producer_trace() {
    let (otel, subscriber) = Otel::install();

    let (producer_context, consumer_context) = tracing::subscriber::with_default(subscriber, || {
        let producer = start_producer_span("publish", None, "grades_exchange", "grades.new.math", 42);
        let mut headers = MessageHeaders::default();
        inject(&mut headers, Some(producer.context()));

        let consumer =
            start_consumer_span("ProcessGrade", &headers, "grades_exchange", "grades.new.math");
        assert_eq!(
            consumer.parent().map(TraceContext::span_id),
            Some(producer.context().span_id())
        );
        (producer.context().clone(), consumer.context().clone())
    });

    let publish = otel.finished("publish");
    let process = otel.finished("ProcessGrade");

    assert_eq!(publish.span_kind, SpanKind::Producer);
    assert_eq!(process.span_kind, SpanKind::Consumer);

    // Header values are the ids the exporter sees
    assert_eq!(publish.span_context.span_id().to_string(), producer_context.span_id());
    assert_eq!(process.span_context.span_id().to_string(), consumer_context.span_id());

    assert_eq!(process.span_context.trace_id(), publish.span_context.trace_id());
    assert_eq!(process.parent_span_id, publish.span_context.span_id());
}

#[test]
fn test_producer_span_continues_explicit_active_trace() {
    let (otel, subscriber) = Otel::install();
    let caller = TraceContext::parse("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
        .expect("valid traceparent");

    tracing::subscriber::with_default(subscriber, || {
        // An ambient span must not become the parent
        let _request = tracing::info_span!("http.request").entered();
        let producer = start_producer_span("publish", Some(&caller), "grades_exchange", "rk", 1);
        assert!(producer.context().same_trace(&caller));
    });

    let publish = otel.finished("publish");
    assert_eq!(
        publish.span_context.trace_id().to_string(),
        "4bf92f3577b34da6a3ce929d0e0e4736"
    );
    assert_eq!(publish.parent_span_id.to_string(), "00f067aa0ba902b7");
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Ping {
    n: u32,
    at: Option<DateTime<Utc>>,
}

impl DomainEvent for Ping {
    type Stamped = Ping;

    fn stamp(self, at: DateTime<Utc>) -> Ping {
        Ping { at: Some(at), ..self }
    }
}

struct Accept;

#[async_trait]
impl EventHandler<Ping> for Accept {
    async fn handle(&self, _event: Ping, _ctx: &DeliveryContext) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_worker_span_is_child_of_publish_span() {
    let (otel, subscriber) = Otel::install();
    // current-thread runtime: spawned worker tasks share this default
    let _guard = tracing::subscriber::set_default(subscriber);

    let broker = InMemoryBroker::new();
    let config = WorkerConfig::new("grades_exchange", "grades.new.*")
        .with_poll_interval(Duration::from_millis(10))
        .with_span_name("ProcessPing");
    let connecting = broker.clone();
    let worker = Worker::<Ping, _>::new(config, Accept).spawn(async move { connecting.connect() });
    assert!(
        tokio::time::timeout(Duration::from_secs(1), worker.wait_for(WorkerState::Consuming))
            .await
            .expect("timeout")
    );

    let connection: Arc<dyn Broker> = Arc::new(broker.connect().unwrap());
    EventProducer::new(connection)
        .publish(Ping { n: 1, at: None }, "grades_exchange", "grades.new.ping", None)
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), broker.wait_for_settlements(1))
        .await
        .expect("timeout");
    worker.stop().await.unwrap();

    let publish = otel.finished("publish");
    let process = otel.finished("ProcessPing");
    assert_eq!(process.span_context.trace_id(), publish.span_context.trace_id());
    assert_eq!(process.parent_span_id, publish.span_context.span_id());
}
