use amqp_bus::{
    Broker, EventProducer, InMemoryBroker, MessageEnvelope, Settlement, WorkerHandle, WorkerState,
};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use grade_contracts::{routing_key, GradeSubmission};
use grade_contracts::BusSettings;
use notifications_rs::config::Config;
use notifications_rs::{app, start_worker_with};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn test_config() -> Config {
    Config {
        bus: BusSettings {
            amqp_url: String::new(),
            exchange: "grades_exchange".to_string(),
            routing_domain: "grades".to_string(),
        },
        host: "127.0.0.1".to_string(),
        port: 0,
        poll_interval: Duration::from_millis(10),
        consumer_tag: "notifications-test".to_string(),
        json_logs: false,
    }
}

async fn consuming_worker(broker: &InMemoryBroker) -> WorkerHandle {
    let connecting = broker.clone();
    let handle = start_worker_with(&test_config(), async move { connecting.connect() });
    let consuming = tokio::time::timeout(
        Duration::from_secs(1),
        handle.wait_for(WorkerState::Consuming),
    )
    .await
    .expect("timeout waiting for worker");
    assert!(consuming);
    handle
}

#[tokio::test]
async fn test_grade_event_is_acknowledged() {
    let broker = InMemoryBroker::new();
    let worker = consuming_worker(&broker).await;

    let producer = EventProducer::new(Arc::new(broker.connect().unwrap()));
    producer
        .publish(
            GradeSubmission::new("Ivan Petrenko", "Mathematics", 5),
            "grades_exchange",
            &routing_key("grades", "Mathematics"),
            None,
        )
        .await
        .unwrap();

    let settlements = tokio::time::timeout(Duration::from_secs(1), broker.wait_for_settlements(1))
        .await
        .expect("timeout");
    assert_eq!(settlements[0].settlement, Settlement::Ack);
    assert_eq!(settlements[0].routing_key, "grades.new.mathematics");

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_grade_event_is_dropped() {
    let broker = InMemoryBroker::new();
    let worker = consuming_worker(&broker).await;

    let connection = broker.connect().unwrap();
    let channel = connection.open_channel().await.unwrap();
    channel
        .publish(MessageEnvelope::new(
            "grades_exchange",
            "grades.new.math",
            b"{not json".to_vec(),
        ))
        .await
        .unwrap();

    let settlements = tokio::time::timeout(Duration::from_secs(1), broker.wait_for_settlements(1))
        .await
        .expect("timeout");
    assert_eq!(settlements[0].settlement, Settlement::RejectNoRequeue);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.settlements().len(), 1);
    assert_eq!(broker.dead_letters().len(), 1);

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_health_reports_worker_state() {
    let broker = InMemoryBroker::new();
    let worker = consuming_worker(&broker).await;

    let response = app(worker.subscribe())
        .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["service"], "notifications-rs");
    assert_eq!(json["worker"], "consuming");

    worker.stop().await.unwrap();
}

async fn get_status(worker: &WorkerHandle, uri: &str) -> StatusCode {
    app(worker.subscribe())
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
        .status()
}

#[tokio::test]
async fn test_unreachable_broker_leaves_worker_connecting() {
    let broker = InMemoryBroker::new();
    broker.set_reachable(false);

    let connecting = broker.clone();
    let worker = start_worker_with(&test_config(), async move { connecting.connect() });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(worker.state(), WorkerState::Connecting);
    assert_eq!(get_status(&worker, "/api/health").await, StatusCode::OK);
    assert_eq!(
        get_status(&worker, "/health/ready").await,
        StatusCode::SERVICE_UNAVAILABLE
    );

    assert!(worker.stop().await.is_err());
}

#[tokio::test]
async fn test_ready_only_while_consuming() {
    let broker = InMemoryBroker::new();
    let worker = consuming_worker(&broker).await;
    assert_eq!(get_status(&worker, "/health/ready").await, StatusCode::OK);

    // Broker outage ends the consumer stream and closes the worker
    broker.set_reachable(false);
    let closed = tokio::time::timeout(Duration::from_secs(1), worker.wait_for(WorkerState::Closed))
        .await
        .expect("timeout waiting for worker");
    assert!(closed);
    assert_eq!(
        get_status(&worker, "/health/ready").await,
        StatusCode::SERVICE_UNAVAILABLE
    );

    worker.stop().await.unwrap();
}
