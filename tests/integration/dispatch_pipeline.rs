//! Dispatch routing and the request→result→store chain

use std::sync::Arc;
use std::time::Duration;

use pulsewatch::bus::Bus;
use pulsewatch::ingest::IngestHandle;
use pulsewatch::manager::ManagerHandle;
use pulsewatch::messages::{subject, CheckAssignment, IngestEvent, MonitorType};
use pulsewatch::storage::StorageBackend;
use pulsewatch::worker::WorkerHandle;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn each_request_yields_at_most_one_assignment_to_a_supporting_worker() {
    let bus = Arc::new(Bus::default());
    let manager = ManagerHandle::spawn(Arc::clone(&bus));

    let http_worker = WorkerHandle::spawn(Arc::clone(&bus), vec![MonitorType::Http]);
    let tcp_worker = WorkerHandle::spawn(Arc::clone(&bus), vec![MonitorType::Tcp]);
    let mut http_assigns = bus.subscribe(&subject::check_assign(http_worker.id()));
    let mut tcp_assigns = bus.subscribe(&subject::check_assign(tcp_worker.id()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let request = check_request("127.0.0.1:1", MonitorType::Tcp, 1);
    bus.publish(subject::CHECK_REQUEST, &request).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Exactly one assignment, and only to the worker supporting TCP.
    let assignment = tokio::time::timeout(
        Duration::from_secs(2),
        tcp_assigns.recv::<CheckAssignment>(),
    )
    .await
    .expect("tcp worker should be assigned")
    .unwrap();
    assert_eq!(assignment.worker_id, tcp_worker.id());
    assert_eq!(assignment.request.monitor_id, request.monitor_id);

    assert!(
        tokio::time::timeout(
            Duration::from_millis(100),
            http_assigns.recv::<CheckAssignment>()
        )
        .await
        .is_err(),
        "http-only worker must not receive a TCP assignment"
    );

    http_worker.shutdown().await;
    tcp_worker.shutdown().await;
    manager.shutdown().await;
}

#[tokio::test]
async fn request_flows_through_worker_into_the_store() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let store = memory_store().await;
    let bus = Arc::new(Bus::default());
    let mut ingest_events = bus.subscribe(subject::ANALYTICS_INGEST);

    let ingest = IngestHandle::spawn(Arc::clone(&bus), Arc::clone(&store));
    let manager = ManagerHandle::spawn(Arc::clone(&bus));
    let worker = WorkerHandle::spawn(Arc::clone(&bus), vec![MonitorType::Http]);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let request = check_request(&mock_server.uri(), MonitorType::Http, 5);
    bus.publish(subject::CHECK_REQUEST, &request).unwrap();

    // The compact analytics event marks the end of the chain.
    let event = tokio::time::timeout(Duration::from_secs(10), ingest_events.recv::<IngestEvent>())
        .await
        .expect("ingest event")
        .unwrap();
    assert_eq!(event.monitor_id, request.monitor_id);
    assert!(event.success);

    assert_eq!(ingest.ingested().await, 1);

    let start = event.timestamp - chrono::TimeDelta::minutes(1);
    let end = event.timestamp + chrono::TimeDelta::minutes(1);
    let rows = store
        .query_results(request.monitor_id, start, end)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].success);
    assert_eq!(rows[0].monitor_id, request.monitor_id);

    worker.shutdown().await;
    manager.shutdown().await;
    ingest.shutdown().await;
}
