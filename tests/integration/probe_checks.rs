//! Probe execution scenarios: dispatch a check through the manager and a
//! live worker against real local endpoints, observe the published result.

use std::sync::Arc;
use std::time::Duration;

use pulsewatch::bus::Bus;
use pulsewatch::manager::ManagerHandle;
use pulsewatch::messages::{subject, CheckResult, MonitorType};
use pulsewatch::worker::WorkerHandle;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

async fn checking_rig(check_types: Vec<MonitorType>) -> (Arc<Bus>, ManagerHandle, WorkerHandle) {
    let bus = Arc::new(Bus::default());
    let manager = ManagerHandle::spawn(Arc::clone(&bus));
    let worker = WorkerHandle::spawn(Arc::clone(&bus), check_types);
    // Let the registration land before dispatching anything.
    tokio::time::sleep(Duration::from_millis(50)).await;
    (bus, manager, worker)
}

async fn next_result(sub: &mut pulsewatch::bus::Subscription) -> CheckResult {
    tokio::time::timeout(Duration::from_secs(10), sub.recv::<CheckResult>())
        .await
        .expect("timed out waiting for check result")
        .expect("result stream closed")
}

#[tokio::test]
async fn happy_http_check_reports_success_and_duration() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(40)))
        .mount(&mock_server)
        .await;

    let (bus, manager, worker) = checking_rig(vec![MonitorType::Http]).await;
    let mut results = bus.subscribe(subject::CHECK_RESULT);

    let request = check_request(&mock_server.uri(), MonitorType::Http, 10);
    bus.publish(subject::CHECK_REQUEST, &request).unwrap();

    let result = next_result(&mut results).await;
    assert!(result.success, "expected success, got {:?}", result.error);
    assert_eq!(result.monitor_id, request.monitor_id);
    assert_eq!(result.worker_id, worker.id());
    assert_eq!(result.details.get("status_code").map(String::as_str), Some("200"));
    assert!(
        result.duration_ms >= 40,
        "duration {}ms below server delay",
        result.duration_ms
    );
    assert!(
        result.duration_ms <= 10_000 + 100,
        "duration {}ms exceeds timeout plus tolerance",
        result.duration_ms
    );

    worker.shutdown().await;
    manager.shutdown().await;
}

#[tokio::test]
async fn unresponsive_server_times_out() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .mount(&mock_server)
        .await;

    let (bus, manager, worker) = checking_rig(vec![MonitorType::Http]).await;
    let mut results = bus.subscribe(subject::CHECK_RESULT);

    let request = check_request(&mock_server.uri(), MonitorType::Http, 1);
    bus.publish(subject::CHECK_REQUEST, &request).unwrap();

    let result = next_result(&mut results).await;
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("timeout"));
    assert!(
        (950..=1_600).contains(&result.duration_ms),
        "duration {}ms should sit at the 1s deadline",
        result.duration_ms
    );

    worker.shutdown().await;
    manager.shutdown().await;
}

#[tokio::test]
async fn server_error_is_an_unexpected_status() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let (bus, manager, worker) = checking_rig(vec![MonitorType::Http]).await;
    let mut results = bus.subscribe(subject::CHECK_RESULT);

    bus.publish(
        subject::CHECK_REQUEST,
        &check_request(&mock_server.uri(), MonitorType::Http, 5),
    )
    .unwrap();

    let result = next_result(&mut results).await;
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("unexpected_status"));
    assert_eq!(result.details.get("status_code").map(String::as_str), Some("503"));

    worker.shutdown().await;
    manager.shutdown().await;
}

#[tokio::test]
async fn expected_status_codes_override_the_default_rule() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let (bus, manager, worker) = checking_rig(vec![MonitorType::Http]).await;
    let mut results = bus.subscribe(subject::CHECK_RESULT);

    let mut request = check_request(&mock_server.uri(), MonitorType::Http, 5);
    request.expected_status_codes = Some(vec![503]);
    bus.publish(subject::CHECK_REQUEST, &request).unwrap();

    let result = next_result(&mut results).await;
    assert!(result.success, "503 was explicitly expected");

    worker.shutdown().await;
    manager.shutdown().await;
}

#[tokio::test]
async fn tcp_check_succeeds_against_listener_and_fails_when_refused() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (bus, manager, worker) = checking_rig(vec![MonitorType::Tcp]).await;
    let mut results = bus.subscribe(subject::CHECK_RESULT);

    bus.publish(
        subject::CHECK_REQUEST,
        &check_request(&addr.to_string(), MonitorType::Tcp, 5),
    )
    .unwrap();
    let result = next_result(&mut results).await;
    assert!(result.success);

    // Drop the listener and probe the same port again.
    drop(listener);
    bus.publish(
        subject::CHECK_REQUEST,
        &check_request(&addr.to_string(), MonitorType::Tcp, 5),
    )
    .unwrap();
    let result = next_result(&mut results).await;
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("connection_refused"));

    worker.shutdown().await;
    manager.shutdown().await;
}

#[tokio::test]
async fn dns_check_resolves_localhost() {
    let (bus, manager, worker) = checking_rig(vec![MonitorType::Dns]).await;
    let mut results = bus.subscribe(subject::CHECK_RESULT);

    bus.publish(
        subject::CHECK_REQUEST,
        &check_request("localhost", MonitorType::Dns, 5),
    )
    .unwrap();

    let result = next_result(&mut results).await;
    assert!(result.success, "localhost must resolve: {:?}", result.error);
    assert!(result.details.contains_key("ip_1"));

    worker.shutdown().await;
    manager.shutdown().await;
}

#[tokio::test]
async fn udp_check_is_best_effort_liveness() {
    // A bound local socket accepts the empty datagram.
    let receiver = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = receiver.local_addr().unwrap();

    let (bus, manager, worker) = checking_rig(vec![MonitorType::Udp]).await;
    let mut results = bus.subscribe(subject::CHECK_RESULT);

    bus.publish(
        subject::CHECK_REQUEST,
        &check_request(&addr.to_string(), MonitorType::Udp, 5),
    )
    .unwrap();

    let result = next_result(&mut results).await;
    assert!(result.success);

    worker.shutdown().await;
    manager.shutdown().await;
}
