mod common;

use common::*;
use hexagon_light::protocol::cmd;
use hexagon_light::*;
use std::sync::Arc;
use std::time::Duration;

fn status_requests(transport: &MockTransport) -> usize {
    transport
        .frames()
        .iter()
        .filter(|frame| frame[1] == cmd::STATUS)
        .count()
}

#[tokio::test]
async fn first_refresh_reports_update_failed() {
    let (device, transport) = session();
    transport.script(|s| s.fail_connect = true);
    let coordinator = RefreshCoordinator::new(Arc::new(device));

    let err = coordinator.first_refresh().await.unwrap_err();

    assert!(matches!(err, Error::UpdateFailed(_)));
    assert!(!coordinator.last_update_success());
    assert!(coordinator.last_error().is_some());
}

#[tokio::test]
async fn successful_refresh_clears_the_last_error() {
    let (device, transport) = session();
    transport.script(|s| s.fail_connect = true);
    let coordinator = RefreshCoordinator::new(Arc::new(device));
    assert!(coordinator.refresh_now().await.is_err());

    transport.script(|s| {
        s.fail_connect = false;
        s.status_reply = Some(status_frame(true, 105));
    });
    coordinator.refresh_now().await.unwrap();

    assert!(coordinator.last_update_success());
    assert_eq!(coordinator.session().state().brightness_percent, Some(100));
}

#[tokio::test]
async fn background_loop_refreshes_until_shutdown() {
    let (device, transport) = session();
    transport.script(|s| s.status_reply = Some(status_frame(true, 55)));
    let coordinator =
        RefreshCoordinator::new(Arc::new(device)).with_interval(Duration::from_millis(20));

    coordinator.first_refresh().await.unwrap();
    coordinator.start();
    assert!(coordinator.is_running());

    tokio::time::sleep(Duration::from_millis(150)).await;
    coordinator.shutdown().await;
    let seen = status_requests(&transport);
    assert!(seen >= 3, "only {seen} status requests");

    assert!(!coordinator.is_running());
    assert_eq!(
        coordinator.session().connection_state(),
        ConnectionState::Disconnected
    );

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(status_requests(&transport), seen);
}
