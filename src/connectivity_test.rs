use super::*;
use crate::fixtures::{MockFailure, MockRemote};

#[tokio::test]
async fn transitions_emit_events() {
    let connectivity = Connectivity::new(false);
    let mut events = connectivity.subscribe();

    connectivity.set_online(true);
    connectivity.set_online(false);

    assert_eq!(events.recv().await.unwrap(), ConnectivityEvent::Online);
    assert_eq!(events.recv().await.unwrap(), ConnectivityEvent::Offline);
    assert!(!connectivity.is_online());
}

#[tokio::test]
async fn repeated_state_is_not_an_event() {
    let connectivity = Connectivity::new(true);
    let mut events = connectivity.subscribe();

    connectivity.set_online(true);
    connectivity.page_visible();

    assert_eq!(events.recv().await.unwrap(), ConnectivityEvent::Visible);
}

#[tokio::test]
async fn clones_share_state() {
    let a = Connectivity::new(false);
    let b = a.clone();
    let mut watch = b.watch();

    a.set_online(true);

    assert!(b.is_online());
    assert!(watch.has_changed().unwrap());
    assert!(*watch.borrow_and_update());
}

#[tokio::test]
async fn reachability_check_records_result() {
    let connectivity = Connectivity::new(false);
    let remote = MockRemote::new();

    assert!(connectivity.check_reachability(remote.as_ref(), Duration::from_millis(200)).await);
    assert!(connectivity.is_online());

    remote.fail_all(Some(MockFailure::Transport));
    assert!(!connectivity.check_reachability(remote.as_ref(), Duration::from_millis(200)).await);
    assert!(!connectivity.is_online());
}

#[tokio::test]
async fn reachability_check_times_out_as_offline() {
    let connectivity = Connectivity::new(true);
    let remote = MockRemote::new();
    remote.set_delay(Some(Duration::from_millis(500)));

    assert!(!connectivity.check_reachability(remote.as_ref(), Duration::from_millis(20)).await);
    assert!(!connectivity.is_online());
}
