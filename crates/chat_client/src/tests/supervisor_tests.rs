use super::*;

use std::time::Duration;

use crate::test_support::{MockTransport, TransportCalls, BUYER, PRODUCT};

fn supervisor(transport: &Arc<MockTransport>) -> ConnectionSupervisor {
    ConnectionSupervisor::new(
        transport.clone(),
        RetryPolicy::fixed(3, Duration::from_secs(2)),
    )
}

async fn wait_for_status(
    supervisor: &ConnectionSupervisor,
    expected: ConnectionState,
    within: Duration,
) {
    let mut rx = supervisor.subscribe();
    tokio::time::timeout(within, rx.wait_for(|state| *state == expected))
        .await
        .unwrap_or_else(|_| panic!("status never reached {expected:?}"))
        .expect("status channel open");
}

#[tokio::test(start_paused = true)]
async fn connects_and_holds_room_membership() {
    let transport = MockTransport::new(true);
    let supervisor = supervisor(&transport);

    supervisor.open(UserId::new(BUYER), ProductId::new(PRODUCT));
    wait_for_status(&supervisor, ConnectionState::Connected, Duration::from_secs(1)).await;

    assert_eq!(TransportCalls::get(&transport.calls.connects), 1);
    assert_eq!(TransportCalls::get(&transport.calls.joins), 1);
    assert_eq!(supervisor.failed_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn stays_connecting_while_retries_remain() {
    let transport = MockTransport::new(false);
    let supervisor = supervisor(&transport);

    supervisor.open(UserId::new(BUYER), ProductId::new(PRODUCT));
    tokio::time::sleep(Duration::from_millis(2500)).await;

    assert_eq!(supervisor.status(), ConnectionState::Connecting);
    assert_eq!(supervisor.failed_attempts(), 1);
    assert_eq!(TransportCalls::get(&transport.calls.connects), 2);
}

#[tokio::test(start_paused = true)]
async fn falls_back_to_offline_after_bounded_retries() {
    let transport = MockTransport::new(false);
    let supervisor = supervisor(&transport);

    supervisor.open(UserId::new(BUYER), ProductId::new(PRODUCT));
    wait_for_status(&supervisor, ConnectionState::Offline, Duration::from_secs(10)).await;

    assert_eq!(supervisor.failed_attempts(), 3);
    assert_eq!(TransportCalls::get(&transport.calls.connects), 3);

    // No further connect attempts without a manual retry.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(TransportCalls::get(&transport.calls.connects), 3);
    assert_eq!(supervisor.status(), ConnectionState::Offline);
}

#[tokio::test(start_paused = true)]
async fn offline_follows_the_shared_link_back_up() {
    let transport = MockTransport::new(false);
    let supervisor = ConnectionSupervisor::new(
        transport.clone(),
        RetryPolicy::fixed(1, Duration::from_secs(2)),
    );

    supervisor.open(UserId::new(BUYER), ProductId::new(PRODUCT));
    wait_for_status(&supervisor, ConnectionState::Offline, Duration::from_secs(10)).await;

    // Another surface reopened the process-wide socket.
    transport.set_link(LinkState::Up);
    wait_for_status(&supervisor, ConnectionState::Connected, Duration::from_secs(1)).await;

    assert_eq!(supervisor.connection_count(), 1);
    assert_eq!(supervisor.outage_count(), 1);
    assert_eq!(supervisor.failed_attempts(), 0);
    assert_eq!(TransportCalls::get(&transport.calls.connects), 1);
}

#[tokio::test(start_paused = true)]
async fn instant_reconnect_still_counts_a_new_connection() {
    let transport = MockTransport::new(true);
    let supervisor = supervisor(&transport);

    supervisor.open(UserId::new(BUYER), ProductId::new(PRODUCT));
    wait_for_status(&supervisor, ConnectionState::Connected, Duration::from_secs(1)).await;
    assert_eq!(supervisor.connection_count(), 1);

    transport.set_link(LinkState::Down);
    tokio::time::timeout(Duration::from_secs(5), async {
        while supervisor.connection_count() < 2 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("link never came back");

    assert_eq!(supervisor.status(), ConnectionState::Connected);
    assert_eq!(supervisor.outage_count(), 1);
    assert_eq!(TransportCalls::get(&transport.calls.connects), 2);
}

#[tokio::test(start_paused = true)]
async fn manual_retry_resets_budget_and_reconnects() {
    let transport = MockTransport::new(false);
    let supervisor = supervisor(&transport);

    supervisor.open(UserId::new(BUYER), ProductId::new(PRODUCT));
    wait_for_status(&supervisor, ConnectionState::Offline, Duration::from_secs(10)).await;

    transport.set_accept(true);
    supervisor.retry();
    assert_eq!(supervisor.failed_attempts(), 0);
    wait_for_status(&supervisor, ConnectionState::Connected, Duration::from_secs(1)).await;
    assert_eq!(TransportCalls::get(&transport.calls.connects), 4);
}

#[tokio::test(start_paused = true)]
async fn link_drop_reports_disconnected_then_recovers() {
    let transport = MockTransport::new(true);
    let supervisor = supervisor(&transport);
    let mut rx = supervisor.subscribe();

    supervisor.open(UserId::new(BUYER), ProductId::new(PRODUCT));
    rx.wait_for(|state| *state == ConnectionState::Connected)
        .await
        .expect("connected");

    transport.set_accept(false);
    transport.set_link(LinkState::Down);
    rx.wait_for(|state| *state == ConnectionState::Disconnected || *state == ConnectionState::Connecting)
        .await
        .expect("dropped");

    transport.set_accept(true);
    tokio::time::timeout(
        Duration::from_secs(10),
        rx.wait_for(|state| *state == ConnectionState::Connected),
    )
    .await
    .expect("reconnected in time")
    .expect("status channel open");

    // Membership is held across reconnects; the transport replays it.
    assert_eq!(TransportCalls::get(&transport.calls.joins), 1);
}

#[tokio::test(start_paused = true)]
async fn close_leaves_room_exactly_once() {
    let transport = MockTransport::new(true);
    let supervisor = supervisor(&transport);

    supervisor.open(UserId::new(BUYER), ProductId::new(PRODUCT));
    wait_for_status(&supervisor, ConnectionState::Connected, Duration::from_secs(1)).await;

    assert!(supervisor.close());
    assert!(!supervisor.close());
    drop(supervisor);

    assert_eq!(TransportCalls::get(&transport.calls.leaves), 1);
}

#[tokio::test(start_paused = true)]
async fn reopening_same_target_is_a_no_op() {
    let transport = MockTransport::new(true);
    let supervisor = supervisor(&transport);

    supervisor.open(UserId::new(BUYER), ProductId::new(PRODUCT));
    supervisor.open(UserId::new(BUYER), ProductId::new(PRODUCT));
    wait_for_status(&supervisor, ConnectionState::Connected, Duration::from_secs(1)).await;

    assert_eq!(TransportCalls::get(&transport.calls.joins), 1);
    assert_eq!(TransportCalls::get(&transport.calls.leaves), 0);
}
