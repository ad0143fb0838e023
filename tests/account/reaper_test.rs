//! Tests for stuck multipart messages: timers, completion and eviction.

use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::time::Instant;

use cellchat::modem::{SmsState, TransportEvent};

use crate::support::{modem, receiving, sms_path, Call, Harness, Setup};

fn hours(h: u64) -> Duration {
    Duration::from_secs(h * 3600)
}

#[tokio::test(start_paused = true)]
async fn entry_past_its_window_is_deleted_almost_at_once() {
    let started = Instant::now();
    let old = Utc::now() - TimeDelta::days(8);
    let mut h = Harness::start(Setup::with_modem().entry(receiving(1, Some(old))));

    h.call(|c| c.is_delete_of(&sms_path(1))).await;
    assert!(started.elapsed() < Duration::from_secs(60));
    assert!(h.handle.stuck_entries().await.expect("running").is_empty());
    assert_eq!(h.count(|c| matches!(c, Call::Persist { .. })), 0);
}

#[tokio::test(start_paused = true)]
async fn entry_inside_its_window_waits_for_the_rest() {
    let started = Instant::now();
    let recent = Utc::now() - TimeDelta::hours(1);
    let mut h = Harness::start(Setup::with_modem().entry(receiving(1, Some(recent))));
    h.connected().await;
    h.settle().await;

    assert_eq!(
        h.handle.stuck_entries().await.expect("running"),
        vec![sms_path(1)]
    );
    assert!(h.modem.contains(&sms_path(1)));

    h.call(|c| c.is_delete_of(&sms_path(1))).await;
    assert!(started.elapsed() >= hours(166));
    assert!(started.elapsed() <= hours(168));
}

#[tokio::test(start_paused = true)]
async fn entry_without_timestamp_gets_the_short_window() {
    let started = Instant::now();
    let mut h = Harness::start(Setup::with_modem().entry(receiving(1, None)));

    h.call(|c| c.is_delete_of(&sms_path(1))).await;
    assert!(started.elapsed() >= hours(48));
}

#[tokio::test(start_paused = true)]
async fn timestamp_far_in_the_future_gets_the_short_window() {
    let started = Instant::now();
    let future = Utc::now() + TimeDelta::days(30);
    let mut h = Harness::start(Setup::with_modem().entry(receiving(1, Some(future))));

    h.call(|c| c.is_delete_of(&sms_path(1))).await;
    assert!(started.elapsed() >= hours(48));
    assert!(started.elapsed() < hours(49));
}

#[tokio::test(start_paused = true)]
async fn completed_entry_is_stored_and_its_timer_cancelled() {
    let mut h = Harness::start(Setup::with_modem().entry(receiving(1, None)));
    h.connected().await;
    h.settle().await;
    assert_eq!(h.handle.stuck_entries().await.expect("running").len(), 1);

    h.modem.set_state(&sms_path(1), SmsState::Received);
    h.signal(TransportEvent::SmsStateChanged {
        sms: sms_path(1),
        state: SmsState::Received,
    })
    .await;

    h.call(|c| matches!(c, Call::Persist { .. })).await;
    h.call(|c| c.is_delete_of(&sms_path(1))).await;
    assert!(h.handle.stuck_entries().await.expect("running").is_empty());

    tokio::time::sleep(hours(100)).await;
    assert_eq!(h.count(|c| c.is_delete_of(&sms_path(1))), 1);
}

#[tokio::test(start_paused = true)]
async fn intermediate_state_changes_keep_the_timer() {
    let mut h = Harness::start(Setup::with_modem().entry(receiving(1, None)));
    h.connected().await;
    h.settle().await;

    h.signal(TransportEvent::SmsStateChanged {
        sms: sms_path(1),
        state: SmsState::Receiving,
    })
    .await;
    h.settle().await;

    assert_eq!(h.handle.stuck_entries().await.expect("running").len(), 1);
    assert_eq!(h.count(|c| matches!(c, Call::Read(p) if *p == sms_path(1))), 1);
}

#[tokio::test(start_paused = true)]
async fn removed_modem_takes_its_timers_along() {
    let mut h = Harness::start(Setup::with_modem().entry(receiving(1, None)));
    h.connected().await;
    h.settle().await;
    assert_eq!(h.handle.stuck_entries().await.expect("running").len(), 1);

    h.signal(TransportEvent::DeviceRemoved(modem())).await;
    h.settle().await;
    assert!(h.handle.stuck_entries().await.expect("running").is_empty());

    tokio::time::sleep(hours(100)).await;
    assert_eq!(h.count(|c| matches!(c, Call::Delete(_))), 0);
}

#[tokio::test(start_paused = true)]
async fn vanished_service_cancels_every_timer() {
    let mut h = Harness::start(Setup::with_modem().entry(receiving(1, None)));
    h.connected().await;
    h.settle().await;

    h.signal(TransportEvent::ServiceVanished).await;
    h.settle().await;
    assert!(h.handle.stuck_entries().await.expect("running").is_empty());

    tokio::time::sleep(hours(100)).await;
    assert_eq!(h.count(|c| matches!(c, Call::Delete(_))), 0);
}
