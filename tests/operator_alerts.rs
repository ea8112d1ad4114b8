// tests/operator_alerts.rs
//
// Operator alert gate over a recording messenger and a fixed clock.
//
// Covered:
// - repeated kind suppressed until the cooldown passes
// - clear re-arms a kind
// - no operator chat configured -> nothing sent

mod common;

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};

use deal_notifier::clock::FixedClock;
use deal_notifier::models::ChatId;
use deal_notifier::notify::operator::{AlertKind, OperatorAlerts};

use common::RecordingMessenger;

fn setup(chat: Option<ChatId>) -> (Arc<RecordingMessenger>, Arc<FixedClock>, OperatorAlerts) {
    let messenger = Arc::new(RecordingMessenger::default());
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap(),
    ));
    let alerts = OperatorAlerts::new(messenger.clone(), chat, clock.clone(), 600);
    (messenger, clock, alerts)
}

#[tokio::test]
async fn repeated_kind_is_suppressed_until_cooldown() {
    let (messenger, clock, alerts) = setup(Some(ChatId(42)));
    assert!(alerts.alert(AlertKind::Fetch, "feed down").await);
    assert!(!alerts.alert(AlertKind::Fetch, "feed down").await);
    assert!(alerts.alert(AlertKind::Store, "db locked").await);

    clock.advance(ChronoDuration::seconds(601));
    assert!(alerts.alert(AlertKind::Fetch, "feed still down").await);

    let sent = messenger.sent();
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|(chat, _)| *chat == ChatId(42)));
    assert!(sent[0].1.contains("[fetch]"));
}

#[tokio::test]
async fn clear_rearms_kind() {
    let (_messenger, _clock, alerts) = setup(Some(ChatId(42)));
    assert!(alerts.alert(AlertKind::Fetch, "x").await);
    alerts.clear(AlertKind::Fetch);
    assert!(alerts.alert(AlertKind::Fetch, "x").await);
}

#[tokio::test]
async fn without_operator_chat_nothing_is_sent() {
    let (messenger, _clock, alerts) = setup(None);
    assert!(!alerts.enabled());
    assert!(!alerts.alert(AlertKind::Panic, "boom").await);
    assert!(messenger.sent().is_empty());
}
