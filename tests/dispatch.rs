// tests/dispatch.rs
//
// Dispatch engine with a scripted messenger, in-memory store and paused time.
//
// Covered:
// - per-chat spacing and global cap on send timestamps
// - transient/rate-limited retry with backoff, exhaustion -> Dropped
// - rejected message is not retried
// - permanent failure suspends the chat for this and later batches
// - shutdown before and during a batch -> Cancelled, nothing completed
// - no subscribers: every deal completes without sends

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::time::Instant;

use deal_notifier::clock::FixedClock;
use deal_notifier::ingest::types::Deal;
use deal_notifier::models::{ChatId, Subscriber, SubscriberStatus};
use deal_notifier::notify::{
    DeliveryResult, DispatchCfg, Dispatcher, RateLimitCfg, RateLimiter, SendError,
};
use deal_notifier::shutdown;
use deal_notifier::store::{MemoryStore, StateStore};

use common::RecordingMessenger;

fn deal(n: u32) -> Deal {
    let url = format!("https://www.mydealz.de/deals/deal-{n}");
    Deal {
        id: url.clone(),
        title: format!("Deal {n}"),
        price: Some(format!("{n}9€")),
        merchant: None,
        url,
        published_at: None,
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    messenger: Arc<RecordingMessenger>,
    dispatcher: Dispatcher,
}

fn harness(cfg: DispatchCfg, rate: RateLimitCfg) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let messenger = Arc::new(RecordingMessenger::default());
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap(),
    ));
    let dispatcher = Dispatcher::new(
        messenger.clone(),
        store.clone(),
        Arc::new(RateLimiter::new(rate)),
        clock,
        cfg,
    );
    Harness {
        store,
        messenger,
        dispatcher,
    }
}

fn fast_cfg() -> DispatchCfg {
    DispatchCfg {
        max_attempts: 3,
        base_backoff: Duration::from_millis(500),
        max_backoff: Duration::from_secs(10),
        send_timeout: Duration::from_secs(5),
        concurrency: 4,
    }
}

fn rate(per_chat_ms: u64, global_per_sec: u32) -> RateLimitCfg {
    RateLimitCfg {
        per_chat_interval: Duration::from_millis(per_chat_ms),
        global_per_sec,
    }
}

async fn subscribe(store: &MemoryStore, chats: &[i64]) -> Vec<Subscriber> {
    let now = Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap();
    for c in chats {
        store.upsert_subscriber(ChatId(*c), now).await.unwrap();
    }
    store.active_subscribers().await.unwrap()
}

#[tokio::test(start_paused = true)]
async fn sends_to_one_chat_respect_min_interval() {
    let h = harness(fast_cfg(), rate(1_000, 25));
    let subs = subscribe(&h.store, &[1]).await;
    let deals: Vec<Deal> = (1..=5).map(deal).collect();
    let (_trigger, signal) = shutdown::channel();

    let report = h.dispatcher.dispatch_batch(&deals, &subs, &signal).await;
    assert_eq!(report.delivered, 5);
    assert_eq!(report.completed_ids.len(), 5);

    let attempts = h.messenger.attempts_to(ChatId(1));
    assert_eq!(attempts.len(), 5);
    for pair in attempts.windows(2) {
        assert!(pair[1].at - pair[0].at >= Duration::from_millis(1_000));
    }
    // deals arrive in the order given
    for (a, d) in attempts.iter().zip(&deals) {
        assert!(a.text.contains(&d.title));
    }
}

#[tokio::test(start_paused = true)]
async fn global_cap_spaces_sends_across_chats() {
    let h = harness(
        DispatchCfg {
            concurrency: 10,
            ..fast_cfg()
        },
        rate(1_000, 5),
    );
    let chats: Vec<i64> = (1..=10).collect();
    let subs = subscribe(&h.store, &chats).await;
    let (_trigger, signal) = shutdown::channel();

    let report = h.dispatcher.dispatch_batch(&[deal(1)], &subs, &signal).await;
    assert_eq!(report.delivered, 10);

    let mut times: Vec<Instant> = h.messenger.attempts().iter().map(|a| a.at).collect();
    times.sort();
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(200));
    }
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_with_backoff() {
    let h = harness(fast_cfg(), rate(100, 100));
    let subs = subscribe(&h.store, &[7]).await;
    h.messenger.script(
        ChatId(7),
        vec![
            Err(SendError::Transient("502".into())),
            Err(SendError::RateLimited {
                retry_after: Some(Duration::from_secs(4)),
            }),
            Ok(()),
        ],
    );
    let (_trigger, signal) = shutdown::channel();

    let results = h.dispatcher.dispatch(&deal(1), &subs, &signal).await;
    assert_eq!(
        results,
        vec![(ChatId(7), DeliveryResult::Delivered { attempts: 3 })]
    );

    let attempts = h.messenger.attempts_to(ChatId(7));
    assert_eq!(attempts.len(), 3);
    assert!(attempts[1].at - attempts[0].at >= Duration::from_millis(500));
    // retry_after outweighs the 1s backoff of the second attempt
    assert!(attempts[2].at - attempts[1].at >= Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_drop_the_message_only() {
    let h = harness(fast_cfg(), rate(100, 100));
    let subs = subscribe(&h.store, &[1, 2]).await;
    h.messenger
        .fail_always(ChatId(1), SendError::Transient("timeout".into()));
    let (_trigger, signal) = shutdown::channel();

    let report = h.dispatcher.dispatch_batch(&[deal(1)], &subs, &signal).await;
    assert_eq!(report.delivered, 1);
    assert_eq!(report.dropped, 1);
    assert!(matches!(
        report.results_for(ChatId(1))[0],
        DeliveryResult::Dropped { attempts: 3, .. }
    ));
    // a dropped delivery still completes the deal; the chat stays subscribed
    assert_eq!(report.completed_ids, vec![deal(1).id]);
    assert!(h.store.subscriber(ChatId(1)).await.unwrap().unwrap().is_active());
    assert_eq!(h.messenger.attempts_to(ChatId(1)).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn rejected_message_is_not_retried() {
    let h = harness(fast_cfg(), rate(100, 100));
    let subs = subscribe(&h.store, &[3]).await;
    h.messenger.script(
        ChatId(3),
        vec![Err(SendError::Rejected("can't parse entities".into()))],
    );
    let (_trigger, signal) = shutdown::channel();

    let results = h.dispatcher.dispatch(&deal(1), &subs, &signal).await;
    assert!(matches!(
        results[0].1,
        DeliveryResult::Dropped { attempts: 1, .. }
    ));
    assert_eq!(h.messenger.attempts_to(ChatId(3)).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unreachable_chat_is_suspended_and_skipped() {
    let h = harness(fast_cfg(), rate(100, 100));
    let subs = subscribe(&h.store, &[1, 2]).await;
    h.messenger.fail_always(
        ChatId(2),
        SendError::PermanentUnreachable("bot was blocked by the user".into()),
    );
    let (_trigger, signal) = shutdown::channel();

    let report = h
        .dispatcher
        .dispatch_batch(&[deal(1), deal(2)], &subs, &signal)
        .await;
    let chat2 = report.results_for(ChatId(2));
    assert!(matches!(chat2[0], DeliveryResult::Suspended { .. }));
    assert_eq!(chat2[1], &DeliveryResult::SkippedSuspended);
    assert_eq!(h.messenger.attempts_to(ChatId(2)).len(), 1);
    assert_eq!(h.messenger.sent_to(ChatId(1)).len(), 2);

    let stored = h.store.subscriber(ChatId(2)).await.unwrap().unwrap();
    assert_eq!(stored.status, SubscriberStatus::Suspended);

    // later batches only see the remaining active chat
    let active = h.store.active_subscribers().await.unwrap();
    h.dispatcher.dispatch_batch(&[deal(3)], &active, &signal).await;
    assert_eq!(h.messenger.attempts_to(ChatId(2)).len(), 1);
    assert_eq!(h.messenger.sent_to(ChatId(1)).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn shutdown_before_batch_cancels_everything() {
    let h = harness(fast_cfg(), rate(100, 100));
    let subs = subscribe(&h.store, &[1, 2]).await;
    let (trigger, signal) = shutdown::channel();
    trigger.trigger();

    let report = h
        .dispatcher
        .dispatch_batch(&[deal(1), deal(2)], &subs, &signal)
        .await;
    assert_eq!(report.cancelled, 4);
    assert!(report.completed_ids.is_empty());
    assert!(h.messenger.attempts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_backoff() {
    let h = harness(
        DispatchCfg {
            max_attempts: 5,
            base_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(600),
            ..fast_cfg()
        },
        rate(100, 100),
    );
    let subs = subscribe(&h.store, &[1]).await;
    h.messenger
        .fail_always(ChatId(1), SendError::Transient("down".into()));
    let (trigger, signal) = shutdown::channel();

    let dispatcher = h.dispatcher.clone();
    let started = Instant::now();
    let task = tokio::spawn(async move {
        dispatcher
            .dispatch_batch(&[deal(1), deal(2)], &subs, &signal)
            .await
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    trigger.trigger();
    let report = task.await.unwrap();

    assert!(Instant::now() - started < Duration::from_secs(60));
    assert_eq!(report.cancelled, 2);
    assert!(report.completed_ids.is_empty());
    assert_eq!(h.messenger.attempts_to(ChatId(1)).len(), 1);
}

#[tokio::test]
async fn without_subscribers_every_deal_completes() {
    let h = harness(fast_cfg(), rate(100, 100));
    let (_trigger, signal) = shutdown::channel();

    let report = h
        .dispatcher
        .dispatch_batch(&[deal(1), deal(2)], &[], &signal)
        .await;
    assert_eq!(report.completed_ids, vec![deal(1).id, deal(2).id]);
    assert!(h.messenger.attempts().is_empty());
}
