//! Dispatch engine: fans new deals out to active subscribers.
//!
//! One worker per subscriber, bounded by a semaphore. Inside a worker the
//! deals go out in order, each send paced by the [`RateLimiter`] and retried
//! with exponential backoff. A chat that turns out to be permanently
//! unreachable is suspended in the store and skipped for the rest of the batch.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::message::format_deal;
use super::{Messenger, RateLimiter, SendError};
use crate::clock::Clock;
use crate::ingest::types::Deal;
use crate::models::{ChatId, Subscriber, SubscriberStatus};
use crate::shutdown::ShutdownSignal;
use crate::store::StateStore;

#[derive(Debug, Clone)]
pub struct DispatchCfg {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub send_timeout: Duration,
    pub concurrency: usize,
}

impl Default for DispatchCfg {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            send_timeout: Duration::from_secs(10),
            concurrency: 8,
        }
    }
}

impl DispatchCfg {
    /// Delay after failed attempt `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.base_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

/// Outcome of one (deal, subscriber) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DeliveryResult {
    Delivered { attempts: u32 },
    /// Retries exhausted or the message was rejected. The deal stays seen.
    Dropped { attempts: u32, reason: String },
    /// This send found the chat unreachable; the subscriber was suspended.
    Suspended { reason: String },
    /// Not attempted because the chat was suspended earlier in the batch.
    SkippedSuspended,
    /// Not completed because shutdown was requested.
    Cancelled,
}

impl DeliveryResult {
    fn label(&self) -> &'static str {
        match self {
            DeliveryResult::Delivered { .. } => "delivered",
            DeliveryResult::Dropped { .. } => "dropped",
            DeliveryResult::Suspended { .. } => "suspended",
            DeliveryResult::SkippedSuspended => "skipped",
            DeliveryResult::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub deal_id: String,
    pub chat_id: ChatId,
    pub result: DeliveryResult,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    pub delivered: usize,
    pub dropped: usize,
    pub suspended: usize,
    pub skipped: usize,
    pub cancelled: usize,
    /// Deals whose fan-out finished (no delivery was cut short by shutdown).
    pub completed_ids: Vec<String>,
    #[serde(skip)]
    pub deliveries: Vec<Delivery>,
}

impl DispatchReport {
    pub fn results_for(&self, chat_id: ChatId) -> Vec<&DeliveryResult> {
        self.deliveries
            .iter()
            .filter(|d| d.chat_id == chat_id)
            .map(|d| &d.result)
            .collect()
    }

    fn record(&mut self, delivery: Delivery) {
        match &delivery.result {
            DeliveryResult::Delivered { .. } => self.delivered += 1,
            DeliveryResult::Dropped { .. } => self.dropped += 1,
            DeliveryResult::Suspended { .. } => self.suspended += 1,
            DeliveryResult::SkippedSuspended => self.skipped += 1,
            DeliveryResult::Cancelled => self.cancelled += 1,
        }
        self.deliveries.push(delivery);
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    messenger: Arc<dyn Messenger>,
    store: Arc<dyn StateStore>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    cfg: DispatchCfg,
}

impl Dispatcher {
    pub fn new(
        messenger: Arc<dyn Messenger>,
        store: Arc<dyn StateStore>,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
        cfg: DispatchCfg,
    ) -> Self {
        Self {
            messenger,
            store,
            limiter,
            clock,
            cfg,
        }
    }

    pub fn cfg(&self) -> &DispatchCfg {
        &self.cfg
    }

    /// Sends one deal to `subscribers`.
    pub async fn dispatch(
        &self,
        deal: &Deal,
        subscribers: &[Subscriber],
        shutdown: &ShutdownSignal,
    ) -> Vec<(ChatId, DeliveryResult)> {
        self.dispatch_batch(std::slice::from_ref(deal), subscribers, shutdown)
            .await
            .deliveries
            .into_iter()
            .map(|d| (d.chat_id, d.result))
            .collect()
    }

    /// Sends every deal in `deals` (in the given order) to every active
    /// subscriber. Inactive entries in `subscribers` are ignored.
    pub async fn dispatch_batch(
        &self,
        deals: &[Deal],
        subscribers: &[Subscriber],
        shutdown: &ShutdownSignal,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        if deals.is_empty() {
            return report;
        }

        let messages: Arc<Vec<(String, String)>> = Arc::new(
            deals
                .iter()
                .map(|d| (d.id.clone(), format_deal(d)))
                .collect(),
        );
        let permits = Arc::new(Semaphore::new(self.cfg.concurrency.max(1)));
        let mut workers = JoinSet::new();

        let mut seen_chats = HashSet::new();
        for sub in subscribers.iter().filter(|s| s.is_active()) {
            if !seen_chats.insert(sub.chat_id) {
                continue;
            }
            let this = self.clone();
            let messages = Arc::clone(&messages);
            let permits = Arc::clone(&permits);
            let mut shutdown = shutdown.clone();
            let chat_id = sub.chat_id;
            workers.spawn(async move {
                let results = match shutdown.run_until(permits.acquire_owned()).await {
                    Some(Ok(_permit)) => this.run_chat(chat_id, &messages, &mut shutdown).await,
                    _ => vec![DeliveryResult::Cancelled; messages.len()],
                };
                (chat_id, results)
            });
        }

        let mut incomplete: HashSet<String> = HashSet::new();
        let mut worker_panicked = false;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((chat_id, results)) => {
                    for ((deal_id, _), result) in messages.iter().zip(results) {
                        counter!("deal_deliveries_total", "result" => result.label())
                            .increment(1);
                        if result == DeliveryResult::Cancelled {
                            incomplete.insert(deal_id.clone());
                        }
                        report.record(Delivery {
                            deal_id: deal_id.clone(),
                            chat_id,
                            result,
                        });
                    }
                }
                Err(e) => {
                    error!(target: "dispatch", error = %e, "dispatch worker failed");
                    worker_panicked = true;
                }
            }
        }

        if !worker_panicked {
            report.completed_ids = messages
                .iter()
                .map(|(id, _)| id.clone())
                .filter(|id| !incomplete.contains(id))
                .collect();
        }

        info!(
            target: "dispatch",
            deals = deals.len(),
            delivered = report.delivered,
            dropped = report.dropped,
            suspended = report.suspended,
            cancelled = report.cancelled,
            "dispatch finished"
        );
        report
    }

    async fn run_chat(
        &self,
        chat_id: ChatId,
        messages: &[(String, String)],
        shutdown: &mut ShutdownSignal,
    ) -> Vec<DeliveryResult> {
        let mut results = Vec::with_capacity(messages.len());
        let mut suspended = false;
        for (deal_id, text) in messages {
            if suspended {
                results.push(DeliveryResult::SkippedSuspended);
                continue;
            }
            if shutdown.is_triggered() {
                results.push(DeliveryResult::Cancelled);
                continue;
            }
            let result = self.deliver(chat_id, text, shutdown).await;
            if let DeliveryResult::Dropped { attempts, reason } = &result {
                warn!(target: "dispatch", %chat_id, deal = %deal_id, attempts, %reason, "delivery dropped");
            }
            suspended = matches!(result, DeliveryResult::Suspended { .. });
            results.push(result);
        }
        results
    }

    async fn deliver(
        &self,
        chat_id: ChatId,
        text: &str,
        shutdown: &mut ShutdownSignal,
    ) -> DeliveryResult {
        let max_attempts = self.cfg.max_attempts.max(1);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if shutdown.run_until(self.limiter.acquire(chat_id)).await.is_none() {
                return DeliveryResult::Cancelled;
            }

            let sent = match tokio::time::timeout(
                self.cfg.send_timeout,
                self.messenger.send_text(chat_id, text),
            )
            .await
            {
                Ok(r) => r,
                Err(_) => Err(SendError::Transient(format!(
                    "no answer within {:?}",
                    self.cfg.send_timeout
                ))),
            };

            let err = match sent {
                Ok(()) => return DeliveryResult::Delivered { attempts: attempt },
                Err(e) => e,
            };

            match err {
                SendError::PermanentUnreachable(reason) => {
                    self.suspend(chat_id, &reason).await;
                    return DeliveryResult::Suspended { reason };
                }
                SendError::Rejected(reason) => {
                    return DeliveryResult::Dropped {
                        attempts: attempt,
                        reason,
                    };
                }
                e if attempt >= max_attempts => {
                    return DeliveryResult::Dropped {
                        attempts: attempt,
                        reason: e.to_string(),
                    };
                }
                e => {
                    let mut delay = self.cfg.backoff(attempt);
                    if let SendError::RateLimited {
                        retry_after: Some(hint),
                    } = &e
                    {
                        delay = delay.max(*hint);
                    }
                    debug!(target: "dispatch", %chat_id, attempt, ?delay, error = %e, "retrying send");
                    if shutdown.run_until(tokio::time::sleep(delay)).await.is_none() {
                        return DeliveryResult::Cancelled;
                    }
                }
            }
        }
    }

    async fn suspend(&self, chat_id: ChatId, reason: &str) {
        counter!("deal_subscribers_suspended_total").increment(1);
        match self
            .store
            .set_subscriber_status(chat_id, SubscriberStatus::Suspended, self.clock.now())
            .await
        {
            Ok(()) => warn!(target: "dispatch", %chat_id, %reason, "subscriber suspended"),
            Err(e) => error!(
                target: "dispatch",
                %chat_id,
                %reason,
                error = %e,
                "chat unreachable but suspension could not be stored"
            ),
        }
    }
}
