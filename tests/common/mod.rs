// tests/common/mod.rs
// --- Test helpers ---
// Scripted collaborators shared by the integration tests. Each test binary
// uses a different subset.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use deal_notifier::ingest::types::{FeedSource, FetchError, RawEntry};
use deal_notifier::models::ChatId;
use deal_notifier::notify::{Messenger, SendError};

#[derive(Debug, Clone)]
pub struct SendAttempt {
    pub chat_id: ChatId,
    pub text: String,
    pub at: Instant,
    pub ok: bool,
}

/// Messenger that records every attempt. Per-chat scripts are consumed one
/// outcome per attempt; a chat with `fail_always` never succeeds.
#[derive(Default)]
pub struct RecordingMessenger {
    attempts: Mutex<Vec<SendAttempt>>,
    scripts: Mutex<HashMap<ChatId, VecDeque<Result<(), SendError>>>>,
    always: Mutex<HashMap<ChatId, SendError>>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingMessenger {
    pub fn script(&self, chat_id: ChatId, outcomes: Vec<Result<(), SendError>>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(chat_id)
            .or_default()
            .extend(outcomes);
    }

    pub fn fail_always(&self, chat_id: ChatId, err: SendError) {
        self.always.lock().unwrap().insert(chat_id, err);
    }

    /// Every send takes `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn attempts(&self) -> Vec<SendAttempt> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn attempts_to(&self, chat_id: ChatId) -> Vec<SendAttempt> {
        self.attempts()
            .into_iter()
            .filter(|a| a.chat_id == chat_id)
            .collect()
    }

    /// Successful sends as (chat, text).
    pub fn sent(&self) -> Vec<(ChatId, String)> {
        self.attempts()
            .into_iter()
            .filter(|a| a.ok)
            .map(|a| (a.chat_id, a.text))
            .collect()
    }

    pub fn sent_to(&self, chat_id: ChatId) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|(c, _)| *c == chat_id)
            .map(|(_, t)| t)
            .collect()
    }
}

#[async_trait::async_trait]
impl Messenger for RecordingMessenger {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<(), SendError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let outcome = match self.always.lock().unwrap().get(&chat_id) {
            Some(err) => Err(err.clone()),
            None => self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&chat_id)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Ok(())),
        };
        self.attempts.lock().unwrap().push(SendAttempt {
            chat_id,
            text: text.to_string(),
            at: Instant::now(),
            ok: outcome.is_ok(),
        });
        outcome
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

enum FeedStep {
    Answer(Result<Vec<RawEntry>, FetchError>),
    Panic,
}

/// Feed source answering from a queue. When the queue runs dry the last
/// successful answer repeats (an unchanged feed).
#[derive(Default)]
pub struct ScriptedFeed {
    name: Option<String>,
    steps: Mutex<VecDeque<FeedStep>>,
    last: Mutex<Vec<RawEntry>>,
    calls: Mutex<usize>,
}

impl ScriptedFeed {
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn push_entries(&self, entries: Vec<RawEntry>) {
        self.steps
            .lock()
            .unwrap()
            .push_back(FeedStep::Answer(Ok(entries)));
    }

    pub fn push_error(&self, err: FetchError) {
        self.steps
            .lock()
            .unwrap()
            .push_back(FeedStep::Answer(Err(err)));
    }

    pub fn push_panic(&self) {
        self.steps.lock().unwrap().push_back(FeedStep::Panic);
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl FeedSource for ScriptedFeed {
    async fn fetch_latest(&self) -> Result<Vec<RawEntry>, FetchError> {
        *self.calls.lock().unwrap() += 1;
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(FeedStep::Answer(Ok(entries))) => {
                *self.last.lock().unwrap() = entries.clone();
                Ok(entries)
            }
            Some(FeedStep::Answer(Err(e))) => Err(e),
            Some(FeedStep::Panic) => panic!("scripted feed panic"),
            None => Ok(self.last.lock().unwrap().clone()),
        }
    }

    fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("scripted")
    }
}

/// Raw entry with just a title and link.
pub fn entry(title: &str, url: &str) -> RawEntry {
    RawEntry {
        title: Some(title.to_string()),
        url: Some(url.to_string()),
        ..RawEntry::default()
    }
}
