//! Chat commands: `/start`, `/stop`, `/help` via the `getUpdates` long poll.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::models::ChatId;
use crate::notify::telegram::Update;
use crate::notify::{Messenger, SendError, TelegramMessenger};
use crate::shutdown::ShutdownSignal;
use crate::store::{StateStore, StoreError};

pub const WELCOME: &str = "Subscribed. New deals will show up here. Send /stop to unsubscribe.";
pub const BYE: &str = "Unsubscribed. Send /start to subscribe again.";
pub const NOT_SUBSCRIBED: &str = "You were not subscribed. Send /start to subscribe.";
pub const HELP: &str = "/start - receive new deals\n/stop - stop receiving deals\n/help - this text";

/// Wait after a failed poll when the platform gives no hint.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Help,
}

/// Recognizes `/cmd`, `/cmd@botname` and `/cmd args`. Anything else is `None`.
pub fn parse_command(text: &str) -> Option<Command> {
    let word = text.split_whitespace().next()?;
    let word = word.strip_prefix('/')?;
    let name = word.split('@').next().unwrap_or(word);
    match name.to_ascii_lowercase().as_str() {
        "start" => Some(Command::Start),
        "stop" => Some(Command::Stop),
        "help" => Some(Command::Help),
        _ => None,
    }
}

pub struct CommandHandler {
    store: Arc<dyn StateStore>,
    messenger: Arc<dyn Messenger>,
    clock: Arc<dyn Clock>,
}

impl CommandHandler {
    pub fn new(
        store: Arc<dyn StateStore>,
        messenger: Arc<dyn Messenger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            messenger,
            clock,
        }
    }

    /// Applies the command in `text` (if any) and replies to the chat.
    pub async fn handle(&self, chat_id: ChatId, text: &str) -> Result<Option<Command>, StoreError> {
        let Some(cmd) = parse_command(text) else {
            return Ok(None);
        };
        let reply = match cmd {
            Command::Start => {
                let sub = self.store.upsert_subscriber(chat_id, self.clock.now()).await?;
                info!(target: "commands", %chat_id, status = sub.status.as_str(), "subscribed");
                WELCOME
            }
            Command::Stop => {
                if self.store.remove_subscriber(chat_id).await? {
                    info!(target: "commands", %chat_id, "unsubscribed");
                    BYE
                } else {
                    NOT_SUBSCRIBED
                }
            }
            Command::Help => HELP,
        };
        if let Err(e) = self.messenger.send_text(chat_id, reply).await {
            warn!(target: "commands", %chat_id, error = %e, "reply failed");
        }
        Ok(Some(cmd))
    }

    /// Handles a polled batch in order. `offset` moves past an update only
    /// after it was handled, so a store failure leaves the failed update (and
    /// everything after it) to be fetched again by the next poll.
    pub async fn process(
        &self,
        updates: &[Update],
        offset: &mut Option<i64>,
    ) -> Result<(), StoreError> {
        for update in updates {
            let message = update.message.as_ref();
            if let Some((chat_id, text)) =
                message.and_then(|m| Some((ChatId(m.chat.id), m.text.as_deref()?)))
            {
                match self.handle(chat_id, text).await {
                    Ok(Some(cmd)) => debug!(target: "commands", %chat_id, ?cmd, "command handled"),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            target: "commands",
                            %chat_id,
                            update_id = update.update_id,
                            error = %e,
                            "command failed, update kept for retry"
                        );
                        return Err(e);
                    }
                }
            }
            *offset = Some(update.update_id + 1);
        }
        Ok(())
    }
}

/// Long-polls `getUpdates` until shutdown. Poll and store errors are logged
/// and retried after `POLL_RETRY_DELAY`.
pub async fn run_poller(
    bot: TelegramMessenger,
    handler: CommandHandler,
    poll_secs: u64,
    mut shutdown: ShutdownSignal,
) {
    let mut offset: Option<i64> = None;
    info!(target: "commands", "command poller started");

    loop {
        let polled = match shutdown.run_until(bot.get_updates(offset, poll_secs)).await {
            None => break,
            Some(p) => p,
        };

        match polled {
            Ok(updates) => {
                if handler.process(&updates, &mut offset).await.is_err()
                    && shutdown
                        .run_until(tokio::time::sleep(POLL_RETRY_DELAY))
                        .await
                        .is_none()
                {
                    break;
                }
            }
            Err(e) => {
                let delay = match &e {
                    SendError::RateLimited {
                        retry_after: Some(d),
                    } => (*d).max(POLL_RETRY_DELAY),
                    _ => POLL_RETRY_DELAY,
                };
                warn!(target: "commands", error = %e, ?delay, "getUpdates failed");
                if shutdown.run_until(tokio::time::sleep(delay)).await.is_none() {
                    break;
                }
            }
        }
    }
    info!(target: "commands", "command poller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_with_bot_suffix_and_args() {
        assert_eq!(parse_command("/start"), Some(Command::Start));
        assert_eq!(parse_command("/Start@deal_bot"), Some(Command::Start));
        assert_eq!(parse_command("  /stop now"), Some(Command::Stop));
        assert_eq!(parse_command("/help"), Some(Command::Help));
        assert_eq!(parse_command("start"), None);
        assert_eq!(parse_command("/deals"), None);
        assert_eq!(parse_command(""), None);
    }
}
