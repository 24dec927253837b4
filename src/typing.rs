//! Typing indicator coalescer
//!
//! Telegram drops a chat action after a few seconds, so long-running commands
//! have to keep re-sending it. Every command reports its own state here and a
//! single background task re-sends at most one action per chat per tick,
//! however many commands are busy in that chat.
//!
//! All state lives inside the task; callers only enqueue [`TypingChange`]s.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, ChatId, MessageId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Requested typing state of one command message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingChange {
    /// Chat the command runs in
    pub chat_id: ChatId,
    /// The command message
    pub message_id: MessageId,
    /// Action to show, `None` clears it
    pub action: Option<ChatAction>,
}

/// Outward "send chat action" signal.
#[async_trait]
pub trait TypingSignaler: Send + Sync {
    /// Show `action` in `chat_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport rejects the request.
    async fn send_action(&self, chat_id: ChatId, action: ChatAction) -> anyhow::Result<()>;
}

#[async_trait]
impl TypingSignaler for Bot {
    async fn send_action(&self, chat_id: ChatId, action: ChatAction) -> anyhow::Result<()> {
        self.send_chat_action(chat_id, action).await?;
        Ok(())
    }
}

/// Cheap, cloneable submit side of the coalescer.
#[derive(Clone, Debug)]
pub struct TypingHandle {
    tx: mpsc::UnboundedSender<TypingChange>,
}

impl TypingHandle {
    /// Submit a raw change. Dropped silently once the coalescer has stopped.
    pub fn change(&self, change: TypingChange) {
        if self.tx.send(change).is_err() {
            debug!("Typing coalescer stopped, change dropped");
        }
    }

    /// Show `action` for the command `message_id`.
    pub fn set(&self, chat_id: ChatId, message_id: MessageId, action: ChatAction) {
        self.change(TypingChange {
            chat_id,
            message_id,
            action: Some(action),
        });
    }

    /// Stop showing anything for the command `message_id`.
    pub fn clear(&self, chat_id: ChatId, message_id: MessageId) {
        self.change(TypingChange {
            chat_id,
            message_id,
            action: None,
        });
    }

    /// Show `action` until the returned guard is dropped.
    #[must_use]
    pub fn start(&self, chat_id: ChatId, message_id: MessageId, action: ChatAction) -> TypingGuard {
        self.set(chat_id, message_id, action);
        TypingGuard {
            handle: self.clone(),
            chat_id,
            message_id,
        }
    }
}

/// Typing state of one command; cleared on drop.
#[derive(Debug)]
pub struct TypingGuard {
    handle: TypingHandle,
    chat_id: ChatId,
    message_id: MessageId,
}

impl TypingGuard {
    /// Switch to another action.
    pub fn set(&self, action: ChatAction) {
        self.handle.set(self.chat_id, self.message_id, action);
    }
}

impl Drop for TypingGuard {
    fn drop(&mut self) {
        self.handle.clear(self.chat_id, self.message_id);
    }
}

/// Background task owning every active typing state.
pub struct TypingCoalescer {
    signaler: Arc<dyn TypingSignaler>,
    active: HashMap<(ChatId, MessageId), ChatAction>,
}

impl TypingCoalescer {
    /// Start the coalescer.
    ///
    /// Runs until `shutdown` is cancelled; the returned handle may be cloned
    /// into every command handler.
    pub fn spawn(
        signaler: Arc<dyn TypingSignaler>,
        refresh_interval: Duration,
        shutdown: CancellationToken,
    ) -> (TypingHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let coalescer = Self {
            signaler,
            active: HashMap::new(),
        };
        let task = tokio::spawn(coalescer.run(rx, refresh_interval, shutdown));
        (TypingHandle { tx }, task)
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<TypingChange>,
        refresh_interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = interval_at(Instant::now() + refresh_interval, refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                change = rx.recv() => match change {
                    Some(change) => self.apply(change).await,
                    None => break,
                },
                _ = ticker.tick() => self.refresh().await,
            }
        }
        info!("Typing coalescer stopped");
    }

    async fn apply(&mut self, change: TypingChange) {
        let key = (change.chat_id, change.message_id);
        self.active.remove(&key);

        if let Some(action) = change.action {
            self.active.insert(key, action);
            self.signal(change.chat_id, action).await;
        }
    }

    // Rebuilt from scratch every tick; the map holds one entry per running
    // command, so it stays small.
    async fn refresh(&self) {
        let mut seen = HashSet::new();
        let targets: Vec<(ChatId, ChatAction)> = self
            .active
            .iter()
            .filter(|((chat_id, _), _)| seen.insert(*chat_id))
            .map(|((chat_id, _), action)| (*chat_id, *action))
            .collect();

        for (chat_id, action) in targets {
            self.signal(chat_id, action).await;
        }
    }

    async fn signal(&self, chat_id: ChatId, action: ChatAction) {
        if let Err(e) = self.signaler.send_action(chat_id, action).await {
            warn!(chat_id = chat_id.0, error = %e, "Failed to send chat action");
        }
    }
}
