//! Composition of the runtime: `start` → (pump ∥ dispatch loops) → drain →
//! per-session `end` → `stop`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::api::{self, AllowedUpdate, UpdateSource};
use crate::dispatcher::{
    Shared, callback_route, command_loop, dispatch_loop, end_session, message_route,
};
use crate::handler::{BotHandler, BoxError, SessionCommand};
use crate::pump::{PumpConfig, UpdateChannels, run_pump};
use crate::session::Registry;
use crate::types::ChatId;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// `BotHandler::start` failed; the runtime never began polling and the
    /// `stop` hook did not run.
    #[error("bot startup failed: {0}")]
    Start(BoxError),
    /// The update pump hit a non-retriable error (a rejected token).
    #[error("update stream failed: {0}")]
    Pump(#[from] api::Error),
}

/// Configuration for [`Runtime`]. The defaults mirror the Bot API's own.
#[derive(Debug, Clone)]
pub struct RuntimeBuilder {
    poll_timeout: Duration,
    limit: u32,
    allowed_updates: Vec<AllowedUpdate>,
    concurrency: usize,
    idle_timeout: Option<Duration>,
    end_timeout: Duration,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(60),
            limit: 100,
            allowed_updates: vec![
                AllowedUpdate::Message,
                AllowedUpdate::EditedMessage,
                AllowedUpdate::ChannelPost,
                AllowedUpdate::EditedChannelPost,
                AllowedUpdate::CallbackQuery,
            ],
            concurrency: 32,
            idle_timeout: None,
            end_timeout: Duration::from_secs(5),
        }
    }
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server-side long poll timeout; doubles as the retry backoff after
    /// pump errors.
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Updates per `getUpdates` batch (the server caps this at 100).
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn allowed_updates(mut self, allowed: Vec<AllowedUpdate>) -> Self {
        self.allowed_updates = allowed;
        self
    }

    /// Upper bound on concurrently running handler invocations per dispatch
    /// loop. Parallelism is across chats; one chat never runs in parallel.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sessions with no successfully handled update for this long end
    /// themselves.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Deadline for each session's `end` callback during removal and
    /// shutdown.
    pub fn end_timeout(mut self, timeout: Duration) -> Self {
        self.end_timeout = timeout;
        self
    }

    pub fn build<A, B>(self, api: A, bot: B) -> Runtime<A, B>
    where
        A: UpdateSource + Clone,
        B: BotHandler<A>,
    {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Runtime {
            api,
            bot,
            config: self,
            shutdown: CancellationToken::new(),
            commands_tx,
            commands_rx,
        }
    }
}

/// Control surface detached from the running runtime. Clonable; works before
/// and during [`Runtime::run`].
#[derive(Debug, Clone)]
pub struct RuntimeHandle {
    shutdown: CancellationToken,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl RuntimeHandle {
    /// Begins graceful shutdown: in-flight handlers unwind, every live
    /// session gets its `end` callback, then the bot's `stop` hook runs.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Opens a session eagerly; its `begin(None)` runs before any update for
    /// that chat.
    pub fn start_session(&self, chat_id: impl Into<ChatId>) {
        let _ = self.commands.send(SessionCommand::Start(chat_id.into()));
    }

    /// Removes a session; in-flight work finishes, then `end(None)` runs.
    pub fn stop_session(&self, chat_id: impl Into<ChatId>) {
        let _ = self.commands.send(SessionCommand::Stop(chat_id.into()));
    }
}

pub struct Runtime<A, B: BotHandler<A>> {
    api: A,
    bot: B,
    config: RuntimeBuilder,
    shutdown: CancellationToken,
    commands_tx: mpsc::UnboundedSender<SessionCommand>,
    commands_rx: mpsc::UnboundedReceiver<SessionCommand>,
}

impl<A, B> Runtime<A, B>
where
    A: UpdateSource + Clone,
    B: BotHandler<A>,
{
    pub fn new(api: A, bot: B) -> Self {
        RuntimeBuilder::default().build(api, bot)
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle {
            shutdown: self.shutdown.clone(),
            commands: self.commands_tx.clone(),
        }
    }

    /// Runs until [`RuntimeHandle::shutdown`] is called or the pump fails
    /// fatally. Requested shutdown is a successful exit.
    pub async fn run(self) -> Result<(), RuntimeError> {
        let Self {
            api,
            bot,
            config,
            shutdown,
            commands_tx,
            commands_rx,
        } = self;

        let shared = Arc::new(Shared {
            api,
            bot,
            registry: Registry::new(),
            commands: commands_tx,
            shutdown: shutdown.clone(),
            idle_timeout: config.idle_timeout,
            end_timeout: config.end_timeout,
        });

        shared
            .bot
            .start(&shared.api)
            .await
            .map_err(RuntimeError::Start)?;
        log::info!("bot started, polling for updates");

        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (callbacks_tx, callbacks_rx) = mpsc::unbounded_channel();

        let pump = tokio::spawn(run_pump(
            shared.api.clone(),
            UpdateChannels {
                messages: messages_tx,
                callbacks: callbacks_tx,
            },
            PumpConfig {
                poll_timeout: config.poll_timeout,
                limit: config.limit,
                allowed_updates: config.allowed_updates,
            },
            shutdown.clone(),
        ));

        let mut workers = JoinSet::new();
        workers.spawn(dispatch_loop(
            shared.clone(),
            messages_rx,
            config.concurrency,
            message_route,
        ));
        workers.spawn(dispatch_loop(
            shared.clone(),
            callbacks_rx,
            config.concurrency,
            callback_route,
        ));
        workers.spawn(command_loop(shared.clone(), commands_rx));

        let exit = match pump.await {
            Ok(result) => result.map_err(RuntimeError::Pump),
            Err(e) => {
                log::error!("update pump task failed: {e}");
                Ok(())
            }
        };

        // unblock the loops, then let each drain its in-flight work
        shutdown.cancel();
        workers.join_all().await;

        let sessions = shared.registry.snapshot();
        if !sessions.is_empty() {
            log::info!("ending {} active sessions", sessions.len());
        }
        let mut ends = JoinSet::new();
        for session in sessions {
            ends.spawn(end_session(session, config.end_timeout));
        }
        ends.join_all().await;
        shared.registry.clear();

        if let Err(e) = shared.bot.stop(&shared.api).await {
            log::warn!("bot shutdown hook failed: {e}");
        }

        exit
    }
}
