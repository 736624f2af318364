//! Fan-out from the update channels onto sessions.
//!
//! Parallelism is across chats only; within a chat the session's serializer
//! keeps handler invocations mutually exclusive and in delivery order.

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::handler::{BotHandler, ChatHandler, ChatRef, SessionCommand};
use crate::session::{Inbound, Registry, Session};
use crate::types::{CallbackQuery, ChatId, Message};

/// Dependencies shared by the dispatch loops.
pub(crate) struct Shared<A, B: BotHandler<A>> {
    pub(crate) api: A,
    pub(crate) bot: B,
    pub(crate) registry: Registry<B::Chat>,
    pub(crate) commands: mpsc::UnboundedSender<SessionCommand>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) end_timeout: Duration,
}

impl<A, B> Shared<A, B>
where
    A: Send + Sync + 'static,
    B: BotHandler<A>,
{
    fn resolve(&self, chat_id: &ChatId) -> (Arc<Session<B::Chat>>, bool) {
        self.registry.get_or_create(chat_id, || {
            let chat = ChatRef::new(chat_id.clone(), self.commands.clone());
            Session::new(
                chat_id.clone(),
                self.bot.chat(chat),
                self.idle_timeout,
                self.commands.clone(),
            )
        })
    }
}

pub(crate) fn message_route(message: Message) -> (ChatId, Inbound) {
    (ChatId::from(message.chat.id), Inbound::Message(message))
}

// callbacks are routed by their sender: the private-chat convention
pub(crate) fn callback_route(query: CallbackQuery) -> (ChatId, Inbound) {
    (ChatId::from(query.from.id), Inbound::Callback(query))
}

/// Consumes one update channel with bounded fan-out across chats.
pub(crate) async fn dispatch_loop<A, B, T>(
    shared: Arc<Shared<A, B>>,
    mut updates: mpsc::UnboundedReceiver<T>,
    concurrency: usize,
    route: fn(T) -> (ChatId, Inbound),
) where
    A: Send + Sync + 'static,
    B: BotHandler<A>,
    T: Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut tasks = JoinSet::new();

    loop {
        reap(&mut tasks);

        let item = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            item = updates.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        let permit = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => {
                permit.expect("semaphore is never closed")
            }
        };

        let (chat_id, item) = route(item);
        let (session, created_now) = shared.resolve(&chat_id);
        if created_now {
            log::debug!("chat {chat_id}: new session");
        }

        // enqueue on the serializer before spawning, so per-chat order
        // follows channel order regardless of task scheduling
        let mut acquiring = Box::pin(session.acquire());
        let ready = acquiring.as_mut().now_or_never();

        let shutdown = shared.shutdown.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let work = async {
                let mut inner = match ready {
                    Some(guard) => guard,
                    None => acquiring.await,
                };
                session.process(&mut inner, item).await;
            };
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    log::debug!("chat {}: dropping update, shutting down", session.chat_id());
                }
                _ = session.lifetime().cancelled() => {
                    log::warn!("chat {}: handler took too long, dropping update", session.chat_id());
                }
                _ = work => {}
            }
        });
    }

    drain(&mut tasks).await;
}

/// Serves explicit session starts and stops: the `ChatRef` stop requests,
/// the inactivity watchers, and the runtime handle.
pub(crate) async fn command_loop<A, B>(
    shared: Arc<Shared<A, B>>,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
) where
    A: Send + Sync + 'static,
    B: BotHandler<A>,
{
    let mut tasks = JoinSet::new();

    loop {
        reap(&mut tasks);

        let command = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            SessionCommand::Start(chat_id) => {
                let (session, created_now) = shared.resolve(&chat_id);
                if !created_now {
                    continue;
                }
                log::debug!("chat {chat_id}: session started on request");
                let shutdown = shared.shutdown.clone();
                tasks.spawn(async move {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => {}
                        _ = session.begin(None) => {}
                    }
                });
            }
            SessionCommand::Stop(chat_id) => {
                if let Some(session) = shared.registry.remove(&chat_id) {
                    let end_timeout = shared.end_timeout;
                    tasks.spawn(async move { end_session(session, end_timeout).await });
                }
            }
        }
    }

    drain(&mut tasks).await;
}

// completed tasks stay queued in a JoinSet until collected; reap every loop
// iteration so the set only ever tracks in-flight work
fn reap(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        if let Err(e) = result {
            log::error!("handler task failed: {e}");
        }
    }
}

async fn drain(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            log::error!("handler task failed: {e}");
        }
    }
}

/// Ends one session under a bounded deadline; on overrun the lifetime is
/// cancelled regardless.
pub(crate) async fn end_session<H: ChatHandler>(session: Arc<Session<H>>, deadline: Duration) {
    if timeout(deadline, session.end(None)).await.is_err() {
        log::warn!("chat {}: end callback timed out", session.chat_id());
        session.abort();
    }
}
