//! Per-chat sessions and the registry of live ones.
//!
//! The session's async mutex is the per-chat serializer: whoever holds the
//! guard is the only task running handler code for that chat. Lock fairness
//! is FIFO, so queueing order is delivery order.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard, mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::handler::{BoxError, ChatHandler, SessionCommand};
use crate::types::{CallbackQuery, ChatId, Message, User};

/// One unit of work for a session.
#[derive(Debug)]
pub(crate) enum Inbound {
    Message(Message),
    Callback(CallbackQuery),
}

impl Inbound {
    // messages carry their sender; callbacks open sessions without one
    fn origin_user(&self) -> Option<&User> {
        match self {
            Inbound::Message(message) => message.from.as_ref(),
            Inbound::Callback(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fresh,
    Active,
    Ending,
    Ended,
}

pub(crate) struct Inner<H> {
    handler: H,
    state: State,
}

struct IdleTimer {
    deadline: watch::Sender<Instant>,
    timeout: Duration,
}

pub(crate) struct Session<H> {
    chat_id: ChatId,
    lifetime: CancellationToken,
    inner: Arc<Mutex<Inner<H>>>,
    idle: Option<IdleTimer>,
}

impl<H: ChatHandler> Session<H> {
    pub(crate) fn new(
        chat_id: ChatId,
        handler: H,
        idle_timeout: Option<Duration>,
        commands: mpsc::UnboundedSender<SessionCommand>,
    ) -> Arc<Self> {
        let lifetime = CancellationToken::new();
        let idle = idle_timeout.map(|timeout| {
            let deadline = watch::Sender::new(Instant::now() + timeout);
            spawn_idle_watcher(
                chat_id.clone(),
                lifetime.clone(),
                commands,
                deadline.subscribe(),
            );
            IdleTimer { deadline, timeout }
        });

        Arc::new(Self {
            chat_id,
            lifetime,
            inner: Arc::new(Mutex::new(Inner {
                handler,
                state: State::Fresh,
            })),
            idle,
        })
    }

    pub(crate) fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    /// Cancelled when the session ends; per-call scopes race against it.
    pub(crate) fn lifetime(&self) -> &CancellationToken {
        &self.lifetime
    }

    /// Queues on the per-chat serializer. Poll the returned future once
    /// before spawning to pin the caller's position in the lock queue.
    pub(crate) fn acquire(
        &self,
    ) -> impl Future<Output = OwnedMutexGuard<Inner<H>>> + Send + 'static {
        self.inner.clone().lock_owned()
    }

    pub(crate) async fn begin(&self, user: Option<&User>) {
        let mut inner = self.inner.lock().await;
        self.begin_locked(&mut inner, user).await;
    }

    async fn begin_locked(&self, inner: &mut Inner<H>, user: Option<&User>) {
        if inner.state != State::Fresh {
            return;
        }
        inner.state = State::Active;
        if let Err(e) = inner.handler.begin(user).await {
            log::warn!("chat {}: begin failed: {e}", self.chat_id);
            self.report(inner, e).await;
        }
    }

    /// Handles one item under an already-held guard, beginning the session
    /// first if no other caller has yet.
    pub(crate) async fn process(&self, inner: &mut Inner<H>, item: Inbound) {
        match inner.state {
            State::Ending | State::Ended => {
                log::debug!(
                    "chat {}: session already ended, dropping update",
                    self.chat_id
                );
                return;
            }
            State::Fresh => self.begin_locked(inner, item.origin_user()).await,
            State::Active => {}
        }

        let result = match item {
            Inbound::Message(message) => inner.handler.handle_message(message).await,
            Inbound::Callback(query) => inner.handler.handle_callback(query).await,
        };

        match result {
            Ok(()) => self.touch(),
            Err(e) => {
                log::warn!("chat {}: handler error: {e}", self.chat_id);
                self.report(inner, e).await;
            }
        }
    }

    async fn report(&self, inner: &mut Inner<H>, error: BoxError) {
        if let Err(e) = inner.handler.on_error(error).await {
            log::warn!("chat {}: error callback failed: {e}", self.chat_id);
        }
    }

    /// Runs the `end` callback at most once. The lifetime token is cancelled
    /// only after the callback returns.
    pub(crate) async fn end(&self, user: Option<&User>) {
        let mut inner = self.inner.lock().await;
        if inner.state == State::Ended {
            return;
        }
        inner.state = State::Ending;
        if let Err(e) = inner.handler.end(user).await {
            log::warn!("chat {}: end callback failed: {e}", self.chat_id);
        }
        inner.state = State::Ended;
        self.lifetime.cancel();
    }

    /// Last resort when `end` overran its deadline.
    pub(crate) fn abort(&self) {
        self.lifetime.cancel();
    }

    fn touch(&self) {
        if let Some(idle) = &self.idle {
            idle.deadline.send_replace(Instant::now() + idle.timeout);
        }
    }
}

fn spawn_idle_watcher(
    chat_id: ChatId,
    lifetime: CancellationToken,
    commands: mpsc::UnboundedSender<SessionCommand>,
    mut deadline: watch::Receiver<Instant>,
) {
    tokio::spawn(async move {
        loop {
            let current = *deadline.borrow_and_update();
            tokio::select! {
                _ = lifetime.cancelled() => return,
                _ = sleep_until(current) => match deadline.has_changed() {
                    Ok(true) => continue,
                    Ok(false) => {
                        log::info!("chat {chat_id}: inactive, closing session");
                        let _ = commands.send(SessionCommand::Stop(chat_id));
                        return;
                    }
                    Err(_) => return,
                },
            }
        }
    });
}

pub(crate) struct Registry<H> {
    sessions: std::sync::Mutex<HashMap<ChatId, Arc<Session<H>>>>,
}

impl<H: ChatHandler> Registry<H> {
    pub(crate) fn new() -> Self {
        Self {
            sessions: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ChatId, Arc<Session<H>>>> {
        // a poisoned registry means a bug somewhere below; crash
        self.sessions.lock().expect("registry lock poisoned")
    }

    /// Atomic get-or-create: exactly one caller per chat observes `true`.
    pub(crate) fn get_or_create(
        &self,
        chat_id: &ChatId,
        create: impl FnOnce() -> Arc<Session<H>>,
    ) -> (Arc<Session<H>>, bool) {
        let mut sessions = self.lock();
        if let Some(existing) = sessions.get(chat_id) {
            return (existing.clone(), false);
        }
        let session = create();
        sessions.insert(chat_id.clone(), session.clone());
        (session, true)
    }

    pub(crate) fn remove(&self, chat_id: &ChatId) -> Option<Arc<Session<H>>> {
        self.lock().remove(chat_id)
    }

    /// Every session created before this call; used by the shutdown sweep.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Session<H>>> {
        self.lock().values().cloned().collect()
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::types::{Chat, ChatKind};

    type Events = Arc<StdMutex<Vec<String>>>;

    struct RecordingHandler {
        events: Events,
        fail_on: Option<String>,
    }

    impl RecordingHandler {
        fn new(events: Events) -> Self {
            Self {
                events,
                fail_on: None,
            }
        }

        fn push(&self, event: impl Into<String>) {
            self.events.lock().unwrap().push(event.into());
        }
    }

    impl ChatHandler for RecordingHandler {
        async fn begin(&mut self, user: Option<&User>) -> Result<(), BoxError> {
            self.push(format!("begin {:?}", user.map(|u| u.id)));
            Ok(())
        }

        async fn handle_message(&mut self, message: Message) -> Result<(), BoxError> {
            let text = message.text.unwrap_or_default();
            self.push(format!("message {text}"));
            if self.fail_on.as_deref() == Some(text.as_str()) {
                return Err(format!("boom on {text}").into());
            }
            Ok(())
        }

        async fn end(&mut self, user: Option<&User>) -> Result<(), BoxError> {
            self.push(format!("end {:?}", user.map(|u| u.id)));
            Ok(())
        }

        async fn on_error(&mut self, error: BoxError) -> Result<(), BoxError> {
            self.push(format!("error {error}"));
            Ok(())
        }
    }

    fn message(text: &str) -> Inbound {
        Inbound::Message(Message {
            message_id: 1,
            date: 1_700_000_000,
            edit_date: None,
            chat: Chat {
                id: 42,
                kind: ChatKind::Private,
                title: None,
                username: None,
                first_name: None,
            },
            from: Some(User {
                id: 9,
                is_bot: false,
                first_name: "A".to_string(),
                last_name: None,
                username: None,
                language_code: None,
            }),
            text: Some(text.to_string()),
            entities: vec![],
            migrate_to_chat_id: None,
        })
    }

    fn session(events: &Events) -> Arc<Session<RecordingHandler>> {
        let (commands, _rx) = mpsc::unbounded_channel();
        Session::new(
            ChatId::Id(42),
            RecordingHandler::new(events.clone()),
            None,
            commands,
        )
    }

    #[tokio::test]
    async fn begin_runs_once_before_handling() {
        let events: Events = Default::default();
        let session = session(&events);

        let mut guard = session.acquire().await;
        session.process(&mut guard, message("hi")).await;
        drop(guard);
        session.begin(None).await;

        assert_eq!(
            *events.lock().unwrap(),
            vec!["begin Some(9)".to_string(), "message hi".to_string()]
        );
    }

    #[tokio::test]
    async fn end_is_idempotent_and_cancels_lifetime_last() {
        let events: Events = Default::default();
        let session = session(&events);

        session.begin(None).await;
        assert!(!session.lifetime().is_cancelled());

        session.end(None).await;
        assert!(session.lifetime().is_cancelled());
        session.end(None).await;

        assert_eq!(
            *events.lock().unwrap(),
            vec!["begin None".to_string(), "end None".to_string()]
        );
    }

    #[tokio::test]
    async fn updates_after_end_are_dropped() {
        let events: Events = Default::default();
        let session = session(&events);

        session.end(None).await;
        let mut guard = session.acquire().await;
        session.process(&mut guard, message("late")).await;

        assert_eq!(*events.lock().unwrap(), vec!["end None".to_string()]);
    }

    #[tokio::test]
    async fn handler_fault_reaches_on_error_and_session_survives() {
        let events: Events = Default::default();
        let (commands, _rx) = mpsc::unbounded_channel();
        let mut handler = RecordingHandler::new(events.clone());
        handler.fail_on = Some("bad".to_string());
        let session = Session::new(ChatId::Id(42), handler, None, commands);

        let mut guard = session.acquire().await;
        session.process(&mut guard, message("bad")).await;
        session.process(&mut guard, message("good")).await;

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                "begin Some(9)".to_string(),
                "message bad".to_string(),
                "error boom on bad".to_string(),
                "message good".to_string(),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn registry_creates_each_chat_once() {
        let registry = Arc::new(Registry::new());
        let created = Arc::new(StdMutex::new(0usize));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let created = created.clone();
            tasks.spawn(async move {
                let (commands, _rx) = mpsc::unbounded_channel();
                let (_, created_now) = registry.get_or_create(&ChatId::Id(7), || {
                    Session::new(
                        ChatId::Id(7),
                        RecordingHandler::new(Default::default()),
                        None,
                        commands,
                    )
                });
                if created_now {
                    *created.lock().unwrap() += 1;
                }
            });
        }
        tasks.join_all().await;

        assert_eq!(*created.lock().unwrap(), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(&ChatId::Id(7)).is_some());
        assert!(registry.remove(&ChatId::Id(7)).is_none());
        assert_eq!(registry.len(), 0);
    }
}
