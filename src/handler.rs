//! The traits an embedding application implements, and the narrow handle a
//! chat handler gets back from the runtime.

use std::future::Future;

use tokio::sync::mpsc;

use crate::types::{CallbackQuery, ChatId, Message, User};

/// Handler faults are opaque to the runtime; they are logged, routed to
/// [`ChatHandler::on_error`] and never escalate past the session.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug)]
pub(crate) enum SessionCommand {
    Start(ChatId),
    Stop(ChatId),
}

/// Identifies a chat to its handler and lets the handler ask the runtime to
/// end the session. Handlers never get a reference to the runtime itself.
#[derive(Debug, Clone)]
pub struct ChatRef {
    chat_id: ChatId,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl ChatRef {
    pub(crate) fn new(chat_id: ChatId, commands: mpsc::UnboundedSender<SessionCommand>) -> Self {
        Self { chat_id, commands }
    }

    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    /// Requests removal of this session. In-flight work finishes first, then
    /// the handler's `end` callback runs.
    pub fn stop(&self) {
        let _ = self
            .commands
            .send(SessionCommand::Stop(self.chat_id.clone()));
    }
}

/// Conversation logic for one chat. Exactly one instance exists per live
/// session, and the runtime never runs two of its methods concurrently.
#[allow(unused_variables)]
pub trait ChatHandler: Send + 'static {
    /// Runs once, before the first `handle_*` call. `user` is the sender of
    /// the message that created the session, when there was one.
    fn begin(&mut self, user: Option<&User>) -> impl Future<Output = Result<(), BoxError>> + Send {
        async { Ok(()) }
    }

    fn handle_message(
        &mut self,
        message: Message,
    ) -> impl Future<Output = Result<(), BoxError>> + Send {
        async { Ok(()) }
    }

    fn handle_callback(
        &mut self,
        query: CallbackQuery,
    ) -> impl Future<Output = Result<(), BoxError>> + Send {
        async { Ok(()) }
    }

    /// Runs at most once, after all in-flight work for the chat returned or
    /// was cancelled. The session's cancellation scope ends only after this
    /// returns.
    fn end(&mut self, user: Option<&User>) -> impl Future<Output = Result<(), BoxError>> + Send {
        async { Ok(()) }
    }

    /// Receives faults from the other callbacks. An error returned from here
    /// is logged and dropped.
    fn on_error(&mut self, error: BoxError) -> impl Future<Output = Result<(), BoxError>> + Send {
        async { Ok(()) }
    }
}

/// Process-wide bot logic: lifecycle hooks plus the per-chat handler factory.
#[allow(unused_variables)]
pub trait BotHandler<A>: Send + Sync + 'static {
    type Chat: ChatHandler;

    /// One-shot initialization before polling starts, e.g. publishing the
    /// command list. A failure here aborts the runtime without running
    /// [`BotHandler::stop`].
    fn start(&self, api: &A) -> impl Future<Output = Result<(), BoxError>> + Send {
        async { Ok(()) }
    }

    /// Runs once at shutdown, after every session ended, but only if
    /// `start` succeeded.
    fn stop(&self, api: &A) -> impl Future<Output = Result<(), BoxError>> + Send {
        async { Ok(()) }
    }

    /// Builds the handler for a newly observed chat.
    fn chat(&self, chat: ChatRef) -> Self::Chat;
}
