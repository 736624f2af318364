//! Session-oriented runtime for Telegram bots.
//!
//! One long-polling producer feeds many concurrent per-chat consumers:
//!
//! 1. **Pump**: polls `getUpdates` with acknowledgement-offset semantics and
//!    retries transient failures (configured through [`RuntimeBuilder`]).
//! 2. **Dispatch**: a demultiplexer splits messages from callback queries;
//!    two loops fan work out across chats with bounded concurrency.
//! 3. **Sessions**: each chat gets one [`ChatHandler`] with a serialized
//!    mailbox, a cancellation lifetime and an optional inactivity timer.
//!
//! Updates for different chats are handled in parallel; updates for one chat
//! never are. Shutdown drains in-flight work, runs every session's `end`
//! callback under a deadline and finally the bot's `stop` hook.
//!
//! The embedding application implements [`BotHandler`] (process-wide hooks
//! plus the per-chat factory) and [`ChatHandler`] (the conversation logic),
//! then hands both to [`Runtime::run`]. Signal wiring and logger setup stay
//! on the application side; the crate logs through the `log` facade.

pub mod api;
pub mod command;
mod dispatcher;
mod handler;
mod pump;
mod runtime;
mod session;
pub mod types;

pub use api::{Client, Error as ApiError, UpdateSource};
pub use handler::{BotHandler, BoxError, ChatHandler, ChatRef};
pub use runtime::{Runtime, RuntimeBuilder, RuntimeError, RuntimeHandle};
pub use types::ChatId;
