//! Long-polling update pump and the demultiplexer feeding the dispatch
//! channels.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::api::{AllowedUpdate, Error, GetUpdatesParams, UpdateSource};
use crate::types::{CallbackQuery, Message, Update, UpdateContent};

pub(crate) struct PumpConfig {
    pub(crate) poll_timeout: Duration,
    pub(crate) limit: u32,
    pub(crate) allowed_updates: Vec<AllowedUpdate>,
}

/// Write side of the demultiplexer: each envelope goes to exactly one
/// downstream channel.
pub(crate) struct UpdateChannels {
    pub(crate) messages: mpsc::UnboundedSender<Message>,
    pub(crate) callbacks: mpsc::UnboundedSender<CallbackQuery>,
}

impl UpdateChannels {
    fn route(&self, update: Update) {
        let update_id = update.update_id;
        match update.into_content() {
            UpdateContent::Message(message) => {
                let _ = self.messages.send(message);
            }
            UpdateContent::CallbackQuery(query) => {
                let _ = self.callbacks.send(query);
            }
            UpdateContent::Unsupported(keys) => {
                log::warn!("update {update_id}: unsupported variant {keys:?}, dropping");
            }
        }
    }
}

/// Polls `getUpdates` until cancelled or the token is rejected.
///
/// Server-side delivery is at-least-once; the acknowledgement offset turns it
/// into at-most-once for everything emitted downstream, because the offset
/// only advances after an update was handed over.
pub(crate) async fn run_pump<A: UpdateSource>(
    bot: A,
    channels: UpdateChannels,
    config: PumpConfig,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let mut params = GetUpdatesParams {
        offset: Some(0),
        limit: Some(config.limit),
        timeout: Some(config.poll_timeout.as_secs()),
        allowed_updates: Some(config.allowed_updates),
    };
    let mut acknowledged = true;

    loop {
        let batch = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            batch = bot.get_updates(&params) => batch,
        };

        match batch {
            Ok(updates) => {
                acknowledged = updates.is_empty();
                for update in updates {
                    let next = update.update_id + 1;
                    channels.route(update);
                    // advance only after the update was handed downstream
                    let offset = params.offset.get_or_insert(0);
                    *offset = (*offset).max(next);
                }
            }
            Err(e) if matches!(e.error_code(), Some(401 | 404)) => {
                log::error!("Invalid token! Was it revoked?");
                return Err(e);
            }
            Err(e) => {
                let delay = config.poll_timeout.max(e.retry_after().unwrap_or_default());
                log::error!(
                    "Error retrieving updates (retrying in {}s): {e}",
                    delay.as_secs()
                );
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = sleep(delay) => {}
                }
            }
        }
    }

    // one zero-timeout poll marks emitted updates as seen, so a clean
    // restart does not replay them
    if !acknowledged {
        params.timeout = Some(0);
        params.limit = Some(1);
        if let Err(e) = bot.get_updates(&params).await {
            log::error!("Error marking updates as seen: {e}");
        }
    }

    Ok(())
}
