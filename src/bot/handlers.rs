//! Message and command handlers.

use super::command::help_text;
use super::imagen::{CommandContext, ImagenService, ERROR_PREFIX};
use super::media::download_attachment;
use super::outbound::{CommandIo, TelegramCommandIo};
use anyhow::Result;
use std::sync::Arc;
use teloxide::prelude::*;
use tracing::{debug, error, info, warn};

/// Prefix of the commands this bot registers
const COMMAND_PREFIX: &str = "/";

/// Get user ID from message safely
#[must_use]
pub fn get_user_id_safe(msg: &Message) -> i64 {
    msg.from.as_ref().map_or(0, |u| u.id.0.cast_signed())
}

/// Handle `/imagen`.
///
/// The command runs detached so the dispatcher can keep delivering the
/// attachments it may wait for.
pub fn imagen(bot: Bot, msg: Message, text: String, service: &Arc<ImagenService>) {
    let ctx = CommandContext::from_message(&msg);
    info!(
        user_id = ctx.user_id,
        chat_id = ctx.chat_id.0,
        "Received imagen command"
    );
    service.spawn_imagen(TelegramCommandIo::new(bot, msg), ctx, text);
}

/// Handle `/imagencancel`.
pub async fn imagen_cancel(bot: Bot, msg: Message, service: &ImagenService) {
    let user_id = get_user_id_safe(&msg);
    service
        .cancel(&TelegramCommandIo::new(bot, msg), user_id)
        .await;
}

/// Handle `/imagenhelp`.
///
/// # Errors
///
/// Returns an error if the help message cannot be sent.
pub async fn imagen_help(bot: Bot, msg: Message) -> Result<()> {
    TelegramCommandIo::new(bot, msg).reply(&help_text(COMMAND_PREFIX)).await
}

/// Route a posted photo or document to the sender's waiting command.
///
/// The download runs on its own task; attachments from users with no waiting
/// command are ignored without being downloaded.
pub fn deliver_attachment(bot: Bot, msg: Message, service: &ImagenService) {
    let user_id = get_user_id_safe(&msg);
    let fetch = async move {
        let err = match download_attachment(&bot, &msg).await {
            Ok(item) => return item,
            Err(e) => e,
        };
        warn!(user_id, error = %err, "Failed to download attachment");
        let notice = format!("{ERROR_PREFIX}: {err}");
        if let Err(e) = TelegramCommandIo::new(bot, msg).reply(&notice).await {
            error!(user_id, error = %e, "Failed to report download error");
        }
        None
    };

    if service.spawn_delivery(user_id, fetch).is_none() {
        debug!(user_id, "Ignoring attachment, no command is waiting");
    }
}
