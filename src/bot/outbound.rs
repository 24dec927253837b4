//! Replies and uploads for one command message.
//!
//! [`CommandIo`] is everything a running command needs from the transport.
//! [`TelegramCommandIo`] implements it on top of the Bot API, retrying
//! transient failures.

use super::media::download_attachment;
use crate::collect::ImageItem;
use crate::config::TELEGRAM_MEDIA_GROUP_LIMIT;
use crate::utils::retry_telegram_operation;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{InputFile, InputMedia, InputMediaPhoto, ReplyParameters};

/// Transport operations bound to the message that triggered a command.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandIo: Send + Sync {
    /// Reply to the command message with plain text.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be sent.
    async fn reply(&self, text: &str) -> Result<()>;

    /// Upload generated images as a reply, with `caption` on the first one.
    ///
    /// # Errors
    ///
    /// Returns an error if any upload fails.
    async fn upload_images(&self, caption: &str, images: Vec<Vec<u8>>) -> Result<()>;

    /// Download the attachment of the message the command replies to.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no such attachment or the download fails.
    async fn fetch_replied_attachment(&self) -> Result<ImageItem>;
}

/// [`CommandIo`] for a Telegram command message.
pub struct TelegramCommandIo {
    bot: Bot,
    msg: Message,
}

impl TelegramCommandIo {
    /// Bind `bot` to the command message `msg`.
    #[must_use]
    pub const fn new(bot: Bot, msg: Message) -> Self {
        Self { bot, msg }
    }

    async fn send_photo_group(&self, caption: Option<&str>, images: &[Vec<u8>]) -> Result<()> {
        let chat_id = self.msg.chat.id;
        let reply_to = ReplyParameters::new(self.msg.id);

        if let [image] = images {
            return retry_telegram_operation(|| async {
                let mut req = self
                    .bot
                    .send_photo(chat_id, InputFile::memory(image.clone()).file_name("image.png"))
                    .reply_parameters(reply_to.clone());
                if let Some(caption) = caption {
                    req = req.caption(caption);
                }
                req.await
                    .map(|_| ())
                    .map_err(|e| anyhow!("Telegram upload error: {e}"))
            })
            .await;
        }

        retry_telegram_operation(|| async {
            let media = images.iter().enumerate().map(|(i, image)| {
                let file = InputFile::memory(image.clone()).file_name(format!("image_{i}.png"));
                let mut photo = InputMediaPhoto::new(file);
                if i == 0 {
                    if let Some(caption) = caption {
                        photo = photo.caption(caption);
                    }
                }
                InputMedia::Photo(photo)
            });
            self.bot
                .send_media_group(chat_id, media)
                .reply_parameters(reply_to.clone())
                .await
                .map(|_| ())
                .map_err(|e| anyhow!("Telegram upload error: {e}"))
        })
        .await
    }
}

#[async_trait]
impl CommandIo for TelegramCommandIo {
    async fn reply(&self, text: &str) -> Result<()> {
        let chat_id = self.msg.chat.id;
        retry_telegram_operation(|| async {
            self.bot
                .send_message(chat_id, text)
                .reply_parameters(ReplyParameters::new(self.msg.id))
                .await
                .map(|_| ())
                .map_err(|e| anyhow!("Telegram send error: {e}"))
        })
        .await
    }

    async fn upload_images(&self, caption: &str, images: Vec<Vec<u8>>) -> Result<()> {
        // Telegram accepts at most ten photos per album.
        for (i, chunk) in images.chunks(TELEGRAM_MEDIA_GROUP_LIMIT).enumerate() {
            let caption = (i == 0).then_some(caption);
            self.send_photo_group(caption, chunk).await?;
        }
        Ok(())
    }

    async fn fetch_replied_attachment(&self) -> Result<ImageItem> {
        let replied = self
            .msg
            .reply_to_message()
            .ok_or_else(|| anyhow!("command is not a reply"))?;
        download_attachment(&self.bot, replied)
            .await?
            .ok_or_else(|| anyhow!("replied message has no attachment"))
    }
}
