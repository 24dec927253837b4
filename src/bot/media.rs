//! Attachment extraction from Telegram messages
//!
//! Converts photos and documents to [`ImageItem`]s.

use crate::collect::ImageItem;
use crate::config::TELEGRAM_MAX_DOWNLOAD_SIZE;
use crate::utils::retry_telegram_operation;
use anyhow::Result;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::FileId;
use tracing::info;

/// MIME type Telegram uses for compressed photos
const PHOTO_MIME_TYPE: &str = "image/jpeg";

/// Whether `msg` carries a photo or a document.
#[must_use]
pub fn has_attachment(msg: &Message) -> bool {
    msg.photo().is_some_and(|sizes| !sizes.is_empty()) || msg.document().is_some()
}

/// Download the attachment of `msg`.
///
/// Photos use their largest size. Returns `Ok(None)` if the message has no
/// attachment.
///
/// # Errors
///
/// Returns an error if the file is too large or the download fails.
pub async fn download_attachment(bot: &Bot, msg: &Message) -> Result<Option<ImageItem>> {
    if let Some(photo) = msg.photo().and_then(|sizes| sizes.last()) {
        let (path, data) = download(bot, &photo.file.id).await?;
        let filename = file_name_from_path(&path).unwrap_or("photo.jpg").to_string();
        info!(%filename, size = data.len(), "Downloaded photo from Telegram");
        return Ok(Some(ImageItem::new(data, filename, PHOTO_MIME_TYPE)));
    }

    if let Some(doc) = msg.document() {
        if doc.file.size > TELEGRAM_MAX_DOWNLOAD_SIZE {
            anyhow::bail!(
                "File too large: {:.1} MB (max 20 MB)",
                f64::from(doc.file.size) / 1024.0 / 1024.0
            );
        }

        let (path, data) = download(bot, &doc.file.id).await?;
        let filename = doc
            .file_name
            .clone()
            .or_else(|| file_name_from_path(&path).map(ToString::to_string))
            .unwrap_or_else(|| "file".to_string());
        let mime_type = doc
            .mime_type
            .as_ref()
            .map_or_else(|| "application/octet-stream".to_string(), ToString::to_string);

        info!(%filename, %mime_type, size = data.len(), "Downloaded document from Telegram");
        return Ok(Some(ImageItem::new(data, filename, mime_type)));
    }

    Ok(None)
}

async fn download(bot: &Bot, file_id: &FileId) -> Result<(String, Vec<u8>)> {
    retry_telegram_operation(|| async {
        let file = bot.get_file(file_id.clone()).await?;
        let mut buf = Vec::new();
        bot.download_file(&file.path, &mut buf).await?;
        Ok((file.path, buf))
    })
    .await
}

fn file_name_from_path(path: &str) -> Option<&str> {
    path.rsplit('/').next().filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_from_path() {
        assert_eq!(file_name_from_path("photos/file_12.jpg"), Some("file_12.jpg"));
        assert_eq!(file_name_from_path("file_3.png"), Some("file_3.png"));
        assert_eq!(file_name_from_path("documents/"), None);
        assert_eq!(file_name_from_path(""), None);
    }
}
