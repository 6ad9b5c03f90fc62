//! Update notifications: rendering of the per-query update email and delivery backends.

use std::path::{Path, PathBuf};

use askama::Template;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evwatch_core::Item;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "evwatch-notify";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("rendering update email: {0}")]
    Render(#[from] askama::Error),
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Transport(String),
}

/// Delivers one update email to one recipient.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_update(
        &self,
        recipient: &str,
        query_title: &str,
        new_items: &[Item],
        updated_items: &[Item],
    ) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
}

struct ItemView {
    title: String,
    when: String,
    location: String,
    price: String,
    url: String,
    source: String,
}

impl From<&Item> for ItemView {
    fn from(item: &Item) -> Self {
        let start = item.event_start.format("%Y-%m-%d %H:%M");
        let when = if item.event_end.date_naive() == item.event_start.date_naive() {
            format!("{start}-{}", item.event_end.format("%H:%M"))
        } else {
            format!("{start} - {}", item.event_end.format("%Y-%m-%d %H:%M"))
        };
        Self {
            title: item.title.clone().unwrap_or_else(|| item.source_id.clone()),
            when,
            location: item.location.clone().unwrap_or_default(),
            price: item.price.clone().unwrap_or_default(),
            url: item.url.clone().unwrap_or_default(),
            source: item.source.to_string(),
        }
    }
}

#[derive(Template)]
#[template(path = "update_email.html")]
struct UpdateEmailTemplate<'a> {
    query_title: &'a str,
    new_items: Vec<ItemView>,
    updated_items: Vec<ItemView>,
}

pub fn render_update_email(
    query_title: &str,
    new_items: &[Item],
    updated_items: &[Item],
) -> Result<RenderedEmail, NotifyError> {
    let template = UpdateEmailTemplate {
        query_title,
        new_items: new_items.iter().map(ItemView::from).collect(),
        updated_items: updated_items.iter().map(ItemView::from).collect(),
    };
    Ok(RenderedEmail {
        subject: format!(
            "[evwatch] {query_title}: {} new, {} updated",
            new_items.len(),
            updated_items.len()
        ),
        html: template.render()?,
    })
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub content_hash: String,
    pub path: PathBuf,
    pub deduplicated: bool,
}

/// Writes each rendered email as a file under `root/<timestamp>/<recipient>/<hash>.html`.
///
/// Files are written to a temp name and renamed into place, so a reader never
/// observes a partial message.
#[derive(Debug, Clone)]
pub struct OutboxNotifier {
    root: PathBuf,
}

impl OutboxNotifier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn message_path(&self, sent_at: DateTime<Utc>, recipient: &str, content_hash: &str) -> PathBuf {
        let stamp = sent_at.format("%Y%m%d_%H%M%S").to_string();
        self.root
            .join(stamp)
            .join(mailbox_dir_name(recipient))
            .join(format!("{content_hash}.html"))
    }

    pub async fn write_message(
        &self,
        sent_at: DateTime<Utc>,
        recipient: &str,
        email: &RenderedEmail,
    ) -> Result<StoredMessage, NotifyError> {
        let document = format!(
            "To: {recipient}\nSubject: {}\nContent-Type: text/html; charset=utf-8\n\n{}",
            email.subject, email.html
        );
        let bytes = document.as_bytes();
        let content_hash = Self::sha256_hex(bytes);
        let path = self.message_path(sent_at, recipient, &content_hash);
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();

        fs::create_dir_all(&parent).await.map_err(|source| NotifyError::Io {
            path: parent.clone(),
            source,
        })?;

        if fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(StoredMessage {
                content_hash,
                path,
                deduplicated: true,
            });
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let io_err = |source| NotifyError::Io {
            path: temp_path.clone(),
            source,
        };
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err)?;
        file.write_all(bytes).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        drop(file);

        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(StoredMessage {
                content_hash,
                path,
                deduplicated: false,
            }),
            Err(source) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(NotifyError::Io { path, source })
            }
        }
    }
}

fn mailbox_dir_name(recipient: &str) -> String {
    recipient
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '@' || c == '.' { c } else { '_' })
        .collect()
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn send_update(
        &self,
        recipient: &str,
        query_title: &str,
        new_items: &[Item],
        updated_items: &[Item],
    ) -> Result<(), NotifyError> {
        let email = render_update_email(query_title, new_items, updated_items)?;
        let stored = self.write_message(Utc::now(), recipient, &email).await?;
        info!(
            recipient,
            query = query_title,
            path = %stored.path.display(),
            deduplicated = stored.deduplicated,
            "update email written to outbox"
        );
        Ok(())
    }
}

/// Renders the email and only logs it; used for dry runs.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_update(
        &self,
        recipient: &str,
        query_title: &str,
        new_items: &[Item],
        updated_items: &[Item],
    ) -> Result<(), NotifyError> {
        let email = render_update_email(query_title, new_items, updated_items)?;
        info!(recipient, subject = %email.subject, bytes = email.html.len(), "dry run: update email not sent");
        Ok(())
    }
}
