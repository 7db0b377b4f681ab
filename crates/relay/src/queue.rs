//! Outbound message queues.
//!
//! Texts and images queue separately per the whole process, and each
//! relay loop drains only its own user's items in arrival order. Image
//! items go through two phases: the relay marks an item uploaded once
//! the page has accepted the file, and only swept items with that mark
//! get their temp files deleted. A crash between the phases leaves the
//! file on disk instead of deleting something that never went out.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct TextItem {
    pub user_id: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ImageItem {
    pub id: u64,
    pub user_id: String,
    pub path: PathBuf,
    pub uploaded: bool,
}

#[derive(Default)]
struct QueueState {
    texts: Vec<TextItem>,
    images: Vec<ImageItem>,
}

#[derive(Clone, Default)]
pub struct OutboundQueues {
    state: Arc<Mutex<QueueState>>,
    next_image_id: Arc<AtomicU64>,
}

impl OutboundQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_text(&self, user_id: &str, content: String) {
        self.state.lock().await.texts.push(TextItem {
            user_id: user_id.to_string(),
            content,
        });
    }

    /// Queue an already-downloaded image file for upload.
    pub async fn push_image(&self, user_id: &str, path: PathBuf) -> u64 {
        let id = self.next_image_id.fetch_add(1, Ordering::SeqCst);
        self.state.lock().await.images.push(ImageItem {
            id,
            user_id: user_id.to_string(),
            path,
            uploaded: false,
        });
        id
    }

    /// Remove and return this user's queued texts, oldest first. Other
    /// users' items stay untouched.
    pub async fn drain_texts(&self, user_id: &str) -> Vec<TextItem> {
        let mut state = self.state.lock().await;
        let mut drained = Vec::new();
        state.texts.retain(|item| {
            if item.user_id == user_id {
                drained.push(item.clone());
                false
            } else {
                true
            }
        });
        drained
    }

    /// Snapshot this user's pending (not yet uploaded) images in order.
    pub async fn pending_images(&self, user_id: &str) -> Vec<ImageItem> {
        self.state
            .lock()
            .await
            .images
            .iter()
            .filter(|i| i.user_id == user_id && !i.uploaded)
            .cloned()
            .collect()
    }

    /// Phase one: record that the page accepted this image.
    pub async fn mark_uploaded(&self, id: u64) {
        let mut state = self.state.lock().await;
        if let Some(item) = state.images.iter_mut().find(|i| i.id == id) {
            item.uploaded = true;
        }
    }

    /// Phase two: drop uploaded items for this user and delete their
    /// temp files. Items never marked uploaded are left queued.
    pub async fn sweep_uploaded(&self, user_id: &str) {
        let mut removed = Vec::new();
        {
            let mut state = self.state.lock().await;
            state.images.retain(|item| {
                if item.user_id == user_id && item.uploaded {
                    removed.push(item.clone());
                    false
                } else {
                    true
                }
            });
        }
        for item in removed {
            match tokio::fs::remove_file(&item.path).await {
                Ok(()) => debug!(path = %item.path.display(), "removed uploaded image"),
                Err(e) => {
                    warn!(path = %item.path.display(), error = %e, "failed to remove image file")
                }
            }
        }
    }

    /// Drop every queued item for a user without touching files. Used
    /// when a session ends with work still queued.
    pub async fn discard_user(&self, user_id: &str) {
        let mut state = self.state.lock().await;
        state.texts.retain(|i| i.user_id != user_id);
        state.images.retain(|i| i.user_id != user_id);
    }

    pub async fn has_pending(&self, user_id: &str) -> bool {
        let state = self.state.lock().await;
        state.texts.iter().any(|i| i.user_id == user_id)
            || state.images.iter().any(|i| i.user_id == user_id && !i.uploaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_texts_is_fifo_and_per_user() {
        let queues = OutboundQueues::new();
        queues.push_text("a", "first".to_string()).await;
        queues.push_text("b", "other".to_string()).await;
        queues.push_text("a", "second".to_string()).await;

        let drained = queues.drain_texts("a").await;
        assert_eq!(
            drained.iter().map(|i| i.content.as_str()).collect::<Vec<_>>(),
            vec!["first", "second"]
        );
        assert!(queues.drain_texts("a").await.is_empty());
        assert_eq!(queues.drain_texts("b").await.len(), 1);
    }

    #[tokio::test]
    async fn test_image_ids_are_unique_and_ordered() {
        let queues = OutboundQueues::new();
        let a = queues.push_image("u", PathBuf::from("/tmp/a.png")).await;
        let b = queues.push_image("u", PathBuf::from("/tmp/b.png")).await;
        assert!(b > a);
        let pending = queues.pending_images("u").await;
        assert_eq!(pending[0].id, a);
        assert_eq!(pending[1].id, b);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_uploaded() {
        let dir = tempfile::tempdir().unwrap();
        let uploaded_path = dir.path().join("up.png");
        let kept_path = dir.path().join("keep.png");
        tokio::fs::write(&uploaded_path, b"x").await.unwrap();
        tokio::fs::write(&kept_path, b"x").await.unwrap();

        let queues = OutboundQueues::new();
        let up_id = queues.push_image("u", uploaded_path.clone()).await;
        queues.push_image("u", kept_path.clone()).await;

        queues.mark_uploaded(up_id).await;
        queues.sweep_uploaded("u").await;

        assert!(!uploaded_path.exists());
        assert!(kept_path.exists());
        assert_eq!(queues.pending_images("u").await.len(), 1);
    }

    #[tokio::test]
    async fn test_discard_user_leaves_files_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.png");
        tokio::fs::write(&path, b"x").await.unwrap();

        let queues = OutboundQueues::new();
        queues.push_text("u", "pending".to_string()).await;
        queues.push_image("u", path.clone()).await;
        queues.discard_user("u").await;

        assert!(!queues.has_pending("u").await);
        assert!(path.exists());
    }
}
