// ABOUTME: ChannelLock - keeps a single routing pass per channel at a time
// ABOUTME: LocalChannelLock covers one engine; guards release the channel on drop

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Guards a channel so only one routing pass runs for it at a time.
///
/// A cluster deployment would back this with a shared lock table; the
/// in-process [`LocalChannelLock`] covers a single engine.
pub trait ChannelLock: Send + Sync {
    /// Returns `None` when another pass already holds the channel.
    fn try_acquire(&self, channel_id: &str) -> Option<LockGuard>;

    fn is_held(&self, channel_id: &str) -> bool;
}

/// Releases its channel when dropped.
pub struct LockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LocalChannelLock {
    held: Arc<Mutex<HashSet<String>>>,
}

impl ChannelLock for LocalChannelLock {
    fn is_held(&self, channel_id: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(channel_id)
    }

    fn try_acquire(&self, channel_id: &str) -> Option<LockGuard> {
        let mut held = self
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !held.insert(channel_id.to_string()) {
            return None;
        }

        let registry = Arc::clone(&self.held);
        let channel_id = channel_id.to_string();
        Some(LockGuard::new(move || {
            registry
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&channel_id);
        }))
    }
}
