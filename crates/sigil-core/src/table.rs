//! The subscription table.
//!
//! Maps channel ids to the receivers the engine believes the transport
//! currently honors. Only subscribe, unsubscribe and reset mutate it; the
//! inbound path only reads.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

use crate::crypto::{ChannelId, Receiver};

/// Maximum channel id length.
pub const MAX_CHANNEL_ID_LENGTH: usize = 256;

/// Validate a channel id.
///
/// # Errors
///
/// Returns an error message if the channel id is unusable.
pub fn validate_channel_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("Channel id cannot be empty");
    }
    if id.len() > MAX_CHANNEL_ID_LENGTH {
        return Err("Channel id too long");
    }
    if !id.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Channel id contains invalid characters");
    }
    Ok(())
}

/// Channel id to receiver map.
///
/// Critical sections never span an await point.
#[derive(Default)]
pub struct SubscriptionTable {
    entries: RwLock<HashMap<ChannelId, Arc<dyn Receiver>>>,
}

impl SubscriptionTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&HashMap<ChannelId, Arc<dyn Receiver>>) -> T) -> T {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        f(&entries)
    }

    fn write<T>(&self, f: impl FnOnce(&mut HashMap<ChannelId, Arc<dyn Receiver>>) -> T) -> T {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut entries)
    }

    /// Look up the receiver for a channel.
    #[must_use]
    pub fn get(&self, channel_id: &str) -> Option<Arc<dyn Receiver>> {
        self.read(|entries| entries.get(channel_id).cloned())
    }

    /// Check if a channel has a receiver.
    #[must_use]
    pub fn contains(&self, channel_id: &str) -> bool {
        self.read(|entries| entries.contains_key(channel_id))
    }

    /// Number of subscribed channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read(HashMap::len)
    }

    /// Check if nothing is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all subscribed receivers.
    #[must_use]
    pub fn receivers(&self) -> Vec<Arc<dyn Receiver>> {
        self.read(|entries| entries.values().cloned().collect())
    }

    /// Snapshot of all subscribed channel ids.
    #[must_use]
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.read(|entries| entries.keys().cloned().collect())
    }

    pub(crate) fn insert_all(&self, receivers: impl IntoIterator<Item = Arc<dyn Receiver>>) {
        self.write(|entries| {
            for receiver in receivers {
                debug!(channel = %receiver.channel_id(), "Subscribed");
                entries.insert(receiver.channel_id().to_string(), receiver);
            }
        });
    }

    pub(crate) fn remove_all<'a>(&self, channel_ids: impl IntoIterator<Item = &'a str>) {
        self.write(|entries| {
            for channel_id in channel_ids {
                if entries.remove(channel_id).is_some() {
                    debug!(channel = %channel_id, "Unsubscribed");
                }
            }
        });
    }

    /// Drop every entry and keep only the given receivers, atomically for
    /// readers.
    pub(crate) fn replace_all(&self, receivers: impl IntoIterator<Item = Arc<dyn Receiver>>) {
        self.write(|entries| {
            let dropped = entries.len();
            entries.clear();
            for receiver in receivers {
                entries.insert(receiver.channel_id().to_string(), receiver);
            }
            debug!(dropped, kept = entries.len(), "Subscription table reset");
        });
    }
}

impl std::fmt::Debug for SubscriptionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionTable")
            .field("channels", &self.channel_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Anonymous, Ciphertext, CryptoError, Decryption};
    use async_trait::async_trait;

    #[derive(Debug)]
    struct Stub(&'static str);

    #[async_trait]
    impl Receiver for Stub {
        fn channel_id(&self) -> &str {
            self.0
        }

        fn anonymous(&self) -> Anonymous {
            Anonymous::new(self.0, Vec::new())
        }

        async fn decrypt(&self, _: &Ciphertext) -> Result<Decryption, CryptoError> {
            Err(CryptoError::Decrypt("stub".into()))
        }
    }

    fn stub(id: &'static str) -> Arc<dyn Receiver> {
        Arc::new(Stub(id))
    }

    #[test]
    fn test_channel_id_validation() {
        assert!(validate_channel_id("5d41402abc4b2a76").is_ok());
        assert!(validate_channel_id("").is_err());
        assert!(validate_channel_id("bad\nid").is_err());
        assert!(validate_channel_id(&"a".repeat(MAX_CHANNEL_ID_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_insert_remove() {
        let table = SubscriptionTable::new();
        table.insert_all([stub("a"), stub("b")]);
        assert_eq!(table.len(), 2);
        assert!(table.contains("a"));

        table.remove_all(["a", "missing"]);
        assert!(!table.contains("a"));
        assert_eq!(table.get("b").unwrap().channel_id(), "b");
    }

    #[test]
    fn test_replace_all_keeps_only_given() {
        let table = SubscriptionTable::new();
        table.insert_all([stub("a"), stub("b")]);

        table.replace_all([stub("c")]);
        assert_eq!(table.channel_ids(), vec!["c".to_string()]);

        table.replace_all(Vec::new());
        assert!(table.is_empty());
    }
}
