/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Room chat and its local cache.
//!
//! The cache is one JSON array per room. Entries older than [`CHAT_TTL_MS`]
//! are skipped on load but never purged from disk.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rooms_protocol::{ChatSend, ClientEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::now_ms;

pub const CHAT_TTL_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedMessage {
    pub by: String,
    pub message: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl CachedMessage {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms - self.timestamp > CHAT_TTL_MS
    }
}

/// Percent-encoded: one file per room id, always inside the data directory.
fn cache_file_name(room_id: &str) -> String {
    format!("chatMessages_{}.json", urlencoding::encode(room_id))
}

pub struct ChatCache {
    path: PathBuf,
}

impl ChatCache {
    pub fn new(dir: &Path, room_id: &str) -> Self {
        let path = dir.join(cache_file_name(room_id));
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Everything on disk, in insertion order. Missing or unreadable files
    /// count as empty.
    pub fn load(&self) -> Vec<CachedMessage> {
        let raw = match fs::read(&self.path) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), "read chat cache failed: {e}");
                return Vec::new();
            }
        };
        match serde_json::from_slice::<Vec<CachedMessage>>(&raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %self.path.display(), "malformed chat cache ignored: {e}");
                Vec::new()
            }
        }
    }

    pub fn append(&self, msg: CachedMessage) -> Result<()> {
        let mut all = self.load();
        all.push(msg);
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("create chat dir: {}", dir.display()))?;
        }
        let json = serde_json::to_vec(&all).context("encode chat cache")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }

    /// Unexpired entries at `now_ms`, original order.
    pub fn history(&self, now_ms: i64) -> Vec<CachedMessage> {
        self.load().into_iter().filter(|m| !m.is_expired(now_ms)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub by: String,
    pub message: String,
    pub own: bool,
}

impl std::fmt::Display for ChatLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.by, self.message)
    }
}

pub struct ChatChannel {
    username: String,
    room_id: String,
    cache: ChatCache,
    signal_tx: mpsc::Sender<ClientEvent>,
}

impl ChatChannel {
    pub fn new(username: &str, room_id: &str, data_dir: &Path, signal_tx: mpsc::Sender<ClientEvent>) -> Self {
        Self {
            username: username.to_string(),
            room_id: room_id.to_string(),
            cache: ChatCache::new(data_dir, room_id),
            signal_tx,
        }
    }

    pub fn cache(&self) -> &ChatCache {
        &self.cache
    }

    fn remember(&self, by: &str, message: &str) {
        let entry = CachedMessage {
            by: by.to_string(),
            message: message.to_string(),
            timestamp: now_ms(),
        };
        if let Err(e) = self.cache.append(entry) {
            warn!(room = %self.room_id, "chat cache append failed: {e:#}");
        }
    }

    /// Sends a trimmed body to the room. Empty bodies are ignored.
    pub async fn send(&self, body: &str) -> Result<Option<ChatLine>> {
        let message = body.trim();
        if message.is_empty() {
            return Ok(None);
        }
        self.signal_tx
            .send(ClientEvent::Message(ChatSend {
                username: self.username.clone(),
                room_id: self.room_id.clone(),
                message: message.to_string(),
            }))
            .await
            .context("signaling channel closed")?;
        self.remember(&self.username, message);
        debug!(room = %self.room_id, "chat sent");
        Ok(Some(ChatLine {
            by: "You".to_string(),
            message: message.to_string(),
            own: true,
        }))
    }

    pub fn receive(&self, by: &str, message: &str) -> ChatLine {
        self.remember(by, message);
        ChatLine {
            by: by.to_string(),
            message: message.to_string(),
            own: by == self.username,
        }
    }

    pub fn history(&self, now_ms: i64) -> Vec<ChatLine> {
        self.cache
            .history(now_ms)
            .into_iter()
            .map(|m| ChatLine {
                own: m.by == self.username,
                by: m.by,
                message: m.message,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(by: &str, message: &str, timestamp: i64) -> CachedMessage {
        CachedMessage {
            by: by.to_string(),
            message: message.to_string(),
            timestamp,
        }
    }

    #[test]
    fn history_skips_expired_and_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChatCache::new(dir.path(), "r1");
        let now = 100 * CHAT_TTL_MS;
        cache.append(msg("alice", "old", now - CHAT_TTL_MS - 1)).unwrap();
        cache.append(msg("bob", "edge", now - CHAT_TTL_MS)).unwrap();
        cache.append(msg("alice", "fresh", now - 10)).unwrap();

        let got: Vec<String> = cache.history(now).into_iter().map(|m| m.message).collect();
        assert_eq!(got, vec!["edge", "fresh"]);
        // Lazy: expired entries stay on disk.
        assert_eq!(cache.load().len(), 3);
    }

    #[test]
    fn malformed_cache_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChatCache::new(dir.path(), "r1");
        fs::write(cache.path(), b"{not json").unwrap();
        assert!(cache.load().is_empty());
        cache.append(msg("alice", "hi", 1)).unwrap();
        assert_eq!(cache.load().len(), 1);
    }

    #[test]
    fn room_id_is_encoded_for_the_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChatCache::new(dir.path(), "../evil/room");
        assert_eq!(
            cache.path().file_name().and_then(|n| n.to_str()),
            Some("chatMessages_..%2Fevil%2Froom.json")
        );
        assert_eq!(cache.path().parent(), Some(dir.path()));
    }

    #[tokio::test]
    async fn look_alike_room_ids_keep_separate_histories() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let slash = ChatChannel::new("alice", "r/1", dir.path(), tx.clone());
        let underscore = ChatChannel::new("alice", "r_1", dir.path(), tx);
        assert_ne!(slash.cache().path(), underscore.cache().path());

        slash.receive("bob", "only in r/1");
        assert!(underscore.history(now_ms()).is_empty());
        assert_eq!(slash.history(now_ms()).len(), 1);
    }

    #[tokio::test]
    async fn send_trims_emits_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let chat = ChatChannel::new("alice", "r1", dir.path(), tx);

        assert_eq!(chat.send("   ").await.unwrap(), None);
        assert!(rx.try_recv().is_err());

        let line = chat.send("  hello  ").await.unwrap().unwrap();
        assert_eq!(line.to_string(), "You: hello");
        match rx.try_recv().unwrap() {
            ClientEvent::Message(m) => {
                assert_eq!(m.username, "alice");
                assert_eq!(m.room_id, "r1");
                assert_eq!(m.message, "hello");
            }
            other => panic!("unexpected {other:?}"),
        }

        let got = chat.receive("bob", "hey");
        assert!(!got.own);
        let history = chat.history(now_ms());
        assert_eq!(history.len(), 2);
        assert!(history[0].own);
        assert_eq!(history[0].by, "alice");
        assert_eq!(history[1].to_string(), "bob: hey");
    }

    #[tokio::test]
    async fn rooms_do_not_share_a_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let r1 = ChatChannel::new("alice", "r1", dir.path(), tx.clone());
        let r2 = ChatChannel::new("alice", "r2", dir.path(), tx);
        r1.receive("bob", "in r1");
        assert!(r2.history(now_ms()).is_empty());
        assert_eq!(r1.history(now_ms()).len(), 1);
    }
}
