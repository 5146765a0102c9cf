//! Channel directory: frequency -> member connections
//!
//! Each channel's member set has its own lock so traffic on one frequency
//! never waits on another. The outer map lock is only held to look up,
//! insert or drop an entry, never while a member lock is being acquired.
//! The connection -> channel index is sharded by connection id, so joins and
//! leaves on different connections rarely share a lock.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::types::{ChannelId, ConnectionId};

#[derive(Debug, Default)]
struct Members {
    ids: HashSet<ConnectionId>,
    /// Set once the last member leaves. A retired entry is never reused.
    retired: bool,
}

#[derive(Debug, Default)]
struct ChannelEntry {
    members: Mutex<Members>,
}

/// Result of a join request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyMember,
    /// Joined after implicitly leaving the previous frequency
    Switched { from: ChannelId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSummary {
    pub frequency: ChannelId,
    pub members: usize,
}

const MEMBERSHIP_SHARDS: usize = 16;

#[derive(Debug)]
pub struct ChannelDirectory {
    channels: RwLock<HashMap<ChannelId, Arc<ChannelEntry>>>,
    /// Connection -> the one channel it belongs to
    memberships: Vec<RwLock<HashMap<ConnectionId, ChannelId>>>,
}

impl Default for ChannelDirectory {
    fn default() -> Self {
        Self {
            channels: RwLock::default(),
            memberships: (0..MEMBERSHIP_SHARDS)
                .map(|_| RwLock::default())
                .collect(),
        }
    }
}

impl ChannelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn memberships_of(&self, conn: ConnectionId) -> &RwLock<HashMap<ConnectionId, ChannelId>> {
        &self.memberships[conn.shard(self.memberships.len())]
    }

    /// Add a connection to a channel, leaving its previous channel first.
    ///
    /// Operations for a single connection must be issued sequentially; the
    /// session layer guarantees this by driving each connection from one task.
    pub async fn join(&self, channel: &ChannelId, conn: ConnectionId) -> JoinOutcome {
        let previous = self.memberships_of(conn).read().await.get(&conn).cloned();

        if previous.as_ref() == Some(channel) {
            return JoinOutcome::AlreadyMember;
        }

        if let Some(prev) = &previous {
            self.remove_member(prev, conn).await;
        }

        loop {
            let entry = self.entry_or_create(channel).await;
            let mut members = entry.members.lock().await;
            if members.retired {
                // Lost a race with the last member leaving; start over on a fresh entry
                drop(members);
                self.discard_entry(channel, &entry).await;
                continue;
            }
            members.ids.insert(conn);
            break;
        }

        self.memberships_of(conn)
            .write()
            .await
            .insert(conn, channel.clone());

        match previous {
            Some(from) => {
                tracing::debug!("{} switched from {} to {}", conn, from, channel);
                JoinOutcome::Switched { from }
            }
            None => {
                tracing::debug!("{} joined {}", conn, channel);
                JoinOutcome::Joined
            }
        }
    }

    /// Remove a connection from whatever channel it is in.
    /// Returns the channel it left, or `None` if it had none.
    pub async fn leave(&self, conn: ConnectionId) -> Option<ChannelId> {
        let channel = self.memberships_of(conn).write().await.remove(&conn)?;
        self.remove_member(&channel, conn).await;
        tracing::debug!("{} left {}", conn, channel);
        Some(channel)
    }

    /// Snapshot of a channel's members. Empty for unknown channels.
    pub async fn members_of(&self, channel: &ChannelId) -> HashSet<ConnectionId> {
        let entry = match self.channels.read().await.get(channel) {
            Some(entry) => entry.clone(),
            None => return HashSet::new(),
        };
        let members = entry.members.lock().await;
        members.ids.clone()
    }

    pub async fn channel_of(&self, conn: ConnectionId) -> Option<ChannelId> {
        self.memberships_of(conn).read().await.get(&conn).cloned()
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Every live channel with its member count, ordered by frequency
    pub async fn channel_summaries(&self) -> Vec<ChannelSummary> {
        let entries: Vec<(ChannelId, Arc<ChannelEntry>)> = self
            .channels
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();

        let mut summaries = Vec::with_capacity(entries.len());
        for (frequency, entry) in entries {
            let members = entry.members.lock().await;
            if !members.retired {
                summaries.push(ChannelSummary {
                    frequency,
                    members: members.ids.len(),
                });
            }
        }
        summaries.sort_by(|a, b| a.frequency.cmp(&b.frequency));
        summaries
    }

    async fn entry_or_create(&self, channel: &ChannelId) -> Arc<ChannelEntry> {
        if let Some(entry) = self.channels.read().await.get(channel) {
            return entry.clone();
        }
        self.channels
            .write()
            .await
            .entry(channel.clone())
            .or_default()
            .clone()
    }

    async fn remove_member(&self, channel: &ChannelId, conn: ConnectionId) {
        let entry = match self.channels.read().await.get(channel) {
            Some(entry) => entry.clone(),
            None => return,
        };

        let now_empty = {
            let mut members = entry.members.lock().await;
            members.ids.remove(&conn);
            if members.ids.is_empty() {
                members.retired = true;
            }
            members.retired
        };

        if now_empty {
            self.discard_entry(channel, &entry).await;
            tracing::debug!("Channel {} is empty, dropped", channel);
        }
    }

    /// Drop `entry` from the map unless it has already been replaced
    async fn discard_entry(&self, channel: &ChannelId, entry: &Arc<ChannelEntry>) {
        let mut channels = self.channels.write().await;
        if channels
            .get(channel)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            channels.remove(channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ch(name: &str) -> ChannelId {
        ChannelId::new(name).unwrap()
    }

    #[tokio::test]
    async fn test_join_then_members_of_includes_connection() {
        let dir = ChannelDirectory::new();
        let a = ConnectionId::new();

        assert_eq!(dir.join(&ch("20"), a).await, JoinOutcome::Joined);
        assert!(dir.members_of(&ch("20")).await.contains(&a));
        assert_eq!(dir.channel_of(a).await, Some(ch("20")));
    }

    #[tokio::test]
    async fn test_rejoin_same_channel_is_noop() {
        let dir = ChannelDirectory::new();
        let a = ConnectionId::new();

        dir.join(&ch("20"), a).await;
        assert_eq!(dir.join(&ch("20"), a).await, JoinOutcome::AlreadyMember);
        assert_eq!(dir.members_of(&ch("20")).await.len(), 1);
    }

    #[tokio::test]
    async fn test_switching_channels_leaves_previous() {
        let dir = ChannelDirectory::new();
        let a = ConnectionId::new();
        let b = ConnectionId::new();

        dir.join(&ch("20"), a).await;
        dir.join(&ch("20"), b).await;
        let outcome = dir.join(&ch("30"), a).await;

        assert_eq!(outcome, JoinOutcome::Switched { from: ch("20") });
        assert!(!dir.members_of(&ch("20")).await.contains(&a));
        assert!(dir.members_of(&ch("20")).await.contains(&b));
        assert!(dir.members_of(&ch("30")).await.contains(&a));
        assert_eq!(dir.channel_of(a).await, Some(ch("30")));
    }

    #[tokio::test]
    async fn test_empty_channel_is_dropped_and_recreated() {
        let dir = ChannelDirectory::new();
        let a = ConnectionId::new();

        dir.join(&ch("20"), a).await;
        assert_eq!(dir.channel_count().await, 1);

        assert_eq!(dir.leave(a).await, Some(ch("20")));
        assert_eq!(dir.channel_count().await, 0);
        assert!(dir.members_of(&ch("20")).await.is_empty());

        assert_eq!(dir.join(&ch("20"), a).await, JoinOutcome::Joined);
        assert_eq!(dir.members_of(&ch("20")).await.len(), 1);
    }

    #[tokio::test]
    async fn test_leave_without_channel_is_noop() {
        let dir = ChannelDirectory::new();
        assert_eq!(dir.leave(ConnectionId::new()).await, None);
    }

    #[tokio::test]
    async fn test_channel_summaries_sorted() {
        let dir = ChannelDirectory::new();
        dir.join(&ch("30"), ConnectionId::new()).await;
        dir.join(&ch("20"), ConnectionId::new()).await;
        dir.join(&ch("20"), ConnectionId::new()).await;

        let summaries = dir.channel_summaries().await;
        assert_eq!(
            summaries,
            vec![
                ChannelSummary {
                    frequency: ch("20"),
                    members: 2
                },
                ChannelSummary {
                    frequency: ch("30"),
                    members: 1
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_busy_membership_shard_does_not_block_other_connections() {
        let dir = ChannelDirectory::new();
        let a = ConnectionId::new();
        let b = std::iter::repeat_with(ConnectionId::new)
            .find(|b| b.shard(MEMBERSHIP_SHARDS) != a.shard(MEMBERSHIP_SHARDS))
            .unwrap();

        let _held = dir.memberships_of(a).write().await;

        let joined = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            dir.join(&ch("30"), b),
        )
        .await;
        assert_eq!(joined, Ok(JoinOutcome::Joined));

        let left = tokio::time::timeout(std::time::Duration::from_millis(100), dir.leave(b)).await;
        assert_eq!(left, Ok(Some(ch("30"))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_churn_keeps_one_channel_per_connection() {
        let dir = Arc::new(ChannelDirectory::new());
        let conns: Vec<ConnectionId> = (0..16).map(|_| ConnectionId::new()).collect();

        let mut tasks = Vec::new();
        for (i, conn) in conns.iter().copied().enumerate() {
            let dir = dir.clone();
            tasks.push(tokio::spawn(async move {
                for round in 0..50 {
                    let name = format!("{}", (i + round) % 3);
                    dir.join(&ChannelId::new(&name).unwrap(), conn).await;
                    if round % 7 == 0 {
                        dir.leave(conn).await;
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        for conn in conns {
            let mut found = 0;
            for name in ["0", "1", "2"] {
                if dir.members_of(&ch(name)).await.contains(&conn) {
                    found += 1;
                }
            }
            assert!(found <= 1, "connection in {} channels", found);
            let expected = dir.channel_of(conn).await;
            assert_eq!(found == 1, expected.is_some());
        }
    }
}
