//! Conversation threads
//!
//! History storage behind a trait, plus per-thread locks so turns within one
//! thread are applied in arrival order while different threads run freely.

use crate::generator::ConversationTurn;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Turns of `thread_id`, oldest first.
    async fn history(&self, thread_id: &str) -> Vec<ConversationTurn>;

    async fn append(&self, thread_id: &str, turn: ConversationTurn);
}

/// Process-local store. Keeps at most `max_turns` per thread.
pub struct InMemoryConversationStore {
    threads: DashMap<String, Vec<ConversationTurn>>,
    max_turns: usize,
}

impl InMemoryConversationStore {
    pub fn new(max_turns: usize) -> Self {
        Self {
            threads: DashMap::new(),
            max_turns: max_turns.max(1),
        }
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn history(&self, thread_id: &str) -> Vec<ConversationTurn> {
        self.threads
            .get(thread_id)
            .map(|turns| turns.clone())
            .unwrap_or_default()
    }

    async fn append(&self, thread_id: &str, turn: ConversationTurn) {
        let mut turns = self.threads.entry(thread_id.to_string()).or_default();
        turns.push(turn);
        if turns.len() > self.max_turns {
            let excess = turns.len() - self.max_turns;
            turns.drain(..excess);
        }
    }
}

/// One FIFO lock per thread id.
#[derive(Default)]
pub struct ThreadLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ThreadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waiters acquire in the order they called `acquire`.
    pub async fn acquire(&self, thread_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Forget locks nobody holds or waits on.
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
