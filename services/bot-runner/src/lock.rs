//! Distributed locks
//!
//! A lock is a key holding a random token. Only the holder of the token can
//! release or extend it; an abandoned lock disappears when its TTL runs out.

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// Key of the scheduler-wide lock
pub const SCHEDULER_LOCK_KEY: &str = "lock:schedule_active_bots";

pub fn subscription_lock_key(subscription_id: uuid::Uuid) -> String {
    format!("lock:subscription:{}", subscription_id)
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Proof of ownership returned by a successful acquire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    pub key: String,
    pub token: String,
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// `None` when someone else holds the key
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockGuard>, LockError>;

    /// Returns false when the lock expired or belongs to another token
    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError>;

    /// Resets the TTL of a lock we still hold; false when it was lost
    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;
}

fn new_token() -> String {
    format!("{:032x}", rand::thread_rng().gen::<u128>())
}

/// Deletes the key only if it still holds our token
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Redis `SET NX PX` locks
pub struct RedisLockManager {
    conn: redis::aio::MultiplexedConnection,
    release_script: redis::Script,
    extend_script: redis::Script,
}

impl RedisLockManager {
    pub async fn new(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            release_script: redis::Script::new(RELEASE_SCRIPT),
            extend_script: redis::Script::new(EXTEND_SCRIPT),
        })
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockGuard>, LockError> {
        let token = new_token();
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;

        Ok(reply.map(|_| LockGuard {
            key: key.to_string(),
            token,
        }))
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        if deleted == 0 {
            debug!("Lock {} was no longer ours on release", key);
        }
        Ok(deleted == 1)
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .extend_script
            .key(key)
            .arg(token)
            .arg(ttl.as_millis().max(1) as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }
}

/// Process-local locks with the same semantics
#[derive(Clone, Default)]
pub struct MemoryLockManager {
    entries: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is currently held
    pub async fn is_held(&self, key: &str) -> bool {
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .map(|(_, expires)| *expires > Instant::now())
            .unwrap_or(false)
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockGuard>, LockError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if let Some((_, expires)) = entries.get(key) {
            if *expires > now {
                return Ok(None);
            }
        }
        let token = new_token();
        entries.insert(key.to_string(), (token.clone(), now + ttl));
        Ok(Some(LockGuard {
            key: key.to_string(),
            token,
        }))
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((held, expires)) if held == token && *expires > Instant::now() => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get_mut(key) {
            Some((held, expires)) if held == token && *expires > now => {
                *expires = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_fails_until_release() {
        let locks = MemoryLockManager::new();
        let guard = locks
            .acquire("lock:a", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        assert!(locks.acquire("lock:a", Duration::from_secs(10)).await.unwrap().is_none());
        assert!(locks.acquire("lock:b", Duration::from_secs(10)).await.unwrap().is_some());

        assert!(locks.release(&guard.key, &guard.token).await.unwrap());
        assert!(locks.acquire("lock:a", Duration::from_secs(10)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_only_holder_releases() {
        let locks = MemoryLockManager::new();
        let guard = locks
            .acquire("lock:a", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        assert!(!locks.release("lock:a", "someone-else").await.unwrap());
        assert!(locks.is_held("lock:a").await);
        assert!(locks.release("lock:a", &guard.token).await.unwrap());
        assert!(!locks.is_held("lock:a").await);
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken() {
        let locks = MemoryLockManager::new();
        let stale = locks
            .acquire("lock:a", Duration::from_millis(5))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let fresh = locks
            .acquire("lock:a", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(stale.token, fresh.token);
        // The stale holder cannot free the new owner's lock
        assert!(!locks.release("lock:a", &stale.token).await.unwrap());
    }

    #[tokio::test]
    async fn test_extend_keeps_lock_past_original_ttl() {
        let locks = MemoryLockManager::new();
        let guard = locks
            .acquire("lock:a", Duration::from_millis(40))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(locks
            .extend("lock:a", &guard.token, Duration::from_millis(200))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(locks.is_held("lock:a").await);
        assert!(locks.acquire("lock:a", Duration::from_secs(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_extend_fails_for_lost_lock() {
        let locks = MemoryLockManager::new();
        let stale = locks
            .acquire("lock:a", Duration::from_millis(5))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!locks
            .extend("lock:a", &stale.token, Duration::from_secs(1))
            .await
            .unwrap());

        let fresh = locks
            .acquire("lock:a", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        assert!(!locks
            .extend("lock:a", &stale.token, Duration::from_secs(1))
            .await
            .unwrap());
        assert!(locks
            .extend("lock:a", &fresh.token, Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[test]
    fn test_lock_keys() {
        let id = uuid::Uuid::nil();
        assert_eq!(
            subscription_lock_key(id),
            "lock:subscription:00000000-0000-0000-0000-000000000000"
        );
    }
}
