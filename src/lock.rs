use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::db::{self, Store};

const LOCK_KEY: &str = "storage_lock";

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("failed to acquire storage lock after {attempts} attempts")]
    Contended { attempts: u32 },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockToken {
    owner_id: String,
    timestamp: i64,
}

/// Time-boxed owner token kept next to the store document. Writers that share
/// the database coordinate through it; a token older than `expiry` is treated
/// as abandoned.
pub struct AdvisoryLock {
    owner_id: String,
    expiry: Duration,
    attempts: u32,
    backoff: Duration,
}

impl AdvisoryLock {
    pub fn new(expiry: Duration, attempts: u32, backoff: Duration) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            owner_id: format!("tab_{}_{}", Utc::now().timestamp_millis(), &suffix[..9]),
            expiry,
            attempts: attempts.max(1),
            backoff,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.lock_expiry(),
            settings.lock_retries,
            settings.lock_backoff(),
        )
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Take the lock if it is free, expired, or already ours.
    pub fn try_acquire(&self, store: &Store) -> Result<bool> {
        store.with_conn(|conn| {
            let now = Utc::now().timestamp_millis();
            if let Some(raw) = db::read_value(conn, LOCK_KEY)? {
                match serde_json::from_str::<LockToken>(&raw) {
                    Ok(token) => {
                        let live = now - token.timestamp < self.expiry.as_millis() as i64;
                        if live && token.owner_id != self.owner_id {
                            debug!("Storage lock held by {}", token.owner_id);
                            return Ok(false);
                        }
                    }
                    Err(e) => warn!("Replacing unreadable storage lock: {e}"),
                }
            }
            let token = LockToken {
                owner_id: self.owner_id.clone(),
                timestamp: now,
            };
            db::write_value(conn, LOCK_KEY, &serde_json::to_string(&token)?)?;
            Ok(true)
        })
    }

    /// Remove the token, but only while we still own it.
    pub fn release(&self, store: &Store) -> Result<()> {
        store.with_conn(|conn| {
            let Some(raw) = db::read_value(conn, LOCK_KEY)? else {
                return Ok(());
            };
            let ours = serde_json::from_str::<LockToken>(&raw)
                .map(|t| t.owner_id == self.owner_id)
                .unwrap_or(false);
            if ours {
                db::remove_value(conn, LOCK_KEY)?;
            }
            Ok(())
        })
    }

    /// Run `f` while holding the lock, retrying acquisition with a fixed backoff.
    pub async fn with_lock<T>(
        &self,
        store: &Store,
        f: impl FnOnce(&Store) -> Result<T>,
    ) -> Result<T> {
        for attempt in 1..=self.attempts {
            if self.try_acquire(store)? {
                let result = f(store);
                if let Err(e) = self.release(store) {
                    warn!("Failed to release storage lock: {e:#}");
                }
                return result;
            }
            if attempt < self.attempts {
                debug!("Storage lock busy, retry {}/{}", attempt, self.attempts);
                tokio::time::sleep(self.backoff).await;
            }
        }
        Err(LockError::Contended {
            attempts: self.attempts,
        }
        .into())
    }
}
