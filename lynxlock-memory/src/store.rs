use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use lynxlock_store::{LockError, LockScript, ScriptReply, ScriptStore};

/// One stored value with an optional expiry deadline.
#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory [`ScriptStore`] backed by a mutex-guarded table.
///
/// Expiry is lazy: expired entries are evicted when the key is next
/// touched. Every script executes under the table lock, matching the
/// server-side atomicity of the Redis adapter.
#[derive(Debug, Default)]
pub struct MemoryScriptStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryScriptStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) keys, for test assertions.
    pub fn len(&self) -> usize {
        let entries = self.entries.lock();
        entries.values().filter(|e| !e.is_expired()).count()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a key directly, bypassing the scripts. Test helper for
    /// simulating server-side eviction.
    pub fn evict(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }
}

fn live<'a>(entries: &'a HashMap<String, Entry>, key: &str) -> Option<&'a Entry> {
    entries.get(key).filter(|e| !e.is_expired())
}

fn parse_ttl(args: &[String], index: usize) -> Result<Duration, LockError> {
    let raw = args
        .get(index)
        .ok_or_else(|| LockError::Protocol(format!("missing ttl argument {index}")))?;
    let ms: i64 = raw
        .parse()
        .map_err(|_| LockError::Protocol(format!("malformed ttl argument: {raw}")))?;
    if ms <= 0 {
        return Err(LockError::Protocol(format!("non-positive ttl: {ms}")));
    }
    Ok(Duration::from_millis(ms as u64))
}

fn two_keys(keys: &[String], script: LockScript) -> Result<(&String, &String), LockError> {
    match keys {
        [lock_key, reentry_key, ..] => Ok((lock_key, reentry_key)),
        _ => Err(LockError::Protocol(format!(
            "script {} expects a lock key and a reentry key",
            script.name()
        ))),
    }
}

#[async_trait]
impl ScriptStore for MemoryScriptStore {
    async fn eval(
        &self,
        script: LockScript,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptReply, LockError> {
        let mut entries = self.entries.lock();

        match script {
            LockScript::Acquire => {
                let (lock_key, reentry_key) = two_keys(keys, script)?;
                let holder = args
                    .first()
                    .ok_or_else(|| LockError::Protocol("acquire: missing holder".into()))?;
                let ttl = parse_ttl(args, 1)?;
                let deadline = Some(Instant::now() + ttl);

                match live(&entries, lock_key).map(|e| e.value.clone()) {
                    None => {
                        entries.insert(
                            lock_key.clone(),
                            Entry {
                                value: holder.clone(),
                                expires_at: deadline,
                            },
                        );
                        entries.insert(
                            reentry_key.clone(),
                            Entry {
                                value: "1".into(),
                                expires_at: deadline,
                            },
                        );
                        Ok(ScriptReply::Int(1))
                    }
                    Some(current) if current == *holder => {
                        let depth = live(&entries, reentry_key)
                            .and_then(|e| e.value.parse::<i64>().ok())
                            .unwrap_or(0)
                            + 1;
                        entries.insert(
                            reentry_key.clone(),
                            Entry {
                                value: depth.to_string(),
                                expires_at: deadline,
                            },
                        );
                        if let Some(entry) = entries.get_mut(lock_key) {
                            entry.expires_at = deadline;
                        }
                        Ok(ScriptReply::Int(2))
                    }
                    Some(_) => Ok(ScriptReply::Int(0)),
                }
            }

            LockScript::Renew => {
                let (lock_key, reentry_key) = two_keys(keys, script)?;
                let holder = args
                    .first()
                    .ok_or_else(|| LockError::Protocol("renew: missing holder".into()))?;
                let ttl = parse_ttl(args, 1)?;
                let deadline = Some(Instant::now() + ttl);

                let held = matches!(
                    live(&entries, lock_key), Some(entry) if entry.value == *holder
                );
                if !held {
                    return Ok(ScriptReply::Int(0));
                }
                if let Some(entry) = entries.get_mut(lock_key) {
                    entry.expires_at = deadline;
                }
                if let Some(entry) = entries.get_mut(reentry_key) {
                    entry.expires_at = deadline;
                }
                Ok(ScriptReply::Int(1))
            }

            LockScript::Release => {
                let (lock_key, reentry_key) = two_keys(keys, script)?;
                let holder = args
                    .first()
                    .ok_or_else(|| LockError::Protocol("release: missing holder".into()))?;

                let held = matches!(
                    live(&entries, lock_key), Some(entry) if entry.value == *holder
                );
                if !held {
                    return Ok(ScriptReply::Int(-1));
                }

                let depth = live(&entries, reentry_key)
                    .and_then(|e| e.value.parse::<i64>().ok())
                    .unwrap_or(0)
                    - 1;
                if depth > 0 {
                    if let Some(entry) = entries.get_mut(reentry_key) {
                        entry.value = depth.to_string();
                    }
                    Ok(ScriptReply::Int(depth))
                } else {
                    entries.remove(lock_key);
                    entries.remove(reentry_key);
                    Ok(ScriptReply::Int(0))
                }
            }

            LockScript::Counter => {
                let counter_key = keys
                    .first()
                    .ok_or_else(|| LockError::Protocol("counter: missing key".into()))?;
                let next = live(&entries, counter_key)
                    .and_then(|e| e.value.parse::<i64>().ok())
                    .unwrap_or(0)
                    + 1;
                entries.insert(
                    counter_key.clone(),
                    Entry {
                        value: next.to_string(),
                        expires_at: None,
                    },
                );
                Ok(ScriptReply::Int(next))
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LockError> {
        let entries = self.entries.lock();
        Ok(live(&entries, key).map(|e| e.value.clone()))
    }
}
