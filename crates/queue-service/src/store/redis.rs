//! Redis-backed Persistence Service and Token Allocator.
//!
//! # Key layout
//!
//! - `queues`: SET of every queue id
//! - `queue:{id}:meta`: queue record (JSON)
//! - `joincode:{code}`: queue id holding a session join code (`SET NX`)
//! - `queue:{id}:token_seq`: token counter (`INCR`)
//! - `queue:{id}:tokens`: HASH token -> entry id
//! - `queue:{id}:entries`: ZSET of entry ids scored by token
//! - `entry:{id}`: entry body (JSON, includes state)
//!
//! Uses a `MultiplexedConnection`, which is cheap to clone per call.

use super::lua_scripts;
use super::repository::{EntryRepository, EntryUpdate, RepositoryError};
use crate::allocator::TokenAllocator;
use crate::models::{Entry, QueueRecord, Token};
use async_trait::async_trait;
use common::secret::{ExposeSecret, SecretString};
use common::types::{EntryId, QueueId};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, error, instrument, warn};

const QUEUES_KEY: &str = "queues";

fn meta_key(queue_id: &QueueId) -> String {
    format!("queue:{queue_id}:meta")
}

fn join_code_key(code: &str) -> String {
    format!("joincode:{code}")
}

fn token_seq_key(queue_id: &QueueId) -> String {
    format!("queue:{queue_id}:token_seq")
}

fn tokens_key(queue_id: &QueueId) -> String {
    format!("queue:{queue_id}:tokens")
}

fn entries_key(queue_id: &QueueId) -> String {
    format!("queue:{queue_id}:entries")
}

fn entry_key(entry_id: &EntryId) -> String {
    format!("entry:{entry_id}")
}

fn unavailable(operation: &str, err: &redis::RedisError) -> RepositoryError {
    warn!(target: "qs.redis", operation, error = %err, "Redis call failed");
    RepositoryError::Unavailable(format!("{operation}: {err}"))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Corrupt(e.to_string()))
}

#[derive(Clone)]
pub struct RedisRepository {
    connection: MultiplexedConnection,
    insert_script: Script,
    apply_script: Script,
    seed_script: Script,
}

impl std::fmt::Debug for RedisRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRepository").finish_non_exhaustive()
    }
}

impl RedisRepository {
    /// Connect to redis.
    ///
    /// The URL may carry credentials; it is never logged.
    pub async fn connect(redis_url: &SecretString) -> Result<Self, RepositoryError> {
        let client = Client::open(redis_url.expose_secret()).map_err(|e| {
            error!(target: "qs.redis", error = %e, "Failed to open Redis client");
            RepositoryError::Unavailable(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(target: "qs.redis", error = %e, "Failed to connect to Redis");
                RepositoryError::Unavailable(format!("Failed to connect to Redis: {e}"))
            })?;

        debug!(target: "qs.redis", "Connected to Redis");

        Ok(Self {
            connection,
            insert_script: Script::new(lua_scripts::INSERT_ENTRY),
            apply_script: Script::new(lua_scripts::APPLY_UPDATES),
            seed_script: Script::new(lua_scripts::SEED_COUNTER),
        })
    }
}

#[async_trait]
impl EntryRepository for RedisRepository {
    #[instrument(skip_all, fields(queue_id = %record.queue_id))]
    async fn save_queue(&self, record: &QueueRecord) -> Result<(), RepositoryError> {
        let mut conn = self.connection.clone();
        let body = to_json(record)?;

        let () = redis::pipe()
            .atomic()
            .set(meta_key(&record.queue_id), body)
            .ignore()
            .sadd(QUEUES_KEY, record.queue_id.as_str())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable("save_queue", &e))?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn load_queues(&self) -> Result<Vec<QueueRecord>, RepositoryError> {
        let mut conn = self.connection.clone();
        let ids: Vec<String> = conn
            .smembers(QUEUES_KEY)
            .await
            .map_err(|e| unavailable("load_queues", &e))?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let queue_id = QueueId::new(id);
            let raw: Option<String> = conn
                .get(meta_key(&queue_id))
                .await
                .map_err(|e| unavailable("load_queues", &e))?;
            match raw {
                Some(raw) => records.push(
                    serde_json::from_str::<QueueRecord>(&raw)
                        .map_err(|e| RepositoryError::Corrupt(format!("queue {queue_id}: {e}")))?,
                ),
                None => warn!(
                    target: "qs.redis",
                    queue_id = %queue_id,
                    "Queue listed without metadata, skipping"
                ),
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn claim_join_code(
        &self,
        code: &str,
        queue_id: &QueueId,
    ) -> Result<bool, RepositoryError> {
        let mut conn = self.connection.clone();
        let key = join_code_key(code);

        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(queue_id.as_str())
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable("claim_join_code", &e))?;
        if set.is_some() {
            return Ok(true);
        }

        // Lost the race, unless the holder is us (a retried claim).
        let holder: Option<String> = conn
            .get(&key)
            .await
            .map_err(|e| unavailable("claim_join_code", &e))?;
        Ok(holder.as_deref() == Some(queue_id.as_str()))
    }

    #[instrument(skip_all, fields(queue_id = %entry.queue_id, token = entry.token))]
    async fn insert_entry(&self, entry: &Entry) -> Result<(), RepositoryError> {
        let mut conn = self.connection.clone();
        let body = to_json(entry)?;

        let inserted: i64 = self
            .insert_script
            .key(tokens_key(&entry.queue_id))
            .key(entries_key(&entry.queue_id))
            .key(entry_key(&entry.id))
            .arg(entry.token)
            .arg(entry.id.to_string())
            .arg(body)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| unavailable("insert_entry", &e))?;

        if inserted == 1 {
            Ok(())
        } else {
            Err(RepositoryError::DuplicateToken {
                queue_id: entry.queue_id.clone(),
                token: entry.token,
            })
        }
    }

    #[instrument(skip_all, fields(queue_id = %queue_id, updates = updates.len()))]
    async fn apply(
        &self,
        queue_id: &QueueId,
        updates: &[EntryUpdate],
    ) -> Result<(), RepositoryError> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();

        let mut invocation = self.apply_script.prepare_invoke();
        for update in updates {
            invocation.key(entry_key(&update.entry.id));
        }
        for update in updates {
            invocation
                .arg(update.expected.as_str())
                .arg(to_json(&update.entry)?);
        }

        let outcome: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| unavailable("apply", &e))?;

        let offending = |position: i64| {
            usize::try_from(position.unsigned_abs())
                .ok()
                .and_then(|i| i.checked_sub(1))
                .and_then(|i| updates.get(i))
                .map(|u| u.entry.id)
        };

        match outcome {
            0 => Ok(()),
            i if i > 0 => match offending(i) {
                Some(entry_id) => Err(RepositoryError::Conflict(entry_id)),
                None => Err(RepositoryError::Corrupt(format!(
                    "apply returned out-of-range position {i}"
                ))),
            },
            i => Err(RepositoryError::Corrupt(format!(
                "entry {} missing from queue {queue_id}",
                offending(i).map_or_else(|| i.to_string(), |id| id.to_string())
            ))),
        }
    }

    #[instrument(skip_all, fields(queue_id = %queue_id))]
    async fn load_entries(&self, queue_id: &QueueId) -> Result<Vec<Entry>, RepositoryError> {
        let mut conn = self.connection.clone();
        let ids: Vec<String> = conn
            .zrange(entries_key(queue_id), 0, -1)
            .await
            .map_err(|e| unavailable("load_entries", &e))?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| format!("entry:{id}")).collect();
        let bodies: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable("load_entries", &e))?;

        let mut entries = Vec::with_capacity(bodies.len());
        for (id, body) in ids.iter().zip(bodies) {
            let body = body.ok_or_else(|| {
                RepositoryError::Corrupt(format!("entry {id} indexed but missing"))
            })?;
            entries.push(
                serde_json::from_str::<Entry>(&body)
                    .map_err(|e| RepositoryError::Corrupt(format!("entry {id}: {e}")))?,
            );
        }
        Ok(entries)
    }
}

#[async_trait]
impl TokenAllocator for RedisRepository {
    async fn next_token(&self, queue_id: &QueueId) -> Result<Token, RepositoryError> {
        let mut conn = self.connection.clone();
        conn.incr(token_seq_key(queue_id), 1u64)
            .await
            .map_err(|e| unavailable("next_token", &e))
    }

    async fn seed(&self, queue_id: &QueueId, issued: Token) -> Result<(), RepositoryError> {
        let mut conn = self.connection.clone();
        let _: u64 = self
            .seed_script
            .key(token_seq_key(queue_id))
            .arg(issued)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| unavailable("seed", &e))?;
        Ok(())
    }
}
