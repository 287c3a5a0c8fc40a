//! Redis-backed reservation store.
//!
//! Layout:
//! - `reservation:{id}` → JSON-encoded [`Reservation`]
//! - `reservation_ids` → set of every stored id (scan path)
//! - `{slot_key}` → id of the reservation holding the slot
//! - `slot_index` → set of every held slot key (orphan sweep path)
//!
//! Conditional writes use `SET .. NX`, which Redis executes atomically, so
//! `claim_slot` stays race-free across any number of processes sharing the
//! server. Each write that touches a key and its membership set runs as one
//! Lua script, so the two never disagree.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::debug;
use ulid::Ulid;

use crate::model::Reservation;

use super::{Predicate, PutOutcome, ReservationStore, StoreError};

const IDS_KEY: &str = "reservation_ids";
const SLOT_INDEX_KEY: &str = "slot_index";

/// SET NX on KEYS[1] and, if it took, add ARGV[2] to the set KEYS[2].
const PUT_AND_INDEX: &str = r#"
    if redis.call('SET', KEYS[1], ARGV[1], 'NX') then
        redis.call('SADD', KEYS[2], ARGV[2])
        return 1
    end
    return 0
"#;

const RELEASE_IF_HOLDER: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        redis.call('SREM', KEYS[2], ARGV[2])
        return redis.call('DEL', KEYS[1])
    end
    return 0
"#;

const TAKE_RECORD: &str = r#"
    local value = redis.call('GET', KEYS[1])
    if value then
        redis.call('DEL', KEYS[1])
        redis.call('SREM', KEYS[2], ARGV[1])
    end
    return value
"#;

#[derive(Clone)]
pub struct RedisStore {
    conn_manager: ConnectionManager,
    key_prefix: String,
}

impl RedisStore {
    /// Connect to `redis_url`. `key_prefix` namespaces every key so several
    /// deployments can share one server.
    pub async fn connect(redis_url: &str, key_prefix: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let conn_manager = ConnectionManager::new(client).await?;
        Ok(Self {
            conn_manager,
            key_prefix: key_prefix.to_string(),
        })
    }

    fn record_key(&self, id: Ulid) -> String {
        format!("{}reservation:{id}", self.key_prefix)
    }

    fn ids_key(&self) -> String {
        format!("{}{IDS_KEY}", self.key_prefix)
    }

    fn index_key(&self, slot_key: &str) -> String {
        format!("{}{slot_key}", self.key_prefix)
    }

    fn slot_index_key(&self) -> String {
        format!("{}{SLOT_INDEX_KEY}", self.key_prefix)
    }

    /// `SET key value NX`, recording `member` in `set_key` when it wins.
    async fn put_and_index(
        &self,
        key: &str,
        value: &str,
        set_key: &str,
        member: &str,
    ) -> Result<PutOutcome, StoreError> {
        let mut conn = self.conn_manager.clone();
        let inserted: i64 = Script::new(PUT_AND_INDEX)
            .key(key)
            .key(set_key)
            .arg(value)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;
        Ok(if inserted > 0 {
            PutOutcome::Inserted
        } else {
            PutOutcome::AlreadyExists
        })
    }
}

fn decode(raw: &str) -> Result<Reservation, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn encode(reservation: &Reservation) -> Result<String, StoreError> {
    serde_json::to_string(reservation).map_err(|e| StoreError::Corrupt(e.to_string()))
}

#[async_trait]
impl ReservationStore for RedisStore {
    async fn insert_if_absent(&self, reservation: &Reservation) -> Result<PutOutcome, StoreError> {
        self.put_and_index(
            &self.record_key(reservation.id),
            &encode(reservation)?,
            &self.ids_key(),
            &reservation.id.to_string(),
        )
        .await
    }

    async fn claim_slot(&self, slot_key: &str, id: Ulid) -> Result<PutOutcome, StoreError> {
        let outcome = self
            .put_and_index(&self.index_key(slot_key), &id.to_string(), &self.slot_index_key(), slot_key)
            .await?;
        debug!(slot_key, %id, ?outcome, "claim_slot");
        Ok(outcome)
    }

    async fn release_slot(&self, slot_key: &str, holder: Ulid) -> Result<bool, StoreError> {
        let mut conn = self.conn_manager.clone();
        let removed: i64 = Script::new(RELEASE_IF_HOLDER)
            .key(self.index_key(slot_key))
            .key(self.slot_index_key())
            .arg(holder.to_string())
            .arg(slot_key)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn slot_holder(&self, slot_key: &str) -> Result<Option<Ulid>, StoreError> {
        let mut conn = self.conn_manager.clone();
        let raw: Option<String> = conn.get(self.index_key(slot_key)).await?;
        raw.map(|s| Ulid::from_string(&s).map_err(|e| StoreError::Corrupt(format!("slot holder {s:?}: {e}"))))
            .transpose()
    }

    async fn get(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        let mut conn = self.conn_manager.clone();
        let raw: Option<String> = conn.get(self.record_key(id)).await?;
        raw.as_deref().map(decode).transpose()
    }

    async fn delete(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        let mut conn = self.conn_manager.clone();
        let raw: Option<String> = Script::new(TAKE_RECORD)
            .key(self.record_key(id))
            .key(self.ids_key())
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await?;
        raw.as_deref().map(decode).transpose()
    }

    async fn scan(&self, predicate: Predicate<'_>) -> Result<Vec<Reservation>, StoreError> {
        let mut conn = self.conn_manager.clone();
        let ids: Vec<String> = conn.smembers(self.ids_key()).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids
            .iter()
            .map(|id| format!("{}reservation:{id}", self.key_prefix))
            .collect();
        let raws: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

        let mut out = Vec::new();
        // Ids whose record vanished between SMEMBERS and MGET were deleted concurrently.
        for raw in raws.into_iter().flatten() {
            let r = decode(&raw)?;
            if predicate(&r) {
                out.push(r);
            }
        }
        Ok(out)
    }

    async fn slot_entries(&self) -> Result<Vec<(String, Ulid)>, StoreError> {
        let mut conn = self.conn_manager.clone();
        let slot_keys: Vec<String> = conn.smembers(self.slot_index_key()).await?;
        if slot_keys.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = slot_keys.iter().map(|k| self.index_key(k)).collect();
        let holders: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

        let mut out = Vec::with_capacity(slot_keys.len());
        for (slot_key, raw) in slot_keys.into_iter().zip(holders) {
            // Released between SMEMBERS and MGET.
            let Some(raw) = raw else { continue };
            let holder = Ulid::from_string(&raw)
                .map_err(|e| StoreError::Corrupt(format!("slot holder {raw:?}: {e}")))?;
            out.push((slot_key, holder));
        }
        Ok(out)
    }
}
