//! Redis remote store.
//!
//! # Layout
//!
//! - item: `{namespace}{key}` holding a JSON envelope `{"value": .., "tags": [..]}`
//!   with native Redis expiry
//! - tag index: `{namespace}tag:{tag}`, a set of member keys
//! - lock: `lock:{name}`, outside every namespace
//!
//! Encoded keys never contain `:`, so index and lock keys cannot collide with
//! items, and a namespace clear only deletes items and tag indexes.
//!
//! Writes and deletes run as one script that moves the key out of the index
//! sets named by the old envelope before writing the new one. An index set
//! expires no earlier than its longest-lived member, so members that expire
//! naturally do not accumulate. Invalidation deletes the members whose
//! envelope still carries the tag, unlinks them from their other tags, then
//! drops the index.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use larder_core::{
    validate_key, CacheItem, CacheValue, LarderError, LarderResult, StorageError, TagSet,
    Timestamp, ValidationError,
};
use redis::aio::ConnectionManager;
use redis::Script;
use serde::{Deserialize, Serialize};

use crate::remote::{AtomicLockStore, RemoteStore};

const SCAN_BATCH: usize = 500;

const TAG_SPACE: &str = "tag:";

const LOCK_SPACE: &str = "lock:";

// KEYS[1] item; ARGV: namespace, member, payload ('' deletes), px ('0' never
// expires), new tags...
const WRITE_ITEM: &str = r#"
local ns, member, payload, px = ARGV[1], ARGV[2], ARGV[3], tonumber(ARGV[4])
local old = redis.call('GET', KEYS[1])
if old then
  local ok, envelope = pcall(cjson.decode, old)
  if ok and type(envelope.tags) == 'table' then
    for _, t in ipairs(envelope.tags) do
      redis.call('SREM', ns .. 'tag:' .. t, member)
    end
  end
end
if payload == '' then
  redis.call('DEL', KEYS[1])
  return 1
end
if px > 0 then
  redis.call('SET', KEYS[1], payload, 'PX', px)
else
  redis.call('SET', KEYS[1], payload)
end
for i = 5, #ARGV do
  local index = ns .. 'tag:' .. ARGV[i]
  local fresh = redis.call('EXISTS', index) == 0
  redis.call('SADD', index, member)
  if px == 0 then
    redis.call('PERSIST', index)
  elseif fresh then
    redis.call('PEXPIRE', index, px)
  else
    local current = redis.call('PTTL', index)
    if current >= 0 and current < px then
      redis.call('PEXPIRE', index, px)
    end
  end
end
return 1
"#;

const INVALIDATE_TAGS: &str = r#"
local ns = ARGV[1]
for i = 2, #ARGV do
  local tag = ARGV[i]
  local index = ns .. 'tag:' .. tag
  for _, key in ipairs(redis.call('SMEMBERS', index)) do
    local raw = redis.call('GET', ns .. key)
    if raw then
      local ok, envelope = pcall(cjson.decode, raw)
      if ok and type(envelope.tags) == 'table' then
        local carried = false
        for _, t in ipairs(envelope.tags) do
          if t == tag then
            carried = true
            break
          end
        end
        if carried then
          redis.call('DEL', ns .. key)
          for _, t in ipairs(envelope.tags) do
            if t ~= tag then
              redis.call('SREM', ns .. 'tag:' .. t, key)
            end
          end
        end
      end
    end
  end
  redis.call('DEL', index)
end
return 1
"#;

const RELEASE_LOCK: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

const REFRESH_LOCK: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
  return 0
end
if ARGV[2] == '0' then
  redis.call('PERSIST', KEYS[1])
else
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 1
"#;

fn script(cell: &'static OnceLock<Script>, source: &'static str) -> &'static Script {
    cell.get_or_init(|| Script::new(source))
}

fn write_script() -> &'static Script {
    static CELL: OnceLock<Script> = OnceLock::new();
    script(&CELL, WRITE_ITEM)
}

fn invalidate_script() -> &'static Script {
    static CELL: OnceLock<Script> = OnceLock::new();
    script(&CELL, INVALIDATE_TAGS)
}

fn release_script() -> &'static Script {
    static CELL: OnceLock<Script> = OnceLock::new();
    script(&CELL, RELEASE_LOCK)
}

fn refresh_script() -> &'static Script {
    static CELL: OnceLock<Script> = OnceLock::new();
    script(&CELL, REFRESH_LOCK)
}

fn backend_error(e: redis::RedisError) -> LarderError {
    StorageError::Backend {
        backend: "redis".to_string(),
        reason: e.to_string(),
    }
    .into()
}

/// Escape glob metacharacters for `SCAN MATCH`.
fn glob_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Physical key of an atomic lock.
fn lock_key(name: &str) -> String {
    format!("{}{}", LOCK_SPACE, name)
}

/// Whether a key found by the namespace scan belongs to the namespace's item
/// or tag-index space. Lock keys and foreign keys sharing the prefix do not.
fn owned_by_namespace(namespace: &str, physical: &str) -> bool {
    match physical.strip_prefix(namespace) {
        Some(rest) if !rest.is_empty() => rest.starts_with(TAG_SPACE) || !rest.contains(':'),
        _ => false,
    }
}

/// Build an item from `GET` and `PTTL` replies read in one transaction.
///
/// PTTL is -1 for a key without expiry and -2 for a missing key; a key whose
/// remaining lifetime reached zero is treated as gone.
fn decode_item(
    key: &str,
    raw: Option<String>,
    pttl: i64,
    now: Timestamp,
) -> LarderResult<CacheItem> {
    let Some(raw) = raw else {
        return Ok(CacheItem::miss(key));
    };
    let expires_at = match pttl {
        -1 => None,
        p if p > 0 => Some(now + chrono::Duration::milliseconds(p)),
        _ => return Ok(CacheItem::miss(key)),
    };
    let envelope: Envelope =
        serde_json::from_str(&raw).map_err(|e| StorageError::CorruptPayload {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
    Ok(CacheItem::hit(key, envelope.value, expires_at, envelope.tags))
}

/// Milliseconds for `PX`, at least one.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    value: CacheValue,
    #[serde(default)]
    tags: TagSet,
}

/// Remote store backed by a Redis connection manager.
#[derive(Clone)]
pub struct RedisRemoteStore {
    conn: ConnectionManager,
    namespace: String,
}

impl RedisRemoteStore {
    pub fn new(conn: ConnectionManager, namespace: impl Into<String>) -> Self {
        Self {
            conn,
            namespace: namespace.into(),
        }
    }

    /// Open a managed connection to `url`.
    pub async fn connect(url: &str, namespace: impl Into<String>) -> LarderResult<Self> {
        let client = redis::Client::open(url).map_err(backend_error)?;
        let conn = ConnectionManager::new(client).await.map_err(backend_error)?;
        Ok(Self::new(conn, namespace))
    }

    fn physical(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    /// Run the write script. `payload` of `None` deletes the item.
    async fn write(
        &self,
        key: &str,
        payload: Option<String>,
        px: u64,
        tags: &TagSet,
    ) -> LarderResult<()> {
        let mut invocation = write_script().prepare_invoke();
        invocation
            .key(self.physical(key))
            .arg(&self.namespace)
            .arg(key)
            .arg(payload.unwrap_or_default())
            .arg(px);
        for tag in tags.iter() {
            invocation.arg(tag);
        }
        let mut conn = self.conn.clone();
        let _: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(backend_error)?;
        Ok(())
    }
}

impl std::fmt::Debug for RedisRemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRemoteStore")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RemoteStore for RedisRemoteStore {
    fn backend_name(&self) -> &str {
        "redis"
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_item(&self, key: &str) -> LarderResult<CacheItem> {
        validate_key(key)?;
        let physical = self.physical(key);
        let mut conn = self.conn.clone();
        let (raw, pttl): (Option<String>, i64) = redis::pipe()
            .atomic()
            .cmd("GET")
            .arg(&physical)
            .cmd("PTTL")
            .arg(&physical)
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;
        decode_item(key, raw, pttl, self.now())
    }

    async fn get_items(&self, keys: &[String]) -> LarderResult<Vec<CacheItem>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        for key in keys {
            validate_key(key)?;
        }
        let physical: Vec<String> = keys.iter().map(|k| self.physical(k)).collect();
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("MGET").arg(&physical);
        for key in &physical {
            pipe.cmd("PTTL").arg(key);
        }
        let replies: Vec<redis::Value> =
            pipe.query_async(&mut conn).await.map_err(backend_error)?;
        let Some((values, pttls)) = replies.split_first() else {
            return Err(StorageError::Backend {
                backend: "redis".to_string(),
                reason: "empty transaction reply".to_string(),
            }
            .into());
        };
        let raws: Vec<Option<String>> = redis::from_redis_value(values).map_err(backend_error)?;

        let now = self.now();
        keys.iter()
            .zip(raws)
            .zip(pttls)
            .map(|((key, raw), pttl)| {
                let pttl: i64 = redis::from_redis_value(pttl).map_err(backend_error)?;
                decode_item(key, raw, pttl, now)
            })
            .collect()
    }

    async fn save(&self, item: CacheItem) -> LarderResult<bool> {
        validate_key(item.key())?;
        item.tags().validate()?;
        let Some(value) = item.get() else {
            return Err(ValidationError::InvalidValue {
                key: item.key().to_string(),
                reason: "cannot save an item without a value".to_string(),
            }
            .into());
        };

        let now = self.now();
        let expires_at = item.expiry().resolve(now)?;
        let px = match expires_at {
            Some(at) if at <= now => {
                self.write(item.key(), None, 0, &TagSet::empty()).await?;
                return Ok(true);
            }
            Some(at) => ttl_millis((at - now).to_std().unwrap_or_default()),
            None => 0,
        };
        let payload = serde_json::to_string(&Envelope {
            value: value.clone(),
            tags: item.tags().clone(),
        })
        .map_err(|e| ValidationError::InvalidValue {
            key: item.key().to_string(),
            reason: e.to_string(),
        })?;
        self.write(item.key(), Some(payload), px, item.tags()).await?;
        Ok(true)
    }

    async fn delete_item(&self, key: &str) -> LarderResult<bool> {
        validate_key(key)?;
        self.write(key, None, 0, &TagSet::empty()).await?;
        Ok(true)
    }

    async fn clear(&self) -> LarderResult<bool> {
        if self.namespace.is_empty() {
            tracing::warn!("Refusing to clear an unprefixed Redis namespace");
            return Ok(false);
        }
        let pattern = format!("{}*", glob_escape(&self.namespace));
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(backend_error)?;
            let keys: Vec<String> = keys
                .into_iter()
                .filter(|key| owned_by_namespace(&self.namespace, key))
                .collect();
            if !keys.is_empty() {
                let _: i64 = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(backend_error)?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(true)
    }

    async fn invalidate_tags(&self, tags: &TagSet) -> LarderResult<bool> {
        tags.validate()?;
        if tags.is_empty() {
            return Ok(true);
        }
        let mut invocation = invalidate_script().prepare_invoke();
        invocation.arg(&self.namespace);
        for tag in tags.iter() {
            invocation.arg(tag);
        }
        let mut conn = self.conn.clone();
        let _: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(backend_error)?;
        Ok(true)
    }

    fn as_atomic_lock_store(self: Arc<Self>) -> Option<Arc<dyn AtomicLockStore>> {
        Some(self)
    }
}

#[async_trait]
impl AtomicLockStore for RedisRemoteStore {
    async fn acquire_lock(
        &self,
        name: &str,
        owner: &str,
        ttl: Option<Duration>,
    ) -> LarderResult<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(lock_key(name)).arg(owner).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let mut conn = self.conn.clone();
        let reply: Option<String> = cmd.query_async(&mut conn).await.map_err(backend_error)?;
        Ok(reply.is_some())
    }

    async fn release_lock(&self, name: &str, owner: &str) -> LarderResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = release_script()
            .key(lock_key(name))
            .arg(owner)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_error)?;
        Ok(deleted > 0)
    }

    async fn force_release_lock(&self, name: &str) -> LarderResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(lock_key(name))
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;
        Ok(())
    }

    async fn lock_owner(&self, name: &str) -> LarderResult<Option<String>> {
        let mut conn = self.conn.clone();
        let owner: Option<String> = redis::cmd("GET")
            .arg(lock_key(name))
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;
        Ok(owner)
    }

    async fn refresh_lock(
        &self,
        name: &str,
        owner: &str,
        ttl: Option<Duration>,
    ) -> LarderResult<bool> {
        let millis = ttl.map_or(0, ttl_millis);
        let mut conn = self.conn.clone();
        let refreshed: i64 = refresh_script()
            .key(lock_key(name))
            .arg(owner)
            .arg(millis)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_error)?;
        Ok(refreshed > 0)
    }
}
