//! Redis durable store.
//!
//! The log is a Redis stream `events:{topic}` whose entry IDs are
//! `{seq}-0`, each carrying a single `op` field with the JSON encoded
//! [`LogOp`]. Appends run as a Lua script so the head check, the stream
//! writes, the block window update and the provisional height land
//! together. State commits are a second script that first checks the
//! writer still owns its lease, so a writer whose lease lapsed cannot
//! overwrite the state of the one that took over.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult, Script};
use tracing::debug;
use txoflow_sdk::{Checkpoint, LogEntry, LogOp, TokenInfo, TokenState};

use super::{keys, AppendBatch, Commit, DurableStore, StoreError};

/// Default timeout for a single store command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

const APPEND_SCRIPT: &str = r"
local head = tonumber(redis.call('GET', KEYS[1]) or '0')
if head ~= tonumber(ARGV[1]) then
  return {0, head}
end
local n = tonumber(ARGV[2])
local i = 3
for _ = 1, n do
  redis.call('XADD', KEYS[2], ARGV[i], 'op', ARGV[i + 1])
  i = i + 2
end
local block_height = ARGV[i]
local block_hash = ARGV[i + 1]
local drop_from = ARGV[i + 2]
local prune_below = ARGV[i + 3]
local provisional = ARGV[i + 4]
if drop_from ~= '' or prune_below ~= '' then
  for _, h in ipairs(redis.call('HKEYS', KEYS[3])) do
    local height = tonumber(h)
    if (drop_from ~= '' and height >= tonumber(drop_from))
      or (prune_below ~= '' and height < tonumber(prune_below)) then
      redis.call('HDEL', KEYS[3], h)
    end
  end
end
if block_hash ~= '' then
  redis.call('HSET', KEYS[3], block_height, block_hash)
end
if provisional ~= '' then
  redis.call('SET', KEYS[4], provisional)
end
redis.call('SET', KEYS[1], head + n)
return {1, head + n}
";

const COMMIT_SCRIPT: &str = r"
if ARGV[1] ~= '' and redis.call('GET', KEYS[1]) ~= ARGV[1] then
  return 0
end
local n = tonumber(ARGV[5])
local i = 6
for k = 1, n do
  redis.call('HSET', KEYS[4 + k], 'balance', ARGV[i + 1], 'seq', ARGV[i + 2], 'height', ARGV[i + 3])
  redis.call('SADD', KEYS[2], ARGV[i])
  i = i + 4
end
local m = tonumber(ARGV[i])
i = i + 1
for k = 1, m do
  redis.call('DEL', KEYS[4 + n + k])
  redis.call('SREM', KEYS[2], ARGV[i])
  i = i + 1
end
if ARGV[3] ~= '' then
  redis.call('SET', KEYS[3], ARGV[3])
elseif ARGV[2] == '1' then
  redis.call('DEL', KEYS[3])
end
redis.call('SET', KEYS[4], ARGV[4])
return 1
";

const RENEW_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
";

const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

/// Redis-backed durable store.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    command_timeout: Duration,
}

impl RedisStore {
    /// Connects to Redis at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str, command_timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(command_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout)??;
        debug!("connected to durable store");
        Ok(Self {
            conn,
            command_timeout,
        })
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        tokio::time::timeout(self.command_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout)?
            .map_err(StoreError::from)
    }

    fn parse_u64(key: &str, fields: &HashMap<String, String>, field: &str) -> Result<u64, StoreError> {
        fields
            .get(field)
            .ok_or_else(|| StoreError::corrupt(key, format!("missing field {}", field)))?
            .parse()
            .map_err(|e| StoreError::corrupt(key, e))
    }

    fn decode_state(
        topic: &str,
        holder: &str,
        fields: &HashMap<String, String>,
    ) -> Result<Option<TokenState>, StoreError> {
        if fields.is_empty() {
            return Ok(None);
        }
        let key = keys::state(topic, holder);
        Ok(Some(TokenState {
            token: topic.to_string(),
            holder: holder.to_string(),
            balance: Self::parse_u64(&key, fields, "balance")?,
            last_seq: Self::parse_u64(&key, fields, "seq")?,
            last_height: Self::parse_u64(&key, fields, "height")?,
        }))
    }

    fn decode_entry(key: &str, id: &str, fields: &[String]) -> Result<LogEntry, StoreError> {
        let seq = id
            .split('-')
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| StoreError::corrupt(key, format!("bad stream id {}", id)))?;
        let json = fields
            .chunks(2)
            .find(|pair| pair.first().map(String::as_str) == Some("op"))
            .and_then(|pair| pair.get(1))
            .ok_or_else(|| StoreError::corrupt(key, format!("entry {} has no op", id)))?;
        let op: LogOp = serde_json::from_str(json).map_err(|e| StoreError::corrupt(key, e))?;
        Ok(LogEntry { seq, op })
    }

    /// Runs the commit script. `removed` holders are deleted and, when
    /// `replace` is set, missing token metadata is deleted too.
    async fn write_commit(
        &self,
        commit: &Commit,
        removed: &[String],
        replace: bool,
    ) -> Result<(), StoreError> {
        let topic = commit.topic();
        let (lock, owner) = match &commit.lease {
            Some(guard) => (guard.key.clone(), guard.owner.clone()),
            None => (keys::checkpoint(topic), String::new()),
        };
        let token_info = match &commit.token_info {
            Some(info) => serde_json::to_string(info)?,
            None => String::new(),
        };

        let script = Script::new(COMMIT_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(lock)
            .key(keys::holders(topic))
            .key(keys::token(topic))
            .key(keys::checkpoint(topic))
            .arg(owner)
            .arg(if replace { "1" } else { "0" })
            .arg(token_info)
            .arg(serde_json::to_string(&commit.checkpoint)?)
            .arg(commit.states.len());
        for state in &commit.states {
            invocation
                .key(keys::state(topic, &state.holder))
                .arg(&state.holder)
                .arg(state.balance)
                .arg(state.last_seq)
                .arg(state.last_height);
        }
        invocation.arg(removed.len());
        for holder in removed {
            invocation.key(keys::state(topic, holder)).arg(holder);
        }

        let mut conn = self.conn.clone();
        let written: i64 = self.timed(invocation.invoke_async(&mut conn)).await?;
        if written == 1 {
            Ok(())
        } else {
            Err(StoreError::LeaseLost {
                key: commit
                    .lease
                    .as_ref()
                    .map(|guard| guard.key.clone())
                    .unwrap_or_default(),
            })
        }
    }
}

#[async_trait]
impl DurableStore for RedisStore {
    async fn head_seq(&self, topic: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let head: Option<u64> = self.timed(conn.get(keys::seq(topic))).await?;
        Ok(head.unwrap_or(0))
    }

    async fn append(&self, topic: &str, batch: &AppendBatch) -> Result<u64, StoreError> {
        batch.validate()?;

        let script = Script::new(APPEND_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(keys::seq(topic))
            .key(keys::events(topic))
            .key(keys::blocks(topic))
            .key(keys::height(topic))
            .arg(batch.expected_head)
            .arg(batch.entries.len());
        for entry in &batch.entries {
            invocation
                .arg(entry.stream_id())
                .arg(serde_json::to_string(&entry.op)?);
        }
        let (block_height, block_hash) = match &batch.block {
            Some((height, hash)) => (height.to_string(), hash.clone()),
            None => (String::new(), String::new()),
        };
        let opt = |v: Option<u64>| v.map(|v| v.to_string()).unwrap_or_default();
        invocation
            .arg(block_height)
            .arg(block_hash)
            .arg(opt(batch.drop_blocks_from))
            .arg(opt(batch.prune_blocks_below))
            .arg(opt(batch.provisional_height));

        let mut conn = self.conn.clone();
        let reply: (u8, u64) = self.timed(invocation.invoke_async(&mut conn)).await?;
        match reply {
            (1, head) => Ok(head),
            (_, actual) => Err(StoreError::HeadMismatch {
                expected: batch.expected_head,
                actual,
            }),
        }
    }

    async fn read_log(
        &self,
        topic: &str,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let key = keys::events(topic);
        let mut conn = self.conn.clone();
        let raw: Vec<(String, Vec<String>)> = self
            .timed(
                redis::cmd("XRANGE")
                    .arg(&key)
                    .arg(format!("{}-0", after_seq.saturating_add(1)))
                    .arg("+")
                    .arg("COUNT")
                    .arg(limit)
                    .query_async(&mut conn),
            )
            .await?;

        raw.iter()
            .map(|(id, fields)| Self::decode_entry(&key, id, fields))
            .collect()
    }

    async fn block_hashes(&self, topic: &str) -> Result<BTreeMap<u64, String>, StoreError> {
        let key = keys::blocks(topic);
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = self.timed(conn.hgetall(&key)).await?;
        raw.into_iter()
            .map(|(height, hash)| {
                height
                    .parse()
                    .map(|h| (h, hash))
                    .map_err(|e| StoreError::corrupt(&key, e))
            })
            .collect()
    }

    async fn provisional_height(&self, topic: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn.clone();
        self.timed(conn.get(keys::height(topic))).await
    }

    async fn load_checkpoint(&self, topic: &str) -> Result<Option<Checkpoint>, StoreError> {
        let key = keys::checkpoint(topic);
        let mut conn = self.conn.clone();
        let raw: Option<String> = self.timed(conn.get(&key)).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(|e| StoreError::corrupt(&key, e)))
            .transpose()
    }

    async fn load_state(
        &self,
        topic: &str,
        holder: &str,
    ) -> Result<Option<TokenState>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> =
            self.timed(conn.hgetall(keys::state(topic, holder))).await?;
        Self::decode_state(topic, holder, &fields)
    }

    async fn load_states(&self, topic: &str) -> Result<Vec<TokenState>, StoreError> {
        let mut conn = self.conn.clone();
        let mut holders: Vec<String> = self.timed(conn.smembers(keys::holders(topic))).await?;
        holders.sort();
        if holders.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for holder in &holders {
            pipe.hgetall(keys::state(topic, holder));
        }
        let rows: Vec<HashMap<String, String>> = self.timed(pipe.query_async(&mut conn)).await?;

        let mut states = Vec::with_capacity(holders.len());
        for (holder, fields) in holders.iter().zip(rows.iter()) {
            if let Some(state) = Self::decode_state(topic, holder, fields)? {
                states.push(state);
            }
        }
        Ok(states)
    }

    async fn load_token_info(&self, topic: &str) -> Result<Option<TokenInfo>, StoreError> {
        let key = keys::token(topic);
        let mut conn = self.conn.clone();
        let raw: Option<String> = self.timed(conn.get(&key)).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(|e| StoreError::corrupt(&key, e)))
            .transpose()
    }

    async fn commit(&self, commit: &Commit) -> Result<(), StoreError> {
        self.write_commit(commit, &commit.removed, false).await
    }

    async fn replace_state(&self, commit: &Commit) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        // The lease keeps other writers out, so the member list is stable
        // until the script runs.
        let existing: Vec<String> = self
            .timed(conn.smembers(keys::holders(commit.topic())))
            .await?;
        let kept: HashSet<&str> = commit.states.iter().map(|s| s.holder.as_str()).collect();
        let removed: Vec<String> = existing
            .into_iter()
            .filter(|holder| !kept.contains(holder.as_str()))
            .chain(commit.removed.iter().cloned())
            .collect();
        self.write_commit(commit, &removed, true).await
    }

    async fn acquire_lease(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = self
            .timed(
                redis::cmd("SET")
                    .arg(key)
                    .arg(owner)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn renew_lease(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let script = Script::new(RENEW_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(key)
            .arg(owner)
            .arg(ttl.as_millis() as u64);
        let mut conn = self.conn.clone();
        let renewed: i64 = self.timed(invocation.invoke_async(&mut conn)).await?;
        Ok(renewed == 1)
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        let script = Script::new(RELEASE_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation.key(key).arg(owner);
        let mut conn = self.conn.clone();
        let released: i64 = self.timed(invocation.invoke_async(&mut conn)).await?;
        Ok(released == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_entry() {
        let json = r#"{"type":"retract","height":811303,"block_hash":null}"#;
        let entry = RedisStore::decode_entry(
            "events:T",
            "9-0",
            &["op".to_string(), json.to_string()],
        )
        .expect("entry");
        assert_eq!(entry, LogEntry::retract(9, 811303, None));
    }

    #[test]
    fn test_decode_entry_missing_op() {
        let result = RedisStore::decode_entry("events:T", "9-0", &["x".to_string()]);
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_decode_state() {
        let fields: HashMap<String, String> = [
            ("balance", "70"),
            ("seq", "4"),
            ("height", "811304"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let state = RedisStore::decode_state("T", "A", &fields)
            .expect("decode")
            .expect("state");
        assert_eq!(state.balance, 70);
        assert_eq!(state.last_seq, 4);
        assert!(RedisStore::decode_state("T", "A", &HashMap::new())
            .expect("decode")
            .is_none());
    }
}
