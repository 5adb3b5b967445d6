use crate::runtime::branch::{BranchMode, BranchRecord, BranchReport};
use crate::runtime::config::OrchestratorConfig;
use crate::runtime::error::{FlowError, FlowResult, StorageError};
use crate::runtime::frame::Outcome;
use crate::runtime::id::ComputationId;
use crate::runtime::storage::{Claimed, StateManager, check_key};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use std::collections::HashMap;

// Publishes the staged stack, heap and branch in one step.
// KEYS: staged stack, staged heap, staged branch, stack, heap, branch
// Returns 1 on success, 0 if the key is taken, -1 if nothing was staged.
const COMMIT_SCRIPT: &str = r#"
    if redis.call("EXISTS", KEYS[4]) == 1 then
        return 0
    end
    if redis.call("EXISTS", KEYS[1]) == 0 then
        return -1
    end
    redis.call("RENAME", KEYS[1], KEYS[4])
    if redis.call("EXISTS", KEYS[2]) == 1 then
        redis.call("RENAME", KEYS[2], KEYS[5])
    end
    if redis.call("EXISTS", KEYS[3]) == 1 then
        redis.call("RENAME", KEYS[3], KEYS[6])
    end
    return 1
"#;

// Pops the top entry and reports how many remain. Nil when the stack is gone.
const POP_SCRIPT: &str = r#"
    local entry = redis.call("RPOP", KEYS[1])
    if not entry then
        return false
    end
    return { entry, redis.call("LLEN", KEYS[1]) }
"#;

// Settles one child of a branch.
// KEYS[1] = branch hash, ARGV[1] = position, ARGV[2] = encoded outcome
// Hash fields: mode, total, outstanding, decided, slot:<n>
const SETTLE_SCRIPT: &str = r#"
    local key = KEYS[1]
    local slot = "slot:" .. ARGV[1]
    if redis.call("EXISTS", key) == 0 then
        return { "missing" }
    end
    local total = tonumber(redis.call("HGET", key, "total"))
    if tonumber(ARGV[1]) >= total or redis.call("HEXISTS", key, slot) == 1 then
        return { "invalid" }
    end
    redis.call("HSET", key, slot, ARGV[2])
    local outstanding = redis.call("HINCRBY", key, "outstanding", -1)
    local mode = redis.call("HGET", key, "mode")
    local decided = redis.call("HGET", key, "decided")

    if mode == "any" then
        if decided == "1" then
            if outstanding <= 0 then
                redis.call("DEL", key)
            end
            return { "discarded" }
        end
        redis.call("HSET", key, "decided", "1")
        return { "won", ARGV[1], ARGV[2] }
    end

    if outstanding > 0 then
        return { "pending", tostring(outstanding) }
    end
    redis.call("HSET", key, "decided", "1")
    local result = { "ready" }
    for i = 0, total - 1 do
        table.insert(result, redis.call("HGET", key, "slot:" .. i))
    end
    return result
"#;

// Reopens a decided branch for one child.
// KEYS[1] = branch hash, ARGV[1] = position
// Returns 1 on success, 0 if the child never settled, -1 if the record is gone.
const UNSETTLE_SCRIPT: &str = r#"
    local key = KEYS[1]
    if redis.call("EXISTS", key) == 0 then
        return -1
    end
    if redis.call("HDEL", key, "slot:" .. ARGV[1]) == 0 then
        return 0
    end
    redis.call("HINCRBY", key, "outstanding", 1)
    redis.call("HSET", key, "decided", "0")
    return 1
"#;

// Claims a whole suspension: stack, heap and a finished branch record.
// KEYS: stack, heap, branch
// Returns nil when the stack is gone, else { heap, branch fields, entries }.
const TAKE_SCRIPT: &str = r#"
    local entries = redis.call("LRANGE", KEYS[1], 0, -1)
    if #entries == 0 then
        return false
    end
    local heap = redis.call("GET", KEYS[2]) or ""
    local branch = {}
    if redis.call("HGET", KEYS[3], "outstanding") == "0" then
        branch = redis.call("HGETALL", KEYS[3])
        redis.call("DEL", KEYS[3])
    end
    redis.call("DEL", KEYS[1], KEYS[2])
    return { heap, branch, entries }
"#;

/// Redis backed state manager.
///
/// Layout under `prefix`: `stack:{id}` (list), `heap:{id}` (string),
/// `branch:{id}` (hash), each with a `staging:` twin written before commit.
pub struct RedisStateManager {
    client: redis::Client,
    prefix: String,
}

impl RedisStateManager {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    pub fn from_config(client: redis::Client, config: &OrchestratorConfig) -> Self {
        Self::new(client, config.key_prefix.clone())
    }

    fn key(&self, kind: &str, id: ComputationId) -> String {
        format!("{}:{}:{}", self.prefix, kind, id)
    }

    fn staging_key(&self, kind: &str, id: ComputationId) -> String {
        format!("{}:staging:{}:{}", self.prefix, kind, id)
    }

    async fn conn(&self) -> FlowResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| FlowError::Storage(e.into()))
    }
}

fn storage(e: redis::RedisError) -> FlowError {
    FlowError::Storage(StorageError::from(e))
}

fn encode_outcome(outcome: &Outcome) -> FlowResult<String> {
    Ok(serde_json::to_string(outcome)?)
}

fn decode_outcome(raw: &str) -> FlowResult<Outcome> {
    Ok(serde_json::from_str(raw)?)
}

fn branch_fields(record: &BranchRecord) -> FlowResult<Vec<(String, String)>> {
    let mode = match record.mode {
        BranchMode::All => "all",
        BranchMode::Any => "any",
    };
    let mut items = vec![
        ("mode".to_string(), mode.to_string()),
        ("total".to_string(), record.slots.len().to_string()),
        ("outstanding".to_string(), record.outstanding.to_string()),
        ("decided".to_string(), if record.decided { "1" } else { "0" }.to_string()),
    ];
    for (position, slot) in record.slots.iter().enumerate() {
        if let Some(outcome) = slot {
            items.push((format!("slot:{position}"), encode_outcome(outcome)?));
        }
    }
    Ok(items)
}

fn branch_from_fields(fields: &HashMap<String, String>) -> FlowResult<BranchRecord> {
    let number = |name: &str| -> FlowResult<usize> {
        fields
            .get(name)
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| FlowError::invalid_state("branch", format!("malformed `{name}` field")))
    };
    let mode = match fields.get("mode").map(String::as_str) {
        Some("all") => BranchMode::All,
        Some("any") => BranchMode::Any,
        _ => return Err(FlowError::invalid_state("branch", "malformed `mode` field")),
    };
    let slots = (0..number("total")?)
        .map(|position| fields.get(&format!("slot:{position}")).map(|raw| decode_outcome(raw)).transpose())
        .collect::<FlowResult<Vec<_>>>()?;
    Ok(BranchRecord {
        mode,
        slots,
        outstanding: number("outstanding")?,
        decided: fields.get("decided").map(String::as_str) == Some("1"),
    })
}

#[async_trait]
impl StateManager for RedisStateManager {
    async fn push(&self, id: ComputationId, frame: Vec<u8>) -> FlowResult<()> {
        check_key(id)?;
        let mut conn = self.conn().await?;
        let _: () = conn
            .rpush(self.staging_key("stack", id), frame)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn save_heap(&self, id: ComputationId, heap: Vec<u8>) -> FlowResult<()> {
        check_key(id)?;
        let mut conn = self.conn().await?;
        let _: () = conn
            .set(self.staging_key("heap", id), heap)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn save_branch(&self, id: ComputationId, record: BranchRecord) -> FlowResult<()> {
        check_key(id)?;
        let items = branch_fields(&record)?;
        let key = self.staging_key("branch", id);
        let mut conn = self.conn().await?;
        let _: () = redis::pipe()
            .atomic()
            .del(&key)
            .hset_multiple(&key, &items)
            .query_async(&mut conn)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn commit(&self, id: ComputationId) -> FlowResult<()> {
        check_key(id)?;
        let mut conn = self.conn().await?;
        let status: i64 = redis::Script::new(COMMIT_SCRIPT)
            .key(self.staging_key("stack", id))
            .key(self.staging_key("heap", id))
            .key(self.staging_key("branch", id))
            .key(self.key("stack", id))
            .key(self.key("heap", id))
            .key(self.key("branch", id))
            .invoke_async(&mut conn)
            .await
            .map_err(storage)?;
        match status {
            1 => Ok(()),
            0 => Err(FlowError::InvalidId(id)),
            _ => Err(FlowError::UnknownFlow(id)),
        }
    }

    async fn abort(&self, id: ComputationId) -> FlowResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .del(vec![
                self.staging_key("stack", id),
                self.staging_key("heap", id),
                self.staging_key("branch", id),
            ])
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn pop(&self, id: ComputationId) -> FlowResult<(Vec<u8>, bool)> {
        check_key(id)?;
        let mut conn = self.conn().await?;
        let popped: Option<(Vec<u8>, usize)> = redis::Script::new(POP_SCRIPT)
            .key(self.key("stack", id))
            .invoke_async(&mut conn)
            .await
            .map_err(storage)?;
        let (entry, remaining) = popped.ok_or(FlowError::UnknownFlow(id))?;
        Ok((entry, remaining > 0))
    }

    async fn load_heap(&self, id: ComputationId) -> FlowResult<Vec<u8>> {
        check_key(id)?;
        let mut conn = self.conn().await?;
        let heap: Option<Vec<u8>> = conn.get_del(self.key("heap", id)).await.map_err(storage)?;
        Ok(heap.unwrap_or_default())
    }

    async fn take(&self, id: ComputationId) -> FlowResult<Claimed> {
        check_key(id)?;
        let mut conn = self.conn().await?;
        type Reply = Option<(Vec<u8>, HashMap<String, String>, Vec<Vec<u8>>)>;
        let reply: Reply = redis::Script::new(TAKE_SCRIPT)
            .key(self.key("stack", id))
            .key(self.key("heap", id))
            .key(self.key("branch", id))
            .invoke_async(&mut conn)
            .await
            .map_err(storage)?;
        let (heap, branch, entries) = reply.ok_or(FlowError::UnknownFlow(id))?;
        let branch = if branch.is_empty() {
            None
        } else {
            Some(branch_from_fields(&branch)?)
        };
        Ok(Claimed { entries, heap, branch })
    }

    async fn settle_branch(&self, id: ComputationId, position: usize, outcome: Outcome) -> FlowResult<BranchReport> {
        check_key(id)?;
        let mut conn = self.conn().await?;
        let reply: Vec<String> = redis::Script::new(SETTLE_SCRIPT)
            .key(self.key("branch", id))
            .arg(position)
            .arg(encode_outcome(&outcome)?)
            .invoke_async(&mut conn)
            .await
            .map_err(storage)?;

        match reply.first().map(String::as_str) {
            Some("missing") => Err(FlowError::UnknownFlow(id)),
            Some("discarded") => Ok(BranchReport::Discarded),
            Some("won") => Ok(BranchReport::Won { position, outcome }),
            Some("pending") => {
                let remaining = reply
                    .get(1)
                    .and_then(|r| r.parse().ok())
                    .ok_or_else(|| FlowError::invalid_state("branch", "malformed pending reply"))?;
                Ok(BranchReport::Pending { remaining })
            }
            Some("ready") => {
                let outcomes = reply[1..]
                    .iter()
                    .map(|raw| decode_outcome(raw))
                    .collect::<FlowResult<Vec<_>>>()?;
                Ok(BranchReport::Ready(outcomes))
            }
            _ => Err(FlowError::invalid_state(
                "branch",
                format!("child at position {position} cannot be settled"),
            )),
        }
    }

    async fn unsettle_branch(&self, id: ComputationId, position: usize) -> FlowResult<()> {
        check_key(id)?;
        let mut conn = self.conn().await?;
        let status: i64 = redis::Script::new(UNSETTLE_SCRIPT)
            .key(self.key("branch", id))
            .arg(position)
            .invoke_async(&mut conn)
            .await
            .map_err(storage)?;
        match status {
            1 => Ok(()),
            0 => Err(FlowError::invalid_state(
                "branch",
                format!("child at position {position} was never settled"),
            )),
            _ => Err(FlowError::UnknownFlow(id)),
        }
    }

    async fn depth(&self, id: ComputationId) -> FlowResult<usize> {
        check_key(id)?;
        let mut conn = self.conn().await?;
        let len: usize = conn.llen(self.key("stack", id)).await.map_err(storage)?;
        Ok(len)
    }

    async fn delete(&self, id: ComputationId) -> FlowResult<()> {
        check_key(id)?;
        let mut conn = self.conn().await?;
        let (existed, _): (i64, i64) = redis::pipe()
            .atomic()
            .del(self.key("stack", id))
            .del(vec![
                self.key("heap", id),
                self.key("branch", id),
                self.staging_key("stack", id),
                self.staging_key("heap", id),
                self.staging_key("branch", id),
            ])
            .query_async(&mut conn)
            .await
            .map_err(storage)?;
        if existed == 0 {
            return Err(FlowError::UnknownFlow(id));
        }
        Ok(())
    }
}
