use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 计算标识的作用域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdScope {
    /// A resumable flow continuation, handed to the host.
    Flow,
    /// An internal frame of a flow (e.g. a parent waiting on branches).
    Frame,
}

/// 计算标识 (Computation Identifier)
/// 每一次持久化挂起都会生成一个新的标识，旧的标识不会被复用。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComputationId {
    uuid: Uuid,
    scope: IdScope,
}

impl ComputationId {
    /// Never a valid key.
    pub const EMPTY: ComputationId = ComputationId {
        uuid: Uuid::nil(),
        scope: IdScope::Frame,
    };

    /// The top-level flow marker. Never used as a storage key.
    pub const ROOT: ComputationId = ComputationId {
        uuid: Uuid::max(),
        scope: IdScope::Flow,
    };

    pub fn new(uuid: Uuid, scope: IdScope) -> Self {
        Self { uuid, scope }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn scope(&self) -> IdScope {
        self.scope
    }

    pub fn is_flow(&self) -> bool {
        self.scope == IdScope::Flow
    }

    pub fn is_reserved(&self) -> bool {
        self.uuid.is_nil() || self.uuid.is_max()
    }
}

impl fmt::Display for ComputationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            IdScope::Flow => write!(f, "flow:{}", self.uuid),
            IdScope::Frame => write!(f, "frame:{}", self.uuid),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid computation id `{0}`")]
pub struct ParseIdError(String);

impl FromStr for ComputationId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scope, raw) = match s.split_once(':') {
            Some(("flow", raw)) => (IdScope::Flow, raw),
            Some(("frame", raw)) => (IdScope::Frame, raw),
            _ => return Err(ParseIdError(s.to_string())),
        };
        let uuid = Uuid::parse_str(raw).map_err(|_| ParseIdError(s.to_string()))?;
        Ok(Self { uuid, scope })
    }
}

/// Source of fresh, collision-free ids.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self, scope: IdScope) -> ComputationId;
}

/// Random v4 ids. Retries in the (theoretical) case a reserved value comes out.
#[derive(Debug, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self, scope: IdScope) -> ComputationId {
        loop {
            let id = ComputationId::new(Uuid::new_v4(), scope);
            if !id.is_reserved() {
                return id;
            }
        }
    }
}
