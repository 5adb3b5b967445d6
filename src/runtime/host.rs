use crate::runtime::error::Fault;
use crate::runtime::frame::CallbackHandle;
use crate::runtime::id::ComputationId;
use crate::runtime::record::SuspendReason;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// 宿主回调接口
/// The orchestrator awaits these before returning from `start` / `resume`.
/// Suspension callbacks fire only after the chain is durably stored; terminal
/// callbacks fire after the flow's stack and heap are gone.
#[async_trait]
pub trait FlowHost: Send + Sync {
    async fn on_yield(&self, id: ComputationId) -> anyhow::Result<()>;
    async fn on_delay(&self, id: ComputationId, duration: Duration) -> anyhow::Result<()>;
    async fn on_callback(&self, id: ComputationId, callback: CallbackHandle) -> anyhow::Result<()>;

    /// A parent is now waiting on `children` branch continuations.
    async fn on_branch(&self, _parent: ComputationId, _children: usize) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_succeed(&self, flow: ComputationId, result: Value) -> anyhow::Result<()>;
    async fn on_fail(&self, flow: ComputationId, fault: Fault) -> anyhow::Result<()>;
}

/// One durably stored continuation.
#[derive(Debug, Clone, PartialEq)]
pub struct Suspension {
    pub id: ComputationId,
    pub reason: SuspendReason,
}

/// Where a `start` / `resume` call left the flow.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowState {
    /// Continuations waiting for external triggers.
    Suspended(Vec<Suspension>),
    Succeeded(Value),
    Failed(Fault),
    /// A branch child finished and its parent recorded the outcome; the
    /// parent is still waiting on other children.
    Joined { parent: ComputationId },
    /// A branch child finished after its `wait_any` was already decided.
    Discarded,
}

impl FlowState {
    pub fn suspensions(&self) -> &[Suspension] {
        match self {
            FlowState::Suspended(list) => list,
            _ => &[],
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowState::Succeeded(_) | FlowState::Failed(_))
    }
}
