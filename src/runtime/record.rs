//! Persisted layout of a suspended chain.
//!
//! A continuation stack stored under one suspension id looks like
//! `[outermost frame, ..., innermost frame, header]`, so popping yields the
//! header first and then the frames innermost to outermost. The heap for the
//! same id holds every shared value the frames point at. Suspensions written
//! together carry the same heap session, so their keys name the same objects.

use crate::runtime::error::{FlowError, FlowResult};
use crate::runtime::frame::{CallbackHandle, PendingMarker};
use crate::runtime::id::ComputationId;
use crate::runtime::marshal::SurrogateToken;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub type_tag: String,
    pub resume_point: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingMarker>,
    pub fields: Vec<(String, FieldValue)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Value(Value),
    Shared(HeapKey),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeapKey(pub u32);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeapEntry {
    pub key: HeapKey,
    pub type_tag: String,
    pub value: HeapValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeapValue {
    Inline(Value),
    Surrogate(SurrogateToken),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Heap {
    #[serde(default)]
    pub session: Uuid,
    pub entries: Vec<HeapEntry>,
}

impl Heap {
    pub fn get(&self, key: HeapKey) -> Option<&HeapEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 挂起原因
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendReason {
    Yield,
    Delay(Duration),
    Callback(CallbackHandle),
    ChildBranch,
}

/// Where the outcome of an exhausted chain goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parent {
    /// Top-level chain; the host gets the terminal notification.
    Host,
    /// Child of a combinator; the outcome fills `position` of the parent's branch.
    Branch { id: ComputationId, position: usize },
    /// Loser of an already decided `wait_any`; the outcome is dropped.
    Detached,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackHeader {
    pub flow: ComputationId,
    pub reason: SuspendReason,
    pub parent: Parent,
    pub frames: usize,
}

pub fn encode<T: Serialize>(value: &T) -> FlowResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> FlowResult<T> {
    serde_json::from_slice(bytes).map_err(FlowError::from)
}
