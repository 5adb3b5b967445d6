use crate::runtime::error::Fault;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::fmt::Debug;
use std::time::Duration;

/// The result a frame completes with, or the result injected into a paused frame.
pub type Outcome = Result<Value, Fault>;

/// 可恢复的计算帧 (Resumable Frame)
/// 一个显式的状态机：每次 `step` 从当前恢复点继续执行，直到完成或等待某个操作。
pub trait Frame: Send + Debug + 'static {
    fn type_tag(&self) -> &str;

    /// Drive the frame from its current resumption point.
    fn step(&mut self, input: Resume) -> Step;

    fn as_any(&self) -> &dyn Any;
}

/// What a frame is re-entered with.
#[derive(Debug, Clone, PartialEq)]
pub enum Resume {
    /// First entry into a freshly created frame.
    Start,
    /// The awaited operation finished, synchronously or after a replay.
    Outcome(Outcome),
}

impl Resume {
    /// The delivered outcome. `Start` reads as `Ok(null)`.
    pub fn into_outcome(self) -> Outcome {
        match self {
            Resume::Start => Ok(Value::Null),
            Resume::Outcome(outcome) => outcome,
        }
    }
}

#[derive(Debug)]
pub enum Step {
    Complete(Outcome),
    Await(Operation),
}

impl Step {
    pub fn ok(value: Value) -> Self {
        Step::Complete(Ok(value))
    }

    pub fn fail(fault: Fault) -> Self {
        Step::Complete(Err(fault))
    }

    pub fn call(frame: impl Frame) -> Self {
        Step::Await(Operation::Call(Box::new(frame)))
    }

    pub fn yield_now() -> Self {
        Step::Await(Operation::Yield)
    }

    pub fn delay(duration: Duration) -> Self {
        Step::Await(Operation::Delay(duration))
    }

    pub fn callback(handle: CallbackHandle) -> Self {
        Step::Await(Operation::Callback(handle))
    }

    pub fn wait_all(children: Vec<Box<dyn Frame>>) -> Self {
        Step::Await(Operation::WaitAll(children))
    }

    pub fn wait_any(children: Vec<Box<dyn Frame>>) -> Self {
        Step::Await(Operation::WaitAny(children))
    }
}

/// External callback a flow is waiting on. The payload is opaque to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackHandle {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

impl CallbackHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// 帧可以等待的操作
#[derive(Debug)]
pub enum Operation {
    /// Call a child computation; runs synchronously until it completes or suspends.
    Call(Box<dyn Frame>),
    Yield,
    Delay(Duration),
    Callback(CallbackHandle),
    WaitAll(Vec<Box<dyn Frame>>),
    WaitAny(Vec<Box<dyn Frame>>),
}

impl Operation {
    pub fn marker(&self) -> PendingMarker {
        match self {
            Operation::Call(child) => PendingMarker::Type(child.type_tag().to_string()),
            Operation::Yield => AwaitSite::Yield.marker(),
            Operation::Delay(_) => AwaitSite::Delay.marker(),
            Operation::Callback(_) => AwaitSite::Callback.marker(),
            Operation::WaitAll(_) => AwaitSite::WaitAll.marker(),
            Operation::WaitAny(_) => AwaitSite::WaitAny.marker(),
        }
    }
}

/// Identifies the outstanding operation of a persisted frame.
/// Value-typed operations by positional slot, child calls by the child's type tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingMarker {
    Slot(u32),
    Type(String),
}

/// An operation a frame type declares it may be paused on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitSite {
    Yield,
    Delay,
    Callback,
    WaitAll,
    WaitAny,
    Call(&'static str),
}

impl AwaitSite {
    pub fn marker(&self) -> PendingMarker {
        match self {
            AwaitSite::Yield => PendingMarker::Slot(0),
            AwaitSite::Delay => PendingMarker::Slot(1),
            AwaitSite::Callback => PendingMarker::Slot(2),
            AwaitSite::WaitAll => PendingMarker::Slot(3),
            AwaitSite::WaitAny => PendingMarker::Slot(4),
            AwaitSite::Call(tag) => PendingMarker::Type((*tag).to_string()),
        }
    }

    pub fn matches(&self, marker: &PendingMarker) -> bool {
        match (self, marker) {
            (AwaitSite::Call(tag), PendingMarker::Type(other)) => *tag == other.as_str(),
            (AwaitSite::Call(_), PendingMarker::Slot(_)) => false,
            (site, marker) => site.marker() == *marker,
        }
    }
}
