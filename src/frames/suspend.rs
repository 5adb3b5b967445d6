use crate::durable_frame;
use crate::runtime::frame::{AwaitSite, CallbackHandle, Resume, Step};
use serde_json::Value;
use std::time::Duration;

/// 检查点: yields once and completes with whatever the host resumed it with.
#[derive(Debug)]
pub struct Checkpoint {
    point: u32,
    label: String,
}

impl Checkpoint {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            point: 0,
            label: label.into(),
        }
    }

    fn run(&mut self, input: Resume) -> Step {
        match self.point {
            0 => {
                self.point = 1;
                Step::yield_now()
            }
            _ => Step::Complete(input.into_outcome()),
        }
    }
}

durable_frame!(Checkpoint, tag = "checkpoint", point = point,
    awaits = [AwaitSite::Yield],
    fields = [label]);

#[derive(Debug)]
pub struct Sleep {
    point: u32,
    duration: Duration,
}

impl Sleep {
    pub fn new(duration: Duration) -> Self {
        Self { point: 0, duration }
    }

    fn run(&mut self, input: Resume) -> Step {
        match self.point {
            0 => {
                self.point = 1;
                Step::delay(self.duration)
            }
            _ => Step::Complete(input.into_outcome().map(|_| Value::Null)),
        }
    }
}

durable_frame!(Sleep, tag = "sleep", point = point,
    awaits = [AwaitSite::Delay],
    fields = [duration]);

/// Suspends on a named callback; the delivered outcome becomes the result.
#[derive(Debug)]
pub struct AwaitCallback {
    point: u32,
    handle: CallbackHandle,
}

impl AwaitCallback {
    pub fn new(handle: CallbackHandle) -> Self {
        Self { point: 0, handle }
    }

    fn run(&mut self, input: Resume) -> Step {
        match self.point {
            0 => {
                self.point = 1;
                Step::callback(self.handle.clone())
            }
            _ => Step::Complete(input.into_outcome()),
        }
    }
}

durable_frame!(AwaitCallback, tag = "await_callback", point = point,
    awaits = [AwaitSite::Callback],
    fields = [handle]);
