use crate::durable_frame;
use crate::runtime::error::Fault;
use crate::runtime::frame::{Resume, Step};
use serde_json::Value;

/// Completes immediately with a fixed value.
#[derive(Debug)]
pub struct Constant {
    point: u32,
    value: Value,
}

impl Constant {
    pub fn new(value: Value) -> Self {
        Self { point: 0, value }
    }

    fn run(&mut self, _input: Resume) -> Step {
        Step::ok(self.value.clone())
    }
}

durable_frame!(Constant, tag = "constant", point = point, awaits = [], fields = [value]);

/// Completes immediately with a fault.
#[derive(Debug)]
pub struct Fail {
    point: u32,
    fault: Fault,
}

impl Fail {
    pub fn new(fault: Fault) -> Self {
        Self { point: 0, fault }
    }

    fn run(&mut self, _input: Resume) -> Step {
        Step::fail(self.fault.clone())
    }
}

durable_frame!(Fail, tag = "fail", point = point, awaits = [], fields = [fault]);
