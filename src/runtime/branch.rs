use crate::runtime::error::{FlowError, FlowResult};
use crate::runtime::frame::Outcome;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchMode {
    All,
    Any,
}

/// 分支记录 (Branch record)
/// Bookkeeping for one `wait_all` / `wait_any`. Lives in memory while the fork runs;
/// if children are still outstanding it is saved next to the parent's stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchRecord {
    pub mode: BranchMode,
    pub slots: Vec<Option<Outcome>>,
    pub outstanding: usize,
    pub decided: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BranchReport {
    /// `wait_all` still has children running.
    Pending { remaining: usize },
    /// `wait_all` finished; outcomes in submission order.
    Ready(Vec<Outcome>),
    /// First completion of a `wait_any`.
    Won { position: usize, outcome: Outcome },
    /// Late completion of an already decided `wait_any`.
    Discarded,
}

impl BranchRecord {
    pub fn new(mode: BranchMode, children: usize) -> Self {
        Self {
            mode,
            slots: vec![None; children],
            outstanding: children,
            decided: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.outstanding == 0
    }

    pub fn settle(&mut self, position: usize, outcome: Outcome) -> FlowResult<BranchReport> {
        let slot = self
            .slots
            .get_mut(position)
            .ok_or_else(|| FlowError::invalid_state("branch", format!("no child at position {position}")))?;
        if slot.is_some() {
            return Err(FlowError::invalid_state(
                "branch",
                format!("child at position {position} settled twice"),
            ));
        }
        *slot = Some(outcome.clone());
        self.outstanding -= 1;

        let report = match self.mode {
            BranchMode::Any if self.decided => BranchReport::Discarded,
            BranchMode::Any => {
                self.decided = true;
                BranchReport::Won { position, outcome }
            }
            BranchMode::All if self.outstanding > 0 => BranchReport::Pending {
                remaining: self.outstanding,
            },
            BranchMode::All => {
                self.decided = true;
                BranchReport::Ready(self.slots.iter().flatten().cloned().collect())
            }
        };
        Ok(report)
    }

    /// Take back the settle of `position` that decided the record.
    pub fn unsettle(&mut self, position: usize) -> FlowResult<()> {
        let slot = self
            .slots
            .get_mut(position)
            .filter(|slot| slot.is_some())
            .ok_or_else(|| FlowError::invalid_state("branch", format!("child at position {position} was never settled")))?;
        *slot = None;
        self.outstanding += 1;
        self.decided = false;
        Ok(())
    }
}

/// Outcome delivered to the frame that awaited `wait_all`: every result in
/// submission order, or the fault of the lowest failed position.
pub fn join_all(outcomes: Vec<Outcome>) -> Outcome {
    let mut values = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        values.push(outcome?);
    }
    Ok(Value::Array(values))
}

/// Outcome delivered to the frame that awaited `wait_any`.
pub fn join_any(position: usize, outcome: Outcome) -> Outcome {
    outcome.map(|value| json!({ "index": position, "value": value }))
}
