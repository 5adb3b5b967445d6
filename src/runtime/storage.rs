use crate::runtime::branch::{BranchRecord, BranchReport};
use crate::runtime::error::{FlowError, FlowResult};
use crate::runtime::frame::Outcome;
use crate::runtime::id::ComputationId;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

// --- Interfaces ---

/// A suspension removed from storage in one step.
#[derive(Debug, Default)]
pub struct Claimed {
    /// Stack entries in push order: outermost frame first, header last.
    pub entries: Vec<Vec<u8>>,
    pub heap: Vec<u8>,
    /// The branch record, when it was finished and left together with the stack.
    pub branch: Option<BranchRecord>,
}

/// 状态管理器 (栈 + 堆)
/// Writes for one suspension are staged and only become visible on `commit`,
/// so a chain is either stored whole or not at all.
#[async_trait]
pub trait StateManager: Send + Sync {
    /// Stage one frame. Frames are pushed outermost first.
    async fn push(&self, id: ComputationId, frame: Vec<u8>) -> FlowResult<()>;
    async fn save_heap(&self, id: ComputationId, heap: Vec<u8>) -> FlowResult<()>;
    async fn save_branch(&self, id: ComputationId, record: BranchRecord) -> FlowResult<()>;

    /// Publish everything staged under `id`. Keys are write-once.
    async fn commit(&self, id: ComputationId) -> FlowResult<()>;
    /// Drop everything staged under `id`.
    async fn abort(&self, id: ComputationId) -> FlowResult<()>;

    /// Pop the most recently pushed entry. Returns the entry and whether more remain.
    async fn pop(&self, id: ComputationId) -> FlowResult<(Vec<u8>, bool)>;
    /// Read and remove the heap. Empty when nothing was shared.
    async fn load_heap(&self, id: ComputationId) -> FlowResult<Vec<u8>>;
    /// Remove the whole stack, its heap and a finished branch record at once.
    /// A second caller for the same id gets `UnknownFlow`.
    async fn take(&self, id: ComputationId) -> FlowResult<Claimed>;

    /// Atomically record a child's outcome on the branch stored under `id`.
    /// A record that decided stays until its parent is taken; one that was
    /// already decided is removed when its last child reports.
    async fn settle_branch(&self, id: ComputationId, position: usize, outcome: Outcome) -> FlowResult<BranchReport>;
    /// Undo the settle of `position` that decided the branch.
    async fn unsettle_branch(&self, id: ComputationId, position: usize) -> FlowResult<()>;

    /// Committed entries under `id`.
    async fn depth(&self, id: ComputationId) -> FlowResult<usize>;
    /// Cancellation: remove stack, heap, branch and anything staged.
    async fn delete(&self, id: ComputationId) -> FlowResult<()>;
}

pub(crate) fn check_key(id: ComputationId) -> FlowResult<()> {
    if id.is_reserved() {
        return Err(FlowError::InvalidId(id));
    }
    Ok(())
}

// --- In-Memory Implementation ---

#[derive(Default)]
struct Staged {
    frames: Vec<Vec<u8>>,
    heap: Option<Vec<u8>>,
    branch: Option<BranchRecord>,
}

#[derive(Default)]
pub struct InMemoryStateManager {
    staged: DashMap<ComputationId, Staged>,
    stacks: DashMap<ComputationId, Vec<Vec<u8>>>,
    heaps: DashMap<ComputationId, Vec<u8>>,
    branches: DashMap<ComputationId, BranchRecord>,
}

impl InMemoryStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing is committed, staged or pending.
    pub fn is_empty(&self) -> bool {
        self.staged.is_empty() && self.stacks.is_empty() && self.heaps.is_empty() && self.branches.is_empty()
    }

    pub fn stack_count(&self) -> usize {
        self.stacks.len()
    }
}

#[async_trait]
impl StateManager for InMemoryStateManager {
    async fn push(&self, id: ComputationId, frame: Vec<u8>) -> FlowResult<()> {
        check_key(id)?;
        self.staged.entry(id).or_default().frames.push(frame);
        Ok(())
    }

    async fn save_heap(&self, id: ComputationId, heap: Vec<u8>) -> FlowResult<()> {
        check_key(id)?;
        self.staged.entry(id).or_default().heap = Some(heap);
        Ok(())
    }

    async fn save_branch(&self, id: ComputationId, record: BranchRecord) -> FlowResult<()> {
        check_key(id)?;
        self.staged.entry(id).or_default().branch = Some(record);
        Ok(())
    }

    async fn commit(&self, id: ComputationId) -> FlowResult<()> {
        check_key(id)?;
        // Hold the stack slot while publishing so a concurrent commit of the
        // same key cannot interleave.
        let slot = match self.stacks.entry(id) {
            Entry::Occupied(_) => return Err(FlowError::InvalidId(id)),
            Entry::Vacant(slot) => slot,
        };
        let (_, staged) = self.staged.remove(&id).ok_or(FlowError::UnknownFlow(id))?;
        if let Some(heap) = staged.heap {
            self.heaps.insert(id, heap);
        }
        if let Some(branch) = staged.branch {
            self.branches.insert(id, branch);
        }
        slot.insert(staged.frames);
        Ok(())
    }

    async fn abort(&self, id: ComputationId) -> FlowResult<()> {
        self.staged.remove(&id);
        Ok(())
    }

    async fn pop(&self, id: ComputationId) -> FlowResult<(Vec<u8>, bool)> {
        check_key(id)?;
        let (frame, has_more) = {
            let mut stack = self.stacks.get_mut(&id).ok_or(FlowError::UnknownFlow(id))?;
            let frame = stack.pop().ok_or(FlowError::UnknownFlow(id))?;
            (frame, !stack.is_empty())
        };
        if !has_more {
            self.stacks.remove_if(&id, |_, stack| stack.is_empty());
        }
        Ok((frame, has_more))
    }

    async fn load_heap(&self, id: ComputationId) -> FlowResult<Vec<u8>> {
        check_key(id)?;
        Ok(self.heaps.remove(&id).map(|(_, heap)| heap).unwrap_or_default())
    }

    async fn take(&self, id: ComputationId) -> FlowResult<Claimed> {
        check_key(id)?;
        let (_, entries) = self.stacks.remove(&id).ok_or(FlowError::UnknownFlow(id))?;
        let heap = self.heaps.remove(&id).map(|(_, heap)| heap).unwrap_or_default();
        let branch = self
            .branches
            .remove_if(&id, |_, record| record.is_finished())
            .map(|(_, record)| record);
        Ok(Claimed { entries, heap, branch })
    }

    async fn settle_branch(&self, id: ComputationId, position: usize, outcome: Outcome) -> FlowResult<BranchReport> {
        check_key(id)?;
        let (report, finished) = {
            let mut record = self.branches.get_mut(&id).ok_or(FlowError::UnknownFlow(id))?;
            let report = record.settle(position, outcome)?;
            (report, record.is_finished())
        };
        if finished && report == BranchReport::Discarded {
            self.branches.remove(&id);
        }
        Ok(report)
    }

    async fn unsettle_branch(&self, id: ComputationId, position: usize) -> FlowResult<()> {
        check_key(id)?;
        let mut record = self.branches.get_mut(&id).ok_or(FlowError::UnknownFlow(id))?;
        record.unsettle(position)
    }

    async fn depth(&self, id: ComputationId) -> FlowResult<usize> {
        check_key(id)?;
        Ok(self.stacks.get(&id).map(|s| s.len()).unwrap_or(0))
    }

    async fn delete(&self, id: ComputationId) -> FlowResult<()> {
        check_key(id)?;
        let existed = self.stacks.remove(&id).is_some();
        self.heaps.remove(&id);
        self.branches.remove(&id);
        self.staged.remove(&id);
        if !existed {
            return Err(FlowError::UnknownFlow(id));
        }
        Ok(())
    }
}
