use crate::runtime::branch::{BranchMode, BranchRecord, BranchReport, join_all, join_any};
use crate::runtime::codec::{resume_frame, suspend_frame};
use crate::runtime::config::OrchestratorConfig;
use crate::runtime::error::{Fault, FlowError, FlowResult, StorageError};
use crate::runtime::frame::{Frame, Operation, Outcome, PendingMarker, Resume, Step};
use crate::runtime::host::{FlowHost, FlowState, Suspension};
use crate::runtime::id::{ComputationId, IdGenerator, IdScope, UuidGenerator};
use crate::runtime::marshal::{Dehydrator, Hydrator, Marshaler};
use crate::runtime::record::{FrameRecord, Heap, Parent, StackHeader, SuspendReason, decode, encode};
use crate::runtime::registry::CodecRegistry;
use crate::runtime::storage::{Claimed, StateManager};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// A frame of the live chain and the operation it is paused on.
#[derive(Debug)]
struct Live {
    frame: Box<dyn Frame>,
    pending: Option<PendingMarker>,
}

impl Live {
    fn fresh(frame: Box<dyn Frame>) -> Self {
        Self { frame, pending: None }
    }
}

/// Outermost frame first, innermost last.
type Chain = Vec<Live>;

/// Where synchronous driving of a chain stopped.
#[derive(Debug)]
enum Driven {
    Done(Outcome),
    Suspended {
        chain: Chain,
        reason: SuspendReason,
    },
    /// The innermost frame waits on a combinator with children still running.
    Forked {
        chain: Chain,
        record: BranchRecord,
        children: Vec<(usize, Driven)>,
    },
}

enum Fork {
    Resolved(Outcome),
    Waiting {
        record: BranchRecord,
        children: Vec<(usize, Driven)>,
    },
}

/// One suspension ready to be written: frames outermost first, header pushed last.
struct Unit {
    id: ComputationId,
    header: StackHeader,
    frames: Vec<Vec<u8>>,
    branch: Option<BranchRecord>,
}

/// A storage effect of one `resume`, undone when a later step fails.
enum Undo {
    /// A consumed suspension, stored again under its id.
    PutBack { id: ComputationId, claimed: Claimed },
    /// Suspensions committed by this pass.
    Discard(Vec<ComputationId>),
    /// A settle that decided its branch.
    Unsettle { id: ComputationId, position: usize },
}

/// Storage effects of one pass, newest last, and the units to announce once it succeeds.
#[derive(Default)]
struct Journal {
    undo: Vec<Undo>,
    written: Vec<Unit>,
}

enum Conclusion {
    /// Every live chain is stored.
    Suspended,
    /// The top-level chain finished.
    Finished(Outcome),
    /// A child reported into a branch; nothing continues.
    Settled(FlowState),
    /// A branch is complete; its parent continues with `outcome`.
    Cascade { id: ComputationId, outcome: Outcome },
}

/// 编排器 (Orchestrator)
/// Drives frame chains, persists them when they suspend and replays them on resume.
pub struct Orchestrator {
    state: Arc<dyn StateManager>,
    codecs: Arc<CodecRegistry>,
    marshaler: Marshaler,
    ids: Arc<dyn IdGenerator>,
    host: Arc<dyn FlowHost>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(host: Arc<dyn FlowHost>, state: Arc<dyn StateManager>, codecs: Arc<CodecRegistry>) -> Self {
        Self {
            state,
            codecs,
            marshaler: Marshaler::new(),
            ids: Arc::new(UuidGenerator),
            host,
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_marshaler(mut self, marshaler: Marshaler) -> Self {
        self.marshaler = marshaler;
        self
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run a new flow until it completes or every live branch of it is suspended.
    pub async fn start(&self, root: impl Frame) -> FlowResult<FlowState> {
        let flow = self.ids.next_id(IdScope::Flow);
        info!(flow = %flow, frame = root.type_tag(), "flow started");

        let mut detached = Vec::new();
        let driven = self.drive(vec![Live::fresh(Box::new(root))], Resume::Start, &mut detached)?;
        let mut journal = Journal::default();
        let concluded = self.conclude(flow, Parent::Host, driven, detached, &mut journal).await;
        match concluded {
            Ok(conclusion) => self.announce(flow, conclusion, journal.written).await,
            Err(e) => {
                self.rollback(journal.undo).await;
                Err(e)
            }
        }
    }

    /// Continue the suspension `id`, delivering `outcome` to its innermost frame.
    /// `None` delivers `Ok(null)`.
    ///
    /// On error every stored suspension and branch record is as it was before the call.
    pub async fn resume(&self, id: ComputationId, outcome: Option<Outcome>) -> FlowResult<FlowState> {
        if id.is_reserved() || !id.is_flow() {
            return Err(FlowError::InvalidId(id));
        }
        let mut journal = Journal::default();
        let replayed = self.replay(id, outcome.unwrap_or(Ok(Value::Null)), &mut journal).await;
        match replayed {
            Ok((flow, conclusion)) => self.announce(flow, conclusion, journal.written).await,
            Err(e) => {
                if !journal.undo.is_empty() {
                    warn!(id = %id, error = %e, "resume failed, restoring stored state");
                }
                self.rollback(journal.undo).await;
                Err(e)
            }
        }
    }

    /// Cancel a suspension: its stack, heap and branch record are removed.
    pub async fn delete(&self, id: ComputationId) -> FlowResult<()> {
        self.guarded(self.state.delete(id)).await?;
        info!(id = %id, "suspension deleted");
        Ok(())
    }

    // --- Driving ---

    fn drive(&self, mut chain: Chain, mut input: Resume, detached: &mut Vec<Driven>) -> FlowResult<Driven> {
        loop {
            let Some(top) = chain.last_mut() else {
                return Err(FlowError::invalid_state("chain", "no frame to drive"));
            };
            match top.frame.step(input) {
                Step::Complete(outcome) => {
                    chain.pop();
                    if chain.is_empty() {
                        return Ok(Driven::Done(outcome));
                    }
                    input = Resume::Outcome(outcome);
                }
                Step::Await(operation) => {
                    top.pending = Some(operation.marker());
                    match operation {
                        Operation::Call(child) => {
                            if chain.len() >= self.config.max_chain_depth {
                                return Err(FlowError::invalid_state(
                                    child.type_tag(),
                                    format!("call chain deeper than {} frames", self.config.max_chain_depth),
                                ));
                            }
                            chain.push(Live::fresh(child));
                            input = Resume::Start;
                        }
                        Operation::Yield => {
                            return Ok(Driven::Suspended {
                                chain,
                                reason: SuspendReason::Yield,
                            });
                        }
                        Operation::Delay(duration) => {
                            return Ok(Driven::Suspended {
                                chain,
                                reason: SuspendReason::Delay(duration),
                            });
                        }
                        Operation::Callback(handle) => {
                            return Ok(Driven::Suspended {
                                chain,
                                reason: SuspendReason::Callback(handle),
                            });
                        }
                        Operation::WaitAll(children) => match self.fork(BranchMode::All, children, detached)? {
                            Fork::Resolved(outcome) => input = Resume::Outcome(outcome),
                            Fork::Waiting { record, children } => {
                                return Ok(Driven::Forked { chain, record, children });
                            }
                        },
                        Operation::WaitAny(children) => match self.fork(BranchMode::Any, children, detached)? {
                            Fork::Resolved(outcome) => input = Resume::Outcome(outcome),
                            Fork::Waiting { record, children } => {
                                return Ok(Driven::Forked { chain, record, children });
                            }
                        },
                    }
                }
            }
        }
    }

    /// Start every child in submission order. Children that suspend keep running
    /// as their own chains.
    fn fork(&self, mode: BranchMode, children: Vec<Box<dyn Frame>>, detached: &mut Vec<Driven>) -> FlowResult<Fork> {
        if children.is_empty() {
            return Ok(Fork::Resolved(match mode {
                BranchMode::All => Ok(Value::Array(Vec::new())),
                BranchMode::Any => Err(Fault::new("InvalidOperation", "wait_any needs at least one child")),
            }));
        }

        let mut record = BranchRecord::new(mode, children.len());
        let mut waiting = Vec::new();
        let mut resolved = None;
        for (position, child) in children.into_iter().enumerate() {
            match self.drive(vec![Live::fresh(child)], Resume::Start, detached)? {
                Driven::Done(outcome) => match record.settle(position, outcome)? {
                    BranchReport::Ready(outcomes) => resolved = Some(join_all(outcomes)),
                    BranchReport::Won { position, outcome } => resolved = Some(join_any(position, outcome)),
                    BranchReport::Pending { .. } | BranchReport::Discarded => {}
                },
                pending => waiting.push((position, pending)),
            }
        }

        match resolved {
            Some(outcome) => {
                // Only a decided wait_any gets here with children left; they run on unobserved.
                detached.extend(waiting.into_iter().map(|(_, child)| child));
                Ok(Fork::Resolved(outcome))
            }
            None => Ok(Fork::Waiting {
                record,
                children: waiting,
            }),
        }
    }

    // --- Suspension ---

    async fn conclude(
        &self,
        flow: ComputationId,
        parent: Parent,
        driven: Driven,
        detached: Vec<Driven>,
        journal: &mut Journal,
    ) -> FlowResult<Conclusion> {
        // One session for every unit, so an object shared by a parent and its
        // children is written once.
        let mut session = self.marshaler.dehydrator();
        let mut units = Vec::new();
        for orphan in detached {
            self.plan(flow, orphan, Parent::Detached, &mut session, &mut units)?;
        }
        let finished = match driven {
            Driven::Done(outcome) => Some(outcome),
            pending => {
                self.plan(flow, pending, parent, &mut session, &mut units)?;
                None
            }
        };
        let heap = session.finish();
        let heap = if heap.is_empty() { Vec::new() } else { encode(&heap)? };

        if !units.is_empty() {
            self.write(&units, &heap).await?;
            journal.undo.push(Undo::Discard(units.iter().map(|u| u.id).collect()));
            journal.written.extend(units);
        }

        let Some(outcome) = finished else {
            return Ok(Conclusion::Suspended);
        };
        match parent {
            Parent::Host => Ok(Conclusion::Finished(outcome)),
            Parent::Detached => {
                warn!(flow = %flow, "detached branch finished, result discarded");
                Ok(Conclusion::Settled(FlowState::Discarded))
            }
            Parent::Branch { id, position } => {
                let report = self.guarded(self.state.settle_branch(id, position, outcome)).await?;
                match &report {
                    BranchReport::Discarded => warn!(flow = %flow, parent = %id, position, "branch already decided, result discarded"),
                    _ => debug!(flow = %flow, parent = %id, position, "branch child settled"),
                }
                let outcome = match report {
                    BranchReport::Pending { .. } => return Ok(Conclusion::Settled(FlowState::Joined { parent: id })),
                    BranchReport::Discarded => return Ok(Conclusion::Settled(FlowState::Discarded)),
                    BranchReport::Ready(outcomes) => join_all(outcomes),
                    BranchReport::Won { position, outcome } => join_any(position, outcome),
                };
                journal.undo.push(Undo::Unsettle { id, position });
                Ok(Conclusion::Cascade { id, outcome })
            }
        }
    }

    /// Tell the host about everything stored, then report where the flow stands.
    async fn announce(&self, flow: ComputationId, conclusion: Conclusion, written: Vec<Unit>) -> FlowResult<FlowState> {
        let suspensions = self.notify(flow, &written).await?;
        match conclusion {
            Conclusion::Suspended => Ok(FlowState::Suspended(suspensions)),
            Conclusion::Finished(outcome) => self.finish(flow, outcome).await,
            Conclusion::Settled(state) => Ok(state),
            Conclusion::Cascade { id, .. } => Err(FlowError::invalid_state(
                "flow",
                format!("branch {id} completed but its parent never ran"),
            )),
        }
    }

    async fn finish(&self, flow: ComputationId, outcome: Outcome) -> FlowResult<FlowState> {
        match outcome {
            Ok(value) => {
                info!(flow = %flow, "flow succeeded");
                self.host
                    .on_succeed(flow, value.clone())
                    .await
                    .map_err(FlowError::Host)?;
                Ok(FlowState::Succeeded(value))
            }
            Err(fault) => {
                warn!(flow = %flow, fault = %fault, "flow failed");
                self.host
                    .on_fail(flow, fault.clone())
                    .await
                    .map_err(FlowError::Host)?;
                Ok(FlowState::Failed(fault))
            }
        }
    }

    /// Dehydrate a stopped chain, and for forks every waiting child, into write units.
    fn plan(
        &self,
        flow: ComputationId,
        driven: Driven,
        parent: Parent,
        session: &mut Dehydrator<'_>,
        units: &mut Vec<Unit>,
    ) -> FlowResult<()> {
        let (id, chain, reason, branch, children) = match driven {
            Driven::Done(_) => return Err(FlowError::invalid_state("chain", "a finished chain cannot be suspended")),
            Driven::Suspended { chain, reason } => (self.ids.next_id(IdScope::Flow), chain, reason, None, Vec::new()),
            Driven::Forked { chain, record, children } => (
                self.ids.next_id(IdScope::Frame),
                chain,
                SuspendReason::ChildBranch,
                Some(record),
                children,
            ),
        };
        let frames = self.dehydrate(&chain, session)?;
        units.push(Unit {
            id,
            header: StackHeader {
                flow,
                reason,
                parent,
                frames: frames.len(),
            },
            frames,
            branch,
        });
        for (position, child) in children {
            self.plan(flow, child, Parent::Branch { id, position }, session, units)?;
        }
        Ok(())
    }

    fn dehydrate(&self, chain: &[Live], session: &mut Dehydrator<'_>) -> FlowResult<Vec<Vec<u8>>> {
        let mut frames = Vec::with_capacity(chain.len());
        for live in chain {
            let tag = live.frame.type_tag();
            let codec = self.codecs.codec(tag)?;
            let pending = live
                .pending
                .clone()
                .ok_or_else(|| FlowError::invalid_state(tag, "frame is not waiting on anything"))?;
            let record = suspend_frame(codec.as_ref(), live.frame.as_ref(), pending, session)?;
            frames.push(encode(&record)?);
        }
        Ok(frames)
    }

    /// Store every unit, or none: on failure the current unit is aborted and
    /// units already committed are removed again.
    async fn write(&self, units: &[Unit], heap: &[u8]) -> FlowResult<()> {
        let mut committed = Vec::with_capacity(units.len());
        for unit in units {
            if let Err(e) = self.write_unit(unit, heap).await {
                error!(id = %unit.id, error = %e, "failed to persist suspension");
                if let Err(abort) = self.guarded(self.state.abort(unit.id)).await {
                    warn!(id = %unit.id, error = %abort, "abort failed");
                }
                self.discard(&committed).await;
                return Err(e);
            }
            committed.push(unit.id);
        }
        Ok(())
    }

    async fn write_unit(&self, unit: &Unit, heap: &[u8]) -> FlowResult<()> {
        for frame in &unit.frames {
            self.guarded(self.state.push(unit.id, frame.clone())).await?;
        }
        self.guarded(self.state.push(unit.id, encode(&unit.header)?)).await?;
        if !heap.is_empty() {
            self.guarded(self.state.save_heap(unit.id, heap.to_vec())).await?;
        }
        if let Some(record) = &unit.branch {
            self.guarded(self.state.save_branch(unit.id, record.clone())).await?;
        }
        self.guarded(self.state.commit(unit.id)).await
    }

    async fn discard(&self, ids: &[ComputationId]) {
        for id in ids {
            if let Err(e) = self.guarded(self.state.delete(*id)).await {
                warn!(id = %id, error = %e, "rollback failed");
            }
        }
    }

    async fn notify(&self, flow: ComputationId, units: &[Unit]) -> FlowResult<Vec<Suspension>> {
        let mut suspensions = Vec::new();
        for unit in units {
            let reason = &unit.header.reason;
            info!(flow = %flow, id = %unit.id, frames = unit.frames.len(), reason = ?reason, "suspended");
            let delivered = match reason {
                SuspendReason::Yield => self.host.on_yield(unit.id).await,
                SuspendReason::Delay(duration) => self.host.on_delay(unit.id, *duration).await,
                SuspendReason::Callback(handle) => self.host.on_callback(unit.id, handle.clone()).await,
                SuspendReason::ChildBranch => {
                    let children = unit.branch.as_ref().map(|b| b.outstanding).unwrap_or(0);
                    self.host.on_branch(unit.id, children).await
                }
            };
            delivered.map_err(FlowError::Host)?;
            if unit.id.is_flow() {
                suspensions.push(Suspension {
                    id: unit.id,
                    reason: reason.clone(),
                });
            }
        }
        Ok(suspensions)
    }

    // --- Replay ---

    /// Claim `id`, run it, and keep continuing parents whose branches complete.
    /// Every hydrate of the pass shares one session.
    async fn replay(
        &self,
        id: ComputationId,
        mut outcome: Outcome,
        journal: &mut Journal,
    ) -> FlowResult<(ComputationId, Conclusion)> {
        let mut session = self.marshaler.hydrator(Heap::default());
        let mut next = id;
        loop {
            let claimed = self.guarded(self.state.take(next)).await?;
            let rebuilt = self.hydrate(&claimed, &mut session);
            journal.undo.push(Undo::PutBack { id: next, claimed });
            let (header, chain) = match rebuilt {
                Ok(rebuilt) => rebuilt,
                Err(e) => {
                    error!(id = %next, error = %e, "cannot rebuild suspended chain");
                    return Err(e);
                }
            };
            let flow = header.flow;
            info!(flow = %flow, id = %next, frames = header.frames, "resuming");

            let mut detached = Vec::new();
            let driven = self.drive(chain, Resume::Outcome(outcome), &mut detached)?;
            match self.conclude(flow, header.parent, driven, detached, journal).await? {
                Conclusion::Cascade { id, outcome: joined } => {
                    debug!(flow = %flow, parent = %id, "branch complete, continuing parent");
                    next = id;
                    outcome = joined;
                }
                conclusion => return Ok((flow, conclusion)),
            }
        }
    }

    /// Rebuild the chain. Frames that shared an object when they were written
    /// get the same instance back.
    fn hydrate(&self, claimed: &Claimed, session: &mut Hydrator<'_>) -> FlowResult<(StackHeader, Chain)> {
        let (header_raw, frames) = claimed
            .entries
            .split_last()
            .ok_or_else(|| FlowError::invalid_state("stack", "no header"))?;
        let header: StackHeader = decode(header_raw)?;
        if frames.len() != header.frames || frames.is_empty() {
            return Err(FlowError::invalid_state(
                "stack",
                format!("header lists {} frames, found {}", header.frames, frames.len()),
            ));
        }
        let heap: Heap = if claimed.heap.is_empty() {
            Heap::default()
        } else {
            decode(&claimed.heap)?
        };
        session.enter(heap);

        let mut chain: Chain = Vec::with_capacity(frames.len());
        for raw in frames {
            let record: FrameRecord = decode(raw)?;
            let codec = self.codecs.codec(&record.type_tag)?;
            let resumed = resume_frame(codec.as_ref(), record, session)?;
            chain.push(Live {
                frame: resumed.frame,
                pending: Some(resumed.pending),
            });
        }

        for pair in chain.windows(2) {
            let expected = PendingMarker::Type(pair[1].frame.type_tag().to_string());
            if pair[0].pending.as_ref() != Some(&expected) {
                return Err(FlowError::invalid_state(
                    pair[0].frame.type_tag(),
                    format!("not waiting on its callee `{}`", pair[1].frame.type_tag()),
                ));
            }
        }
        Ok((header, chain))
    }

    /// Undo a failed pass, newest effect first.
    async fn rollback(&self, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            match step {
                Undo::PutBack { id, claimed } => match self.put_back(id, &claimed).await {
                    Ok(()) => warn!(id = %id, "suspension restored"),
                    Err(e) => {
                        error!(id = %id, error = %e, "could not restore suspension");
                        if let Err(abort) = self.guarded(self.state.abort(id)).await {
                            warn!(id = %id, error = %abort, "abort failed");
                        }
                    }
                },
                Undo::Discard(ids) => self.discard(&ids).await,
                Undo::Unsettle { id, position } => {
                    if let Err(e) = self.guarded(self.state.unsettle_branch(id, position)).await {
                        error!(parent = %id, position, error = %e, "could not reopen branch");
                    }
                }
            }
        }
    }

    /// Store a claimed suspension again under its original id.
    async fn put_back(&self, id: ComputationId, claimed: &Claimed) -> FlowResult<()> {
        for entry in &claimed.entries {
            self.guarded(self.state.push(id, entry.clone())).await?;
        }
        if !claimed.heap.is_empty() {
            self.guarded(self.state.save_heap(id, claimed.heap.clone())).await?;
        }
        if let Some(record) = &claimed.branch {
            self.guarded(self.state.save_branch(id, record.clone())).await?;
        }
        self.guarded(self.state.commit(id)).await
    }

    async fn guarded<T>(&self, op: impl Future<Output = FlowResult<T>>) -> FlowResult<T> {
        let limit = self.config.storage_timeout();
        match timeout(limit, op).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout(limit).into()),
        }
    }
}
