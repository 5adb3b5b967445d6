pub mod runtime;
pub mod frames;

pub use runtime::codec::{DurableFrame, FrameCodec, FrameReader, FrameWriter, TypedCodec};
pub use runtime::config::OrchestratorConfig;
pub use runtime::error::{ErrorKind, Fault, FlowError, FlowResult, StorageError};
pub use runtime::frame::{AwaitSite, CallbackHandle, Frame, Operation, Outcome, PendingMarker, Resume, Step};
pub use runtime::host::{FlowHost, FlowState, Suspension};
pub use runtime::id::{ComputationId, IdGenerator, IdScope, UuidGenerator};
pub use runtime::marshal::{FnSurrogator, Marshaler, ServiceSurrogator, Surrogator};
pub use runtime::orchestrator::Orchestrator;
pub use runtime::registry::CodecRegistry;
pub use runtime::storage::{Claimed, InMemoryStateManager, StateManager};
