pub mod common;
pub mod suspend;

use crate::runtime::registry::CodecRegistry;

pub use common::{Constant, Fail};
pub use suspend::{AwaitCallback, Checkpoint, Sleep};

pub fn register_builtin_frames(registry: &mut CodecRegistry) {
    registry.register::<Constant>();
    registry.register::<Fail>();
    registry.register::<Checkpoint>();
    registry.register::<Sleep>();
    registry.register::<AwaitCallback>();
}
