pub mod id;
pub mod error;
pub mod frame;
pub mod record;
pub mod marshal;
pub mod codec;
pub mod registry;
pub mod branch;
pub mod storage;
pub mod redis_storage;
pub mod host;
pub mod config;
pub mod orchestrator;
