use crate::runtime::codec::{DurableFrame, FrameCodec, TypedCodec};
use crate::runtime::error::{FlowError, FlowResult};
use dashmap::DashMap;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// 帧定义 (编解码器工厂)
pub trait FrameDefinition: Send + Sync {
    fn name(&self) -> &str;
    fn prepare(&self) -> FlowResult<Arc<dyn FrameCodec>>;
}

pub struct TypedDefinition<F>(PhantomData<fn() -> F>);

impl<F> TypedDefinition<F> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<F> Default for TypedDefinition<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: DurableFrame> FrameDefinition for TypedDefinition<F> {
    fn name(&self) -> &str {
        F::TYPE_TAG
    }

    fn prepare(&self) -> FlowResult<Arc<dyn FrameCodec>> {
        Ok(Arc::new(TypedCodec::<F>::new()))
    }
}

/// Registration table of frame types, built at startup.
/// Codecs are prepared on first use and cached.
#[derive(Default)]
pub struct CodecRegistry {
    definitions: HashMap<String, Box<dyn FrameDefinition>>,
    codecs: DashMap<String, Arc<dyn FrameCodec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F: DurableFrame>(&mut self) {
        self.register_definition(Box::new(TypedDefinition::<F>::new()));
    }

    pub fn register_definition(&mut self, definition: Box<dyn FrameDefinition>) {
        let name = definition.name().to_string();
        self.codecs.remove(&name);
        self.definitions.insert(name, definition);
    }

    pub fn codec(&self, type_tag: &str) -> FlowResult<Arc<dyn FrameCodec>> {
        if let Some(codec) = self.codecs.get(type_tag) {
            return Ok(codec.clone());
        }

        let definition = self
            .definitions
            .get(type_tag)
            .ok_or_else(|| FlowError::UnknownFrameType(type_tag.to_string()))?;

        // The entry holds the shard lock while preparing, so concurrent first
        // lookups of one tag build it once and the rest reuse the result.
        let codec = self
            .codecs
            .entry(type_tag.to_string())
            .or_try_insert_with(|| {
                debug!(frame = type_tag, "preparing frame codec");
                definition.prepare()
            })?
            .clone();
        Ok(codec)
    }
}
