use crate::runtime::error::{FlowError, FlowResult};
use crate::runtime::record::{Heap, HeapEntry, HeapKey, HeapValue};
use anyhow::anyhow;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::{Any, type_name};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub type SharedAny = Arc<dyn Any + Send + Sync>;

/// Portable stand-in for a value that cannot be serialized as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurrogateToken {
    pub type_tag: String,
    pub payload: Value,
}

/// 替身转换器接口
/// 把宿主相关的对象 (例如注入的服务) 替换为可序列化的令牌，并能反向还原。
pub trait Surrogator: Send + Sync {
    fn type_tag(&self) -> &str;
    fn try_surrogate(&self, value: &SharedAny) -> Option<Value>;
    fn restore(&self, payload: &Value) -> anyhow::Result<SharedAny>;
}

fn address(value: &SharedAny) -> usize {
    Arc::as_ptr(value) as *const () as usize
}

/// Chain of surrogators, consulted in registration order.
#[derive(Default, Clone)]
pub struct Marshaler {
    chain: Vec<Arc<dyn Surrogator>>,
}

impl Marshaler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, surrogator: Arc<dyn Surrogator>) {
        self.chain.push(surrogator);
    }

    pub fn with(mut self, surrogator: Arc<dyn Surrogator>) -> Self {
        self.register(surrogator);
        self
    }

    pub fn try_surrogate(&self, value: &SharedAny) -> Option<SurrogateToken> {
        self.chain.iter().find_map(|s| {
            s.try_surrogate(value).map(|payload| SurrogateToken {
                type_tag: s.type_tag().to_string(),
                payload,
            })
        })
    }

    pub fn try_restore(&self, token: &SurrogateToken) -> FlowResult<SharedAny> {
        let surrogator = self
            .chain
            .iter()
            .find(|s| s.type_tag() == token.type_tag)
            .ok_or_else(|| FlowError::UnresolvedSurrogate(token.type_tag.clone()))?;
        surrogator
            .restore(&token.payload)
            .map_err(|e| FlowError::invalid_state(&token.type_tag, format!("surrogate restore failed: {e}")))
    }

    pub fn dehydrator(&self) -> Dehydrator<'_> {
        Dehydrator {
            marshaler: self,
            identity: HashMap::new(),
            pinned: Vec::new(),
            heap: Heap {
                session: Uuid::new_v4(),
                entries: Vec::new(),
            },
        }
    }

    pub fn hydrator(&self, heap: Heap) -> Hydrator<'_> {
        let mut hydrator = Hydrator {
            marshaler: self,
            heaps: HashMap::new(),
            current: heap.session,
            cache: HashMap::new(),
        };
        hydrator.enter(heap);
        hydrator
    }
}

/// Serialization session for everything one flow suspends in a single step:
/// the chain, and for forks the parent plus every waiting child.
/// The identity map lives exactly as long as the session.
pub struct Dehydrator<'a> {
    marshaler: &'a Marshaler,
    identity: HashMap<usize, HeapKey>,
    // Keeps every seen instance alive so addresses stay unique for the session.
    pinned: Vec<SharedAny>,
    heap: Heap,
}

impl Dehydrator<'_> {
    pub fn share<T>(&mut self, field: &str, value: &Arc<T>) -> FlowResult<HeapKey>
    where
        T: Serialize + Send + Sync + 'static,
    {
        let any: SharedAny = value.clone();
        if let Some(key) = self.identity.get(&address(&any)) {
            return Ok(*key);
        }
        let stored = match self.marshaler.try_surrogate(&any) {
            Some(token) => HeapValue::Surrogate(token),
            None => HeapValue::Inline(serde_json::to_value(&**value)?),
        };
        debug!(field, type_name = type_name::<T>(), "shared value written to heap");
        Ok(self.insert(any, type_name::<T>(), stored))
    }

    /// Like `share`, but the value has no serialized form and must be surrogated.
    pub fn service<T>(&mut self, field: &str, value: &Arc<T>) -> FlowResult<HeapKey>
    where
        T: Send + Sync + 'static,
    {
        let any: SharedAny = value.clone();
        if let Some(key) = self.identity.get(&address(&any)) {
            return Ok(*key);
        }
        let token = self
            .marshaler
            .try_surrogate(&any)
            .ok_or_else(|| FlowError::NotPortable(field.to_string()))?;
        Ok(self.insert(any, type_name::<T>(), HeapValue::Surrogate(token)))
    }

    fn insert(&mut self, any: SharedAny, type_tag: &str, value: HeapValue) -> HeapKey {
        let key = HeapKey(self.heap.entries.len() as u32);
        self.identity.insert(address(&any), key);
        self.pinned.push(any);
        self.heap.entries.push(HeapEntry {
            key,
            type_tag: type_tag.to_string(),
            value,
        });
        key
    }

    pub fn finish(self) -> Heap {
        self.heap
    }
}

/// Deserialization session: every field naming the same key of the same heap
/// session gets the same `Arc`.
pub struct Hydrator<'a> {
    marshaler: &'a Marshaler,
    heaps: HashMap<Uuid, Heap>,
    current: Uuid,
    cache: HashMap<(Uuid, HeapKey), SharedAny>,
}

impl Hydrator<'_> {
    /// Read the next frames against `heap`. Objects already restored from the
    /// same heap session are handed out again.
    pub fn enter(&mut self, heap: Heap) {
        self.current = heap.session;
        self.heaps.entry(heap.session).or_insert(heap);
    }

    pub fn share<T>(&mut self, field: &str, key: HeapKey) -> FlowResult<Arc<T>>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let any = match self.cache.get(&(self.current, key)) {
            Some(any) => any.clone(),
            None => {
                let entry = self.entry(field, key)?;
                let any: SharedAny = match &entry.value {
                    HeapValue::Inline(raw) => Arc::new(T::deserialize(raw)?),
                    HeapValue::Surrogate(token) => self.marshaler.try_restore(token)?,
                };
                self.cache.insert((self.current, key), any.clone());
                any
            }
        };
        downcast(field, any)
    }

    pub fn service<T>(&mut self, field: &str, key: HeapKey) -> FlowResult<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let any = match self.cache.get(&(self.current, key)) {
            Some(any) => any.clone(),
            None => {
                let entry = self.entry(field, key)?;
                let any = match &entry.value {
                    HeapValue::Surrogate(token) => self.marshaler.try_restore(token)?,
                    HeapValue::Inline(_) => {
                        return Err(FlowError::invalid_state(
                            &entry.type_tag,
                            format!("field `{field}` expects a surrogated service"),
                        ));
                    }
                };
                self.cache.insert((self.current, key), any.clone());
                any
            }
        };
        downcast(field, any)
    }

    fn entry(&self, field: &str, key: HeapKey) -> FlowResult<&HeapEntry> {
        self.heaps
            .get(&self.current)
            .and_then(|heap| heap.get(key))
            .ok_or_else(|| FlowError::invalid_state(field, format!("dangling heap key {}", key.0)))
    }
}

fn downcast<T: Send + Sync + 'static>(field: &str, any: SharedAny) -> FlowResult<Arc<T>> {
    any.downcast::<T>().map_err(|_| {
        FlowError::invalid_state(field, format!("heap value is not a `{}`", type_name::<T>()))
    })
}

/// Host services known at startup, surrogated by name.
#[derive(Default)]
pub struct ServiceSurrogator {
    services: Vec<(String, SharedAny)>,
}

impl ServiceSurrogator {
    pub const TYPE_TAG: &'static str = "service";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Send + Sync + 'static>(mut self, name: impl Into<String>, service: Arc<T>) -> Self {
        let service: SharedAny = service;
        self.services.push((name.into(), service));
        self
    }
}

impl Surrogator for ServiceSurrogator {
    fn type_tag(&self) -> &str {
        Self::TYPE_TAG
    }

    fn try_surrogate(&self, value: &SharedAny) -> Option<Value> {
        self.services
            .iter()
            .find(|(_, s)| address(s) == address(value))
            .map(|(name, _)| Value::String(name.clone()))
    }

    fn restore(&self, payload: &Value) -> anyhow::Result<SharedAny> {
        let name = payload.as_str().ok_or_else(|| anyhow!("service token must be a name"))?;
        self.services
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s.clone())
            .ok_or_else(|| anyhow!("service `{}` is not registered", name))
    }
}

type ToToken<T> = Box<dyn Fn(&T) -> Option<Value> + Send + Sync>;
type FromToken<T> = Box<dyn Fn(&Value) -> anyhow::Result<T> + Send + Sync>;

/// Surrogator for one concrete type built from a pair of closures.
pub struct FnSurrogator<T> {
    tag: String,
    to_token: ToToken<T>,
    from_token: FromToken<T>,
}

impl<T: Send + Sync + 'static> FnSurrogator<T> {
    pub fn new(
        tag: impl Into<String>,
        to_token: impl Fn(&T) -> Option<Value> + Send + Sync + 'static,
        from_token: impl Fn(&Value) -> anyhow::Result<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            tag: tag.into(),
            to_token: Box::new(to_token),
            from_token: Box::new(from_token),
        }
    }
}

impl<T: Send + Sync + 'static> Surrogator for FnSurrogator<T> {
    fn type_tag(&self) -> &str {
        &self.tag
    }

    fn try_surrogate(&self, value: &SharedAny) -> Option<Value> {
        value.downcast_ref::<T>().and_then(|v| (self.to_token)(v))
    }

    fn restore(&self, payload: &Value) -> anyhow::Result<SharedAny> {
        Ok(Arc::new((self.from_token)(payload)?))
    }
}
