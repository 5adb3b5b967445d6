use crate::runtime::error::{FlowError, FlowResult};
use crate::runtime::frame::{AwaitSite, Frame, PendingMarker};
use crate::runtime::marshal::{Dehydrator, Hydrator};
use crate::runtime::record::{FieldValue, FrameRecord};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// 帧编解码器接口
/// 每种帧类型一个，负责把挂起的帧转换为记录，或者从记录重建帧。
pub trait FrameCodec: Send + Sync {
    fn type_tag(&self) -> &str;

    /// Whether a persisted frame of this type may be paused on `marker`.
    fn accepts(&self, marker: &PendingMarker) -> bool;

    /// Write every local field once and return the frame's resumption point.
    fn suspend(&self, frame: &dyn Frame, writer: &mut FrameWriter<'_, '_>) -> FlowResult<u32>;

    /// Rebuild a frame positioned at `resume_point`.
    fn resume(&self, resume_point: u32, reader: &mut FrameReader<'_, '_>) -> FlowResult<Box<dyn Frame>>;
}

pub struct FrameWriter<'a, 'm> {
    type_tag: &'a str,
    fields: Vec<(String, FieldValue)>,
    dehydrator: &'a mut Dehydrator<'m>,
}

impl<'a, 'm> FrameWriter<'a, 'm> {
    pub fn new(type_tag: &'a str, dehydrator: &'a mut Dehydrator<'m>) -> Self {
        Self {
            type_tag,
            fields: Vec::new(),
            dehydrator,
        }
    }

    pub fn field<T: Serialize>(&mut self, name: &str, value: &T) -> FlowResult<()> {
        let value = serde_json::to_value(value)?;
        self.push(name, FieldValue::Value(value))
    }

    /// Shared object; every field pointing at the same instance is written once.
    pub fn shared<T>(&mut self, name: &str, value: &Arc<T>) -> FlowResult<()>
    where
        T: Serialize + Send + Sync + 'static,
    {
        let key = self.dehydrator.share(name, value)?;
        self.push(name, FieldValue::Shared(key))
    }

    /// Host object that only crosses the boundary as a surrogate token.
    pub fn service<T>(&mut self, name: &str, value: &Arc<T>) -> FlowResult<()>
    where
        T: Send + Sync + 'static,
    {
        let key = self.dehydrator.service(name, value)?;
        self.push(name, FieldValue::Shared(key))
    }

    fn push(&mut self, name: &str, value: FieldValue) -> FlowResult<()> {
        if self.fields.iter().any(|(n, _)| n == name) {
            return Err(FlowError::invalid_state(
                self.type_tag,
                format!("field `{name}` written twice"),
            ));
        }
        self.fields.push((name.to_string(), value));
        Ok(())
    }

    fn into_fields(self) -> Vec<(String, FieldValue)> {
        self.fields
    }
}

pub struct FrameReader<'a, 'm> {
    type_tag: &'a str,
    fields: Vec<(String, FieldValue)>,
    hydrator: &'a mut Hydrator<'m>,
}

impl<'a, 'm> FrameReader<'a, 'm> {
    pub fn new(type_tag: &'a str, fields: Vec<(String, FieldValue)>, hydrator: &'a mut Hydrator<'m>) -> Self {
        Self {
            type_tag,
            fields,
            hydrator,
        }
    }

    pub fn field<T: DeserializeOwned>(&mut self, name: &str) -> FlowResult<T> {
        match self.take(name)? {
            FieldValue::Value(raw) => Ok(serde_json::from_value(raw)?),
            FieldValue::Shared(_) => Err(self.mismatch(name, "a plain value")),
        }
    }

    pub fn shared<T>(&mut self, name: &str) -> FlowResult<Arc<T>>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        match self.take(name)? {
            FieldValue::Shared(key) => self.hydrator.share(name, key),
            FieldValue::Value(_) => Err(self.mismatch(name, "a heap reference")),
        }
    }

    pub fn service<T>(&mut self, name: &str) -> FlowResult<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        match self.take(name)? {
            FieldValue::Shared(key) => self.hydrator.service(name, key),
            FieldValue::Value(_) => Err(self.mismatch(name, "a surrogated service")),
        }
    }

    fn take(&mut self, name: &str) -> FlowResult<FieldValue> {
        let idx = self
            .fields
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| FlowError::invalid_state(self.type_tag, format!("missing field `{name}`")))?;
        Ok(self.fields.remove(idx).1)
    }

    fn mismatch(&self, name: &str, expected: &str) -> FlowError {
        FlowError::invalid_state(self.type_tag, format!("field `{name}` is not {expected}"))
    }

    /// Fields the codec did not read mean the record and the type disagree.
    fn finish(self) -> FlowResult<()> {
        match self.fields.first() {
            None => Ok(()),
            Some((name, _)) => Err(FlowError::invalid_state(
                self.type_tag,
                format!("unexpected field `{name}`"),
            )),
        }
    }
}

/// Typed half of a codec. Usually generated with [`durable_frame!`](crate::durable_frame).
pub trait DurableFrame: Frame + Sized {
    const TYPE_TAG: &'static str;
    const AWAITS: &'static [AwaitSite];

    fn resume_point(&self) -> u32;
    fn set_resume_point(&mut self, point: u32);
    fn write_fields(&self, writer: &mut FrameWriter<'_, '_>) -> FlowResult<()>;
    fn read_fields(reader: &mut FrameReader<'_, '_>) -> FlowResult<Self>;
}

pub struct TypedCodec<F>(PhantomData<fn() -> F>);

impl<F> TypedCodec<F> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<F> Default for TypedCodec<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: DurableFrame> FrameCodec for TypedCodec<F> {
    fn type_tag(&self) -> &str {
        F::TYPE_TAG
    }

    fn accepts(&self, marker: &PendingMarker) -> bool {
        F::AWAITS.iter().any(|site| site.matches(marker))
    }

    fn suspend(&self, frame: &dyn Frame, writer: &mut FrameWriter<'_, '_>) -> FlowResult<u32> {
        let typed = frame.as_any().downcast_ref::<F>().ok_or_else(|| {
            FlowError::invalid_state(F::TYPE_TAG, format!("codec cannot suspend a `{}` frame", frame.type_tag()))
        })?;
        typed.write_fields(writer)?;
        Ok(typed.resume_point())
    }

    fn resume(&self, resume_point: u32, reader: &mut FrameReader<'_, '_>) -> FlowResult<Box<dyn Frame>> {
        let mut frame = F::read_fields(reader)?;
        frame.set_resume_point(resume_point);
        Ok(Box::new(frame))
    }
}

/// Serialize one paused frame. `pending` is the operation it is waiting on.
pub fn suspend_frame(
    codec: &dyn FrameCodec,
    frame: &dyn Frame,
    pending: PendingMarker,
    dehydrator: &mut Dehydrator<'_>,
) -> FlowResult<FrameRecord> {
    let type_tag = codec.type_tag().to_string();
    let mut writer = FrameWriter::new(&type_tag, dehydrator);
    let resume_point = codec.suspend(frame, &mut writer)?;
    let fields = writer.into_fields();
    debug!(frame = %type_tag, resume_point, fields = fields.len(), "frame suspended");
    Ok(FrameRecord {
        type_tag,
        resume_point,
        pending: Some(pending),
        fields,
    })
}

/// A frame rebuilt from its record, still waiting on its pending operation.
#[derive(Debug)]
pub struct ResumedFrame {
    pub pending: PendingMarker,
    pub frame: Box<dyn Frame>,
}

pub fn resume_frame(
    codec: &dyn FrameCodec,
    record: FrameRecord,
    hydrator: &mut Hydrator<'_>,
) -> FlowResult<ResumedFrame> {
    let FrameRecord {
        type_tag,
        resume_point,
        pending,
        fields,
    } = record;
    if type_tag != codec.type_tag() {
        return Err(FlowError::invalid_state(
            &type_tag,
            format!("record decoded with the `{}` codec", codec.type_tag()),
        ));
    }
    let pending = pending.ok_or_else(|| FlowError::invalid_state(&type_tag, "no pending operation"))?;
    if !codec.accepts(&pending) {
        return Err(FlowError::invalid_state(
            &type_tag,
            format!("pending operation {pending:?} is unknown to this frame type"),
        ));
    }
    let mut reader = FrameReader::new(&type_tag, fields, hydrator);
    let frame = codec.resume(resume_point, &mut reader)?;
    reader.finish()?;
    debug!(frame = %type_tag, resume_point, "frame resumed");
    Ok(ResumedFrame { pending, frame })
}

/// Implements [`DurableFrame`] and [`Frame`] for a struct from its field list.
///
/// The struct must consist of exactly the resumption-point field plus the listed
/// fields, and provide an inherent `fn run(&mut self, input: Resume) -> Step`.
///
/// ```ignore
/// durable_frame!(Checkout, tag = "checkout", point = state,
///     awaits = [AwaitSite::Call("charge"), AwaitSite::Yield],
///     fields = [order_id, total],
///     shared = [cart],
///     services = [mailer]);
/// ```
#[macro_export]
macro_rules! durable_frame {
    (
        $ty:ident,
        tag = $tag:literal,
        point = $point:ident,
        awaits = [$($site:expr),* $(,)?],
        fields = [$($field:ident),* $(,)?]
        $(, shared = [$($shared:ident),* $(,)?])?
        $(, services = [$($svc:ident),* $(,)?])?
        $(,)?
    ) => {
        impl $crate::runtime::frame::Frame for $ty {
            fn type_tag(&self) -> &str {
                $tag
            }

            fn step(&mut self, input: $crate::runtime::frame::Resume) -> $crate::runtime::frame::Step {
                self.run(input)
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }
        }

        impl $crate::runtime::codec::DurableFrame for $ty {
            const TYPE_TAG: &'static str = $tag;
            const AWAITS: &'static [$crate::runtime::frame::AwaitSite] = &[$($site),*];

            fn resume_point(&self) -> u32 {
                self.$point
            }

            fn set_resume_point(&mut self, point: u32) {
                self.$point = point;
            }

            #[allow(unused_variables)]
            fn write_fields(
                &self,
                writer: &mut $crate::runtime::codec::FrameWriter<'_, '_>,
            ) -> $crate::runtime::error::FlowResult<()> {
                $(writer.field(stringify!($field), &self.$field)?;)*
                $($(writer.shared(stringify!($shared), &self.$shared)?;)*)?
                $($(writer.service(stringify!($svc), &self.$svc)?;)*)?
                Ok(())
            }

            #[allow(unused_variables)]
            fn read_fields(
                reader: &mut $crate::runtime::codec::FrameReader<'_, '_>,
            ) -> $crate::runtime::error::FlowResult<Self> {
                Ok(Self {
                    $point: 0,
                    $($field: reader.field(stringify!($field))?,)*
                    $($($shared: reader.shared(stringify!($shared))?,)*)?
                    $($($svc: reader.service(stringify!($svc))?,)*)?
                })
            }
        }
    };
}
