//! Values flowing through the catalog.
//!
//! A [`Payload`] is a single element, either as it arrives on the wire (bytes or text) or
//! after decoding into the element type a callable declared. [`Data`] is what a callable
//! actually consumes and produces: one payload, or a stream of them.

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::fmt;

use crate::core::descriptor::ElementType;
use crate::core::error::{BoxError, CatalogError, ConversionError};

/// The Alias for serde_json::Value, used for structured records
pub type RecordValue = serde_json::Value;

/// A stream of elements. Errors travel in-band so element-wise failures keep ordering.
pub type PayloadStream = BoxStream<'static, Result<Payload, CatalogError>>;

/// A single element.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Bytes),
    Text(String),
    Record(RecordValue),
}

impl Payload {
    /// The element type this payload currently holds.
    pub fn element_type(&self) -> ElementType {
        match self {
            Payload::Bytes(_) => ElementType::Bytes,
            Payload::Text(_) => ElementType::Text,
            Payload::Record(_) => ElementType::Record,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Coerces this payload into `target`, used between composite segments.
    ///
    /// Text and bytes convert through UTF-8, records through their JSON form.
    /// `ElementType::Unknown` accepts anything unchanged.
    pub fn coerce(self, target: ElementType) -> Result<Payload, ConversionError> {
        match (self, target) {
            (p, ElementType::Unknown) => Ok(p),
            (p @ Payload::Bytes(_), ElementType::Bytes) => Ok(p),
            (p @ Payload::Text(_), ElementType::Text) => Ok(p),
            (p @ Payload::Record(_), ElementType::Record) => Ok(p),
            (Payload::Text(s), ElementType::Bytes) => Ok(Payload::Bytes(Bytes::from(s))),
            (Payload::Bytes(b), ElementType::Text) => utf8(b).map(Payload::Text),
            (Payload::Record(RecordValue::String(s)), ElementType::Text) => Ok(Payload::Text(s)),
            (Payload::Record(v), ElementType::Text) => Ok(Payload::Text(v.to_string())),
            (Payload::Record(v), ElementType::Bytes) => serde_json::to_vec(&v)
                .map(|b| Payload::Bytes(Bytes::from(b)))
                .map_err(|e| ConversionError::json("application/json", e)),
            (Payload::Text(s), ElementType::Record) => Ok(Payload::Record(
                serde_json::from_str(&s).unwrap_or(RecordValue::String(s)),
            )),
            (Payload::Bytes(b), ElementType::Record) => serde_json::from_slice(&b)
                .map(Payload::Record)
                .map_err(|e| ConversionError::json("application/json", e)),
        }
    }
}

pub(crate) fn utf8(bytes: Bytes) -> Result<String, ConversionError> {
    String::from_utf8(bytes.to_vec()).map_err(|e| ConversionError::Utf8(e.to_string()))
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Payload::Text(s) => f.write_str(s),
            Payload::Record(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Payload::Bytes(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(value))
    }
}

impl From<RecordValue> for Payload {
    fn from(value: RecordValue) -> Self {
        Payload::Record(value)
    }
}

/// Input or output of a callable: a single element or a sequence of elements.
pub enum Data {
    Single(Payload),
    Stream(PayloadStream),
}

impl Data {
    /// Builds a stream from already available elements, preserving their order.
    pub fn stream_of<I, P>(items: I) -> Data
    where
        I: IntoIterator<Item = P>,
        P: Into<Payload>,
    {
        let items: Vec<Payload> = items.into_iter().map(Into::into).collect();
        Data::Stream(stream::iter(items.into_iter().map(Ok::<Payload, CatalogError>)).boxed())
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Data::Stream(_))
    }

    /// Returns the single payload, or `None` for a stream.
    pub fn into_single(self) -> Option<Payload> {
        match self {
            Data::Single(p) => Some(p),
            Data::Stream(_) => None,
        }
    }

    /// Turns a single value into a one-element stream; streams pass through.
    pub fn into_stream(self) -> PayloadStream {
        match self {
            Data::Single(p) => stream::once(async move { Ok::<Payload, CatalogError>(p) }).boxed(),
            Data::Stream(s) => s,
        }
    }

    /// Drains the data into a vector, stopping at the first failed element.
    pub async fn collect(self) -> Result<Vec<Payload>, CatalogError> {
        match self {
            Data::Single(p) => Ok(vec![p]),
            Data::Stream(mut s) => {
                let mut out = Vec::new();
                while let Some(item) = s.next().await {
                    out.push(item?);
                }
                Ok(out)
            }
        }
    }
}

/// Ends `stream` right after its first failed element. Dropping the rest releases the source.
pub(crate) fn stop_after_error(stream: PayloadStream) -> PayloadStream {
    stream
        .scan(false, |failed, item| {
            if *failed {
                return futures::future::ready(None);
            }
            *failed = item.is_err();
            futures::future::ready(Some(item))
        })
        .boxed()
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Data::Single(p) => f.debug_tuple("Single").field(p).finish(),
            Data::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

macro_rules! single_data_from {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Data {
                fn from(value: $t) -> Self {
                    Data::Single(value.into())
                }
            }
        )*
    };
}

single_data_from!(Payload, &str, String, Bytes, Vec<u8>, RecordValue);

/// Bridges typed Rust values and [`Payload`]s for the typed registration helpers.
pub trait Element: Sized + Send + 'static {
    /// The element type a callable taking or returning `Self` declares.
    const TYPE: ElementType;

    fn from_payload(payload: Payload) -> Result<Self, BoxError>;

    fn into_payload(self) -> Payload;
}

impl Element for String {
    const TYPE: ElementType = ElementType::Text;

    fn from_payload(payload: Payload) -> Result<Self, BoxError> {
        match payload.coerce(ElementType::Text)? {
            Payload::Text(s) => Ok(s),
            other => Err(unexpected(&other, ElementType::Text)),
        }
    }

    fn into_payload(self) -> Payload {
        Payload::Text(self)
    }
}

impl Element for Bytes {
    const TYPE: ElementType = ElementType::Bytes;

    fn from_payload(payload: Payload) -> Result<Self, BoxError> {
        match payload.coerce(ElementType::Bytes)? {
            Payload::Bytes(b) => Ok(b),
            other => Err(unexpected(&other, ElementType::Bytes)),
        }
    }

    fn into_payload(self) -> Payload {
        Payload::Bytes(self)
    }
}

impl Element for Vec<u8> {
    const TYPE: ElementType = ElementType::Bytes;

    fn from_payload(payload: Payload) -> Result<Self, BoxError> {
        Bytes::from_payload(payload).map(|b| b.to_vec())
    }

    fn into_payload(self) -> Payload {
        Payload::Bytes(Bytes::from(self))
    }
}

impl Element for RecordValue {
    const TYPE: ElementType = ElementType::Record;

    fn from_payload(payload: Payload) -> Result<Self, BoxError> {
        match payload.coerce(ElementType::Record)? {
            Payload::Record(v) => Ok(v),
            other => Err(unexpected(&other, ElementType::Record)),
        }
    }

    fn into_payload(self) -> Payload {
        Payload::Record(self)
    }
}

impl Element for Payload {
    const TYPE: ElementType = ElementType::Unknown;

    fn from_payload(payload: Payload) -> Result<Self, BoxError> {
        Ok(payload)
    }

    fn into_payload(self) -> Payload {
        self
    }
}

fn unexpected(payload: &Payload, to: ElementType) -> BoxError {
    Box::new(ConversionError::Incompatible {
        from: payload.element_type().to_string(),
        to,
    })
}
