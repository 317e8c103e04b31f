//! Content negotiation: picking the converter that adapts wire payloads to the element
//! type a callable declared, and back.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::StreamExt;

use crate::core::descriptor::{ElementType, Shape};
use crate::core::error::{CatalogError, ConversionError, Result};
use crate::core::payload::{Data, Payload, RecordValue};

pub const APPLICATION_JSON: &str = "application/json";
pub const TEXT_PLAIN: &str = "text/plain";
pub const OCTET_STREAM: &str = "application/octet-stream";

/// A symmetric encode/decode pair between wire payloads and in-memory elements.
///
/// Both directions are always implemented so any converter can be round-trip tested.
pub trait Converter: Send + Sync + fmt::Debug {
    /// The media type this converter produces.
    fn content_type(&self) -> &str;

    /// Wire payload (bytes or text) into the element type.
    fn decode(&self, raw: Payload) -> Result<Payload, ConversionError>;

    /// Element back into its wire form.
    fn encode(&self, value: Payload) -> Result<Payload, ConversionError>;
}

/// Builds a converter for a given element type.
pub type ConverterFactory = Arc<dyn Fn(ElementType) -> Arc<dyn Converter> + Send + Sync>;

/// Leaves payloads untouched in both directions.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityConverter;

impl Converter for IdentityConverter {
    fn content_type(&self) -> &str {
        "*/*"
    }

    fn decode(&self, raw: Payload) -> Result<Payload, ConversionError> {
        Ok(raw)
    }

    fn encode(&self, value: Payload) -> Result<Payload, ConversionError> {
        Ok(value)
    }
}

/// `application/json`. Raw bytes pass through untouched, as does anything the callable
/// declares as bytes.
///
/// For an [`ElementType::Unknown`] element every JSON document decodes to a record, so
/// text encoded here comes back as a string record holding the same characters.
#[derive(Debug, Clone, Copy)]
pub struct JsonConverter {
    element: ElementType,
}

impl JsonConverter {
    pub fn new(element: ElementType) -> Self {
        Self { element }
    }

    fn parse(&self, raw: &Payload) -> Result<RecordValue, ConversionError> {
        match raw {
            Payload::Text(s) => serde_json::from_str(s),
            Payload::Bytes(b) => serde_json::from_slice(b),
            Payload::Record(v) => Ok(v.clone()),
        }
        .map_err(|e| ConversionError::json(APPLICATION_JSON, e))
    }
}

impl Converter for JsonConverter {
    fn content_type(&self) -> &str {
        APPLICATION_JSON
    }

    fn decode(&self, raw: Payload) -> Result<Payload, ConversionError> {
        match self.element {
            ElementType::Bytes => raw.coerce(ElementType::Bytes),
            ElementType::Record => self.parse(&raw).map(Payload::Record),
            ElementType::Text => match self.parse(&raw) {
                Ok(RecordValue::String(s)) => Ok(Payload::Text(s)),
                Ok(_) => raw.coerce(ElementType::Text),
                Err(_) => {
                    log::debug!("Input is not JSON, passing it to a text function as is");
                    raw.coerce(ElementType::Text)
                }
            },
            ElementType::Unknown => match self.parse(&raw) {
                Ok(value) => Ok(Payload::Record(value)),
                Err(_) => Ok(raw),
            },
        }
    }

    fn encode(&self, value: Payload) -> Result<Payload, ConversionError> {
        match value {
            Payload::Bytes(b) => Ok(Payload::Bytes(b)),
            Payload::Text(s) => serde_json::to_string(&s)
                .map(Payload::Text)
                .map_err(|e| ConversionError::json(APPLICATION_JSON, e)),
            Payload::Record(v) => Ok(Payload::Text(v.to_string())),
        }
    }
}

/// `text/plain`: text on the wire, coerced into the element type.
///
/// Records are written in their JSON form and parsed back leniently, so a string record
/// keeps its type. Bytes must be UTF-8 to be written as text.
#[derive(Debug, Clone, Copy)]
pub struct TextConverter {
    element: ElementType,
}

impl TextConverter {
    pub fn new(element: ElementType) -> Self {
        Self { element }
    }
}

impl Converter for TextConverter {
    fn content_type(&self) -> &str {
        TEXT_PLAIN
    }

    fn decode(&self, raw: Payload) -> Result<Payload, ConversionError> {
        raw.coerce(self.element)
    }

    fn encode(&self, value: Payload) -> Result<Payload, ConversionError> {
        match value {
            Payload::Record(v) => Ok(Payload::Text(v.to_string())),
            other => other.coerce(ElementType::Text),
        }
    }
}

/// `application/octet-stream`: bytes on the wire. Also the fallback for text and bytes
/// callables when the requested media type is not recognized.
#[derive(Debug, Clone, Copy)]
pub struct BytesConverter {
    element: ElementType,
}

impl BytesConverter {
    pub fn new(element: ElementType) -> Self {
        Self { element }
    }
}

impl Converter for BytesConverter {
    fn content_type(&self) -> &str {
        OCTET_STREAM
    }

    fn decode(&self, raw: Payload) -> Result<Payload, ConversionError> {
        match (raw, self.element) {
            (Payload::Text(s), ElementType::Record) => {
                Payload::Bytes(Bytes::from(s)).coerce(ElementType::Record)
            }
            (raw, element) => raw.coerce(element),
        }
    }

    fn encode(&self, value: Payload) -> Result<Payload, ConversionError> {
        value.coerce(ElementType::Bytes)
    }
}

/// A negotiated converter applied to [`Data`].
///
/// Streams are converted one element at a time, in order.
#[derive(Debug, Clone)]
pub struct DataConverter {
    converter: Arc<dyn Converter>,
}

impl DataConverter {
    pub fn new(converter: Arc<dyn Converter>) -> Self {
        Self { converter }
    }

    pub fn identity() -> Self {
        Self::new(Arc::new(IdentityConverter))
    }

    pub fn converter(&self) -> &Arc<dyn Converter> {
        &self.converter
    }

    pub fn content_type(&self) -> &str {
        self.converter.content_type()
    }

    pub fn decode_data<W>(&self, data: Data, wrap: W) -> Result<Data>
    where
        W: Fn(ConversionError) -> CatalogError + Send + Sync + 'static,
    {
        match data {
            Data::Single(p) => self.converter.decode(p).map(Data::Single).map_err(wrap),
            Data::Stream(s) => {
                let converter = self.converter.clone();
                Ok(Data::Stream(
                    s.map(move |item| item.and_then(|p| converter.decode(p).map_err(&wrap)))
                        .boxed(),
                ))
            }
        }
    }

    pub fn encode_data<W>(&self, data: Data, wrap: W) -> Result<Data>
    where
        W: Fn(ConversionError) -> CatalogError + Send + Sync + 'static,
    {
        match data {
            Data::Single(p) => self.converter.encode(p).map(Data::Single).map_err(wrap),
            Data::Stream(s) => {
                let converter = self.converter.clone();
                Ok(Data::Stream(
                    s.map(move |item| item.and_then(|p| converter.encode(p).map_err(&wrap)))
                        .boxed(),
                ))
            }
        }
    }
}

/// Strips parameters and case: `Application/JSON; charset=utf-8` → `application/json`.
pub fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Selects converters by media type. Custom factories take precedence over the built-in
/// JSON, text and bytes converters.
#[derive(Clone)]
pub struct ContentNegotiator {
    factories: Vec<(String, ConverterFactory)>,
}

impl fmt::Debug for ContentNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentNegotiator")
            .field(
                "media_types",
                &self.factories.iter().map(|(m, _)| m.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Default for ContentNegotiator {
    fn default() -> Self {
        let mut negotiator = ContentNegotiator {
            factories: Vec::new(),
        };
        negotiator.factories.push((
            APPLICATION_JSON.to_string(),
            Arc::new(|e: ElementType| Arc::new(JsonConverter::new(e)) as Arc<dyn Converter>),
        ));
        negotiator.factories.push((
            TEXT_PLAIN.to_string(),
            Arc::new(|e: ElementType| Arc::new(TextConverter::new(e)) as Arc<dyn Converter>),
        ));
        negotiator.factories.push((
            OCTET_STREAM.to_string(),
            Arc::new(|e: ElementType| Arc::new(BytesConverter::new(e)) as Arc<dyn Converter>),
        ));
        negotiator
    }
}

impl ContentNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a converter for `media_type`, ahead of the existing ones.
    pub fn register<F>(&mut self, media_type_name: &str, factory: F)
    where
        F: Fn(ElementType) -> Arc<dyn Converter> + Send + Sync + 'static,
    {
        self.factories
            .insert(0, (media_type(media_type_name), Arc::new(factory)));
    }

    pub fn supports(&self, content_type: &str) -> bool {
        self.factory_for(&media_type(content_type)).is_some()
    }

    fn factory_for(&self, media: &str) -> Option<&ConverterFactory> {
        if let Some((_, f)) = self.factories.iter().find(|(m, _)| m == media) {
            return Some(f);
        }
        if media == "*/*" {
            return self.factories.first().map(|(_, f)| f);
        }
        // Structured syntax suffix, e.g. application/cloudevents+json
        if media.ends_with("+json") {
            return self
                .factories
                .iter()
                .find(|(m, _)| m == APPLICATION_JSON)
                .map(|(_, f)| f);
        }
        None
    }

    /// Picks the converter adapting `content_type` to `shape`.
    ///
    /// Unknown media types fall back to byte passthrough for text and byte shapes and
    /// fail for everything else.
    pub fn negotiate(&self, shape: Shape, content_type: &str) -> Result<DataConverter> {
        let media = media_type(content_type);
        let converter = match self.factory_for(&media) {
            Some(factory) => factory(shape.element),
            None if matches!(shape.element, ElementType::Bytes | ElementType::Text) => {
                log::debug!(
                    "No converter for '{}', falling back to byte passthrough for {} values",
                    content_type,
                    shape.element
                );
                Arc::new(BytesConverter::new(shape.element))
            }
            None => {
                return Err(CatalogError::UnsupportedContentType {
                    content_type: content_type.to_string(),
                    element: shape.element,
                });
            }
        };
        log::debug!(
            "Negotiated {} for {} {} values",
            converter.content_type(),
            if shape.stream { "stream of" } else { "single" },
            shape.element
        );
        Ok(DataConverter::new(converter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wrap(e: ConversionError) -> CatalogError {
        CatalogError::InputConversion {
            definition: "test".into(),
            segment: None,
            source: e,
        }
    }

    #[test]
    fn test_json_text_decodes_quoted_string() {
        let c = JsonConverter::new(ElementType::Text);
        assert_eq!(c.decode("\"oleg\"".into()).unwrap(), Payload::from("oleg"));
        assert_eq!(c.encode("OLEG".into()).unwrap(), Payload::from("\"OLEG\""));
        // Lenient for plain text
        assert_eq!(c.decode("oleg".into()).unwrap(), Payload::from("oleg"));
    }

    #[test]
    fn test_json_record_rejects_invalid() {
        let c = JsonConverter::new(ElementType::Record);
        let err = c.decode("{not json".into()).unwrap_err();
        assert!(matches!(err, ConversionError::Json { .. }));
        assert_eq!(
            c.decode(Payload::from(br#"{"a":1}"#.to_vec())).unwrap(),
            Payload::Record(json!({"a": 1}))
        );
    }

    #[test]
    fn test_round_trips() {
        let record = Payload::Record(json!({"name": "oleg", "tags": [1, 2, 3], "ok": true}));
        let text = Payload::from("héllo \"world\"");
        let bytes = Payload::from(vec![0u8, 159, 146, 150]);
        // Strings that would parse as other JSON values
        let quoted_number = Payload::Record(json!("42"));
        let quoted_bool = Payload::Record(json!("true"));
        let quoted_object = Payload::Record(json!("{\"a\":1}"));

        let cases: Vec<(Arc<dyn Converter>, Vec<Payload>)> = vec![
            (
                Arc::new(JsonConverter::new(ElementType::Text)),
                vec![text.clone()],
            ),
            (
                Arc::new(JsonConverter::new(ElementType::Record)),
                vec![record.clone()],
            ),
            (
                Arc::new(JsonConverter::new(ElementType::Bytes)),
                vec![bytes.clone()],
            ),
            (
                Arc::new(BytesConverter::new(ElementType::Text)),
                vec![text.clone()],
            ),
            (
                Arc::new(BytesConverter::new(ElementType::Record)),
                vec![record.clone()],
            ),
            (
                Arc::new(BytesConverter::new(ElementType::Bytes)),
                vec![bytes.clone()],
            ),
            (
                Arc::new(TextConverter::new(ElementType::Text)),
                vec![text.clone()],
            ),
            (
                Arc::new(TextConverter::new(ElementType::Record)),
                vec![record.clone(), quoted_number.clone(), quoted_bool, quoted_object],
            ),
            (
                Arc::new(BytesConverter::new(ElementType::Record)),
                vec![quoted_number],
            ),
            (Arc::new(IdentityConverter), vec![record, text, bytes]),
        ];
        for (converter, values) in cases {
            for value in values {
                let encoded = converter.encode(value.clone()).unwrap();
                assert_eq!(converter.decode(encoded).unwrap(), value, "{converter:?}");
            }
        }
    }

    #[test]
    fn test_text_converter_writes_records_as_json() {
        let c = TextConverter::new(ElementType::Record);
        assert_eq!(c.encode(Payload::Record(json!("42"))).unwrap(), Payload::from("\"42\""));
        assert_eq!(c.encode(Payload::Record(json!(42))).unwrap(), Payload::from("42"));
        // Plain text still decodes to a string record
        assert_eq!(c.decode("hello".into()).unwrap(), Payload::Record(json!("hello")));
    }

    #[test]
    fn test_non_utf8_bytes_cannot_be_written_as_text() {
        let c = TextConverter::new(ElementType::Bytes);
        let err = c.encode(Payload::from(vec![0xff, 0xfe])).unwrap_err();
        assert!(matches!(err, ConversionError::Utf8(_)));
        // Valid UTF-8 survives the trip
        let bytes = Payload::from(b"plain".to_vec());
        assert_eq!(c.decode(c.encode(bytes.clone()).unwrap()).unwrap(), bytes);
        // Octet streams carry any bytes
        let raw = Payload::from(vec![0xff, 0xfe]);
        let c = BytesConverter::new(ElementType::Bytes);
        assert_eq!(c.decode(c.encode(raw.clone()).unwrap()).unwrap(), raw);
    }

    #[test]
    fn test_unknown_element_decodes_json_to_records() {
        let c = JsonConverter::new(ElementType::Unknown);
        let encoded = c.encode(Payload::from("abc")).unwrap();
        assert_eq!(encoded, Payload::from("\"abc\""));
        let decoded = c.decode(encoded).unwrap();
        assert_eq!(decoded, Payload::Record(json!("abc")));
        assert_eq!(decoded.coerce(ElementType::Text).unwrap(), Payload::from("abc"));
        // Records round-trip as they are
        let record = Payload::Record(json!({"a": [1, 2]}));
        assert_eq!(c.decode(c.encode(record.clone()).unwrap()).unwrap(), record);
        // Anything that is not JSON passes through
        assert_eq!(c.decode("not json".into()).unwrap(), Payload::from("not json"));
    }

    #[test]
    fn test_media_type_normalization() {
        assert_eq!(media_type("Application/JSON; charset=utf-8"), "application/json");
        let n = ContentNegotiator::default();
        assert!(n.supports("application/cloudevents+json"));
        assert!(n.supports("*/*"));
        assert!(!n.supports("application/avro"));
    }

    #[test]
    fn test_unknown_media_type_fallback() {
        let n = ContentNegotiator::default();
        let c = n
            .negotiate(Shape::scalar(ElementType::Text), "application/x-custom")
            .unwrap();
        assert_eq!(c.content_type(), OCTET_STREAM);

        let err = n
            .negotiate(Shape::scalar(ElementType::Record), "application/x-custom")
            .unwrap_err();
        assert!(matches!(err, CatalogError::UnsupportedContentType { .. }));
    }

    #[test]
    fn test_custom_converter_takes_precedence() {
        #[derive(Debug)]
        struct Shouting;
        impl Converter for Shouting {
            fn content_type(&self) -> &str {
                "text/shout"
            }
            fn decode(&self, raw: Payload) -> Result<Payload, ConversionError> {
                raw.coerce(ElementType::Text)
            }
            fn encode(&self, value: Payload) -> Result<Payload, ConversionError> {
                Ok(Payload::Text(value.to_string().to_uppercase()))
            }
        }

        let mut n = ContentNegotiator::default();
        n.register("text/shout", |_| Arc::new(Shouting) as Arc<dyn Converter>);
        let c = n
            .negotiate(Shape::scalar(ElementType::Record), "text/shout; level=max")
            .unwrap();
        assert_eq!(c.content_type(), "text/shout");
    }

    #[tokio::test]
    async fn test_stream_converted_element_wise() {
        let n = ContentNegotiator::default();
        let c = n
            .negotiate(Shape::stream(ElementType::Text), OCTET_STREAM)
            .unwrap();
        assert_eq!(c.content_type(), OCTET_STREAM);
        let input = Data::stream_of([
            Payload::from(b"foo".to_vec()),
            Payload::from(vec![0xff]),
            Payload::from(b"bar".to_vec()),
        ]);
        let Data::Stream(s) = c.decode_data(input, wrap).unwrap() else {
            panic!("expected a stream");
        };
        let items: Vec<_> = s.collect().await;
        assert_eq!(items[0].as_ref().unwrap(), &Payload::from("foo"));
        assert!(matches!(items[1], Err(CatalogError::InputConversion { .. })));
        assert_eq!(items[2].as_ref().unwrap(), &Payload::from("bar"));
    }
}
