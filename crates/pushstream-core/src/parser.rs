//! Format parsers for streaming payloads
//!
//! Every subscription owns one parser instance, picked from the shared
//! [`ParserFacade`] by the MIME format it negotiated. Schema-driven formats
//! register schemas received in the subscribe response; JSON needs none.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::warn;

use crate::error::ParseError;
use crate::types::{MessageData, FORMAT_JSON};

/// Decodes streaming payloads for one subscription.
///
/// Implementations are stateful: schema-driven formats accumulate schemas
/// via [`StreamParser::add_schema`] and use the most recently registered one
/// when a delta does not name its schema.
pub trait StreamParser: Send {
    /// MIME format this parser handles
    fn format(&self) -> &str;

    /// Decode one payload into JSON.
    fn parse(&mut self, data: &MessageData, schema_name: Option<&str>)
        -> Result<Value, ParseError>;

    /// Register a schema definition under `name`.
    fn add_schema(&mut self, schema: &str, name: &str) -> Result<(), ParseError>;

    /// Names of every registered schema, sent as `KnownSchemas` on subscribe.
    fn schema_names(&self) -> Vec<String>;

    /// Most recently registered schema name, if any.
    fn schema_name(&self) -> Option<&str>;
}

/// Parser for `application/json`: payloads arrive decoded or as raw JSON text.
#[derive(Debug, Default)]
pub struct JsonParser;

impl StreamParser for JsonParser {
    fn format(&self) -> &str {
        FORMAT_JSON
    }

    fn parse(
        &mut self,
        data: &MessageData,
        _schema_name: Option<&str>,
    ) -> Result<Value, ParseError> {
        match data {
            MessageData::Json(value) => Ok(value.clone()),
            MessageData::Binary(bytes) => Ok(serde_json::from_slice(bytes)?),
        }
    }

    fn add_schema(&mut self, _schema: &str, _name: &str) -> Result<(), ParseError> {
        // Schemas do not apply to JSON; the server only sends them for
        // binary formats.
        Ok(())
    }

    fn schema_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn schema_name(&self) -> Option<&str> {
        None
    }
}

type ParserFactory = Arc<dyn Fn() -> Box<dyn StreamParser> + Send + Sync>;

/// Registry mapping a MIME format to a parser factory.
///
/// JSON is built in; binary formats are registered by the embedder with
/// [`ParserFacade::register_engine`]. Unknown formats fall back to the JSON
/// default so a subscription always has a working parser.
pub struct ParserFacade {
    engines: RwLock<HashMap<String, ParserFactory>>,
}

impl ParserFacade {
    pub fn new() -> Self {
        let mut engines: HashMap<String, ParserFactory> = HashMap::new();
        engines.insert(
            FORMAT_JSON.to_string(),
            Arc::new(|| Box::new(JsonParser) as Box<dyn StreamParser>),
        );
        Self {
            engines: RwLock::new(engines),
        }
    }

    /// Register a parser factory for a MIME format.
    pub fn register_engine(
        &self,
        format: impl Into<String>,
        factory: impl Fn() -> Box<dyn StreamParser> + Send + Sync + 'static,
    ) {
        self.engines.write().insert(format.into(), Arc::new(factory));
    }

    /// True when a parser is registered for `format`.
    pub fn supports(&self, format: &str) -> bool {
        self.engines.read().contains_key(format)
    }

    /// Build a parser for `format`, falling back to the JSON default when
    /// the format is unknown.
    pub fn get_parser(&self, format: &str) -> Box<dyn StreamParser> {
        if let Some(factory) = self.engines.read().get(format) {
            return factory();
        }
        warn!(format, "no parser registered for format; using {}", FORMAT_JSON);
        self.default_parser()
    }

    /// Build a parser for the default format.
    pub fn default_parser(&self) -> Box<dyn StreamParser> {
        Box::new(JsonParser)
    }
}

impl Default for ParserFacade {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn json_parser_handles_both_payload_shapes() {
        let mut parser = JsonParser;

        let decoded = parser
            .parse(&MessageData::Json(json!({"a": 1})), None)
            .unwrap();
        assert_eq!(decoded, json!({"a": 1}));

        let decoded = parser
            .parse(&MessageData::Binary(Bytes::from_static(b"{\"b\":2}")), None)
            .unwrap();
        assert_eq!(decoded, json!({"b": 2}));
    }

    #[test]
    fn json_parser_rejects_garbage_bytes() {
        let mut parser = JsonParser;
        let result = parser.parse(&MessageData::Binary(Bytes::from_static(b"not json")), None);
        assert!(matches!(result, Err(ParseError::Json(_))));
    }

    #[test]
    fn facade_falls_back_to_json_for_unknown_formats() {
        let facade = ParserFacade::new();
        let parser = facade.get_parser("application/x-unheard-of");
        assert_eq!(parser.format(), FORMAT_JSON);
    }

    #[test]
    fn facade_serves_registered_engines() {
        struct Stub;
        impl StreamParser for Stub {
            fn format(&self) -> &str {
                "application/x-stub"
            }
            fn parse(
                &mut self,
                _data: &MessageData,
                _schema_name: Option<&str>,
            ) -> Result<Value, ParseError> {
                Ok(Value::Null)
            }
            fn add_schema(&mut self, _schema: &str, _name: &str) -> Result<(), ParseError> {
                Ok(())
            }
            fn schema_names(&self) -> Vec<String> {
                Vec::new()
            }
            fn schema_name(&self) -> Option<&str> {
                None
            }
        }

        let facade = ParserFacade::new();
        facade.register_engine("application/x-stub", || Box::new(Stub));
        assert!(facade.supports("application/x-stub"));
        assert_eq!(
            facade.get_parser("application/x-stub").format(),
            "application/x-stub"
        );
    }
}
