use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Header carrying the name of the schema the publisher validated against.
pub const SCHEMA_HEADER: &str = "fedora_messaging_schema";

/// Header carrying the version of that schema.
pub const SCHEMA_VERSION_HEADER: &str = "fedora_messaging_schema_version";

/// Name of the schema every message falls back to.
pub const BASE_SCHEMA_NAME: &str = "fedora_messaging.message:Message";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("message does not match schema {schema}: {reason}")]
pub struct ValidationError {
    pub schema: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(schema: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            reason: reason.into(),
        }
    }
}

/// A message schema: a name the wire can carry, a version, and a check.
pub trait MessageSchema: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> u32 {
        1
    }

    fn validate(&self, message: &Message) -> Result<(), ValidationError>;
}

/// The schema used when a message carries no (or an unknown) schema header.
/// It only requires the body to be a JSON object.
#[derive(Debug, Default, Clone, Copy)]
pub struct BaseSchema;

impl MessageSchema for BaseSchema {
    fn name(&self) -> &str {
        BASE_SCHEMA_NAME
    }

    fn validate(&self, message: &Message) -> Result<(), ValidationError> {
        if message.body.is_object() {
            Ok(())
        } else {
            Err(ValidationError::new(
                self.name(),
                format!("body must be a JSON object, got {}", json_type(&message.body)),
            ))
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Clone)]
pub struct Message {
    pub topic: String,
    pub headers: Map<String, Value>,
    pub body: Value,
    schema: Arc<dyn MessageSchema>,
}

impl Message {
    /// Creates a message validated by the base schema.
    pub fn new(topic: impl Into<String>, body: Value) -> Self {
        Self::with_schema(Arc::new(BaseSchema), topic, body)
    }

    pub fn with_schema(schema: Arc<dyn MessageSchema>, topic: impl Into<String>, body: Value) -> Self {
        Self::from_parts(schema, topic, Map::new(), body)
    }

    pub fn from_parts(
        schema: Arc<dyn MessageSchema>,
        topic: impl Into<String>,
        headers: Map<String, Value>,
        body: Value,
    ) -> Self {
        Message {
            topic: topic.into(),
            headers,
            body,
            schema,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn schema(&self) -> &Arc<dyn MessageSchema> {
        &self.schema
    }

    pub fn schema_name(&self) -> &str {
        self.schema.name()
    }

    pub fn schema_version(&self) -> u32 {
        self.schema.version()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.schema.validate(self)
    }

    /// Writes the schema name and version headers consumers use to pick a schema.
    pub fn stamp_schema_headers(&mut self) {
        let name = self.schema.name().to_string();
        let version = self.schema.version();
        self.headers.insert(SCHEMA_HEADER.to_string(), Value::String(name));
        self.headers
            .insert(SCHEMA_VERSION_HEADER.to_string(), Value::from(version));
    }

    /// The schema name as advertised in the headers, if any.
    pub fn declared_schema(&self) -> Option<&str> {
        self.headers.get(SCHEMA_HEADER).and_then(Value::as_str)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("topic", &self.topic)
            .field("schema", &self.schema.name())
            .field("headers", &self.headers)
            .field("body", &self.body)
            .finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic: {}\n\n{}", self.topic, self.body)
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.topic == other.topic
            && self.headers == other.headers
            && self.body == other.body
            && self.schema.name() == other.schema.name()
    }
}

/// Maps schema names found on the wire to the schema implementations this
/// process knows about. Always knows the base schema.
#[derive(Clone, Debug)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Arc<dyn MessageSchema>>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        let mut registry = SchemaRegistry {
            schemas: HashMap::new(),
        };
        registry.register(Arc::new(BaseSchema));
        registry
    }
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: Arc<dyn MessageSchema>) -> &mut Self {
        self.schemas.insert(schema.name().to_string(), schema);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MessageSchema>> {
        self.schemas.get(name).cloned()
    }

    pub fn base(&self) -> Arc<dyn MessageSchema> {
        self.get(BASE_SCHEMA_NAME)
            .unwrap_or_else(|| Arc::new(BaseSchema))
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
