// src/rabbitmq/properties.rs
// Wire envelope of a message and the JSON <-> AMQP field table mapping.

use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use lapin::BasicProperties;
use serde_json::{Map, Number, Value};
use uuid::Uuid;

use crate::message::Message;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_ENCODING_UTF8: &str = "utf-8";
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeliveryProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub delivery_mode: Option<u8>,
    pub headers: Map<String, Value>,
    pub message_id: Option<String>,
}

impl DeliveryProperties {
    /// Properties for publishing `message`: JSON, UTF-8, persistent, and a
    /// freshly generated message id.
    pub fn for_message(message: &Message) -> Self {
        DeliveryProperties {
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            content_encoding: Some(CONTENT_ENCODING_UTF8.to_string()),
            delivery_mode: Some(DELIVERY_MODE_PERSISTENT),
            headers: message.headers.clone(),
            message_id: Some(Uuid::new_v4().to_string()),
        }
    }

    pub fn to_basic_properties(&self) -> BasicProperties {
        let mut properties = BasicProperties::default().with_headers(json_to_field_table(&self.headers));

        if let Some(content_type) = &self.content_type {
            properties = properties.with_content_type(content_type.clone().into());
        }
        if let Some(content_encoding) = &self.content_encoding {
            properties = properties.with_content_encoding(content_encoding.clone().into());
        }
        if let Some(delivery_mode) = self.delivery_mode {
            properties = properties.with_delivery_mode(delivery_mode);
        }
        if let Some(message_id) = &self.message_id {
            properties = properties.with_message_id(message_id.clone().into());
        }

        properties
    }

    pub fn from_basic_properties(properties: &BasicProperties) -> Self {
        DeliveryProperties {
            content_type: properties.content_type().as_ref().map(|s| s.as_str().to_string()),
            content_encoding: properties.content_encoding().as_ref().map(|s| s.as_str().to_string()),
            delivery_mode: *properties.delivery_mode(),
            headers: properties
                .headers()
                .as_ref()
                .map(field_table_to_json)
                .unwrap_or_default(),
            message_id: properties.message_id().as_ref().map(|s| s.as_str().to_string()),
        }
    }
}

pub fn json_to_field_table(map: &Map<String, Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in map {
        table.insert(ShortString::from(key.clone()), json_to_amqp(value));
    }
    table
}

pub fn field_table_to_json(table: &FieldTable) -> Map<String, Value> {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), amqp_to_json(value)))
        .collect()
}

fn json_to_amqp(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                AMQPValue::LongLongInt(i)
            } else {
                // u64 above i64::MAX or a float
                AMQPValue::Double(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        Value::Array(items) => {
            let mut array = FieldArray::default();
            for item in items {
                array.push(json_to_amqp(item));
            }
            AMQPValue::FieldArray(array)
        }
        Value::Object(map) => AMQPValue::FieldTable(json_to_field_table(map)),
    }
}

fn amqp_to_json(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(i) => Value::from(*i),
        AMQPValue::ShortShortUInt(i) => Value::from(*i),
        AMQPValue::ShortInt(i) => Value::from(*i),
        AMQPValue::ShortUInt(i) => Value::from(*i),
        AMQPValue::LongInt(i) => Value::from(*i),
        AMQPValue::LongUInt(i) => Value::from(*i),
        AMQPValue::LongLongInt(i) => Value::from(*i),
        AMQPValue::Timestamp(t) => Value::from(*t),
        AMQPValue::Float(f) => Number::from_f64(f64::from(*f)).map_or(Value::Null, Value::Number),
        AMQPValue::Double(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
        AMQPValue::ShortString(s) => Value::String(s.as_str().to_string()),
        AMQPValue::LongString(s) => Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::FieldArray(array) => Value::Array(array.as_slice().iter().map(amqp_to_json).collect()),
        AMQPValue::FieldTable(table) => Value::Object(field_table_to_json(table)),
        _ => Value::Null,
    }
}
