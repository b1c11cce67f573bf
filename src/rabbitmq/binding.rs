use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An exchange -> queue binding the consumer must have in place before it
/// starts consuming from the queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub exchange: String,
    pub queue_name: String,
    pub routing_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_arguments: Option<Map<String, Value>>,
    /// Deletes the queue once its last consumer goes away.
    #[serde(default)]
    pub queue_auto_delete: bool,
}

impl Binding {
    pub fn new(
        exchange: impl Into<String>,
        queue_name: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Binding {
            exchange: exchange.into(),
            queue_name: queue_name.into(),
            routing_key: routing_key.into(),
            queue_arguments: None,
            queue_auto_delete: false,
        }
    }

    pub fn with_auto_delete(mut self, auto_delete: bool) -> Self {
        self.queue_auto_delete = auto_delete;
        self
    }

    pub fn with_queue_argument(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.queue_arguments
            .get_or_insert_with(Map::new)
            .insert(name.into(), value.into());
        self
    }
}
