//! Protobuf payload codec
//!
//! Schemas are `.proto` files compiled at runtime, so scenarios can carry
//! protobuf payloads without a build step. Messages are converted to and
//! from their canonical JSON mapping.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use prost::Message;
use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor};
use serde_json::Value;

use crate::common::{Error, Result};

/// Encoder/decoder between JSON values and protobuf wire bytes
pub trait ProtoCodec: Send + Sync {
    fn encode(&self, schema: &Path, class: &str, value: &Value) -> Result<Vec<u8>>;

    fn decode(&self, schema: &Path, class: &str, bytes: &[u8]) -> Result<Value>;
}

/// Reflection-based codec; compiled descriptor pools are cached per file
#[derive(Default)]
pub struct ReflectCodec {
    pools: Mutex<HashMap<PathBuf, DescriptorPool>>,
}

impl ReflectCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn pool(&self, schema: &Path) -> Result<DescriptorPool> {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pool) = pools.get(schema) {
            return Ok(pool.clone());
        }

        let include = schema.parent().unwrap_or(Path::new("."));
        let files = protox::compile([schema], [include]).map_err(|e| {
            Error::Proto(format!("Failed to compile '{}': {}", schema.display(), e))
        })?;
        let pool = DescriptorPool::from_file_descriptor_set(files)
            .map_err(|e| Error::Proto(format!("Invalid schema '{}': {}", schema.display(), e)))?;

        tracing::debug!(schema = %schema.display(), "compiled proto schema");
        pools.insert(schema.to_path_buf(), pool.clone());
        Ok(pool)
    }

    fn message(&self, schema: &Path, class: &str) -> Result<MessageDescriptor> {
        self.pool(schema)?
            .get_message_by_name(class)
            .ok_or_else(|| {
                Error::Proto(format!(
                    "Message '{}' not found in '{}'",
                    class,
                    schema.display()
                ))
            })
    }
}

impl ProtoCodec for ReflectCodec {
    fn encode(&self, schema: &Path, class: &str, value: &Value) -> Result<Vec<u8>> {
        let desc = self.message(schema, class)?;
        let message = DynamicMessage::deserialize(desc, value.clone())
            .map_err(|e| Error::Proto(format!("Cannot encode {}: {}", class, e)))?;
        Ok(message.encode_to_vec())
    }

    fn decode(&self, schema: &Path, class: &str, bytes: &[u8]) -> Result<Value> {
        let desc = self.message(schema, class)?;
        let message = DynamicMessage::decode(desc, bytes)
            .map_err(|e| Error::Proto(format!("Cannot decode {}: {}", class, e)))?;
        Ok(serde_json::to_value(&message)?)
    }
}
