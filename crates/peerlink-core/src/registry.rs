//! Capability definitions and the registry that owns their handlers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::BridgeError;
use crate::schema::InputSchema;

/// A named operation a provider exposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

impl CapabilityDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: InputSchema::object(),
        }
    }

    pub fn with_schema(mut self, schema: InputSchema) -> Self {
        self.input_schema = schema;
        self
    }
}

/// Runs a capability.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    async fn call(&self, params: Value) -> anyhow::Result<Value>;
}

/// Adapter so plain closures can be registered as handlers.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> CapabilityHandler for FnHandler<F>
where
    F: Fn(Value) -> anyhow::Result<Value> + Send + Sync,
{
    async fn call(&self, params: Value) -> anyhow::Result<Value> {
        (self.0)(params)
    }
}

pub(crate) struct Registered {
    pub(crate) definition: CapabilityDefinition,
    pub(crate) handler: Arc<dyn CapabilityHandler>,
}

/// Maps capability name to definition and handler.
///
/// Built up front and then shared read-only behind an `Arc`.
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: BTreeMap<String, Registered>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability. Names are unique; a duplicate leaves the
    /// existing registration untouched.
    pub fn register(
        &mut self,
        definition: CapabilityDefinition,
        handler: Arc<dyn CapabilityHandler>,
    ) -> Result<(), BridgeError> {
        if self.entries.contains_key(&definition.name) {
            return Err(BridgeError::DuplicateCapability(definition.name));
        }
        definition
            .input_schema
            .check()
            .map_err(|reason| BridgeError::InvalidSchema {
                name: definition.name.clone(),
                reason,
            })?;

        tracing::debug!(capability = %definition.name, "registered capability");
        self.entries.insert(
            definition.name.clone(),
            Registered {
                definition,
                handler,
            },
        );
        Ok(())
    }

    /// Register a synchronous closure.
    pub fn register_fn<F>(&mut self, definition: CapabilityDefinition, f: F) -> Result<(), BridgeError>
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register(definition, Arc::new(FnHandler(f)))
    }

    pub fn get(&self, name: &str) -> Option<&CapabilityDefinition> {
        self.entries.get(name).map(|r| &r.definition)
    }

    pub(crate) fn resolve(&self, name: &str) -> Option<&Registered> {
        self.entries.get(name)
    }

    pub fn definitions(&self) -> Vec<CapabilityDefinition> {
        self.entries.values().map(|r| r.definition.clone()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
