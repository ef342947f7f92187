//! Capabilities served by `peerlink provide`.

use anyhow::Context;
use peerlink_core::{BridgeError, CapabilityDefinition, CapabilityRegistry, InputSchema};
use serde_json::{Value, json};

pub fn registry() -> Result<CapabilityRegistry, BridgeError> {
    let mut registry = CapabilityRegistry::new();

    registry.register_fn(
        CapabilityDefinition::new("echo", "Return the given text unchanged").with_schema(
            InputSchema::object().required_property("text", "string"),
        ),
        |params| Ok(json!({ "text": params["text"] })),
    )?;

    registry.register_fn(
        CapabilityDefinition::new("add", "Add two numbers").with_schema(
            InputSchema::object()
                .required_property("a", "number")
                .required_property("b", "number"),
        ),
        add,
    )?;

    Ok(registry)
}

fn add(params: Value) -> anyhow::Result<Value> {
    let a = params["a"].as_f64().context("a is not a number")?;
    let b = params["b"].as_f64().context("b is not a number")?;
    let sum = a + b;
    if !sum.is_finite() {
        anyhow::bail!("sum overflows");
    }
    Ok(json!({ "sum": sum }))
}
