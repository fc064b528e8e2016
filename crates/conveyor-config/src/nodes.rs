// Helper functions for extracting values from KDL nodes

use conveyor_core::recipe::EnvVar;
use kdl::KdlNode;

use crate::{ConfigError, ConfigResult};

pub fn first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub fn all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub fn required_string_arg(node: &KdlNode, field: &str) -> ConfigResult<String> {
    first_string_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

pub fn bool_arg(node: &KdlNode, field: &str) -> ConfigResult<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
        .ok_or_else(|| ConfigError::invalid(field, "expected #true or #false"))
}

pub fn int_arg(node: &KdlNode, field: &str) -> ConfigResult<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
        .ok_or_else(|| ConfigError::invalid(field, "expected an integer"))
}

pub fn u64_arg(node: &KdlNode, field: &str) -> ConfigResult<u64> {
    let value = int_arg(node, field)?;
    u64::try_from(value).map_err(|_| ConfigError::invalid(field, "must not be negative"))
}

pub fn string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub fn bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

/// Children of an `env { NAME "value" }` block, in declaration order.
pub fn env_block(node: &KdlNode) -> Vec<EnvVar> {
    let Some(children) = node.children() else {
        return Vec::new();
    };
    children
        .nodes()
        .iter()
        .filter_map(|child| {
            first_string_arg(child).map(|value| EnvVar::new(child.name().value(), value))
        })
        .collect()
}
