use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of tool families the engine can dispatch to. `Unknown` exists
/// so that a step naming an unregistered tool still classifies (fail safe)
/// instead of being unclassifiable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    FsRead,
    FsList,
    FsWrite,
    FsDelete,
    Patch,
    Command,
    GitRead,
    GitWrite,
    Network,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolAccess {
    ReadOnly,
    Mutating,
}

/// Opaque payload selecting the external tool and its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

impl ToolCall {
    pub fn new(tool: impl Into<String>, args: Value) -> Self {
        Self {
            tool: tool.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub output: String,
    #[serde(default)]
    pub metadata: Value,
}

impl ToolResult {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            metadata: Value::Null,
        }
    }
}
