//! Function-calling types.
//!
//! These describe callable functions to the model and carry the model's
//! request to invoke one. The local implementations live in `gee-engine`.

use serde_json::{Map, Value, json};

use crate::message::Message;

/// One named parameter of a callable function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionParameter {
    pub name: String,
    /// JSON Schema type tag, e.g. `"string"` or `"integer"`.
    pub kind: String,
    pub description: String,
    pub required: bool,
}

impl FunctionParameter {
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            description: description.into(),
            required: false,
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Definition of a function the model may call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    /// Declaration order is kept in the emitted schema.
    pub parameters: Vec<FunctionParameter>,
}

impl FunctionDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Vec<FunctionParameter>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// JSON Schema object describing the parameters.
    #[must_use]
    pub fn parameters_schema(&self) -> Value {
        let mut properties = Map::new();
        for param in &self.parameters {
            properties.insert(
                param.name.clone(),
                json!({ "type": param.kind, "description": param.description }),
            );
        }
        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Full function descriptor in the shape providers expect.
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters_schema(),
        })
    }
}

/// A function invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCall {
    pub name: String,
    /// Raw provider-supplied argument payload, typically a JSON object string.
    pub arguments: String,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// Result of one blocking completion call.
#[derive(Debug, Clone)]
pub enum Completion {
    /// Final answer from the model.
    Answer(Message),
    /// The model wants a local function invoked before it answers.
    FunctionCall(FunctionCall),
}
