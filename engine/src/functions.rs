//! Locally implemented functions the model may call.

use std::fmt;
use std::sync::Arc;

use gee_types::{FunctionCall, FunctionDefinition, FunctionParameter, Message};

use crate::AskError;

type Implementation<C> = Arc<dyn Fn(&str, &C) -> anyhow::Result<String> + Send + Sync>;

/// A function offered to the model, paired with its local implementation.
///
/// The implementation receives the raw argument payload exactly as the model
/// produced it (usually a JSON object string) plus a caller-supplied context.
pub struct LlmFunction<C> {
    definition: FunctionDefinition,
    implementation: Implementation<C>,
}

impl<C> LlmFunction<C> {
    pub fn new<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Vec<FunctionParameter>,
        implementation: F,
    ) -> Self
    where
        F: Fn(&str, &C) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        Self {
            definition: FunctionDefinition::new(name, description, parameters),
            implementation: Arc::new(implementation),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    #[must_use]
    pub fn definition(&self) -> &FunctionDefinition {
        &self.definition
    }

    pub fn invoke(&self, arguments: &str, context: &C) -> anyhow::Result<String> {
        (self.implementation)(arguments, context)
    }
}

impl<C> Clone for LlmFunction<C> {
    fn clone(&self) -> Self {
        Self {
            definition: self.definition.clone(),
            implementation: Arc::clone(&self.implementation),
        }
    }
}

impl<C> fmt::Debug for LlmFunction<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmFunction")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("function `{0}` is defined more than once")]
pub struct DuplicateFunction(pub String);

/// Functions offered for one request. Names are unique.
pub struct FunctionSet<C> {
    functions: Vec<LlmFunction<C>>,
    definitions: Vec<FunctionDefinition>,
}

impl<C> FunctionSet<C> {
    pub fn new(functions: Vec<LlmFunction<C>>) -> Result<Self, DuplicateFunction> {
        for (i, function) in functions.iter().enumerate() {
            if functions[..i].iter().any(|f| f.name() == function.name()) {
                return Err(DuplicateFunction(function.name().to_string()));
            }
        }
        let definitions = functions.iter().map(|f| f.definition().clone()).collect();
        Ok(Self {
            functions,
            definitions,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Descriptors sent to the provider, in declaration order.
    #[must_use]
    pub fn definitions(&self) -> &[FunctionDefinition] {
        &self.definitions
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&LlmFunction<C>> {
        self.functions.iter().find(|f| f.name() == name)
    }

    /// Run the function the model asked for and wrap its output as a
    /// `function`-role message named after it.
    pub fn dispatch(&self, call: &FunctionCall, context: &C) -> Result<Message, AskError> {
        let function = self
            .get(&call.name)
            .ok_or_else(|| AskError::UnknownFunction {
                name: call.name.clone(),
            })?;

        tracing::debug!(
            function = %call.name,
            argument_bytes = call.arguments.len(),
            "Invoking function"
        );
        let output = function
            .invoke(&call.arguments, context)
            .map_err(|source| AskError::FunctionFailed {
                name: call.name.clone(),
                source,
            })?;

        Ok(Message::function(&call.name, output))
    }
}

impl<C> fmt::Debug for FunctionSet<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.functions.iter().map(LlmFunction::name))
            .finish()
    }
}
