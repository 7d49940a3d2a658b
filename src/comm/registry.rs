//! Named call handlers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

use super::protocol::{CallRequest, ErrorWrapper};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("No handler registered for '{0}'")]
    UnknownMethod(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Failed(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }

    pub fn to_wrapper(&self) -> ErrorWrapper {
        let kind = match self {
            HandlerError::UnknownMethod(_) => "UnknownMethod",
            HandlerError::InvalidArguments(_) => "InvalidArguments",
            HandlerError::Failed(_) => "HandlerError",
            HandlerError::Panicked(_) => "Panic",
        };
        ErrorWrapper::from_message(kind, &self.to_string())
    }
}

/// Arguments of an incoming call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl CallArgs {
    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Map::new(),
        }
    }

    /// Deserialize positional argument `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, HandlerError> {
        let value = self.args.get(index).ok_or_else(|| {
            HandlerError::InvalidArguments(format!("missing positional argument {}", index))
        })?;
        serde_json::from_value(value.clone())
            .map_err(|e| HandlerError::InvalidArguments(format!("argument {}: {}", index, e)))
    }

    /// Deserialize keyword argument `name`, `None` when absent.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, HandlerError> {
        match self.kwargs.get(name) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| HandlerError::InvalidArguments(format!("{}: {}", name, e))),
        }
    }
}

impl From<&CallRequest> for CallArgs {
    fn from(request: &CallRequest) -> Self {
        Self {
            args: request.args.clone(),
            kwargs: request.kwargs.clone(),
        }
    }
}

/// Handler signature.
pub type CallHandler = Arc<dyn Fn(CallArgs) -> Result<Value, HandlerError> + Send + Sync>;

/// Maps method names to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, CallHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous one.
    pub fn register<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(CallArgs) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.handlers.write().insert(name.into(), Arc::new(handler));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.handlers.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<CallHandler> {
        self.handlers.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }
}
