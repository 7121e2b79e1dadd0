//! Mutation dispatch: the executor contract and a name-validated registry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::{CacheError, MutationError, Result};

/// Executes a named mutation against the remote side.
///
/// Delivery is at-least-once: a mutation may be executed again after a
/// crash or timeout, so implementations should be idempotent.
#[async_trait]
pub trait MutationExecutor: Send + Sync {
    async fn execute(&self, name: &str, args: Value) -> std::result::Result<Value, MutationError>;
}

pub type MutationFuture = Pin<Box<dyn Future<Output = std::result::Result<Value, MutationError>> + Send>>;

pub type MutationHandler = Arc<dyn Fn(Value) -> MutationFuture + Send + Sync>;

/// `namespace.action`, each part non-empty and made of ASCII alphanumerics,
/// `_` or `-`.
pub fn validate_mutation_name(name: &str) -> Result<()> {
    let valid_part = |part: &str| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    };
    match name.split_once('.') {
        Some((namespace, action)) if valid_part(namespace) && valid_part(action) => Ok(()),
        _ => Err(CacheError::InvalidMutationName(name.to_string())),
    }
}

/// Explicit table of mutation handlers, validated at registration.
#[derive(Default)]
pub struct MutationRegistry {
    handlers: RwLock<HashMap<String, MutationHandler>>,
}

impl MutationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, handler: MutationHandler) -> Result<()> {
        validate_mutation_name(name)?;
        let mut handlers = self.handlers.write();
        if handlers.contains_key(name) {
            return Err(CacheError::DuplicateMutation(name.to_string()));
        }
        handlers.insert(name.to_string(), handler);
        Ok(())
    }

    /// Register a handler with typed arguments and output.
    ///
    /// Arguments that do not deserialize into `A` fail the execution with
    /// [`MutationError::InvalidArgs`].
    pub fn register_fn<A, O, F, Fut>(&self, name: &str, f: F) -> Result<()>
    where
        A: DeserializeOwned + Send + 'static,
        O: Serialize + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<O, MutationError>> + Send + 'static,
    {
        let owned_name = name.to_string();
        let handler: MutationHandler = Arc::new(move |args: Value| -> MutationFuture {
            let args: A = match serde_json::from_value(args) {
                Ok(args) => args,
                Err(e) => {
                    let err = MutationError::InvalidArgs {
                        name: owned_name.clone(),
                        message: e.to_string(),
                    };
                    return Box::pin(async move { Err(err) });
                }
            };
            let fut = f(args);
            Box::pin(async move {
                let out = fut.await?;
                serde_json::to_value(out).map_err(|e| MutationError::Failed(e.to_string()))
            })
        });
        self.register(name, handler)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl MutationExecutor for MutationRegistry {
    async fn execute(&self, name: &str, args: Value) -> std::result::Result<Value, MutationError> {
        let handler = self.handlers.read().get(name).cloned();
        match handler {
            Some(handler) => handler(args).await,
            None => Err(MutationError::Unknown(name.to_string())),
        }
    }
}
