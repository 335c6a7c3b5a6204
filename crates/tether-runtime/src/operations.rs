//! Named operations a helper core can execute

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Result of one operation: output payload or an error message for the caller
pub type OperationResult = Result<Vec<u8>, String>;

/// A unit of work a helper can run
#[async_trait]
pub trait Operation: Send + Sync + 'static {
    async fn invoke(&self, payload: Vec<u8>) -> OperationResult;
}

#[async_trait]
impl<F, Fut> Operation for F
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = OperationResult> + Send + 'static,
{
    async fn invoke(&self, payload: Vec<u8>) -> OperationResult {
        (self)(payload).await
    }
}

/// Operation name to implementation
#[derive(Clone, Default)]
pub struct OperationTable {
    operations: HashMap<String, Arc<dyn Operation>>,
}

impl OperationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `echo`, `sha256`, `sleep` and `fail`
    pub fn builtin() -> Self {
        Self::new()
            .with("echo", echo)
            .with("sha256", sha256)
            .with("sleep", sleep)
            .with("fail", fail)
    }

    pub fn register(&mut self, name: impl Into<String>, operation: impl Operation) {
        self.operations.insert(name.into(), Arc::new(operation));
    }

    pub fn with(mut self, name: impl Into<String>, operation: impl Operation) -> Self {
        self.register(name, operation);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run an operation; an unknown name is an operation failure, not a transport one
    pub async fn invoke(&self, name: &str, payload: Vec<u8>) -> OperationResult {
        match self.operations.get(name) {
            Some(op) => op.invoke(payload).await,
            None => Err(format!("unknown operation '{}'", name)),
        }
    }
}

impl std::fmt::Debug for OperationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationTable")
            .field("operations", &self.names())
            .finish()
    }
}

async fn echo(payload: Vec<u8>) -> OperationResult {
    Ok(payload)
}

async fn sha256(payload: Vec<u8>) -> OperationResult {
    Ok(Sha256::digest(&payload).to_vec())
}

/// Payload is a decimal millisecond count
async fn sleep(payload: Vec<u8>) -> OperationResult {
    let text = std::str::from_utf8(&payload).map_err(|_| "sleep expects decimal text".to_string())?;
    let millis: u64 = text
        .trim()
        .parse()
        .map_err(|e| format!("invalid sleep duration '{}': {}", text.trim(), e))?;
    tokio::time::sleep(Duration::from_millis(millis)).await;
    Ok(payload)
}

async fn fail(payload: Vec<u8>) -> OperationResult {
    if payload.is_empty() {
        return Err("operation failed".to_string());
    }
    Err(String::from_utf8_lossy(&payload).into_owned())
}
