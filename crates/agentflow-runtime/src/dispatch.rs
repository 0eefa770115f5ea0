//! Handler contract and in-process dispatch table.
//!
//! A handler executes one facet given a payload and returns a result map.
//! The dispatcher maps facet names to handlers; agents use it for claimed
//! tasks and the evaluator uses it for inline dispatch at `EventTransmit`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use agentflow_core::RuntimeError;

/// A flat payload / result map.
pub type PayloadMap = serde_json::Map<String, serde_json::Value>;

/// The narrow contract domain code is invoked through.
#[async_trait]
pub trait FacetHandler: Send + Sync {
    /// Execute the facet with the given payload and return its result map.
    async fn handle(
        &self,
        facet_name: &str,
        payload: &PayloadMap,
    ) -> Result<PayloadMap, RuntimeError>;
}

type BoxedHandlerFn = Arc<
    dyn Fn(PayloadMap) -> Pin<Box<dyn Future<Output = Result<PayloadMap, RuntimeError>> + Send>>
        + Send
        + Sync,
>;

struct FnHandler {
    f: BoxedHandlerFn,
}

#[async_trait]
impl FacetHandler for FnHandler {
    async fn handle(
        &self,
        _facet_name: &str,
        payload: &PayloadMap,
    ) -> Result<PayloadMap, RuntimeError> {
        (self.f)(payload.clone()).await
    }
}

/// Facet-name to handler mapping for one process.
///
/// # Example
///
/// ```
/// use agentflow_runtime::HandlerDispatcher;
/// use serde_json::json;
///
/// let dispatcher = HandlerDispatcher::new();
/// dispatcher.register_handler("demo.AddOne", |payload| async move {
///     let value = payload.get("value").and_then(|v| v.as_i64()).unwrap_or(0);
///     let mut result = serde_json::Map::new();
///     result.insert("result".to_string(), json!(value + 1));
///     Ok(result)
/// });
///
/// assert!(dispatcher.can_dispatch("demo.AddOne"));
/// ```
#[derive(Default)]
pub struct HandlerDispatcher {
    handlers: DashMap<String, Arc<dyn FacetHandler>>,
}

impl HandlerDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handler object for a facet name.
    pub fn register(&self, facet_name: impl Into<String>, handler: Arc<dyn FacetHandler>) {
        self.handlers.insert(facet_name.into(), handler);
    }

    /// Install a closure handler for a facet name.
    pub fn register_handler<F, Fut>(&self, facet_name: impl Into<String>, handler: F)
    where
        F: Fn(PayloadMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PayloadMap, RuntimeError>> + Send + 'static,
    {
        let f: BoxedHandlerFn = Arc::new(move |payload| Box::pin(handler(payload)));
        self.handlers
            .insert(facet_name.into(), Arc::new(FnHandler { f }));
    }

    pub fn can_dispatch(&self, facet_name: &str) -> bool {
        self.handlers.contains_key(facet_name)
    }

    /// The facet names this dispatcher serves.
    pub fn facet_names(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Dispatch a payload to the registered handler.
    ///
    /// Unknown facets fail with [`RuntimeError::HandlerNotFound`].
    pub async fn dispatch(
        &self,
        facet_name: &str,
        payload: &PayloadMap,
    ) -> Result<PayloadMap, RuntimeError> {
        let handler = self
            .handlers
            .get(facet_name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| RuntimeError::HandlerNotFound(facet_name.to_string()))?;
        handler.handle(facet_name, payload).await
    }
}
