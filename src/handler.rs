//! Task handler contract and the opaque collaborator interfaces consumed by
//! chain/RAG layers built on top of the core.

use crate::error::{Error, Result};
use crate::task::Task;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// User-supplied work. Handlers declare the capabilities they serve; the
/// coordinator never routes a task to a handler whose capability set does not
/// cover the task's requirements.
///
/// With dedup enabled, handlers should be side-effect-idempotent; without it
/// they must tolerate at-least-once invocation.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Vec<String>;

    async fn handle_task(&self, task: &Task) -> Result<serde_json::Value>;
}

type HandlerFn =
    Arc<dyn Fn(Task) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;

/// Closure-backed handler; the convenient form for tests and small tools.
#[derive(Clone)]
pub struct FnHandler {
    name: String,
    capabilities: Vec<String>,
    function: HandlerFn,
}

impl FnHandler {
    pub fn new<F, Fut>(name: impl Into<String>, capabilities: &[&str], function: F) -> Self
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
            function: Arc::new(move |task| Box::pin(function(task))),
        }
    }
}

impl std::fmt::Debug for FnHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

#[async_trait]
impl TaskHandler for FnHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    async fn handle_task(&self, task: &Task) -> Result<serde_json::Value> {
        (self.function)(task.clone()).await
    }
}

/// Capability-tagged dispatch table: task type -> handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type.into(), handler);
    }

    pub fn with(mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.register(task_type, handler);
        self
    }

    /// All capabilities served by the registered handlers; a worker
    /// advertises this union to the pool.
    pub fn capabilities(&self) -> BTreeSet<String> {
        self.handlers
            .values()
            .flat_map(|handler| handler.capabilities())
            .collect()
    }

    /// Resolve the handler for `task`, enforcing the capability contract.
    pub fn resolve(&self, task: &Task) -> Result<Arc<dyn TaskHandler>> {
        let handler = self.handlers.get(&task.task_type).ok_or_else(|| {
            Error::no_eligible_worker(format!("no handler for task type '{}'", task.task_type))
        })?;
        let served: BTreeSet<String> = handler.capabilities().into_iter().collect();
        if !task.required_capabilities.is_subset(&served) {
            return Err(Error::no_eligible_worker(format!(
                "handler '{}' lacks required capabilities for task '{}'",
                handler.name(),
                task.id
            )));
        }
        Ok(handler.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Opaque collaborator contracts (LLM, retriever, vector store). The core only
// defines the seams; providers live outside.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub text: String,
    pub tokens_used: u32,
    pub finish_reason: String,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate_completion(&self, request: CompletionRequest) -> Result<CompletionResponse>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub page_content: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn get_relevant_documents(&self, query: &str) -> Result<Vec<Document>>;
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn add_documents(&self, documents: Vec<Document>) -> Result<Vec<String>>;

    async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<Document>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::task::TaskRequest;
    use serde_json::json;

    fn echo_handler() -> Arc<dyn TaskHandler> {
        Arc::new(FnHandler::new("echo", &["echo"], |task| async move {
            Ok(json!({"out": task.input.get("msg").cloned().unwrap_or(json!(null))}))
        }))
    }

    #[tokio::test]
    async fn fn_handler_runs_and_reports_capabilities() {
        let handler = echo_handler();
        assert_eq!(handler.name(), "echo");
        assert_eq!(handler.capabilities(), vec!["echo".to_string()]);

        let task = TaskRequest::new("echo").input("msg", json!("hi")).into_task(1);
        let result = handler.handle_task(&task).await.unwrap();
        assert_eq!(result, json!({"out": "hi"}));
    }

    #[test]
    fn registry_resolves_by_task_type() {
        let registry = HandlerRegistry::new().with("echo", echo_handler());
        let task = TaskRequest::new("echo").capability("echo").into_task(1);
        assert!(registry.resolve(&task).is_ok());

        let unknown = TaskRequest::new("summarize").into_task(1);
        let err = match registry.resolve(&unknown) {
            Err(err) => err,
            Ok(_) => panic!("expected no handler for unknown task type"),
        };
        assert_eq!(err.kind(), ErrorKind::NoEligibleWorker);
    }

    #[test]
    fn registry_enforces_capability_superset() {
        let registry = HandlerRegistry::new().with("echo", echo_handler());
        let demanding = TaskRequest::new("echo")
            .capability("echo")
            .capability("gpu")
            .into_task(1);
        let err = match registry.resolve(&demanding) {
            Err(err) => err,
            Ok(_) => panic!("expected capability superset to be unmet"),
        };
        assert_eq!(err.kind(), ErrorKind::NoEligibleWorker);
    }

    #[test]
    fn registry_unions_capabilities() {
        let registry = HandlerRegistry::new()
            .with("echo", echo_handler())
            .with(
                "summarize",
                Arc::new(FnHandler::new("summarize", &["llm", "summarize"], |_| async {
                    Ok(json!(null))
                })) as Arc<dyn TaskHandler>,
            );
        let caps = registry.capabilities();
        assert!(caps.contains("echo"));
        assert!(caps.contains("llm"));
        assert!(caps.contains("summarize"));
    }
}
