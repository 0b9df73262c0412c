//! Mock completion provider for testing and dry runs.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::RequestId;
use crate::domain::ports::{CompletionProvider, ProviderRequest, ProviderResponse};

/// Mock response configuration.
#[derive(Debug, Clone)]
pub struct MockResponse {
    /// Response payload
    pub response: Value,
    /// Whether to simulate failure
    pub fail: bool,
    /// Error message if failing
    pub error_message: Option<String>,
    /// Simulated latency
    pub delay: Duration,
    /// Never respond
    pub hang: bool,
    /// Conversation id to report instead of the one supplied
    pub rotate_to: Option<String>,
    /// Progress values emitted before responding
    pub progress: Vec<Value>,
}

impl Default for MockResponse {
    fn default() -> Self {
        Self {
            response: Value::String("Mock completion.".to_string()),
            fail: false,
            error_message: None,
            delay: Duration::ZERO,
            hang: false,
            rotate_to: None,
            progress: Vec::new(),
        }
    }
}

impl MockResponse {
    pub fn success(response: impl Into<Value>) -> Self {
        Self {
            response: response.into(),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            fail: true,
            error_message: Some(error.into()),
            ..Default::default()
        }
    }

    /// A call that never completes on its own.
    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn rotating_to(mut self, conversation_id: impl Into<String>) -> Self {
        self.rotate_to = Some(conversation_id.into());
        self
    }

    pub fn with_progress(mut self, progress: Vec<Value>) -> Self {
        self.progress = progress;
        self
    }
}

/// One recorded provider call.
#[derive(Debug, Clone)]
pub struct MockInvocation {
    pub request_id: RequestId,
    pub prompt: Value,
    pub conversation_id: Option<String>,
    /// Global order in which calls started.
    pub started_seq: u64,
    /// Global order in which calls ended; `None` while running.
    pub finished_seq: Option<u64>,
    /// The call future was dropped before it produced a result.
    pub aborted: bool,
}

/// Mock provider for testing.
///
/// Responses are taken from the per-prompt table first, then from the
/// scripted queue, then the default.
pub struct MockProvider {
    default_response: MockResponse,
    scripted: Mutex<VecDeque<MockResponse>>,
    by_prompt: Mutex<HashMap<String, MockResponse>>,
    invocations: Mutex<Vec<MockInvocation>>,
    seq: AtomicU64,
    active: AtomicUsize,
    max_active: AtomicUsize,
    supports_abort: bool,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::with_default_response(MockResponse::default())
    }

    pub fn with_default_response(response: MockResponse) -> Self {
        Self {
            default_response: response,
            scripted: Mutex::new(VecDeque::new()),
            by_prompt: Mutex::new(HashMap::new()),
            invocations: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            supports_abort: true,
        }
    }

    /// Behave like a provider whose calls cannot be interrupted.
    pub fn without_abort(mut self) -> Self {
        self.supports_abort = false;
        self
    }

    /// Queue a response for the next call that has no per-prompt override.
    pub fn push_response(&self, response: MockResponse) {
        self.scripted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(response);
    }

    /// Respond with `response` whenever the prompt text equals `prompt`.
    pub fn set_response_for_prompt(&self, prompt: impl Into<String>, response: MockResponse) {
        self.by_prompt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(prompt.into(), response);
    }

    pub fn invocations(&self) -> Vec<MockInvocation> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Highest number of calls that were running at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn next_response(&self, prompt: &Value) -> MockResponse {
        if let Some(text) = prompt.as_str() {
            let by_prompt = self.by_prompt.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(response) = by_prompt.get(text) {
                return response.clone();
            }
        }
        self.scripted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.default_response.clone())
    }

    fn finish(&self, index: usize, aborted: bool) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let mut invocations = self.invocations.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(call) = invocations.get_mut(index) {
            call.finished_seq = Some(seq);
            call.aborted = aborted;
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks a call finished even when its future is dropped.
struct CallGuard<'a> {
    provider: &'a MockProvider,
    index: usize,
    completed: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.provider.active.fetch_sub(1, Ordering::SeqCst);
        self.provider.finish(self.index, !self.completed);
    }
}

#[async_trait]
impl CompletionProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn supports_abort(&self) -> bool {
        self.supports_abort
    }

    async fn invoke(
        &self,
        request: ProviderRequest,
        progress: mpsc::Sender<Value>,
    ) -> DomainResult<ProviderResponse> {
        let response = self.next_response(&request.prompt);

        let index = {
            let mut invocations = self.invocations.lock().unwrap_or_else(PoisonError::into_inner);
            invocations.push(MockInvocation {
                request_id: request.request_id.clone(),
                prompt: request.prompt.clone(),
                conversation_id: request.conversation_id.clone(),
                started_seq: self.seq.fetch_add(1, Ordering::SeqCst),
                finished_seq: None,
                aborted: false,
            });
            invocations.len() - 1
        };
        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(running, Ordering::SeqCst);
        let mut guard = CallGuard {
            provider: self,
            index,
            completed: false,
        };

        for value in response.progress {
            let _ = progress.send(value).await;
        }
        if response.hang {
            std::future::pending::<()>().await;
        }
        if !response.delay.is_zero() {
            tokio::time::sleep(response.delay).await;
        }
        guard.completed = true;
        drop(guard);

        if response.fail {
            return Err(DomainError::Provider(
                response
                    .error_message
                    .unwrap_or_else(|| "Mock failure".to_string()),
            ));
        }

        let conversation_id = response
            .rotate_to
            .or(request.conversation_id)
            .or_else(|| Some(format!("mock-{}", Uuid::new_v4())));
        Ok(ProviderResponse {
            response: response.response,
            conversation_id,
            usage: Some(serde_json::json!({"input_tokens": 10, "output_tokens": 5})),
        })
    }
}
