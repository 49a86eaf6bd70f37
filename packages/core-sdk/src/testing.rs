//! Test doubles shared by the unit tests.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

use async_trait::async_trait;

use crate::errors::{PlanktonError, Result};
use crate::llm::CompletionService;
use crate::models::{Message, ModelDescriptor};

/** \brief 可编排回复的补全服务；`Err(status)` 表示远端返回该状态码。 */
pub(crate) struct StubService {
    reply: Mutex<std::result::Result<String, u16>>,
    models: Vec<ModelDescriptor>,
    calls: AtomicUsize,
    requests: Mutex<Vec<(Vec<Message>, String)>>,
}

impl StubService {
    pub(crate) fn replying(reply: &str) -> Self {
        Self {
            reply: Mutex::new(Ok(reply.to_string())),
            models: Vec::new(),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing(status: u16) -> Self {
        let stub = Self::replying("");
        *stub.reply.lock().unwrap() = Err(status);
        stub
    }

    pub(crate) fn with_models(mut self, models: Vec<ModelDescriptor>) -> Self {
        self.models = models;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_request(&self) -> Option<(Vec<Message>, String)> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl CompletionService for StubService {
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        match &*self.reply.lock().unwrap() {
            Ok(_) => Ok(self.models.clone()),
            Err(status) => Err(PlanktonError::Remote {
                status: *status,
                body: "stub".into(),
            }),
        }
    }

    async fn complete(&self, messages: &[Message], model: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap()
            .push((messages.to_vec(), model.to_string()));
        match &*self.reply.lock().unwrap() {
            Ok(text) => Ok(text.clone()),
            Err(status) => Err(PlanktonError::Remote {
                status: *status,
                body: "stub".into(),
            }),
        }
    }
}

pub(crate) fn model(id: &str, name: &str, description: Option<&str>) -> ModelDescriptor {
    ModelDescriptor {
        id: id.to_string(),
        name: name.to_string(),
        description: description.map(|s| s.to_string()),
    }
}
