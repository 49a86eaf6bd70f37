use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};

use crate::errors::{PlanktonError, Result};
use crate::models::{Message, ModelDescriptor};

/** \brief 默认远端地址（OpenRouter 兼容）。 */
pub const DEFAULT_API_BASE: &str = "https://openrouter.ai/api/v1";
const DEFAULT_REFERER: &str = "https://localhost";
const CLIENT_TITLE: &str = "Word AI Assistant";

const IMPROVE_PROMPT: &str = "You are a helpful writing assistant. Improve the following text while maintaining its original meaning and tone.";
const GRAMMAR_PROMPT: &str = "You are a grammar correction assistant. Fix any grammatical errors in the following text while preserving its meaning.";
const IDEAS_PROMPT: &str =
    "You are a creative writing assistant. Generate ideas based on the given prompt.";
const REWRITE_PROMPT: &str = "You are a helpful writing assistant. Rewrite the text the user provides according to their instruction. Reply with the rewritten text only.";
const AUTOCOMPLETE_PROMPT: &str = "You are an autocomplete assistant. Given the current text, provide a natural continuation that matches the style and context. Keep the continuation concise and relevant. Only provide the continuation text, do not repeat the input text.";

/**
 * \brief 补全服务抽象；便捷操作是固定模板，最终都转发给 `complete`。
 */
#[async_trait]
pub trait CompletionService: Send + Sync {
    /** \brief 列出远端模型目录。 */
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>>;

    /** \brief 非流式调用，返回第一条 choice 的内容。 */
    async fn complete(&self, messages: &[Message], model: &str) -> Result<String>;

    async fn improve(&self, text: &str, model: &str) -> Result<String> {
        self.complete(&improve_messages(text), model).await
    }

    async fn fix_grammar(&self, text: &str, model: &str) -> Result<String> {
        self.complete(&grammar_messages(text), model).await
    }

    async fn generate_ideas(&self, prompt: &str, model: &str) -> Result<String> {
        self.complete(&ideas_messages(prompt), model).await
    }

    async fn rewrite(&self, text: &str, instruction: &str, model: &str) -> Result<String> {
        self.complete(&rewrite_messages(text, instruction), model).await
    }

    async fn autocomplete(&self, text: &str, model: &str) -> Result<String> {
        self.complete(&autocomplete_messages(text), model).await
    }
}

pub fn improve_messages(text: &str) -> Vec<Message> {
    vec![Message::system(IMPROVE_PROMPT), Message::user(text)]
}

pub fn grammar_messages(text: &str) -> Vec<Message> {
    vec![Message::system(GRAMMAR_PROMPT), Message::user(text)]
}

pub fn ideas_messages(prompt: &str) -> Vec<Message> {
    vec![Message::system(IDEAS_PROMPT), Message::user(prompt)]
}

pub fn rewrite_messages(text: &str, instruction: &str) -> Vec<Message> {
    vec![
        Message::system(REWRITE_PROMPT),
        Message::user(format!("Instruction: {}\n\nText:\n{}", instruction, text)),
    ]
}

pub fn autocomplete_messages(text: &str) -> Vec<Message> {
    vec![Message::system(AUTOCOMPLETE_PROMPT), Message::user(text)]
}

/**
 * \brief 基于 reqwest 的 OpenRouter 兼容客户端。
 */
#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    referer: String,
}

impl OpenRouterClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base(DEFAULT_API_BASE, api_key)
    }

    pub fn with_base(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            referer: DEFAULT_REFERER.to_string(),
        }
    }

    /**
     * \brief 读取 PLANKTON_API_BASE / PLANKTON_REFERER 环境变量构造客户端。
     */
    pub fn from_env(api_key: impl Into<String>) -> Self {
        let base =
            std::env::var("PLANKTON_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());
        let mut client = Self::with_base(base, api_key);
        if let Ok(referer) = std::env::var("PLANKTON_REFERER") {
            client.referer = referer;
        }
        client
    }

    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = referer.into();
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|_| PlanktonError::precondition("API key contains invalid characters"))?,
        );
        headers.insert(
            "http-referer",
            HeaderValue::from_str(&self.referer)
                .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_REFERER)),
        );
        headers.insert("x-title", HeaderValue::from_static(CLIENT_TITLE));
        Ok(headers)
    }
}

#[async_trait]
impl CompletionService for OpenRouterClient {
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        let url = format!("{}/models", self.api_base);
        let resp = self.http.get(url).headers(self.headers()?).send().await?;
        let v = read_json(resp).await?;
        parse_model_list(&v)
    }

    async fn complete(&self, messages: &[Message], model: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = json!({
            "model": model,
            "messages": messages,
        });
        let resp = self
            .http
            .post(url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await?;
        let v = read_json(resp).await?;
        extract_choice_content(&v)
    }
}

async fn read_json(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(PlanktonError::Remote {
            status: status.as_u16(),
            body: text,
        });
    }
    serde_json::from_str(&text)
        .map_err(|e| PlanktonError::MalformedResponse(format!("invalid json: {}", e)))
}

fn extract_choice_content(v: &Value) -> Result<String> {
    v.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| PlanktonError::MalformedResponse("response has no usable choice".into()))
}

fn parse_model_list(v: &Value) -> Result<Vec<ModelDescriptor>> {
    let arr = v
        .get("data")
        .and_then(|x| x.as_array())
        .ok_or_else(|| PlanktonError::MalformedResponse("models payload has no data".into()))?;
    Ok(arr
        .iter()
        .filter_map(|item| {
            let id = item.get("id").and_then(|s| s.as_str())?;
            let name = item
                .get("name")
                .and_then(|s| s.as_str())
                .unwrap_or(id)
                .to_string();
            let description = item
                .get("description")
                .and_then(|s| s.as_str())
                .map(|s| s.to_string());
            Some(ModelDescriptor {
                id: id.to_string(),
                name,
                description,
            })
        })
        .collect())
}
