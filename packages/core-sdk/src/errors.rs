use thiserror::Error;

/**
 * \brief SDK 统一错误类型。
 */
#[derive(Debug, Error)]
pub enum PlanktonError {
    /** \brief 远端返回非 2xx 状态。 */
    #[error("remote request failed: {status} -> {body}")]
    Remote { status: u16, body: String },

    /** \brief 响应缺少预期字段。 */
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /** \brief 缺少 API Key、选区或输入。 */
    #[error("{0}")]
    Precondition(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("document error: {0}")]
    Document(String),

    #[error("settings store error: {0}")]
    Settings(String),
}

impl PlanktonError {
    pub fn precondition(message: impl Into<String>) -> Self {
        PlanktonError::Precondition(message.into())
    }

    /**
     * \brief 面向状态栏的简短原因；前置条件错误直接展示原文。
     */
    pub fn short_reason(&self) -> Option<String> {
        match self {
            PlanktonError::Remote { status, .. } => Some(format!("HTTP {}", status)),
            PlanktonError::MalformedResponse(_) => Some("unexpected response".to_string()),
            PlanktonError::Transport(_) => Some("network error".to_string()),
            PlanktonError::Document(_) => Some("document unavailable".to_string()),
            PlanktonError::Settings(_) => Some("settings unavailable".to_string()),
            PlanktonError::Precondition(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PlanktonError>;
