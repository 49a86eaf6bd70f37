use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/** \brief 未选择模型时使用的默认模型。 */
pub const DEFAULT_MODEL: &str = "openai/gpt-3.5-turbo";

/** \brief 自动补全默认延迟（毫秒）。 */
pub const DEFAULT_AUTOCOMPLETE_DELAY_MS: u64 = 1000;

/**
 * \brief 远端模型目录中的一项。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /** \brief 模型标识，如 "openai/gpt-4o" */
    pub id: String,
    /** \brief 显示名称 */
    pub name: String,
    /** \brief 描述（可选） */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ModelDescriptor {
    /**
     * \brief 过滤用的检索文本：id、名称、描述以空格拼接。
     */
    pub fn search_text(&self) -> String {
        format!(
            "{} {} {}",
            self.id,
            self.name,
            self.description.as_deref().unwrap_or("")
        )
    }
}

/**
 * \brief 消息角色。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /** \brief 角色：system/user/assistant */
    pub role: Role,
    /** \brief 内容 */
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/**
 * \brief 会话设置，启动时从本地存储恢复。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /** \brief API Key（明文存储于本地配置表） */
    pub api_key: Option<String>,
    /** \brief 当前选择的模型 */
    pub selected_model: Option<String>,
    /** \brief 是否开启自动补全 */
    pub autocomplete_enabled: bool,
    /** \brief 自动补全延迟（毫秒） */
    pub autocomplete_delay_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: None,
            selected_model: None,
            autocomplete_enabled: false,
            autocomplete_delay_ms: DEFAULT_AUTOCOMPLETE_DELAY_MS,
        }
    }
}

impl Settings {
    pub fn model_or_default(&self) -> &str {
        self.selected_model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    pub fn autocomplete_delay(&self) -> Duration {
        Duration::from_millis(self.autocomplete_delay_ms)
    }
}

/**
 * \brief 段落对齐方式。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Alignment {
    #[default]
    Left,
    Center,
    Right,
    Justify,
}

impl FromStr for Alignment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "left" => Ok(Alignment::Left),
            "center" | "centre" => Ok(Alignment::Center),
            "right" => Ok(Alignment::Right),
            "justify" | "justified" => Ok(Alignment::Justify),
            other => Err(format!("unknown alignment: {}", other)),
        }
    }
}

impl fmt::Display for Alignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Alignment::Left => "left",
            Alignment::Center => "center",
            Alignment::Right => "right",
            Alignment::Justify => "justify",
        };
        f.write_str(s)
    }
}

/**
 * \brief 全文格式化参数。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Formatting {
    pub font_name: String,
    pub font_size: f32,
    /** \brief 行距（磅） */
    pub line_spacing: f32,
    pub alignment: Alignment,
}

/**
 * \brief 状态栏的三种类别。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Success,
    Error,
    Loading,
}

/**
 * \brief 每次操作后展示给用户的状态。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub kind: StatusKind,
    pub message: String,
}

impl Status {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            kind: StatusKind::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: StatusKind::Error,
            message: message.into(),
        }
    }

    pub fn loading(message: impl Into<String>) -> Self {
        Self {
            kind: StatusKind::Loading,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == StatusKind::Success
    }
}
