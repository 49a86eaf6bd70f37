use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde::Serialize;

use crate::errors::{PlanktonError, Result};
use crate::models::{Alignment, Formatting};

/** \brief 选区变化回调。 */
pub type SelectionListener = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct ListenerTable {
    next_id: u64,
    listeners: BTreeMap<u64, SelectionListener>,
}

/**
 * \brief 选区监听注册表，宿主实现可直接复用。
 */
#[derive(Default, Clone)]
pub struct SelectionListeners {
    table: Arc<Mutex<ListenerTable>>,
}

impl SelectionListeners {
    /**
     * \brief 注册监听；注册表锁中毒时返回错误，不会交出空句柄。
     */
    pub fn subscribe(&self, listener: SelectionListener) -> Result<SelectionSubscription> {
        let mut guard = self
            .table
            .lock()
            .map_err(|_| PlanktonError::Document("selection listeners poisoned".into()))?;
        guard.next_id += 1;
        let id = guard.next_id;
        guard.listeners.insert(id, listener);
        Ok(SelectionSubscription {
            id,
            table: Arc::downgrade(&self.table),
        })
    }

    /**
     * \brief 通知所有监听者；回调在锁外执行。
     */
    pub fn notify(&self) {
        let listeners: Vec<SelectionListener> = match self.table.lock() {
            Ok(guard) => guard.listeners.values().cloned().collect(),
            Err(_) => return,
        };
        for listener in listeners {
            listener();
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().map(|g| g.listeners.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/**
 * \brief 订阅句柄；调用 `unsubscribe` 或析构即注销。
 */
pub struct SelectionSubscription {
    id: u64,
    table: Weak<Mutex<ListenerTable>>,
}

impl SelectionSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for SelectionSubscription {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            if let Ok(mut guard) = table.lock() {
                guard.listeners.remove(&self.id);
            }
        }
    }
}

/**
 * \brief 宿主文档访问接口。写操作在宿主确认提交后才返回。
 */
#[async_trait]
pub trait DocumentAccessor: Send + Sync {
    /** \brief 当前选区文本，可能为空。 */
    async fn selected_text(&self) -> Result<String>;

    /** \brief 文档正文全文。 */
    async fn body_text(&self) -> Result<String>;

    /**
     * \brief 以选区为中心向两侧各扩展 radius 个字符，越界时截断到文档边界。
     * \details 默认实现在正文中查找选区文本的第一次出现作为锚点；
     *  选区文本在前文重复出现时会锚定到错误位置。能拿到真实区间的宿主应覆盖此方法。
     */
    async fn surrounding_text(&self, radius: usize) -> Result<String> {
        let body = self.body_text().await?;
        let selection = self.selected_text().await?;
        Ok(surrounding_by_first_occurrence(&body, &selection, radius))
    }

    async fn replace_selection(&self, text: &str) -> Result<()>;

    /** \brief 在选区末尾插入文本，光标移到插入内容之后。 */
    async fn insert_text(&self, text: &str) -> Result<()>;

    /** \brief 设置全文字体字号，并为每个段落设置行距与对齐。 */
    async fn apply_formatting(&self, formatting: &Formatting) -> Result<()>;

    fn subscribe_selection(&self, listener: SelectionListener) -> Result<SelectionSubscription>;
}

pub fn surrounding_by_first_occurrence(body: &str, selection: &str, radius: usize) -> String {
    let start = body
        .find(selection)
        .map(|byte| body[..byte].chars().count())
        .unwrap_or(0);
    let len = if body.contains(selection) {
        selection.chars().count()
    } else {
        0
    };
    surrounding_by_range(body, start, start + len, radius)
}

/**
 * \brief 按字符区间 [start, end) 扩展 radius，结果截断到边界。
 */
pub fn surrounding_by_range(body: &str, start: usize, end: usize, radius: usize) -> String {
    let total = body.chars().count();
    let end = end.min(total);
    let start = start.min(end);
    let from = start.saturating_sub(radius);
    let to = end.saturating_add(radius).min(total);
    body.chars().skip(from).take(to - from).collect()
}

fn check_selection(text: &str, start: usize, end: usize) -> Result<()> {
    let total = text.chars().count();
    if start > end || end > total {
        return Err(PlanktonError::Document(format!(
            "selection {}..{} out of bounds (len {})",
            start, end, total
        )));
    }
    Ok(())
}

fn byte_offset(text: &str, char_idx: usize) -> usize {
    text.char_indices()
        .nth(char_idx)
        .map(|(i, _)| i)
        .unwrap_or(text.len())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParagraphFormat {
    pub line_spacing: f32,
    pub alignment: Alignment,
}

/**
 * \brief 文档格式快照。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DocumentFormat {
    pub font_name: Option<String>,
    pub font_size: Option<f32>,
    pub paragraphs: Vec<ParagraphFormat>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentSnapshot {
    pub text: String,
    pub selection_start: usize,
    pub selection_end: usize,
    pub format: DocumentFormat,
}

#[derive(Debug, Default)]
struct DocState {
    text: String,
    /** 字符下标 */
    start: usize,
    end: usize,
    format: DocumentFormat,
}

/**
 * \brief 内存宿主文档：文本缓冲 + 字符区间选区 + 段落格式。
 * \details 仅 `set_selection` 触发选区变化通知，程序写入不触发，避免自动补全自我循环。
 */
#[derive(Default)]
pub struct MemoryDocument {
    state: Mutex<DocState>,
    listeners: SelectionListeners,
}

impl MemoryDocument {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let end = text.chars().count();
        Self {
            state: Mutex::new(DocState {
                text,
                start: end,
                end,
                format: DocumentFormat::default(),
            }),
            listeners: SelectionListeners::default(),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, DocState>> {
        self.state
            .lock()
            .map_err(|_| PlanktonError::Document("document state poisoned".into()))
    }

    /**
     * \brief 用户移动选区；成功后通知监听者。
     */
    pub fn set_selection(&self, start: usize, end: usize) -> Result<()> {
        {
            let mut state = self.lock()?;
            check_selection(&state.text, start, end)?;
            state.start = start;
            state.end = end;
        }
        self.listeners.notify();
        Ok(())
    }

    /**
     * \brief 整体替换内容（例如重新加载文件），选区放到给定位置并通知。
     * \details 选区越界时返回错误，原文本与选区保持不变。
     */
    pub fn load(&self, text: impl Into<String>, start: usize, end: usize) -> Result<()> {
        let text = text.into();
        {
            let mut state = self.lock()?;
            check_selection(&text, start, end)?;
            state.text = text;
            state.start = start;
            state.end = end;
        }
        self.listeners.notify();
        Ok(())
    }

    pub fn text(&self) -> String {
        self.lock().map(|s| s.text.clone()).unwrap_or_default()
    }

    pub fn selection(&self) -> (usize, usize) {
        self.lock().map(|s| (s.start, s.end)).unwrap_or((0, 0))
    }

    pub fn format(&self) -> DocumentFormat {
        self.lock().map(|s| s.format.clone()).unwrap_or_default()
    }

    pub fn snapshot(&self) -> Result<DocumentSnapshot> {
        let state = self.lock()?;
        Ok(DocumentSnapshot {
            text: state.text.clone(),
            selection_start: state.start,
            selection_end: state.end,
            format: state.format.clone(),
        })
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

#[async_trait]
impl DocumentAccessor for MemoryDocument {
    async fn selected_text(&self) -> Result<String> {
        let state = self.lock()?;
        Ok(state
            .text
            .chars()
            .skip(state.start)
            .take(state.end - state.start)
            .collect())
    }

    async fn body_text(&self) -> Result<String> {
        Ok(self.lock()?.text.clone())
    }

    async fn surrounding_text(&self, radius: usize) -> Result<String> {
        let state = self.lock()?;
        Ok(surrounding_by_range(&state.text, state.start, state.end, radius))
    }

    async fn replace_selection(&self, text: &str) -> Result<()> {
        let mut state = self.lock()?;
        let from = byte_offset(&state.text, state.start);
        let to = byte_offset(&state.text, state.end);
        state.text.replace_range(from..to, text);
        state.end = state.start + text.chars().count();
        Ok(())
    }

    async fn insert_text(&self, text: &str) -> Result<()> {
        let mut state = self.lock()?;
        let at = byte_offset(&state.text, state.end);
        state.text.insert_str(at, text);
        state.end += text.chars().count();
        state.start = state.end;
        Ok(())
    }

    async fn apply_formatting(&self, formatting: &Formatting) -> Result<()> {
        let mut state = self.lock()?;
        let count = state.text.split('\n').count();
        state.format = DocumentFormat {
            font_name: Some(formatting.font_name.clone()),
            font_size: Some(formatting.font_size),
            paragraphs: vec![
                ParagraphFormat {
                    line_spacing: formatting.line_spacing,
                    alignment: formatting.alignment,
                };
                count
            ],
        };
        Ok(())
    }

    fn subscribe_selection(&self, listener: SelectionListener) -> Result<SelectionSubscription> {
        self.listeners.subscribe(listener)
    }
}
