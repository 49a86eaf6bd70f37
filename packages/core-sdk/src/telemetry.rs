use std::{
    collections::VecDeque,
    fs::OpenOptions,
    io::Write,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use anyhow::Result;
use serde::Serialize;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

const LOG_PREFIX: &str = "[Plankton AI]";

/**
 * \brief 日志级别。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Error,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Error => "ERROR",
        }
    }
}

/**
 * \brief 日志协作者，由会话注入到各组件。
 */
pub trait Logger: Send + Sync {
    fn log(&self, message: &str, level: LogLevel);

    fn info(&self, message: &str) {
        self.log(message, LogLevel::Info);
    }

    fn error(&self, message: &str) {
        self.log(message, LogLevel::Error);
    }
}

/**
 * \brief 生成带前缀与时间戳的日志行。
 */
pub fn format_line(message: &str) -> String {
    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();
    format!("{} {} - {}", LOG_PREFIX, timestamp, message)
}

/**
 * \brief 文件日志：开启遥测时追加写入 logs/plankton.log，错误始终输出到 stderr。
 */
pub struct FileLogger {
    dir: PathBuf,
    enabled: AtomicBool,
}

impl FileLogger {
    pub fn new(dir: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            dir: dir.into(),
            enabled: AtomicBool::new(enabled),
        }
    }

    /**
     * \brief 更新遥测开关状态。
     */
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn write_line(&self, level: LogLevel, line: &str) -> Result<()> {
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join("plankton.log"))?;
        writeln!(file, "[{}] {}", level.as_str(), line)?;
        Ok(())
    }
}

impl Default for FileLogger {
    fn default() -> Self {
        Self::new("logs", false)
    }
}

impl Logger for FileLogger {
    fn log(&self, message: &str, level: LogLevel) {
        let line = format_line(message);
        if level == LogLevel::Error {
            eprintln!("{}", line);
        }
        if !self.is_enabled() {
            return;
        }
        if let Err(err) = self.write_line(level, &line) {
            eprintln!("telemetry write failed: {}", err);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub line: String,
}

/**
 * \brief 内存日志：保留最近若干条，供日志面板读取；可转发给下游日志。
 */
pub struct MemoryLogger {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
    forward: Option<Arc<dyn Logger>>,
}

impl MemoryLogger {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            forward: None,
        }
    }

    pub fn forwarding(capacity: usize, forward: Arc<dyn Logger>) -> Self {
        Self {
            forward: Some(forward),
            ..Self::new(capacity)
        }
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .map(|g| g.iter().cloned().collect())
            .unwrap_or_default()
    }

    /** \brief 指定级别的条目中是否有包含 needle 的行。 */
    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.entries()
            .iter()
            .any(|e| e.level == level && e.line.contains(needle))
    }
}

impl Logger for MemoryLogger {
    fn log(&self, message: &str, level: LogLevel) {
        if let Ok(mut guard) = self.entries.lock() {
            if guard.len() == self.capacity {
                guard.pop_front();
            }
            guard.push_back(LogEntry {
                level,
                line: format_line(message),
            });
        }
        if let Some(next) = &self.forward {
            next.log(message, level);
        }
    }
}
