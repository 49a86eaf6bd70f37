use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{sync::Mutex, thread, time::Duration};

use crate::models::{Settings, DEFAULT_AUTOCOMPLETE_DELAY_MS};

pub const KEY_API_KEY: &str = "openRouterApiKey";
pub const KEY_SELECTED_MODEL: &str = "selectedModel";
pub const KEY_AUTOCOMPLETE_ENABLED: &str = "autocompleteEnabled";
pub const KEY_AUTOCOMPLETE_DELAY: &str = "autocompleteDelay";
pub const KEY_TELEMETRY_ENABLED: &str = "telemetry_enabled";

/**
 * \brief 打开默认数据库文件（PLANKTON_DB 或本地目录下的 plankton.db）。
 */
pub fn open_default_db() -> Result<Connection> {
    let path = std::env::var("PLANKTON_DB").unwrap_or_else(|_| "plankton.db".to_string());
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建配置表。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
        )
    })?;
    Ok(())
}

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>> {
    let val = conn
        .query_row(
            "SELECT value FROM app_config WHERE key=?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(val)
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )
    })?;
    Ok(())
}

pub fn delete_config(conn: &Connection, key: &str) -> Result<()> {
    retry_on_locked(|| conn.execute("DELETE FROM app_config WHERE key=?1", params![key]))?;
    Ok(())
}

fn set_bool_config(conn: &Connection, key: &str, value: bool) -> Result<()> {
    set_config(conn, key, if value { "1" } else { "0" })
}

fn get_bool_config(conn: &Connection, key: &str, default: bool) -> Result<bool> {
    Ok(get_config(conn, key)?
        .map(|s| s == "1" || s == "true")
        .unwrap_or(default))
}

/**
 * \brief 读取全部会话设置；缺失或无法解析的值回落到默认值。
 */
pub fn load_settings(conn: &Connection) -> Result<Settings> {
    let api_key = get_config(conn, KEY_API_KEY)?.filter(|s| !s.is_empty());
    let selected_model = get_config(conn, KEY_SELECTED_MODEL)?.filter(|s| !s.is_empty());
    let autocomplete_enabled = get_bool_config(conn, KEY_AUTOCOMPLETE_ENABLED, false)?;
    let autocomplete_delay_ms = get_config(conn, KEY_AUTOCOMPLETE_DELAY)?
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_AUTOCOMPLETE_DELAY_MS);
    Ok(Settings {
        api_key,
        selected_model,
        autocomplete_enabled,
        autocomplete_delay_ms,
    })
}

/**
 * \brief 读取遥测开关。
 */
pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    get_bool_config(conn, KEY_TELEMETRY_ENABLED, false)
}

/**
 * \brief 更新遥测开关。
 */
pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_bool_config(conn, KEY_TELEMETRY_ENABLED, enabled)
}

/**
 * \brief 本地设置存储，包装单连接供会话跨任务共享。
 */
pub struct SettingsStore {
    conn: Mutex<Connection>,
}

impl SettingsStore {
    /** \brief 接管连接并执行迁移。 */
    pub fn new(conn: Connection) -> Result<Self> {
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_default() -> Result<Self> {
        Self::new(open_default_db()?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| anyhow!("settings connection poisoned"))?;
        f(&guard)
    }

    pub fn load(&self) -> Result<Settings> {
        self.with_conn(load_settings)
    }

    pub fn save_api_key(&self, api_key: &str) -> Result<()> {
        self.with_conn(|c| set_config(c, KEY_API_KEY, api_key))
    }

    pub fn save_selected_model(&self, model: &str) -> Result<()> {
        self.with_conn(|c| set_config(c, KEY_SELECTED_MODEL, model))
    }

    pub fn save_autocomplete_enabled(&self, enabled: bool) -> Result<()> {
        self.with_conn(|c| set_bool_config(c, KEY_AUTOCOMPLETE_ENABLED, enabled))
    }

    pub fn save_autocomplete_delay(&self, delay_ms: u64) -> Result<()> {
        self.with_conn(|c| set_config(c, KEY_AUTOCOMPLETE_DELAY, &delay_ms.to_string()))
    }

    pub fn telemetry_enabled(&self) -> Result<bool> {
        self.with_conn(get_telemetry_enabled)
    }

    pub fn save_telemetry_enabled(&self, enabled: bool) -> Result<()> {
        self.with_conn(|c| set_telemetry_enabled(c, enabled))
    }
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行线性退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}
