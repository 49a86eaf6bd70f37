use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::autocomplete::{AutocompleteConfig, AutocompleteTrigger, SURROUNDING_RADIUS};
use crate::db::SettingsStore;
use crate::document::DocumentAccessor;
use crate::errors::{PlanktonError, Result};
use crate::llm::{CompletionService, OpenRouterClient};
use crate::models::{Formatting, ModelDescriptor, Settings, Status};
use crate::telemetry::Logger;

/** \brief 由 API Key 构造补全服务。 */
pub type ClientFactory = Arc<dyn Fn(&str) -> Arc<dyn CompletionService> + Send + Sync>;

/**
 * \brief 用户可触发的文档操作。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Improve,
    FixGrammar,
    /** \brief 按自定义指令改写选区 */
    Rewrite { instruction: String },
    /** \brief 以选区为上下文生成想法，插入到选区之后 */
    GenerateIdeas,
    Format(Formatting),
}

struct ActionLabels {
    progress: &'static str,
    success: &'static str,
    failure: &'static str,
}

impl Action {
    fn labels(&self) -> ActionLabels {
        match self {
            Action::Improve => ActionLabels {
                progress: "Improving text...",
                success: "Text improved successfully",
                failure: "Error improving text",
            },
            Action::FixGrammar => ActionLabels {
                progress: "Fixing grammar...",
                success: "Grammar fixed successfully",
                failure: "Error fixing grammar",
            },
            Action::Rewrite { .. } => ActionLabels {
                progress: "Rewriting text...",
                success: "Text rewritten successfully",
                failure: "Error rewriting text",
            },
            Action::GenerateIdeas => ActionLabels {
                progress: "Generating ideas...",
                success: "Ideas generated successfully",
                failure: "Error generating ideas",
            },
            Action::Format(_) => ActionLabels {
                progress: "Applying formatting...",
                success: "Formatting applied successfully",
                failure: "Error applying formatting",
            },
        }
    }

    fn empty_selection_message(&self) -> &'static str {
        match self {
            Action::GenerateIdeas => "Please select some text as context",
            _ => "Please select some text first",
        }
    }
}

/**
 * \brief 按名称排序（不区分大小写，名称相同按 id）。
 */
pub fn sort_by_name(models: &mut [ModelDescriptor]) {
    models.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.id.cmp(&b.id))
    });
}

/**
 * \brief 在 id、名称、描述拼接文本上做不区分大小写的子串匹配，不修改输入。
 */
pub fn filter_models(models: &[ModelDescriptor], term: &str) -> Vec<ModelDescriptor> {
    let needle = term.trim().to_lowercase();
    let mut out: Vec<ModelDescriptor> = models
        .iter()
        .filter(|m| needle.is_empty() || m.search_text().to_lowercase().contains(&needle))
        .cloned()
        .collect();
    sort_by_name(&mut out);
    out
}

/**
 * \brief 会话控制器：每个应用生命周期构造一次，持有客户端、模型列表、自动补全与状态。
 */
pub struct Session {
    store: SettingsStore,
    settings: RwLock<Settings>,
    factory: ClientFactory,
    client: RwLock<Option<Arc<dyn CompletionService>>>,
    models: RwLock<Arc<Vec<ModelDescriptor>>>,
    document: Arc<dyn DocumentAccessor>,
    edit_lock: Arc<tokio::sync::Mutex<()>>,
    autocomplete: AutocompleteTrigger,
    status: watch::Sender<Status>,
    logger: Arc<dyn Logger>,
}

impl Session {
    pub fn new(
        store: SettingsStore,
        document: Arc<dyn DocumentAccessor>,
        logger: Arc<dyn Logger>,
        factory: ClientFactory,
    ) -> Self {
        let edit_lock = Arc::new(tokio::sync::Mutex::new(()));
        let autocomplete =
            AutocompleteTrigger::new(document.clone(), logger.clone(), edit_lock.clone());
        let (status, _) = watch::channel(Status::success("Ready"));
        Self {
            store,
            settings: RwLock::new(Settings::default()),
            factory,
            client: RwLock::new(None),
            models: RwLock::new(Arc::new(Vec::new())),
            document,
            edit_lock,
            autocomplete,
            status,
            logger,
        }
    }

    /**
     * \brief 使用 OpenRouter 客户端（读取 PLANKTON_API_BASE 等环境变量）。
     */
    pub fn with_openrouter(
        store: SettingsStore,
        document: Arc<dyn DocumentAccessor>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        let factory: ClientFactory = Arc::new(|key: &str| {
            Arc::new(OpenRouterClient::from_env(key)) as Arc<dyn CompletionService>
        });
        Self::new(store, document, logger, factory)
    }

    /**
     * \brief 启动时恢复上次的设置：初始化客户端，并按需开启自动补全。
     */
    pub fn restore(&self) -> Result<Settings> {
        let settings = self
            .store
            .load()
            .map_err(|e| PlanktonError::Settings(e.to_string()))?;
        if let Some(key) = settings.api_key.as_deref() {
            self.install_client(key);
        }
        self.write_settings(|s| *s = settings.clone());
        if settings.autocomplete_enabled {
            match self.require_client() {
                Ok(client) => {
                    let armed = self.autocomplete.enable(client, self.autocomplete_config());
                    if let Err(err) = armed {
                        self.logger
                            .error(&format!("restore autocomplete failed: {}", err));
                    }
                }
                Err(_) => self
                    .logger
                    .info("autocomplete enabled but no API key saved; leaving it off"),
            }
        }
        self.logger.info("session restored");
        Ok(settings)
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn settings_store(&self) -> &SettingsStore {
        &self.store
    }

    pub fn document(&self) -> &Arc<dyn DocumentAccessor> {
        &self.document
    }

    pub fn has_client(&self) -> bool {
        self.client.read().map(|c| c.is_some()).unwrap_or(false)
    }

    pub fn autocomplete_armed(&self) -> bool {
        self.autocomplete.is_armed()
    }

    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    /** \brief 当前模型列表（整体替换，不会被局部修改）。 */
    pub fn models(&self) -> Arc<Vec<ModelDescriptor>> {
        self.models.read().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn filter_models(&self, term: &str) -> Vec<ModelDescriptor> {
        filter_models(&self.models(), term)
    }

    pub fn set_api_key(&self, api_key: &str) -> Status {
        let result = (|| -> Result<String> {
            let key = api_key.trim();
            if key.is_empty() {
                return Err(PlanktonError::precondition("Please enter an API key"));
            }
            self.store
                .save_api_key(key)
                .map_err(|e| PlanktonError::Settings(e.to_string()))?;
            self.write_settings(|s| s.api_key = Some(key.to_string()));
            let client = self.install_client(key);
            if self.autocomplete.is_armed() {
                self.autocomplete.enable(client, self.autocomplete_config())?;
            }
            Ok("API key saved".to_string())
        })();
        self.finish("Error saving API key", result)
    }

    /**
     * \brief 拉取远端模型目录，按名称排序后整体替换内存列表。
     */
    pub async fn refresh_models(&self) -> Status {
        self.report(Status::loading("Loading models..."));
        let result = async {
            let client = self.require_client()?;
            let mut models = client.list_models().await?;
            sort_by_name(&mut models);
            let count = models.len();
            if let Ok(mut guard) = self.models.write() {
                *guard = Arc::new(models);
            }
            Ok::<String, PlanktonError>(format!("Loaded {} models", count))
        }
        .await;
        self.finish("Error loading models", result)
    }

    pub fn select_model(&self, model_id: &str) -> Status {
        let result = (|| -> Result<String> {
            let id = model_id.trim();
            if id.is_empty() {
                return Err(PlanktonError::precondition("Please choose a model"));
            }
            self.store
                .save_selected_model(id)
                .map_err(|e| PlanktonError::Settings(e.to_string()))?;
            self.write_settings(|s| s.selected_model = Some(id.to_string()));
            self.autocomplete.update_config(self.autocomplete_config());
            Ok(format!("Model set to {}", id))
        })();
        self.finish("Error selecting model", result)
    }

    pub fn set_autocomplete(&self, enabled: bool) -> Status {
        let result = (|| -> Result<String> {
            let client = if enabled {
                Some(self.require_client()?)
            } else {
                None
            };
            // 先落盘，写入失败时触发器保持原状态
            self.store
                .save_autocomplete_enabled(enabled)
                .map_err(|e| PlanktonError::Settings(e.to_string()))?;
            match client {
                Some(client) => {
                    let armed = self.autocomplete.enable(client, self.autocomplete_config());
                    if let Err(err) = armed {
                        let previous = self.settings().autocomplete_enabled;
                        if let Err(e) = self.store.save_autocomplete_enabled(previous) {
                            self.logger
                                .error(&format!("rollback autocomplete flag failed: {}", e));
                        }
                        return Err(err);
                    }
                }
                None => self.autocomplete.disable(),
            }
            self.write_settings(|s| s.autocomplete_enabled = enabled);
            Ok(if enabled {
                "Autocomplete enabled".to_string()
            } else {
                "Autocomplete disabled".to_string()
            })
        })();
        self.finish("Error updating autocomplete", result)
    }

    pub fn set_autocomplete_delay(&self, delay_ms: u64) -> Status {
        let result = (|| -> Result<String> {
            if delay_ms == 0 {
                return Err(PlanktonError::precondition(
                    "Autocomplete delay must be greater than zero",
                ));
            }
            self.store
                .save_autocomplete_delay(delay_ms)
                .map_err(|e| PlanktonError::Settings(e.to_string()))?;
            self.write_settings(|s| s.autocomplete_delay_ms = delay_ms);
            self.autocomplete.update_config(self.autocomplete_config());
            Ok(format!("Autocomplete delay set to {} ms", delay_ms))
        })();
        self.finish("Error updating autocomplete", result)
    }

    /**
     * \brief 执行一次用户操作；所有错误在此捕获并转为状态消息。
     */
    pub async fn run(&self, action: Action) -> Status {
        let labels = action.labels();
        self.report(Status::loading(labels.progress));
        self.logger.info(&format!("action {:?} started", action));
        let result = self.execute(&action).await.map(|_| labels.success.to_string());
        self.finish(labels.failure, result)
    }

    /**
     * \brief 在光标处手动请求一次续写。
     */
    pub async fn suggest_once(&self) -> Status {
        self.report(Status::loading("Fetching suggestion..."));
        let result = async {
            let client = self.require_client()?;
            let _edit = self.edit_lock.lock().await;
            let context = self.document.surrounding_text(SURROUNDING_RADIUS).await?;
            if context.is_empty() {
                return Err(PlanktonError::precondition(
                    "Please write some text before requesting a suggestion",
                ));
            }
            let suggestion = client.autocomplete(&context, &self.current_model()).await?;
            if suggestion.is_empty() {
                return Ok("No suggestion returned".to_string());
            }
            self.document.insert_text(&suggestion).await?;
            Ok::<String, PlanktonError>("Suggestion inserted".to_string())
        }
        .await;
        self.finish("Error fetching suggestion", result)
    }

    async fn execute(&self, action: &Action) -> Result<()> {
        if let Action::Format(formatting) = action {
            let _edit = self.edit_lock.lock().await;
            return self.document.apply_formatting(formatting).await;
        }

        let client = self.require_client()?;
        if let Action::Rewrite { instruction } = action {
            if instruction.trim().is_empty() {
                return Err(PlanktonError::precondition("Please enter a prompt first"));
            }
        }

        let _edit = self.edit_lock.lock().await;
        let selected = self.document.selected_text().await?;
        if selected.is_empty() {
            return Err(PlanktonError::precondition(
                action.empty_selection_message(),
            ));
        }
        let model = self.current_model();
        match action {
            Action::Improve => {
                let out = client.improve(&selected, &model).await?;
                self.document.replace_selection(&out).await
            }
            Action::FixGrammar => {
                let out = client.fix_grammar(&selected, &model).await?;
                self.document.replace_selection(&out).await
            }
            Action::Rewrite { instruction } => {
                let out = client.rewrite(&selected, instruction, &model).await?;
                self.document.replace_selection(&out).await
            }
            Action::GenerateIdeas => {
                let out = client.generate_ideas(&selected, &model).await?;
                self.document.insert_text(&out).await
            }
            Action::Format(_) => Ok(()),
        }
    }

    fn install_client(&self, api_key: &str) -> Arc<dyn CompletionService> {
        let client = (self.factory)(api_key);
        if let Ok(mut guard) = self.client.write() {
            *guard = Some(client.clone());
        }
        client
    }

    fn require_client(&self) -> Result<Arc<dyn CompletionService>> {
        self.client
            .read()
            .ok()
            .and_then(|c| c.clone())
            .ok_or_else(|| PlanktonError::precondition("Please enter an API key first"))
    }

    fn current_model(&self) -> String {
        self.settings().model_or_default().to_string()
    }

    fn autocomplete_config(&self) -> AutocompleteConfig {
        let settings = self.settings();
        AutocompleteConfig {
            model: settings.model_or_default().to_string(),
            delay: settings.autocomplete_delay(),
        }
    }

    fn write_settings(&self, f: impl FnOnce(&mut Settings)) {
        if let Ok(mut guard) = self.settings.write() {
            f(&mut guard);
        }
    }

    fn report(&self, status: Status) {
        self.status.send_replace(status);
    }

    fn finish(&self, failure: &str, result: Result<String>) -> Status {
        let status = match result {
            Ok(message) => {
                self.logger.info(&message);
                Status::success(message)
            }
            Err(err) => {
                self.logger.error(&format!("{}: {}", failure, err));
                match err.short_reason() {
                    None => Status::error(err.to_string()),
                    Some(reason) => Status::error(format!(
                        "{} ({}). Please try again.",
                        failure, reason
                    )),
                }
            }
        };
        self.report(status.clone());
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::MemoryDocument;
    use crate::models::{Alignment, Role, StatusKind};
    use crate::telemetry::{LogLevel, MemoryLogger};
    use crate::testing::{model, StubService};
    use std::time::Duration;

    struct Fixture {
        session: Session,
        doc: Arc<MemoryDocument>,
        stub: Arc<StubService>,
        logger: Arc<MemoryLogger>,
    }

    fn fixture_with(stub: StubService, text: &str) -> Fixture {
        fixture_on(SettingsStore::in_memory().expect("store"), stub, text)
    }

    fn fixture_on(store: SettingsStore, stub: StubService, text: &str) -> Fixture {
        let doc = Arc::new(MemoryDocument::new(text));
        let logger = Arc::new(MemoryLogger::new(64));
        let stub = Arc::new(stub);
        let for_factory = stub.clone();
        let factory: ClientFactory =
            Arc::new(move |_key: &str| for_factory.clone() as Arc<dyn CompletionService>);
        let session = Session::new(store, doc.clone(), logger.clone(), factory);
        Fixture {
            session,
            doc,
            stub,
            logger,
        }
    }

    fn ready_fixture(reply: &str, text: &str) -> Fixture {
        let fx = fixture_with(StubService::replying(reply), text);
        assert!(fx.session.set_api_key("sk-test").is_success());
        fx
    }

    #[tokio::test]
    async fn test_improve_replaces_selection_with_reply() {
        let fx = ready_fixture("A polished sentence.", "Intro. a rough sentnce. Outro.");
        fx.doc.set_selection(7, 23).unwrap();

        let status = fx.session.run(Action::Improve).await;
        assert_eq!(status, Status::success("Text improved successfully"));
        assert_eq!(fx.doc.text(), "Intro. A polished sentence. Outro.");
        assert_eq!(fx.session.status(), status);

        let (messages, model) = fx.stub.last_request().expect("request");
        assert_eq!(model, "openai/gpt-3.5-turbo");
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].content, "a rough sentnce.");
    }

    #[tokio::test]
    async fn test_fix_grammar_and_rewrite_replace_selection() {
        let fx = ready_fixture("R", "one two three");
        fx.doc.set_selection(4, 7).unwrap();
        assert!(fx.session.run(Action::FixGrammar).await.is_success());
        assert_eq!(fx.doc.text(), "one R three");

        fx.doc.set_selection(0, 3).unwrap();
        let status = fx
            .session
            .run(Action::Rewrite {
                instruction: "make it formal".into(),
            })
            .await;
        assert_eq!(status.message, "Text rewritten successfully");
        assert_eq!(fx.doc.text(), "R R three");
        let (messages, _) = fx.stub.last_request().expect("request");
        assert!(messages[1].content.contains("make it formal"));
        assert!(messages[1].content.contains("one"));
    }

    #[tokio::test]
    async fn test_empty_selection_makes_no_remote_call() {
        let fx = ready_fixture("R", "some text");
        for action in [
            Action::Improve,
            Action::FixGrammar,
            Action::Rewrite {
                instruction: "shorter".into(),
            },
        ] {
            let status = fx.session.run(action).await;
            assert_eq!(status, Status::error("Please select some text first"));
        }
        assert_eq!(fx.stub.calls(), 0);
        assert_eq!(fx.doc.text(), "some text");
    }

    #[tokio::test]
    async fn test_missing_api_key_is_precondition_error() {
        let fx = fixture_with(StubService::replying("R"), "some text");
        fx.doc.set_selection(0, 4).unwrap();
        let status = fx.session.run(Action::Improve).await;
        assert_eq!(status, Status::error("Please enter an API key first"));
        assert_eq!(fx.stub.calls(), 0);

        let status = fx.session.set_api_key("   ");
        assert_eq!(status, Status::error("Please enter an API key"));
        assert!(!fx.session.has_client());
    }

    #[tokio::test]
    async fn test_remote_error_leaves_document_unchanged() {
        let fx = fixture_with(StubService::failing(500), "keep me");
        fx.session.set_api_key("sk-test");
        fx.doc.set_selection(0, 4).unwrap();

        let status = fx.session.run(Action::Improve).await;
        assert_eq!(status.kind, StatusKind::Error);
        assert_eq!(
            status.message,
            "Error improving text (HTTP 500). Please try again."
        );
        assert_eq!(fx.doc.text(), "keep me");
        assert!(fx.logger.contains(LogLevel::Error, "Error improving text"));
    }

    #[tokio::test]
    async fn test_generate_ideas_inserts_after_selection() {
        let fx = ready_fixture("\n- idea", "Topic: gardens");
        fx.doc.set_selection(7, 14).unwrap();
        let status = fx.session.run(Action::GenerateIdeas).await;
        assert_eq!(status.message, "Ideas generated successfully");
        assert_eq!(fx.doc.text(), "Topic: gardens\n- idea");

        fx.doc.set_selection(0, 0).unwrap();
        let status = fx.session.run(Action::GenerateIdeas).await;
        assert_eq!(status, Status::error("Please select some text as context"));
    }

    #[tokio::test]
    async fn test_rewrite_requires_instruction() {
        let fx = ready_fixture("R", "abc");
        fx.doc.set_selection(0, 3).unwrap();
        let status = fx
            .session
            .run(Action::Rewrite {
                instruction: " ".into(),
            })
            .await;
        assert_eq!(status, Status::error("Please enter a prompt first"));
        assert_eq!(fx.stub.calls(), 0);
    }

    #[tokio::test]
    async fn test_format_needs_no_client() {
        let fx = fixture_with(StubService::replying("R"), "a\nb");
        let status = fx
            .session
            .run(Action::Format(Formatting {
                font_name: "Georgia".into(),
                font_size: 12.0,
                line_spacing: 18.0,
                alignment: Alignment::Center,
            }))
            .await;
        assert!(status.is_success());
        let format = fx.doc.format();
        assert_eq!(format.font_name.as_deref(), Some("Georgia"));
        assert_eq!(format.paragraphs.len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_and_filter_models() {
        let stub = StubService::replying("R").with_models(vec![
            model("b/llama", "Llama", None),
            model("a/gpt", "GPT", Some("fast")),
        ]);
        let fx = fixture_with(stub, "");
        fx.session.set_api_key("sk-test");

        let status = fx.session.refresh_models().await;
        assert_eq!(status.message, "Loaded 2 models");

        let hits = fx.session.filter_models("fast");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a/gpt");

        let all = fx.session.filter_models("");
        assert_eq!(
            all.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
            vec!["GPT", "Llama"]
        );
        assert_eq!(fx.session.filter_models("LLAMA").len(), 1);
        assert_eq!(fx.session.filter_models("b/").len(), 1);
        assert_eq!(fx.session.models().len(), 2);
    }

    #[test]
    fn test_filter_does_not_mutate_backing_list() {
        let backing = vec![
            model("b/llama", "Llama", None),
            model("a/gpt", "GPT", Some("fast")),
        ];
        let out = filter_models(&backing, "fast");
        assert_eq!(out.len(), 1);
        assert_eq!(backing.len(), 2);
        assert_eq!(backing[0].id, "b/llama");
    }

    #[tokio::test]
    async fn test_refresh_without_key_fails() {
        let fx = fixture_with(StubService::replying("R"), "");
        let status = fx.session.refresh_models().await;
        assert_eq!(status, Status::error("Please enter an API key first"));
        assert!(fx.session.models().is_empty());
    }

    #[tokio::test]
    async fn test_selected_model_is_used() {
        let fx = ready_fixture("R", "text");
        assert!(fx.session.select_model("a/gpt").is_success());
        fx.doc.set_selection(0, 4).unwrap();
        fx.session.run(Action::Improve).await;
        let (_, model) = fx.stub.last_request().expect("request");
        assert_eq!(model, "a/gpt");
    }

    #[tokio::test(start_paused = true)]
    async fn test_settings_persist_and_restore() {
        let fx = ready_fixture("R", "text");
        fx.session.select_model("a/gpt");
        fx.session.set_autocomplete_delay(300);
        assert!(fx.session.set_autocomplete(true).is_success());
        assert!(fx.session.autocomplete_armed());

        let stored = fx.session.settings_store().load().expect("load");
        assert_eq!(stored.api_key.as_deref(), Some("sk-test"));
        assert_eq!(stored.selected_model.as_deref(), Some("a/gpt"));
        assert!(stored.autocomplete_enabled);
        assert_eq!(stored.autocomplete_delay_ms, 300);

        // 新会话从相同的设置内容恢复
        let store = SettingsStore::in_memory().expect("store");
        store.save_api_key("sk-test").unwrap();
        store.save_selected_model("a/gpt").unwrap();
        store.save_autocomplete_delay(300).unwrap();
        store.save_autocomplete_enabled(true).unwrap();
        let restored_fx = fixture_on(store, StubService::replying(" world"), "Hello");
        let settings = restored_fx.session.restore().expect("restore");
        assert_eq!(settings, stored);
        assert!(restored_fx.session.has_client());
        assert!(restored_fx.session.autocomplete_armed());

        // 恢复的延迟与模型进入触发器配置
        restored_fx.doc.set_selection(5, 5).unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(restored_fx.stub.calls(), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(restored_fx.stub.calls(), 1);
        let (_, model) = restored_fx.stub.last_request().expect("request");
        assert_eq!(model, "a/gpt");
        assert_eq!(restored_fx.doc.text(), "Hello world");
    }

    fn store_rejecting_autocomplete_flag(value: &str) -> SettingsStore {
        let conn = rusqlite::Connection::open_in_memory().expect("open");
        crate::db::migrate(&conn).expect("migrate");
        conn.execute_batch(&format!(
            "CREATE TRIGGER reject_flag BEFORE INSERT ON app_config
             WHEN NEW.key = 'autocompleteEnabled' AND NEW.value = '{}'
             BEGIN SELECT RAISE(ABORT, 'read-only flag'); END;",
            value
        ))
        .expect("trigger");
        SettingsStore::new(conn).expect("store")
    }

    #[tokio::test]
    async fn test_failed_enable_save_leaves_trigger_disarmed() {
        let fx = fixture_on(
            store_rejecting_autocomplete_flag("1"),
            StubService::replying("R"),
            "text",
        );
        fx.session.set_api_key("sk-test");

        let status = fx.session.set_autocomplete(true);
        assert_eq!(
            status,
            Status::error("Error updating autocomplete (settings unavailable). Please try again.")
        );
        assert!(!fx.session.autocomplete_armed());
        assert!(!fx.session.settings().autocomplete_enabled);
    }

    #[tokio::test]
    async fn test_failed_disable_save_keeps_trigger_armed() {
        let fx = fixture_on(
            store_rejecting_autocomplete_flag("0"),
            StubService::replying("R"),
            "text",
        );
        fx.session.set_api_key("sk-test");
        assert!(fx.session.set_autocomplete(true).is_success());

        let status = fx.session.set_autocomplete(false);
        assert_eq!(status.kind, StatusKind::Error);
        assert!(fx.session.autocomplete_armed());
        assert!(fx.session.settings().autocomplete_enabled);
        assert!(fx.session.settings_store().load().unwrap().autocomplete_enabled);
    }

    #[tokio::test]
    async fn test_autocomplete_toggle_requires_key() {
        let fx = fixture_with(StubService::replying("R"), "text");
        let status = fx.session.set_autocomplete(true);
        assert_eq!(status, Status::error("Please enter an API key first"));
        assert!(!fx.session.autocomplete_armed());
        assert!(!fx.session.settings().autocomplete_enabled);

        fx.session.set_api_key("sk");
        assert!(fx.session.set_autocomplete(true).is_success());
        assert!(fx.session.set_autocomplete(false).is_success());
        assert!(!fx.session.autocomplete_armed());
        assert_eq!(fx.session.set_autocomplete_delay(0).kind, StatusKind::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_autocomplete_through_session() {
        let fx = ready_fixture(" world", "Hello");
        fx.session.set_autocomplete_delay(200);
        fx.session.set_autocomplete(true);
        fx.doc.set_selection(5, 5).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fx.doc.text(), "Hello world");
    }

    #[tokio::test]
    async fn test_suggest_once_inserts_at_cursor() {
        let fx = ready_fixture(" world", "Hello");
        let status = fx.session.suggest_once().await;
        assert_eq!(status.message, "Suggestion inserted");
        assert_eq!(fx.doc.text(), "Hello world");
    }

    #[tokio::test]
    async fn test_status_channel_sees_updates() {
        let fx = ready_fixture("R", "abc");
        let mut rx = fx.session.subscribe_status();
        fx.doc.set_selection(0, 3).unwrap();
        fx.session.run(Action::Improve).await;
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().kind, StatusKind::Success);
    }

    #[test]
    fn test_action_wire_format() {
        let v = serde_json::to_value(Action::Rewrite {
            instruction: "shorter".into(),
        })
        .unwrap();
        assert_eq!(v["action"], "rewrite");
        assert_eq!(v["instruction"], "shorter");

        let parsed: Action = serde_json::from_str(
            r#"{"action":"format","font_name":"Arial","font_size":11,"line_spacing":12,"alignment":"right"}"#,
        )
        .unwrap();
        assert!(matches!(parsed, Action::Format(f) if f.alignment == Alignment::Right));
        let parsed: Action = serde_json::from_str(r#"{"action":"fix_grammar"}"#).unwrap();
        assert_eq!(parsed, Action::FixGrammar);
    }
}
