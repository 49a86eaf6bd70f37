use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::document::{DocumentAccessor, SelectionSubscription};
use crate::errors::{PlanktonError, Result};
use crate::llm::CompletionService;
use crate::telemetry::Logger;

/** \brief 取上下文时选区两侧各扩展的字符数。 */
pub const SURROUNDING_RADIUS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutocompleteConfig {
    pub model: String,
    pub delay: Duration,
}

/**
 * \brief 选区变化驱动的防抖自动补全。
 * \details 两个状态：disabled / armed。armed 时每次选区变化取消待触发的请求并重新计时，
 *          任一时刻最多一个待触发请求；补全与用户操作共用编辑锁，不会并发写入文档。
 */
pub struct AutocompleteTrigger {
    inner: Arc<TriggerInner>,
}

struct TriggerInner {
    document: Arc<dyn DocumentAccessor>,
    logger: Arc<dyn Logger>,
    edit_lock: Arc<tokio::sync::Mutex<()>>,
    state: Mutex<TriggerState>,
}

enum TriggerState {
    Disabled,
    Armed(Armed),
}

struct Armed {
    service: Arc<dyn CompletionService>,
    config: AutocompleteConfig,
    runtime: Handle,
    generation: u64,
    pending: Option<CancellationToken>,
    _subscription: SelectionSubscription,
}

impl AutocompleteTrigger {
    pub fn new(
        document: Arc<dyn DocumentAccessor>,
        logger: Arc<dyn Logger>,
        edit_lock: Arc<tokio::sync::Mutex<()>>,
    ) -> Self {
        Self {
            inner: Arc::new(TriggerInner {
                document,
                logger,
                edit_lock,
                state: Mutex::new(TriggerState::Disabled),
            }),
        }
    }

    /**
     * \brief disabled -> armed：注册选区监听。已 armed 时仅更新服务与配置。
     * \details 必须在 tokio 运行时内调用，计时任务在该运行时上派发。
     */
    pub fn enable(
        &self,
        service: Arc<dyn CompletionService>,
        config: AutocompleteConfig,
    ) -> Result<()> {
        let runtime = Handle::try_current()
            .map_err(|_| PlanktonError::precondition("autocomplete needs an async runtime"))?;
        let mut state = self.inner.lock_state()?;
        if let TriggerState::Armed(armed) = &mut *state {
            armed.service = service;
            armed.config = config;
            return Ok(());
        }

        let weak: Weak<TriggerInner> = Arc::downgrade(&self.inner);
        let subscription = self
            .inner
            .document
            .subscribe_selection(Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.schedule();
                }
            }))?;
        *state = TriggerState::Armed(Armed {
            service,
            config,
            runtime,
            generation: 0,
            pending: None,
            _subscription: subscription,
        });
        self.inner.logger.info("autocomplete enabled");
        Ok(())
    }

    /**
     * \brief armed -> disabled：注销监听并取消待触发请求。
     */
    pub fn disable(&self) {
        let previous = match self.inner.state.lock() {
            Ok(mut guard) => std::mem::replace(&mut *guard, TriggerState::Disabled),
            Err(_) => return,
        };
        if let TriggerState::Armed(armed) = previous {
            if let Some(token) = armed.pending {
                token.cancel();
            }
            self.inner.logger.info("autocomplete disabled");
        }
    }

    /** \brief 更新延迟或模型，下一次选区变化生效。 */
    pub fn update_config(&self, config: AutocompleteConfig) {
        if let Ok(mut guard) = self.inner.state.lock() {
            if let TriggerState::Armed(armed) = &mut *guard {
                armed.config = config;
            }
        }
    }

    pub fn is_armed(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|g| matches!(*g, TriggerState::Armed(_)))
            .unwrap_or(false)
    }

    /** \brief 已调度的次数（每次选区变化加一）。 */
    pub fn generation(&self) -> u64 {
        match self.inner.state.lock() {
            Ok(guard) => match &*guard {
                TriggerState::Armed(armed) => armed.generation,
                TriggerState::Disabled => 0,
            },
            Err(_) => 0,
        }
    }
}

impl Drop for AutocompleteTrigger {
    fn drop(&mut self) {
        self.disable();
    }
}

impl TriggerInner {
    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, TriggerState>> {
        self.state
            .lock()
            .map_err(|_| PlanktonError::Document("autocomplete state poisoned".into()))
    }

    fn schedule(self: &Arc<Self>) {
        let Ok(mut guard) = self.state.lock() else {
            return;
        };
        let TriggerState::Armed(armed) = &mut *guard else {
            return;
        };
        if let Some(previous) = armed.pending.take() {
            previous.cancel();
        }
        armed.generation = armed.generation.wrapping_add(1);
        let cancel = CancellationToken::new();
        armed.pending = Some(cancel.clone());

        let service = armed.service.clone();
        let config = armed.config.clone();
        let inner = self.clone();
        armed.runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(config.delay) => {}
            }
            if let Err(err) = inner
                .fetch_and_insert(service.as_ref(), &config.model, &cancel)
                .await
            {
                inner.logger.error(&format!("autocomplete failed: {}", err));
            }
        });
    }

    async fn fetch_and_insert(
        &self,
        service: &dyn CompletionService,
        model: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _edit = self.edit_lock.lock().await;
        if cancel.is_cancelled() {
            return Ok(());
        }
        let context = self.document.surrounding_text(SURROUNDING_RADIUS).await?;
        if context.is_empty() {
            return Ok(());
        }
        let suggestion = service.autocomplete(&context, model).await?;
        // 请求期间被取消（关闭或选区再次变化）时丢弃结果
        if cancel.is_cancelled() || suggestion.is_empty() {
            return Ok(());
        }
        self.document.insert_text(&suggestion).await?;
        self.logger.info(&format!(
            "autocomplete inserted {} chars",
            suggestion.chars().count()
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::MemoryDocument;
    use crate::telemetry::{LogLevel, MemoryLogger};
    use crate::testing::StubService;

    struct Fixture {
        doc: Arc<MemoryDocument>,
        logger: Arc<MemoryLogger>,
        trigger: AutocompleteTrigger,
    }

    fn fixture(text: &str) -> Fixture {
        let doc = Arc::new(MemoryDocument::new(text));
        let logger = Arc::new(MemoryLogger::new(32));
        let trigger = AutocompleteTrigger::new(
            doc.clone(),
            logger.clone(),
            Arc::new(tokio::sync::Mutex::new(())),
        );
        Fixture {
            doc,
            logger,
            trigger,
        }
    }

    fn config(delay_ms: u64) -> AutocompleteConfig {
        AutocompleteConfig {
            model: "a/gpt".into(),
            delay: Duration::from_millis(delay_ms),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_selection_changes_fetch_once() {
        let fx = fixture("Once upon a time");
        let service = Arc::new(StubService::replying(" there was"));
        fx.trigger
            .enable(service.clone(), config(1000))
            .expect("enable");

        fx.doc.set_selection(16, 16).unwrap();
        sleep(Duration::from_millis(100)).await;
        fx.doc.set_selection(16, 16).unwrap();

        // 第一次计时本应在 t=1000 触发，已被第二次事件取消
        sleep(Duration::from_millis(950)).await;
        assert_eq!(service.calls(), 0);

        sleep(Duration::from_millis(1000)).await;
        assert_eq!(service.calls(), 1);
        assert_eq!(fx.trigger.generation(), 2);
        assert_eq!(fx.doc.text(), "Once upon a time there was");

        let (messages, model) = service.last_request().expect("request");
        assert_eq!(model, "a/gpt");
        assert_eq!(messages[1].content, "Once upon a time");
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_cancels_pending_fetch() {
        let fx = fixture("Once upon a time");
        let service = Arc::new(StubService::replying(" there was"));
        fx.trigger
            .enable(service.clone(), config(1000))
            .expect("enable");
        fx.doc.set_selection(16, 16).unwrap();
        sleep(Duration::from_millis(500)).await;

        fx.trigger.disable();
        assert!(!fx.trigger.is_armed());
        assert_eq!(fx.doc.listener_count(), 0);

        sleep(Duration::from_millis(3000)).await;
        assert_eq!(service.calls(), 0);
        assert_eq!(fx.doc.text(), "Once upon a time");

        fx.doc.set_selection(0, 4).unwrap();
        sleep(Duration::from_millis(3000)).await;
        assert_eq!(service.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_logged_and_swallowed() {
        let fx = fixture("Once upon a time");
        let service = Arc::new(StubService::failing(500));
        fx.trigger
            .enable(service.clone(), config(200))
            .expect("enable");
        fx.doc.set_selection(16, 16).unwrap();
        sleep(Duration::from_millis(500)).await;

        assert_eq!(service.calls(), 1);
        assert!(fx.logger.contains(LogLevel::Error, "autocomplete failed"));
        assert_eq!(fx.doc.text(), "Once upon a time");
        assert!(fx.trigger.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_document_skips_request() {
        let fx = fixture("");
        let service = Arc::new(StubService::replying("anything"));
        fx.trigger
            .enable(service.clone(), config(100))
            .expect("enable");
        fx.doc.set_selection(0, 0).unwrap();
        sleep(Duration::from_millis(500)).await;
        assert_eq!(service.calls(), 0);
        assert_eq!(fx.doc.text(), "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_suggestion_is_not_inserted() {
        let fx = fixture("Hello");
        let service = Arc::new(StubService::replying(""));
        fx.trigger
            .enable(service.clone(), config(100))
            .expect("enable");
        fx.doc.set_selection(5, 5).unwrap();
        sleep(Duration::from_millis(500)).await;
        assert_eq!(service.calls(), 1);
        assert_eq!(fx.doc.text(), "Hello");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reenable_keeps_single_listener() {
        let fx = fixture("Hello");
        let service = Arc::new(StubService::replying("!"));
        fx.trigger.enable(service.clone(), config(100)).unwrap();
        fx.trigger.enable(service.clone(), config(300)).unwrap();
        assert_eq!(fx.doc.listener_count(), 1);

        fx.doc.set_selection(5, 5).unwrap();
        sleep(Duration::from_millis(200)).await;
        assert_eq!(service.calls(), 0);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(service.calls(), 1);
        assert_eq!(fx.doc.text(), "Hello!");
    }

    #[test]
    fn test_enable_outside_runtime_fails() {
        let fx = fixture("Hello");
        let service = Arc::new(StubService::replying("!"));
        let err = fx.trigger.enable(service, config(100)).unwrap_err();
        assert!(matches!(err, PlanktonError::Precondition(_)));
        assert!(!fx.trigger.is_armed());
    }
}
