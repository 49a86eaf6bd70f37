pub mod autocomplete;
pub mod db;
pub mod document;
pub mod errors;
pub mod llm;
pub mod models;
pub mod server;
pub mod session;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::autocomplete;
    pub use crate::db;
    pub use crate::document::{DocumentAccessor, MemoryDocument};
    pub use crate::errors::PlanktonError;
    pub use crate::llm::{CompletionService, OpenRouterClient};
    pub use crate::models;
    pub use crate::server;
    pub use crate::session::{Action, Session};
    pub use crate::telemetry;
}
