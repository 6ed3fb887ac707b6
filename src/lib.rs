// 模块声明
pub mod ai;
pub mod chapter_registry;
pub mod chunker;
pub mod command_index;
pub mod config;
pub mod db;
pub mod error;
pub mod fingerprint;
pub mod key_items;
pub mod library;
pub mod man_page;
pub mod parser;
pub mod session;
pub mod store;
pub mod summary;

#[cfg(test)]
mod test_support;

pub use chapter_registry::{BoundarySource, Chapter, ChapterRegistry, Section};
pub use command_index::{CommandEntry, CommandIndex, CommandIndexView, IndexConflict, IndexDelta};
pub use config::StudyConfig;
pub use error::{Result, StudyError};
pub use key_items::{ExtractionMode, KeyItemsReport};
pub use library::Library;
pub use man_page::{ManPageSource, ManPageSummary};
pub use session::{DocumentInfo, StudyServices, StudySession};
pub use store::{KeyValueStore, MemoryStore, SqliteStore};
pub use summary::{DepthTier, SummaryRecord, SummaryRequest, SummaryResponse};
