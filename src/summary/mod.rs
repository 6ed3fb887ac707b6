// 子模块声明
pub mod assemble;
pub mod cache;
pub mod category;
pub mod depth;
pub mod orchestrator;
pub mod types;

pub use cache::SummaryCache;
pub use depth::DepthTier;
pub use orchestrator::{ChapterInput, SummaryOrchestrator};
pub use types::{
    ContentBlock, FailedSection, PartialFailureReport, PositionAnchor, SummaryMeta, SummaryRecord, SummaryRequest,
    SummaryResponse,
};
