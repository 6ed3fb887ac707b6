use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 章节边界不变量
///
/// 边界编辑被拒绝时，标明具体违反的是哪一条
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundaryInvariant {
    /// 页码范围不合法（起始页大于结束页，或超出文档页数）
    PageRange,
    /// 与相邻章节的顺序被打乱
    Ordering,
    /// 与相邻章节重叠
    Overlap,
    /// 最后一章必须结束于文档最后一页
    LastChapterEnd,
}

/// 章节边界校验错误
///
/// 包含违反的不变量以及冲突的相邻章节索引；拒绝时注册表保持不变
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("章节 {chapter_index} 边界校验失败 ({invariant:?}): {message}")]
pub struct BoundaryValidationError {
    pub chapter_index: usize,
    pub invariant: BoundaryInvariant,
    /// 冲突的相邻章节索引
    pub neighbors: Vec<usize>,
    pub message: String,
}

/// 外部服务（文本生成 / 视觉）调用错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("调用超时 ({0} 秒)")]
    Timeout(u64),
    #[error("触发限流: {0}")]
    RateLimited(String),
    #[error("HTTP 错误 {status}: {body}")]
    Http { status: u16, body: String },
    #[error("网络错误: {0}")]
    Transport(String),
    #[error("服务返回空结果")]
    EmptyResponse,
    #[error("请求被拒绝: {0}")]
    Rejected(String),
}

impl ServiceError {
    /// 是否值得重试
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::RateLimited(_) | Self::Transport(_) | Self::EmptyResponse => true,
            Self::Http { status, .. } => *status >= 500,
            Self::Rejected(_) => false,
        }
    }
}

/// 持久化存储错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("数据库错误: {0}")]
    Database(String),
    #[error("锁定存储失败: {0}")]
    Lock(String),
    #[error("序列化失败: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// 核心错误类型
///
/// 对外可见的错误都会指明受影响的章节/分段/命令，
/// 并通过 [`StudyError::is_retryable`] 说明能否在本次会话内重试
#[derive(Error, Debug, Clone)]
pub enum StudyError {
    #[error(transparent)]
    BoundaryValidation(#[from] BoundaryValidationError),

    #[error("章节 {chapter_index} 无法分段: 第 {paragraph_index} 段含有长度 {length} 的句子，超过上限 {budget}，需要手动调整")]
    Chunking {
        chapter_index: usize,
        paragraph_index: usize,
        length: usize,
        budget: usize,
    },

    #[error("章节 {chapter_index} 的外部服务调用失败 ({target}): {source}")]
    ExternalService {
        chapter_index: usize,
        target: String,
        #[source]
        source: ServiceError,
    },

    #[error("命令 `{command}` 无法查询手册页: {reason}")]
    ManPage { command: String, reason: String },

    #[error("命令 `{command}` 的手册页摘要生成失败: {source}")]
    ManPageService {
        command: String,
        #[source]
        source: ServiceError,
    },

    #[error("摘要缓存读写失败: {0}")]
    CacheIo(String),

    #[error("章节 {chapter_index} 的边界置信度 {confidence:.2} 低于阈值，需要人工确认后才能生成摘要")]
    ReviewRequired { chapter_index: usize, confidence: f32 },

    #[error("章节不存在: {0}")]
    ChapterNotFound(usize),

    #[error("章节 {0} 没有可提取的文本")]
    EmptyChapter(usize),

    #[error("文档未打开: {0}")]
    DocumentNotOpen(String),

    #[error("文档解析失败: {0}")]
    Document(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("配置错误: {0}")]
    Config(String),
}

impl StudyError {
    /// 是否可以在本次会话内重试
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ExternalService { source, .. } | Self::ManPageService { source, .. } => source.is_transient(),
            Self::CacheIo(_) | Self::Store(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StudyError>;
