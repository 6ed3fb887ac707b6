use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::ai::GeminiClient;
use crate::chapter_registry::Chapter;
use crate::command_index::{BasicCommandScanner, CommandEntry, CommandIndexView};
use crate::config::StudyConfig;
use crate::error::{Result, StudyError};
use crate::fingerprint::document_fingerprint;
use crate::key_items::{ExtractionMode, KeyItemsReport};
use crate::man_page::ManPageSummary;
use crate::parser::pdf_parser::PdfParser;
use crate::parser::DocumentParser;
use crate::session::{DocumentInfo, StudyServices, StudySession};
use crate::store::KeyValueStore;
use crate::summary::{SummaryMeta, SummaryRecord, SummaryRequest, SummaryResponse};

/// 文档库
///
/// 按文档 ID 管理已打开的会话，对外提供全部操作
pub struct Library {
    services: StudyServices,
    parser: Arc<dyn DocumentParser>,
    sessions: RwLock<HashMap<String, Arc<StudySession>>>,
}

impl Library {
    pub fn new(services: StudyServices, parser: Arc<dyn DocumentParser>) -> Self {
        Self {
            services,
            parser,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// 使用默认实现创建文档库：PDF 解析器、Gemini 客户端、基础命令规则与系统手册页来源
    ///
    /// # 参数
    /// - `config`: 核心配置，Gemini API Key 从其指定的环境变量读取
    /// - `store`: 持久化存储
    pub fn with_defaults(config: StudyConfig, store: Arc<dyn KeyValueStore>) -> Result<Self> {
        config.validate()?;
        let client = Arc::new(GeminiClient::from_config(&config)?);
        let services = StudyServices::new(
            config,
            store,
            client.clone(),
            Some(client),
            Arc::new(BasicCommandScanner),
        );
        Ok(Self::new(services, Arc::new(PdfParser::default())))
    }

    /// 打开文档，返回文档 ID
    ///
    /// 同一文档已打开时直接返回已有会话的 ID
    pub async fn open_document(&self, bytes: Vec<u8>) -> Result<String> {
        let document_id = document_fingerprint(&bytes);
        if self.sessions.read().await.contains_key(&document_id) {
            return Ok(document_id);
        }

        let parser = self.parser.clone();
        let services = self.services.clone();
        // 解析是 CPU 密集的同步操作
        let session = tokio::task::spawn_blocking(move || StudySession::open(&bytes, parser.as_ref(), services))
            .await
            .map_err(|e| StudyError::Document(format!("解析任务异常退出: {}", e)))??;

        let mut sessions = self.sessions.write().await;
        sessions
            .entry(document_id.clone())
            .or_insert_with(|| Arc::new(session));
        Ok(document_id)
    }

    /// 关闭文档并写回存储
    pub async fn close_document(&self, document_id: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(document_id)
            .ok_or_else(|| StudyError::DocumentNotOpen(document_id.to_string()))?;
        session.flush().await?;
        info!("文档已关闭: {}", document_id);
        Ok(())
    }

    /// 已打开的文档
    pub async fn documents(&self) -> Vec<DocumentInfo> {
        self.sessions
            .read()
            .await
            .values()
            .map(|s| s.document().clone())
            .collect()
    }

    pub async fn session(&self, document_id: &str) -> Result<Arc<StudySession>> {
        self.sessions
            .read()
            .await
            .get(document_id)
            .cloned()
            .ok_or_else(|| StudyError::DocumentNotOpen(document_id.to_string()))
    }

    pub async fn get_chapters(&self, document_id: &str) -> Result<Vec<Chapter>> {
        Ok(self.session(document_id).await?.chapters().await)
    }

    pub async fn update_chapter_boundary(
        &self,
        document_id: &str,
        chapter_index: usize,
        start_page: u32,
        end_page: u32,
    ) -> Result<()> {
        self.session(document_id)
            .await?
            .update_chapter_boundary(chapter_index, start_page, end_page)
            .await
    }

    pub async fn verify_chapter(&self, document_id: &str, chapter_index: usize) -> Result<()> {
        self.session(document_id).await?.verify_chapter(chapter_index).await
    }

    pub async fn get_summary(&self, request: &SummaryRequest) -> Result<SummaryResponse> {
        self.session(&request.document_id).await?.get_summary(request).await
    }

    pub async fn get_summary_record(&self, document_id: &str, record_id: &str) -> Result<Option<SummaryRecord>> {
        self.session(document_id).await?.get_summary_record(record_id)
    }

    pub async fn list_cached_summaries(&self, document_id: &str) -> Result<Vec<SummaryMeta>> {
        self.session(document_id).await?.list_cached_summaries()
    }

    pub async fn extract_key_items(
        &self,
        document_id: &str,
        chapter_index: usize,
        mode: ExtractionMode,
    ) -> Result<KeyItemsReport> {
        self.session(document_id)
            .await?
            .extract_key_items(chapter_index, mode)
            .await
    }

    pub async fn get_command_index(&self, document_id: &str) -> Result<Vec<CommandEntry>> {
        Ok(self.session(document_id).await?.command_index().await)
    }

    /// 按首次出现章节组织的命令索引，并列出当前章节新引入的命令
    pub async fn get_command_index_view(&self, document_id: &str, chapter_index: usize) -> Result<CommandIndexView> {
        self.session(document_id)
            .await?
            .command_index_view(chapter_index)
            .await
    }

    /// 章节中可直接查询手册页的命令名
    pub async fn man_page_candidates(&self, document_id: &str, chapter_index: usize) -> Result<Vec<String>> {
        self.session(document_id)
            .await?
            .man_page_candidates(chapter_index)
            .await
    }

    /// 查询命令手册页并整理成参考卡片，与文档无关
    pub async fn lookup_man_page(&self, command: &str) -> Result<ManPageSummary> {
        self.services.man_pages.lookup(command).await
    }

    /// 已缓存的手册页摘要
    pub fn cached_man_pages(&self) -> Result<Vec<ManPageSummary>> {
        self.services.man_pages.cached()
    }

    pub async fn ask_question(&self, document_id: &str, chapter_index: usize, question: &str) -> Result<String> {
        self.session(document_id)
            .await?
            .ask_question(chapter_index, question)
            .await
    }

    /// 把所有已打开文档写回存储
    pub async fn flush_all(&self) -> Result<()> {
        let sessions: Vec<Arc<StudySession>> = self.sessions.read().await.values().cloned().collect();
        for session in sessions {
            session.flush().await?;
        }
        Ok(())
    }
}
