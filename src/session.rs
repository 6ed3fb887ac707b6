use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::ai::prompts::question_prompt;
use crate::ai::{GenerationOptions, TextGenerator, VisionDescriber};
use crate::chapter_registry::{BoundarySource, Chapter, ChapterRegistry};
use crate::command_index::{ChapterCommands, CommandEntry, CommandIndex, CommandIndexView, CommandPatternLibrary};
use crate::config::StudyConfig;
use crate::error::{Result, ServiceError, StudyError};
use crate::fingerprint::document_fingerprint;
use crate::key_items::{into_report, ExtractionMode, KeyItemExtractor, KeyItemsReport};
use crate::man_page::{command_name, ManPageLookup, ManPageSource, SystemManSource};
use crate::parser::chapter_detector::{candidates_to_chapters, ChapterDetector};
use crate::parser::toc_resolver::resolve_outline;
use crate::parser::{DocumentParser, ParsedDocument};
use crate::store::{doc_key, get_json, put_json, KeyValueStore};
use crate::summary::{
    ChapterInput, SummaryCache, SummaryMeta, SummaryOrchestrator, SummaryRecord, SummaryRequest, SummaryResponse,
};

const CHAPTERS_KEY: &str = "chapters";
const COMMANDS_KEY: &str = "commands";
/// 手册页快速查询的候选上限
const MAX_MAN_CANDIDATES: usize = 20;

/// 问答调用的参数
const QA_OPTIONS: GenerationOptions = GenerationOptions {
    temperature: 0.2,
    max_output_tokens: 4096,
};

/// 已打开文档的基本信息，打开后不再改变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentInfo {
    /// 文档指纹，同时作为文档 ID
    pub document_id: String,
    pub title: Option<String>,
    pub page_count: u32,
    pub has_outline: bool,
}

/// 会话共享的服务与配置
#[derive(Clone)]
pub struct StudyServices {
    pub config: StudyConfig,
    pub store: Arc<dyn KeyValueStore>,
    pub generator: Arc<dyn TextGenerator>,
    pub orchestrator: Arc<SummaryOrchestrator>,
    pub extractor: Arc<KeyItemExtractor>,
    pub commands: Arc<dyn CommandPatternLibrary>,
    pub man_pages: Arc<ManPageLookup>,
}

impl StudyServices {
    /// 组装服务
    ///
    /// # 参数
    /// - `config`: 核心配置
    /// - `store`: 持久化存储
    /// - `generator`: 文本生成服务
    /// - `vision`: 视觉服务（可选）
    /// - `commands`: 命令识别规则库
    pub fn new(
        config: StudyConfig,
        store: Arc<dyn KeyValueStore>,
        generator: Arc<dyn TextGenerator>,
        vision: Option<Arc<dyn VisionDescriber>>,
        commands: Arc<dyn CommandPatternLibrary>,
    ) -> Self {
        let orchestrator = SummaryOrchestrator::new(
            generator.clone(),
            vision,
            SummaryCache::new(store.clone()),
            config.clone(),
        );
        let extractor = KeyItemExtractor::new(generator.clone(), commands.clone(), config.clone());
        let man_pages = ManPageLookup::new(
            Arc::new(SystemManSource::new(&config.man_page)),
            generator.clone(),
            store.clone(),
            config.clone(),
        );
        Self {
            config,
            store,
            generator,
            orchestrator: Arc::new(orchestrator),
            extractor: Arc::new(extractor),
            commands,
            man_pages: Arc::new(man_pages),
        }
    }

    /// 替换手册页来源
    pub fn with_man_source(mut self, source: Arc<dyn ManPageSource>) -> Self {
        self.man_pages = Arc::new(ManPageLookup::new(
            source,
            self.generator.clone(),
            self.store.clone(),
            self.config.clone(),
        ));
        self
    }
}

/// 单个文档的学习会话
///
/// 持有解析结果、章节注册表与命令索引；注册表与索引在修改后写回存储
pub struct StudySession {
    document: DocumentInfo,
    parsed: ParsedDocument,
    registry: RwLock<ChapterRegistry>,
    index: Mutex<CommandIndex>,
    services: StudyServices,
}

impl StudySession {
    /// 打开文档
    ///
    /// 存储中已有该文档的章节注册表时直接恢复，否则先按大纲解析，
    /// 大纲不可用时回退到启发式检测
    ///
    /// # 参数
    /// - `bytes`: 文档原始字节
    /// - `parser`: 文档解析器
    /// - `services`: 共享服务
    pub fn open(bytes: &[u8], parser: &dyn DocumentParser, services: StudyServices) -> Result<Self> {
        let parsed = parser.parse(bytes).map_err(StudyError::Document)?;
        if parsed.page_count == 0 {
            return Err(StudyError::Document("文档没有任何页面".to_string()));
        }

        let document = DocumentInfo {
            document_id: document_fingerprint(bytes),
            title: parsed.title.clone(),
            page_count: parsed.page_count,
            has_outline: parsed.has_outline(),
        };
        let store = services.store.as_ref();

        let registry = match load_registry(store, &document) {
            Some(registry) => registry,
            None => {
                let registry = build_registry(&parsed, &services.config)?;
                if let Err(e) = put_json(store, &doc_key(&document.document_id, CHAPTERS_KEY), &registry) {
                    warn!("章节注册表写入存储失败: {}", e);
                }
                registry
            }
        };

        let index = match get_json::<CommandIndex>(store, &doc_key(&document.document_id, COMMANDS_KEY)) {
            Ok(index) => index.unwrap_or_default(),
            Err(e) => {
                warn!("命令索引读取失败，从空索引开始: {}", e);
                CommandIndex::new()
            }
        };

        info!(
            "文档已打开: {}（{} 页，{} 章，命令 {} 条）",
            document.title.as_deref().unwrap_or(&document.document_id),
            document.page_count,
            registry.chapters().len(),
            index.len()
        );

        Ok(Self {
            document,
            parsed,
            registry: RwLock::new(registry),
            index: Mutex::new(index),
            services,
        })
    }

    pub fn document(&self) -> &DocumentInfo {
        &self.document
    }

    pub fn document_id(&self) -> &str {
        &self.document.document_id
    }

    pub async fn chapters(&self) -> Vec<Chapter> {
        self.registry.read().await.chapters().to_vec()
    }

    /// 需要人工确认的章节
    pub async fn pending_review(&self) -> Vec<usize> {
        self.registry
            .read()
            .await
            .pending_review(self.services.config.confidence_threshold)
    }

    /// 修改章节边界并写回存储
    ///
    /// 校验失败或写入失败时注册表保持不变
    pub async fn update_chapter_boundary(&self, chapter_index: usize, start_page: u32, end_page: u32) -> Result<()> {
        let mut registry = self.registry.write().await;
        let mut edited = registry.clone();
        edited.update_boundary(chapter_index, start_page, end_page)?;
        self.persist_registry(&edited)?;
        *registry = edited;
        Ok(())
    }

    /// 人工确认章节边界
    pub async fn verify_chapter(&self, chapter_index: usize) -> Result<()> {
        let mut registry = self.registry.write().await;
        let mut edited = registry.clone();
        edited.verify(chapter_index)?;
        self.persist_registry(&edited)?;
        *registry = edited;
        Ok(())
    }

    /// 获取章节摘要
    ///
    /// 边界置信度低于阈值且未经确认的章节拒绝生成
    pub async fn get_summary(&self, request: &SummaryRequest) -> Result<SummaryResponse> {
        self.check_document(&request.document_id)?;
        let chapter = self.chapter(request.chapter_index).await?;
        let threshold = self.services.config.confidence_threshold;
        if chapter.requires_review(threshold) {
            return Err(StudyError::ReviewRequired {
                chapter_index: chapter.index,
                confidence: chapter.confidence,
            });
        }

        let text = self.parsed.chapter_text(chapter.start_page, chapter.end_page);
        if text.is_empty() {
            return Err(StudyError::EmptyChapter(chapter.index));
        }
        let images = self
            .parsed
            .images_in_range(chapter.start_page, chapter.end_page, usize::MAX)
            .into_iter()
            .cloned()
            .collect();

        let input = ChapterInput { chapter, text, images };
        self.services.orchestrator.summarize(request, &input).await
    }

    /// 列出文档的所有缓存摘要
    pub fn list_cached_summaries(&self) -> Result<Vec<SummaryMeta>> {
        Ok(self.services.orchestrator.cache().list(self.document_id())?)
    }

    /// 按记录 ID 读取摘要（包括已被新一代取代的旧记录）
    pub fn get_summary_record(&self, record_id: &str) -> Result<Option<SummaryRecord>> {
        Ok(self
            .services
            .orchestrator
            .cache()
            .get_record(self.document_id(), record_id)?)
    }

    /// 提取章节关键内容
    ///
    /// 命令模式下把结果写入命令索引；索引写回存储失败只作为警告
    pub async fn extract_key_items(&self, chapter_index: usize, mode: ExtractionMode) -> Result<KeyItemsReport> {
        let chapter = self.chapter(chapter_index).await?;
        let text = self.parsed.chapter_text(chapter.start_page, chapter.end_page);
        if text.is_empty() {
            return Err(StudyError::EmptyChapter(chapter_index));
        }

        let mut extraction = self
            .services
            .extractor
            .extract(&chapter, &text.text(), mode)
            .await?;

        let delta = if mode == ExtractionMode::Commands {
            let mut index = self.index.lock().await;
            let delta = index.apply(chapter_index, &extraction.command_tokens);
            if !delta.is_empty() {
                if let Err(e) = put_json(
                    self.services.store.as_ref(),
                    &doc_key(self.document_id(), COMMANDS_KEY),
                    &*index,
                ) {
                    warn!("命令索引写入存储失败: {}", e);
                    extraction.warnings.push(format!("命令索引写入存储失败: {}", e));
                }
            }
            delta
        } else {
            Default::default()
        };

        Ok(into_report(chapter_index, mode, extraction, delta))
    }

    /// 命令索引的全部条目
    pub async fn command_index(&self) -> Vec<CommandEntry> {
        self.index.lock().await.entries()
    }

    /// 按首次出现章节组织的命令索引
    ///
    /// # 参数
    /// - `chapter_index`: 当前章节，用于列出本章新引入的命令
    pub async fn command_index_view(&self, chapter_index: usize) -> Result<CommandIndexView> {
        self.chapter(chapter_index).await?;
        let chapters = self.chapters().await;
        let index = self.index.lock().await;
        let by_chapter = index
            .by_first_chapter()
            .into_iter()
            .map(|(i, commands)| ChapterCommands {
                chapter_index: i,
                chapter_title: chapters
                    .get(i)
                    .map(|c| c.title.clone())
                    .unwrap_or_else(|| format!("Chapter {}", i + 1)),
                commands,
            })
            .collect();
        Ok(CommandIndexView {
            total: index.len(),
            by_chapter,
            new_in_chapter: index.new_in_chapter(chapter_index).into_iter().cloned().collect(),
        })
    }

    /// 章节中出现的命令名（去重排序，最多 20 个），供手册页快速查询
    pub async fn man_page_candidates(&self, chapter_index: usize) -> Result<Vec<String>> {
        let chapter = self.chapter(chapter_index).await?;
        let text = self.parsed.chapter_text(chapter.start_page, chapter.end_page);
        let names: BTreeSet<String> = self
            .services
            .commands
            .scan(&text.text())
            .iter()
            .filter_map(|token| command_name(&token.raw))
            .collect();
        Ok(names.into_iter().take(MAX_MAN_CANDIDATES).collect())
    }

    /// 只根据章节正文回答问题
    pub async fn ask_question(&self, chapter_index: usize, question: &str) -> Result<String> {
        let chapter = self.chapter(chapter_index).await?;
        let text = self.parsed.chapter_text(chapter.start_page, chapter.end_page);
        if text.is_empty() {
            return Err(StudyError::EmptyChapter(chapter_index));
        }
        let content: String = text.text().chars().take(self.services.config.qa_char_budget).collect();
        let prompt = question_prompt(&chapter.title, question.trim());

        debug!("章节 {} 问答: {}", chapter_index, question.trim());
        let result = match timeout(
            self.services.config.call_timeout(),
            self.services.generator.generate(&prompt, &content, &QA_OPTIONS),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout(self.services.config.call_timeout_secs)),
        };

        result.map_err(|source| StudyError::ExternalService {
            chapter_index,
            target: "问答".to_string(),
            source,
        })
    }

    /// 把注册表与命令索引写回存储并落盘
    pub async fn flush(&self) -> Result<()> {
        let registry = self.registry.read().await;
        self.persist_registry(&registry)?;
        let index = self.index.lock().await;
        put_json(
            self.services.store.as_ref(),
            &doc_key(self.document_id(), COMMANDS_KEY),
            &*index,
        )?;
        self.services.store.flush()?;
        debug!("文档 {} 已写回存储", self.document_id());
        Ok(())
    }

    /// 关闭会话
    pub async fn close(self) -> Result<()> {
        self.flush().await?;
        info!("文档已关闭: {}", self.document_id());
        Ok(())
    }

    async fn chapter(&self, index: usize) -> Result<Chapter> {
        Ok(self.registry.read().await.get(index)?.clone())
    }

    fn check_document(&self, document_id: &str) -> Result<()> {
        if document_id != self.document_id() {
            return Err(StudyError::DocumentNotOpen(document_id.to_string()));
        }
        Ok(())
    }

    fn persist_registry(&self, registry: &ChapterRegistry) -> Result<()> {
        put_json(
            self.services.store.as_ref(),
            &doc_key(self.document_id(), CHAPTERS_KEY),
            registry,
        )?;
        Ok(())
    }
}

/// 从存储恢复章节注册表，恢复的内容重新校验
fn load_registry(store: &dyn KeyValueStore, document: &DocumentInfo) -> Option<ChapterRegistry> {
    match get_json::<ChapterRegistry>(store, &doc_key(&document.document_id, CHAPTERS_KEY)) {
        Ok(Some(saved)) if saved.page_count() == document.page_count => {
            match ChapterRegistry::new(saved.page_count(), saved.chapters().to_vec()) {
                Ok(registry) => {
                    debug!("从存储恢复章节注册表（{} 章）", registry.chapters().len());
                    Some(registry)
                }
                Err(e) => {
                    warn!("存储中的章节注册表无效，重新检测: {}", e);
                    None
                }
            }
        }
        Ok(_) => None,
        Err(e) => {
            warn!("章节注册表读取失败，重新检测: {}", e);
            None
        }
    }
}

/// 解析章节边界：优先使用大纲，失败时回退到启发式检测
pub fn build_registry(parsed: &ParsedDocument, config: &StudyConfig) -> Result<ChapterRegistry> {
    let page_count = parsed.page_count;
    let chapters = resolve_outline(parsed.outline.as_deref(), page_count, config.max_outline_depth);
    if !chapters.is_empty() {
        match ChapterRegistry::new(page_count, chapters) {
            Ok(registry) => {
                info!("按大纲解析出 {} 章", registry.chapters().len());
                return Ok(registry);
            }
            Err(e) => warn!("大纲章节未通过校验，回退到启发式检测: {}", e),
        }
    }

    let report = ChapterDetector::new().detect(&parsed.pages);
    let chapters = candidates_to_chapters(&report, page_count, config.confidence_threshold);
    let registry = ChapterRegistry::new(page_count, chapters)?;
    let linear = registry
        .chapters()
        .first()
        .map(|c| c.source == BoundarySource::Linear)
        .unwrap_or(false);
    if linear {
        info!("未检测到章节边界，全文作为一章（需要人工确认）");
    } else {
        info!(
            "启发式检测出 {} 章，其中 {} 章需要人工确认",
            registry.chapters().len(),
            registry.pending_review(config.confidence_threshold).len()
        );
    }
    Ok(registry)
}
