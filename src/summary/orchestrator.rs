use chrono::Utc;
use futures::future::join_all;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell, Semaphore};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::assemble::{assemble_blocks, mark_section, owning_section, PageSpan, PlacedImage};
use super::cache::{record_id, SummaryCache};
use super::category::{active_tags, parse_categorized};
use super::depth::DepthTier;
use super::types::{
    ContentBlock, FailedSection, PartialFailureReport, PositionAnchor, SummaryRecord, SummaryRequest,
    SummaryResponse,
};
use crate::ai::prompts::{figure_instruction, merge_prompt, section_prompt};
use crate::ai::{GenerationOptions, TextGenerator, VisionDescriber};
use crate::chapter_registry::Chapter;
use crate::chunker::{chunk_chapter, TextSection};
use crate::config::{StudyConfig, VisionConfig};
use crate::error::{Result, ServiceError, StudyError};
use crate::fingerprint::{content_version, summary_fingerprint};
use crate::parser::{ChapterText, ExtractedImage, FigureKind};

/// 合并输入之间的分隔符
const SUMMARY_SEPARATOR: &str = "\n\n";

/// 生成摘要所需的章节数据
#[derive(Debug, Clone)]
pub struct ChapterInput {
    pub chapter: Chapter,
    pub text: ChapterText,
    /// 章节页码范围内的全部图片，筛选由编排器完成
    pub images: Vec<ExtractedImage>,
}

/// 重试耗尽后的失败
#[derive(Debug, Clone)]
struct CallFailure {
    error: ServiceError,
    attempts: u32,
}

/// 一次生成的中间结果
struct Generated {
    blocks: Vec<ContentBlock>,
    merge_tiers: u32,
    failure: PartialFailureReport,
    warnings: Vec<String>,
}

/// 某个指纹正在进行的生成
///
/// 同一指纹的所有生成共用一个 `gate`，查缓存、生成、分配代数与写入都在持有它时完成
#[derive(Clone)]
struct Flight {
    forced: bool,
    gate: Arc<Mutex<()>>,
    cell: Arc<OnceCell<Result<SummaryResponse>>>,
}

/// 摘要编排器
///
/// 负责分段生成、合并、重试、缓存读写，以及相同指纹请求的并发去重
pub struct SummaryOrchestrator {
    generator: Arc<dyn TextGenerator>,
    vision: Option<Arc<dyn VisionDescriber>>,
    cache: SummaryCache,
    config: StudyConfig,
    /// 所有外部调用共享的并发上限
    semaphore: Arc<Semaphore>,
    /// 以 `{文档}/{指纹}` 为键
    in_flight: Mutex<HashMap<String, Flight>>,
}

impl SummaryOrchestrator {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        vision: Option<Arc<dyn VisionDescriber>>,
        cache: SummaryCache,
        config: StudyConfig,
    ) -> Self {
        let permits = config.max_concurrent_calls.max(1);
        Self {
            generator,
            vision,
            cache,
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &SummaryCache {
        &self.cache
    }

    /// 获取章节摘要
    ///
    /// 先按指纹查缓存，命中时不发起任何外部调用；未命中时生成并写入缓存。
    /// 指纹相同的并发请求共用一次生成
    ///
    /// # 参数
    /// - `request`: 摘要请求
    /// - `input`: 章节数据
    ///
    /// # 返回
    /// 摘要记录，以及警告和部分失败报告
    pub async fn summarize(&self, request: &SummaryRequest, input: &ChapterInput) -> Result<SummaryResponse> {
        if input.text.is_empty() {
            return Err(StudyError::EmptyChapter(input.chapter.index));
        }

        let mut warnings = Vec::new();
        let vision_enabled = request.vision_enabled && self.vision.is_some();
        if request.vision_enabled && !vision_enabled {
            warnings.push("未配置视觉服务，本次摘要不含图片描述".to_string());
        }

        let version = content_version(&input.text.text());
        let fingerprint = summary_fingerprint(
            &version,
            request.depth,
            request.normalized_instructions(),
            vision_enabled,
        );

        // 普通请求加入任何进行中的生成；强制请求只加入强制生成，
        // 否则排在当前生成之后，保证新记录成为当前记录
        let key = format!("{}/{}", request.document_id, fingerprint);
        let flight = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(&key).cloned() {
                Some(existing) if !request.force_regenerate || existing.forced => existing,
                existing => {
                    let flight = Flight {
                        forced: request.force_regenerate,
                        gate: existing.map(|f| f.gate).unwrap_or_default(),
                        cell: Arc::new(OnceCell::new()),
                    };
                    in_flight.insert(key.clone(), flight.clone());
                    flight
                }
            }
        };

        let result = flight
            .cell
            .get_or_init(|| async {
                let _turn = flight.gate.lock().await;
                self.resolve(request, input, &fingerprint, vision_enabled, flight.forced)
                    .await
            })
            .await
            .clone();

        {
            let mut in_flight = self.in_flight.lock().await;
            if in_flight
                .get(&key)
                .map(|f| Arc::ptr_eq(&f.cell, &flight.cell))
                .unwrap_or(false)
            {
                in_flight.remove(&key);
            }
        }

        let mut response = result?;
        // 相同正文的不同章节共用记录，返回时换成请求的章节
        if response.record.chapter_index != input.chapter.index {
            response.record.chapter_index = input.chapter.index;
            response.record.chapter_title = input.chapter.title.clone();
        }
        warnings.append(&mut response.warnings);
        response.warnings = warnings;
        Ok(response)
    }

    async fn resolve(
        &self,
        request: &SummaryRequest,
        input: &ChapterInput,
        fingerprint: &str,
        vision_enabled: bool,
        forced: bool,
    ) -> Result<SummaryResponse> {
        let document_id = request.document_id.as_str();
        let chapter = &input.chapter;
        let mut warnings = Vec::new();

        if !forced {
            match self.cache.lookup(document_id, fingerprint) {
                Ok(Some(record)) => {
                    info!("摘要缓存命中: 章节 {} {}", chapter.index, request.depth);
                    return Ok(SummaryResponse {
                        record,
                        from_cache: true,
                        warnings,
                        failure: None,
                    });
                }
                Ok(None) => debug!("摘要缓存未命中: 章节 {} {}", chapter.index, request.depth),
                Err(e) => {
                    let err = StudyError::CacheIo(e.to_string());
                    warn!("{}，按未命中处理", err);
                    warnings.push(format!("{}，按未命中处理", err));
                }
            }
        }

        let generated = self.generate(request, input, vision_enabled).await?;

        let generation = match self.cache.next_generation(document_id, fingerprint) {
            Ok(generation) => generation,
            Err(e) => {
                warnings.push(StudyError::CacheIo(e.to_string()).to_string());
                1
            }
        };

        let markdown = generated
            .blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let record = SummaryRecord {
            record_id: record_id(fingerprint, generation),
            fingerprint: fingerprint.to_string(),
            document_id: document_id.to_string(),
            chapter_index: chapter.index,
            chapter_title: chapter.title.clone(),
            depth: request.depth,
            instructions: request.normalized_instructions().map(str::to_string),
            vision_enabled,
            blocks: generated.blocks,
            category_tags: active_tags(&parse_categorized(&markdown)),
            generation,
            merge_tiers: generated.merge_tiers,
            created_at: Utc::now(),
        };

        let failure = if generated.failure.is_empty() {
            None
        } else {
            Some(generated.failure)
        };

        match &failure {
            None => {
                if let Err(e) = self.cache.insert(&record) {
                    let err = StudyError::CacheIo(e.to_string());
                    warn!("{}", err);
                    warnings.push(err.to_string());
                }
            }
            Some(report) => warn!(
                "章节 {} 摘要部分失败（{}/{} 段失败，合并失败: {}），结果不写入缓存",
                chapter.index,
                report.failed_sections.len(),
                report.total_sections,
                report.merge_failed
            ),
        }

        warnings.extend(generated.warnings);
        Ok(SummaryResponse {
            record,
            from_cache: false,
            warnings,
            failure,
        })
    }

    async fn generate(&self, request: &SummaryRequest, input: &ChapterInput, vision_enabled: bool) -> Result<Generated> {
        let chapter = &input.chapter;
        let text = &input.text;
        let instructions = request.normalized_instructions();
        let options = self.options();

        let direct = text.char_count() <= self.config.direct_threshold_chars;
        let sections = if direct {
            vec![whole_chapter(chapter, text)]
        } else {
            chunk_chapter(chapter.index, &chapter.title, text, self.config.section_char_budget)?
        };

        let figures = if vision_enabled {
            select_figures(&input.images, &self.config.vision)
        } else {
            Vec::new()
        };

        info!(
            "章节 {} 开始生成摘要: {} 段，{} 张图片，深度 {}{}",
            chapter.index,
            sections.len(),
            figures.len(),
            request.depth,
            if direct { "（直接生成）" } else { "" }
        );

        let section_calls = sections.iter().map(|section| {
            let part = if direct { None } else { Some((section.index, sections.len())) };
            let prompt = section_prompt(request.depth, &section.context, part, instructions);
            let target = format!("分段 {}", section.index);
            let options = &options;
            async move {
                self.with_retry(chapter.index, &target, || {
                    self.generator.generate(&prompt, &section.body, options)
                })
                .await
            }
        });

        let (summaries, (images, mut warnings)) = tokio::join!(
            join_all(section_calls),
            self.describe_figures(chapter, &figures, &sections, text)
        );

        let mut succeeded: Vec<(usize, String)> = Vec::new();
        let mut failed: Vec<FailedSection> = Vec::new();
        for (section, result) in sections.iter().zip(summaries) {
            match result {
                Ok(summary) => succeeded.push((section.index, summary)),
                Err(f) => {
                    warn!(
                        "章节 {} 分段 {}（第 {}-{} 页）生成失败，以占位块代替: {}",
                        chapter.index, section.index, section.start_page, section.end_page, f.error
                    );
                    failed.push(FailedSection {
                        section_index: section.index,
                        start_page: section.start_page,
                        end_page: section.end_page,
                        attempts: f.attempts,
                        reason: f.error.to_string(),
                        retryable: f.error.is_transient(),
                    });
                }
            }
        }

        let mut merge_failed = false;
        let mut merge_tiers = 0;
        let merged = match succeeded.len() {
            // 全部失败时不发起合并
            0 => String::new(),
            1 if sections.len() == 1 => succeeded[0].1.trim().to_string(),
            1 => mark_section(succeeded[0].0, &succeeded[0].1),
            _ => {
                let marked: Vec<String> = succeeded.iter().map(|(i, s)| mark_section(*i, s)).collect();
                let (result, tiers) = self
                    .merge(chapter, request.depth, instructions, marked.clone(), &mut warnings)
                    .await;
                merge_tiers = tiers;
                match result {
                    Ok(text) => text,
                    Err(f) => {
                        merge_failed = true;
                        warnings.push(format!("章节 {} 合并失败，按顺序拼接分段摘要: {}", chapter.index, f.error));
                        marked.join(SUMMARY_SEPARATOR)
                    }
                }
            }
        };

        let span = PageSpan {
            start: chapter.start_page,
            end: chapter.end_page,
        };
        let blocks = assemble_blocks(&merged, &sections, &failed, images, span, text);

        info!(
            "章节 {} 摘要生成完成: {} 个内容块，{} 段失败，合并层数 {}",
            chapter.index,
            blocks.len(),
            failed.len(),
            merge_tiers
        );

        Ok(Generated {
            blocks,
            merge_tiers,
            failure: PartialFailureReport {
                failed_sections: failed,
                total_sections: sections.len(),
                merge_failed,
            },
            warnings,
        })
    }

    /// 合并分段摘要
    ///
    /// 输入超过 `merge_char_budget` 时先把相邻摘要分批合并，直到能放进一次调用。
    /// 返回合并结果与合并层数
    async fn merge(
        &self,
        chapter: &Chapter,
        depth: DepthTier,
        instructions: Option<&str>,
        mut inputs: Vec<String>,
        warnings: &mut Vec<String>,
    ) -> (std::result::Result<String, CallFailure>, u32) {
        let prompt = merge_prompt(depth, &chapter.title, instructions);
        let options = self.options();
        let budget = self.config.merge_char_budget;
        let mut tiers = 0;

        loop {
            tiers += 1;
            let joined = inputs.join(SUMMARY_SEPARATOR);
            let batches = if joined.chars().count() > budget {
                batch_by_budget(&inputs, budget)
            } else {
                Vec::new()
            };

            // 放得下，或者已经无法再分批
            if batches.len() < 2 || batches.len() == inputs.len() {
                let result = self
                    .with_retry(chapter.index, "合并", || self.generator.generate(&prompt, &joined, &options))
                    .await;
                return (result, tiers);
            }

            debug!(
                "章节 {} 合并输入 {} 字符超过上限 {}，分 {} 批合并",
                chapter.index,
                joined.chars().count(),
                budget,
                batches.len()
            );

            let batch_calls = batches.iter().enumerate().map(|(b, batch)| {
                let content = batch.join(SUMMARY_SEPARATOR);
                let target = format!("合并批次 {}", b);
                let prompt = &prompt;
                let options = &options;
                async move {
                    let result = self
                        .with_retry(chapter.index, &target, || self.generator.generate(prompt, &content, options))
                        .await;
                    (result, content)
                }
            });

            inputs = join_all(batch_calls)
                .await
                .into_iter()
                .enumerate()
                .map(|(b, (result, content))| match result {
                    Ok(text) => text,
                    Err(f) => {
                        warnings.push(format!("章节 {} 合并批次 {} 失败，按顺序拼接: {}", chapter.index, b, f.error));
                        content
                    }
                })
                .collect();
        }
    }

    async fn describe_figures(
        &self,
        chapter: &Chapter,
        figures: &[&ExtractedImage],
        sections: &[TextSection],
        text: &ChapterText,
    ) -> (Vec<PlacedImage>, Vec<String>) {
        let vision = match &self.vision {
            Some(vision) if !figures.is_empty() => vision,
            _ => return (Vec::new(), Vec::new()),
        };

        let calls = figures.iter().map(|image| {
            let image: &ExtractedImage = image;
            let instruction = figure_instruction(image, &chapter.title);
            let target = format!("第 {} 页{}", image.page, figure_noun(image.kind));
            async move {
                let result = self
                    .with_retry(chapter.index, &target, || vision.describe(image, &instruction))
                    .await;
                (image, result)
            }
        });

        let mut placed = Vec::new();
        let mut warnings = Vec::new();
        for (image, result) in join_all(calls).await {
            let description = match result {
                Ok(description) => description.trim().to_string(),
                Err(f) => {
                    warnings.push(format!(
                        "第 {} 页{}描述失败，保留占位: {}",
                        image.page,
                        figure_noun(image.kind),
                        f.error
                    ));
                    String::new()
                }
            };
            let caption = if image.label.trim().is_empty() {
                format!("第 {} 页{}", image.page, figure_noun(image.kind))
            } else {
                image.label.clone()
            };
            placed.push(PlacedImage {
                owner: owning_section(sections, text, image),
                page: image.page,
                block: ContentBlock::Image {
                    caption,
                    description,
                    anchor: PositionAnchor {
                        page: image.page,
                        paragraph: image.paragraph,
                    },
                    kind: image.kind,
                    image_hash: image_hash(&image.bytes),
                },
            });
        }
        (placed, warnings)
    }

    /// 带超时与指数退避的外部调用
    ///
    /// 每次尝试都占用一个并发许可；不可重试的错误立即返回
    async fn with_retry<F, Fut>(
        &self,
        chapter_index: usize,
        target: &str,
        mut call: F,
    ) -> std::result::Result<String, CallFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<String, ServiceError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = {
                let _permit = self.semaphore.acquire().await.map_err(|_| CallFailure {
                    error: ServiceError::Transport("并发许可已关闭".to_string()),
                    attempts: attempt,
                })?;
                timeout(self.config.call_timeout(), call()).await
            };

            let error = match outcome {
                Ok(Ok(text)) => {
                    if attempt > 1 {
                        info!("章节 {} {} 第 {} 次尝试成功", chapter_index, target, attempt);
                    }
                    return Ok(text);
                }
                Ok(Err(e)) => e,
                Err(_) => ServiceError::Timeout(self.config.call_timeout_secs),
            };

            if !error.is_transient() || attempt >= max_attempts {
                warn!(
                    "章节 {} {} 调用失败（共尝试 {} 次）: {}",
                    chapter_index, target, attempt, error
                );
                return Err(CallFailure { error, attempts: attempt });
            }

            let delay = self.config.retry_base_delay() * 2u32.saturating_pow(attempt - 1);
            warn!(
                "章节 {} {} 第 {} 次调用失败，{} 毫秒后重试: {}",
                chapter_index,
                target,
                attempt,
                delay.as_millis(),
                error
            );
            sleep(delay).await;
        }
    }

    fn options(&self) -> GenerationOptions {
        GenerationOptions::new(self.config.gemini.temperature, self.config.gemini.max_output_tokens)
    }
}

/// 直接生成时整章作为一段
fn whole_chapter(chapter: &Chapter, text: &ChapterText) -> TextSection {
    TextSection {
        index: 0,
        context: chapter.title.clone(),
        body: text.text(),
        start_paragraph: 0,
        end_paragraph: text.paragraphs.len().saturating_sub(1),
        start_page: chapter.start_page,
        end_page: chapter.end_page,
    }
}

/// 筛掉图标类小图并限制数量，表格不受尺寸限制
fn select_figures<'a>(images: &'a [ExtractedImage], config: &VisionConfig) -> Vec<&'a ExtractedImage> {
    images
        .iter()
        .filter(|img| {
            img.kind == FigureKind::Table
                || (img.width >= config.min_image_size && img.height >= config.min_image_size)
        })
        .take(config.max_images)
        .collect()
}

/// 把相邻的输入分批，每批不超过上限（单个输入超限时独占一批）
fn batch_by_budget(inputs: &[String], budget: usize) -> Vec<Vec<String>> {
    let mut batches: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_len = 0;

    for input in inputs {
        let len = input.chars().count();
        let added = if current.is_empty() {
            len
        } else {
            SUMMARY_SEPARATOR.len() + len
        };
        if !current.is_empty() && current_len + added > budget {
            batches.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current_len += if current.is_empty() {
            len
        } else {
            SUMMARY_SEPARATOR.len() + len
        };
        current.push(input.clone());
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

fn figure_noun(kind: FigureKind) -> &'static str {
    match kind {
        FigureKind::Image => "的图片",
        FigureKind::Table => "的表格",
    }
}

fn image_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
