//! 测试用的假协作方与文档构造工具

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::ai::{GenerationOptions, TextGenerator, VisionDescriber};
use crate::command_index::BasicCommandScanner;
use crate::config::StudyConfig;
use crate::error::{ServiceError, StoreError};
use crate::man_page::{ManPage, ManPageOrigin, ManPageSource};
use crate::parser::{DocumentParser, ExtractedImage, FigureKind, OutlineEntry, PageContent, ParsedDocument};
use crate::session::StudyServices;
use crate::store::{KeyValueStore, MemoryStore};

/// 合并指令中的固定语句，用来区分合并调用与分段调用
const MERGE_PHRASE: &str = "Combine them into one coherent summary";

/// 内容中包含 `needle` 时触发的行为
enum Behavior {
    Fail(ServiceError),
    Stall(Duration),
}

struct Script {
    needle: String,
    /// 剩余触发次数，None 表示一直触发
    remaining: Option<u32>,
    behavior: Behavior,
}

/// 可编排的文本生成服务
///
/// 分段调用返回 `## [CMD] {首个单词}`，合并调用原样返回输入（保留分段标记）
#[derive(Default)]
pub struct FakeGenerator {
    calls: AtomicUsize,
    merge_calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    contents: Mutex<Vec<String>>,
    scripts: Mutex<Vec<Script>>,
    replies: Mutex<Vec<(String, String)>>,
    delay: Duration,
}

impl FakeGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次调用先等待 `delay`
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// 内容包含 `needle` 的调用先失败 `times` 次
    pub fn fail_times(&self, needle: &str, times: u32, error: ServiceError) {
        self.push_script(needle, Some(times), Behavior::Fail(error));
    }

    /// 内容包含 `needle` 的调用总是失败
    pub fn fail_always(&self, needle: &str, error: ServiceError) {
        self.push_script(needle, None, Behavior::Fail(error));
    }

    /// 内容包含 `needle` 的调用总是卡住 `duration`
    pub fn stall(&self, needle: &str, duration: Duration) {
        self.push_script(needle, None, Behavior::Stall(duration));
    }

    /// 指令包含 `needle` 时返回固定回复
    pub fn reply_to(&self, needle: &str, reply: &str) {
        self.replies
            .lock()
            .unwrap()
            .push((needle.to_string(), reply.to_string()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 同时进行的调用数的最大值
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn merge_calls(&self) -> usize {
        self.merge_calls.load(Ordering::SeqCst)
    }

    /// 所有调用收到的内容
    pub fn contents(&self) -> Vec<String> {
        self.contents.lock().unwrap().clone()
    }

    fn push_script(&self, needle: &str, remaining: Option<u32>, behavior: Behavior) {
        self.scripts.lock().unwrap().push(Script {
            needle: needle.to_string(),
            remaining,
            behavior,
        });
    }

    /// 找到第一个命中的脚本并消耗一次
    fn triggered(&self, content: &str) -> Option<Result<Duration, ServiceError>> {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts
            .iter_mut()
            .find(|s| content.contains(&s.needle) && s.remaining.map(|n| n > 0).unwrap_or(true))?;
        if let Some(n) = script.remaining.as_mut() {
            *n -= 1;
        }
        Some(match &script.behavior {
            Behavior::Fail(e) => Err(e.clone()),
            Behavior::Stall(d) => Ok(*d),
        })
    }
}

#[async_trait]
impl TextGenerator for FakeGenerator {
    async fn generate(&self, prompt: &str, content: &str, _options: &GenerationOptions) -> Result<String, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        let result = self.respond(prompt, content).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl FakeGenerator {
    async fn respond(&self, prompt: &str, content: &str) -> Result<String, ServiceError> {
        self.contents.lock().unwrap().push(content.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match self.triggered(content) {
            Some(Err(e)) => return Err(e),
            Some(Ok(stall)) => tokio::time::sleep(stall).await,
            None => {}
        }

        if prompt.contains(MERGE_PHRASE) {
            self.merge_calls.fetch_add(1, Ordering::SeqCst);
            return Ok(content.to_string());
        }

        let fixed = self
            .replies
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone());
        if let Some(reply) = fixed {
            return Ok(reply);
        }

        let first_word = content.split_whitespace().next().unwrap_or("empty");
        Ok(format!("## [CMD] {}\n- covers {}", first_word, first_word))
    }
}

/// 视觉服务：返回固定描述，可设置为总是失败
#[derive(Default)]
pub struct FakeVision {
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl FakeVision {
    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(true),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionDescriber for FakeVision {
    async fn describe(&self, image: &ExtractedImage, _instruction: &str) -> Result<String, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ServiceError::Rejected("unsupported image".to_string()));
        }
        Ok(format!("Diagram from page {}", image.page))
    }
}

/// 读取可以被设置为失败的内存存储
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_reads: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Database("disk I/O error".to_string()));
        }
        Ok(())
    }
}

impl KeyValueStore for FlakyStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check()?;
        self.inner.get(key)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.inner.put(key, value)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.check()?;
        self.inner.scan_prefix(prefix)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.inner.flush()
    }
}

/// 按命令名返回预置文本的手册页来源
#[derive(Default)]
pub struct FakeManSource {
    pages: HashMap<String, String>,
    calls: AtomicUsize,
}

impl FakeManSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, command: &str, text: &str) -> Self {
        self.pages.insert(command.to_string(), text.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManPageSource for FakeManSource {
    async fn fetch(&self, command: &str) -> Option<ManPage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.pages.get(command).map(|text| ManPage {
            text: text.clone(),
            origin: ManPageOrigin::Local,
        })
    }
}

/// 直接返回预先构造的解析结果
pub struct FakeParser {
    pub document: ParsedDocument,
}

impl DocumentParser for FakeParser {
    fn parse(&self, _bytes: &[u8]) -> Result<ParsedDocument, String> {
        Ok(self.document.clone())
    }
}

/// 测试配置：预算很小，重试几乎不等待
pub fn test_config() -> StudyConfig {
    StudyConfig {
        section_char_budget: 200,
        direct_threshold_chars: 200,
        merge_char_budget: 10_000,
        max_concurrent_calls: 4,
        call_timeout_secs: 5,
        max_attempts: 3,
        retry_base_delay_ms: 1,
        ..StudyConfig::default()
    }
}

pub fn services(
    config: StudyConfig,
    store: Arc<dyn KeyValueStore>,
    generator: Arc<FakeGenerator>,
    vision: Option<Arc<FakeVision>>,
) -> StudyServices {
    let vision: Option<Arc<dyn VisionDescriber>> = vision.map(|v| v as Arc<dyn VisionDescriber>);
    StudyServices::new(config, store, generator, vision, Arc::new(BasicCommandScanner))
}

/// 约 150 字符、以 `word` 开头的段落
pub fn paragraph(word: &str) -> String {
    format!("{} {}", word, "steady filler text keeps going. ".repeat(4).trim_end())
}

pub fn page(number: u32, paragraphs: &[String]) -> PageContent {
    PageContent {
        number,
        text: paragraphs.join("\n\n"),
        lines: vec![],
    }
}

pub fn outline_entry(title: &str, page: u32) -> OutlineEntry {
    OutlineEntry {
        title: title.to_string(),
        page,
        level: 1,
    }
}

/// 一页一段的文档，每个单词对应一页，带单条大纲（整本为一章）
pub fn one_chapter_book(words: &[&str]) -> ParsedDocument {
    let pages: Vec<PageContent> = words
        .iter()
        .enumerate()
        .map(|(i, w)| page(i as u32 + 1, &[paragraph(w)]))
        .collect();
    ParsedDocument {
        title: Some("Shell Basics".to_string()),
        page_count: pages.len() as u32,
        pages,
        outline: Some(vec![outline_entry("Getting Started", 1)]),
        images: vec![],
    }
}

pub fn figure(page: u32, paragraph: Option<usize>, label: &str) -> ExtractedImage {
    ExtractedImage {
        page,
        paragraph,
        kind: FigureKind::Image,
        label: label.to_string(),
        mime_type: "image/png".to_string(),
        width: 640,
        height: 480,
        bytes: label.as_bytes().to_vec(),
        text: None,
    }
}
