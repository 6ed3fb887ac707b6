use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::ai::prompts::extraction_prompt;
use crate::ai::{GenerationOptions, TextGenerator};
use crate::chapter_registry::Chapter;
use crate::command_index::{
    canonicalize, is_better_description, CommandPatternLibrary, CommandToken, DescribedListScanner, IndexDelta,
};
use crate::config::StudyConfig;
use crate::error::{Result, ServiceError, StudyError};

/// `- **名称**: 说明`、`1. 名称: 说明` 之类的列表项
static LIST_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(?:[-*+]|\d+[.)])\s+(.+)$").unwrap());
static BOLD_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\*\*([^*]+)\*\*\s*[:：\-—–]?\s*(.*)$").unwrap());

/// 提取调用使用较低的温度
const EXTRACTION_TEMPERATURE: f32 = 0.1;

/// 提取模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMode {
    Commands,
    Terms,
    Concepts,
    Examples,
}

impl ExtractionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commands => "commands",
            Self::Terms => "terms",
            Self::Concepts => "concepts",
            Self::Examples => "examples",
        }
    }

    fn instruction(&self) -> &'static str {
        match self {
            Self::Commands => {
                "Extract ALL commands, flags, and syntax mentioned in this text. For each command, provide:\n\
                 - The command name and syntax\n\
                 - What it does (brief description)\n\
                 - Any flags/options mentioned with their purposes\n\
                 - Example usage if given in the text\n\
                 Format as a list where every line starts with the command in backticks, \
                 followed by ` - ` and its description."
            }
            Self::Terms => {
                "Extract ALL key terms, definitions, and vocabulary from this text. \
                 For each term, provide the definition or explanation given in the text. \
                 Format as a glossary list: `- **Term**: definition`."
            }
            Self::Concepts => {
                "Extract ALL key concepts and ideas from this text. For each concept, provide a brief \
                 explanation and how it relates to other concepts mentioned. Organize hierarchically, \
                 one `- **Concept**: explanation` line per concept."
            }
            Self::Examples => {
                "Extract ALL examples, code snippets, and practical demonstrations from this text. \
                 For each, explain what it demonstrates and the expected output or result, \
                 one `- **Example**: explanation` line per example."
            }
        }
    }
}

impl fmt::Display for ExtractionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExtractionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "commands" => Ok(Self::Commands),
            "terms" => Ok(Self::Terms),
            "concepts" => Ok(Self::Concepts),
            "examples" => Ok(Self::Examples),
            other => Err(format!("未知的提取模式: {}", other)),
        }
    }
}

/// 提取出的一项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyItem {
    pub name: String,
    pub description: String,
}

/// 关键内容提取结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyItemsReport {
    pub chapter_index: usize,
    pub mode: ExtractionMode,
    pub items: Vec<KeyItem>,
    /// 生成服务的原始输出（调用失败时为空）
    pub raw_text: String,
    /// 命令模式下对命令索引的改动
    pub index_delta: IndexDelta,
    pub warnings: Vec<String>,
}

/// 提取结果（写入命令索引之前）
#[derive(Debug, Clone)]
pub struct Extraction {
    pub items: Vec<KeyItem>,
    pub raw_text: String,
    /// 命令模式下识别出的命令，其他模式为空
    pub command_tokens: Vec<CommandToken>,
    pub warnings: Vec<String>,
}

/// 关键内容提取器
pub struct KeyItemExtractor {
    generator: Arc<dyn TextGenerator>,
    library: Arc<dyn CommandPatternLibrary>,
    config: StudyConfig,
}

impl KeyItemExtractor {
    pub fn new(generator: Arc<dyn TextGenerator>, library: Arc<dyn CommandPatternLibrary>, config: StudyConfig) -> Self {
        Self {
            generator,
            library,
            config,
        }
    }

    /// 从章节正文提取关键内容
    ///
    /// 命令模式下先用本地规则扫描，再用生成服务补充说明；
    /// 生成服务失败时仍返回本地扫描结果并附带警告。其他模式依赖生成服务，失败即报错
    ///
    /// # 参数
    /// - `chapter`: 章节
    /// - `text`: 章节正文
    /// - `mode`: 提取模式
    pub async fn extract(&self, chapter: &Chapter, text: &str, mode: ExtractionMode) -> Result<Extraction> {
        let mut warnings = Vec::new();

        // 本地扫描覆盖全文，只有送入生成服务的内容受长度限制
        let local_tokens = if mode == ExtractionMode::Commands {
            self.library.scan(text)
        } else {
            Vec::new()
        };
        let content: String = text.chars().take(self.config.qa_char_budget).collect();

        let raw_text = match self.call(chapter, &content, mode).await {
            Ok(raw) => raw,
            Err(e) if mode == ExtractionMode::Commands => {
                warn!("章节 {} 命令提取调用失败，只使用本地扫描结果: {}", chapter.index, e);
                warnings.push(format!("生成服务调用失败，只返回本地扫描结果: {}", e));
                String::new()
            }
            Err(e) => {
                return Err(StudyError::ExternalService {
                    chapter_index: chapter.index,
                    target: format!("{} 提取", mode),
                    source: e,
                })
            }
        };

        let extraction = if mode == ExtractionMode::Commands {
            let mut tokens = local_tokens;
            tokens.extend(DescribedListScanner.scan(&raw_text));
            Extraction {
                items: command_items(&tokens),
                raw_text,
                command_tokens: tokens,
                warnings,
            }
        } else {
            Extraction {
                items: parse_items(&raw_text),
                raw_text,
                command_tokens: Vec::new(),
                warnings,
            }
        };

        info!(
            "章节 {} 提取 {}: {} 项",
            chapter.index,
            mode,
            extraction.items.len()
        );
        Ok(extraction)
    }

    async fn call(&self, chapter: &Chapter, text: &str, mode: ExtractionMode) -> std::result::Result<String, ServiceError> {
        let prompt = extraction_prompt(mode.instruction(), &chapter.title);
        let options = GenerationOptions::new(EXTRACTION_TEMPERATURE, self.config.gemini.max_output_tokens);
        match timeout(self.config.call_timeout(), self.generator.generate(&prompt, text, &options)).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout(self.config.call_timeout_secs)),
        }
    }
}

/// 按规范化命令去重，保留最好的说明
fn command_items(tokens: &[CommandToken]) -> Vec<KeyItem> {
    let mut items: Vec<(String, KeyItem)> = Vec::new();
    for token in tokens {
        let Some(key) = canonicalize(&token.raw) else { continue };
        match items.iter_mut().find(|(k, _)| *k == key) {
            Some((_, item)) => {
                if is_better_description(&item.description, &token.description) {
                    item.description = token.description.trim().to_string();
                }
            }
            None => items.push((
                key.clone(),
                KeyItem {
                    name: key,
                    description: token.description.trim().to_string(),
                },
            )),
        }
    }
    items.into_iter().map(|(_, item)| item).collect()
}

/// 解析列表形式的输出，名称取加粗部分或冒号前的部分
pub fn parse_items(text: &str) -> Vec<KeyItem> {
    text.lines()
        .filter_map(|line| LIST_ITEM.captures(line))
        .filter_map(|caps| {
            let body = caps.get(1)?.as_str().trim();
            if let Some(bold) = BOLD_NAME.captures(body) {
                return Some(KeyItem {
                    name: bold[1].trim().trim_end_matches(':').to_string(),
                    description: bold[2].trim().to_string(),
                });
            }
            let (name, description) = match body.split_once(": ") {
                Some((name, description)) if name.chars().count() <= 80 => (name, description),
                _ => (body, ""),
            };
            Some(KeyItem {
                name: name.trim().to_string(),
                description: description.trim().to_string(),
            })
        })
        .filter(|item| !item.name.is_empty())
        .collect()
}

/// 组装对外的提取结果
pub fn into_report(chapter_index: usize, mode: ExtractionMode, extraction: Extraction, index_delta: IndexDelta) -> KeyItemsReport {
    KeyItemsReport {
        chapter_index,
        mode,
        items: extraction.items,
        raw_text: extraction.raw_text,
        index_delta,
        warnings: extraction.warnings,
    }
}
