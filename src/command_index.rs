use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

static BACKTICK_SPAN: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`\n]+)`").unwrap());
static COMMAND_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][\w.+-]*$").unwrap());
/// `- \`cmd\` - 描述`、`| \`cmd\` | 描述 |`、`**\`cmd\`**: 描述` 之类的列表行
static DESCRIBED_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:[-*+]|\d+[.)]|\|)?\s*\**`([^`\n]+)`\**\s*(?:\||[-:—–])?\s*(.*)$").unwrap()
});

/// 命令文本的最大长度，超过的多半是整段代码
const MAX_COMMAND_CHARS: usize = 80;

/// 描述被替换所需的词数倍数
const BETTER_WORD_RATIO: f32 = 1.5;
/// 描述被替换所需的最少新增字符数
const BETTER_EXTRA_CHARS: usize = 20;

/// 从文本中识别出的原始命令
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandToken {
    pub raw: String,
    /// 文本给出的说明，没有时为空
    pub description: String,
}

impl CommandToken {
    pub fn new(raw: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            description: description.into(),
        }
    }
}

/// 命令识别规则库
pub trait CommandPatternLibrary: Send + Sync {
    /// 扫描文本，按出现顺序返回命令
    fn scan(&self, text: &str) -> Vec<CommandToken>;
}

/// 默认规则：反引号包裹的片段与 `$ ` 提示符开头的行
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicCommandScanner;

impl CommandPatternLibrary for BasicCommandScanner {
    fn scan(&self, text: &str) -> Vec<CommandToken> {
        let mut tokens = Vec::new();
        for line in text.lines() {
            let trimmed = line.trim();
            if let Some(rest) = trimmed.strip_prefix("$ ") {
                if looks_like_command(rest) {
                    tokens.push(CommandToken::new(trimmed, ""));
                }
                continue;
            }
            for cap in BACKTICK_SPAN.captures_iter(line) {
                let span = &cap[1];
                if looks_like_command(span) {
                    tokens.push(CommandToken::new(span, ""));
                }
            }
        }
        tokens
    }
}

/// 带说明的命令列表（例如生成服务输出的命令参考表）
#[derive(Debug, Clone, Copy, Default)]
pub struct DescribedListScanner;

impl CommandPatternLibrary for DescribedListScanner {
    fn scan(&self, text: &str) -> Vec<CommandToken> {
        text.lines()
            .filter(|line| !is_table_rule(line))
            .filter_map(|line| {
                let caps = DESCRIBED_LINE.captures(line)?;
                let command = caps.get(1)?.as_str();
                if !looks_like_command(command) {
                    return None;
                }
                let description = caps
                    .get(2)
                    .map(|m| clean_description(m.as_str()))
                    .unwrap_or_default();
                Some(CommandToken::new(command, description))
            })
            .collect()
    }
}

fn is_table_rule(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|') && t.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

fn clean_description(text: &str) -> String {
    text.split('|')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("; ")
        .replace("**", "")
}

/// 判断片段是否像一条命令：首词是命令名、不是变量赋值、长度合理
fn looks_like_command(text: &str) -> bool {
    let text = text.trim();
    let text = text.strip_prefix("$ ").unwrap_or(text);
    if text.is_empty() || text.chars().count() > MAX_COMMAND_CHARS {
        return false;
    }
    match text.split_whitespace().next() {
        Some(first) => {
            let name = first.rsplit('/').next().unwrap_or(first);
            !first.contains('=') && COMMAND_NAME.is_match(name)
        }
        None => false,
    }
}

/// 规范化命令文本：去首尾空白、去掉开头的 `$ ` 提示符、合并空白、转小写
///
/// 结果为空时返回 None
pub fn canonicalize(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let without_prompt = trimmed.strip_prefix("$ ").unwrap_or(trimmed);
    let canonical = without_prompt
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    if canonical.is_empty() {
        None
    } else {
        Some(canonical)
    }
}

/// 新描述是否明显更好：原描述为空，或词数至少 1.5 倍且多出至少 20 个字符
pub fn is_better_description(current: &str, candidate: &str) -> bool {
    let candidate = candidate.trim();
    if candidate.is_empty() {
        return false;
    }
    let current = current.trim();
    if current.is_empty() {
        return true;
    }
    let current_words = current.split_whitespace().count() as f32;
    let candidate_words = candidate.split_whitespace().count() as f32;
    candidate_words >= current_words * BETTER_WORD_RATIO
        && candidate.chars().count() >= current.chars().count() + BETTER_EXTRA_CHARS
}

/// 命令索引条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEntry {
    /// 规范化后的命令（索引键）
    pub command: String,
    /// 最早出现的章节
    pub first_seen_chapter: usize,
    pub description: String,
    /// 出现过的章节，只增不减
    pub chapters: BTreeSet<usize>,
    /// 归并到该条目的原始写法
    #[serde(default)]
    pub raw_forms: BTreeSet<String>,
}

/// 同一次提取中多个原始写法规范化为同一个键
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConflict {
    pub canonical: String,
    pub chapter_index: usize,
    pub raw_forms: Vec<String>,
}

/// 某一章节首次引入的命令
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterCommands {
    pub chapter_index: usize,
    pub chapter_title: String,
    pub commands: Vec<String>,
}

/// 按章节组织的命令索引
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandIndexView {
    pub total: usize,
    /// 按首次出现的章节分组，章节顺序排列
    pub by_chapter: Vec<ChapterCommands>,
    /// 当前章节首次引入的命令
    pub new_in_chapter: Vec<CommandEntry>,
}

/// 一次提取对索引的改动
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDelta {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub conflicts: Vec<IndexConflict>,
}

impl IndexDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.conflicts.is_empty()
    }
}

/// 命令索引
///
/// 跨章节累积，按规范化命令去重；对同一章节重复提取不会产生任何改动
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandIndex {
    entries: BTreeMap<String, CommandEntry>,
}

impl CommandIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, raw: &str) -> Option<&CommandEntry> {
        canonicalize(raw).and_then(|key| self.entries.get(&key))
    }

    /// 按命令排序的全部条目
    pub fn entries(&self) -> Vec<CommandEntry> {
        self.entries.values().cloned().collect()
    }

    /// 在该章节首次出现的命令
    pub fn new_in_chapter(&self, chapter_index: usize) -> Vec<&CommandEntry> {
        self.entries
            .values()
            .filter(|e| e.first_seen_chapter == chapter_index)
            .collect()
    }

    /// 按首次出现章节分组的命令
    pub fn by_first_chapter(&self) -> BTreeMap<usize, Vec<String>> {
        let mut grouped: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for entry in self.entries.values() {
            grouped
                .entry(entry.first_seen_chapter)
                .or_default()
                .push(entry.command.clone());
        }
        grouped
    }

    /// 把一个章节的命令写入索引
    ///
    /// 新命令创建条目；已有命令只追加章节、在新描述明显更好时替换描述。
    /// 多个新写法规范化为同一个键时记为冲突并合并，不会中断
    ///
    /// # 参数
    /// - `chapter_index`: 命令所在章节
    /// - `tokens`: 识别出的命令
    ///
    /// # 返回
    /// 本次新增、更新的命令与冲突；重复提取时为空
    pub fn apply(&mut self, chapter_index: usize, tokens: &[CommandToken]) -> IndexDelta {
        // 按规范化键分组，保留首次出现的顺序
        let mut order: Vec<String> = Vec::new();
        let mut groups: BTreeMap<String, Vec<&CommandToken>> = BTreeMap::new();
        for token in tokens {
            if let Some(key) = canonicalize(&token.raw) {
                let group = groups.entry(key.clone()).or_default();
                if group.is_empty() {
                    order.push(key);
                }
                group.push(token);
            }
        }

        let mut delta = IndexDelta::default();
        for key in order {
            let group = &groups[&key];
            let raw_forms: BTreeSet<String> = group.iter().map(|t| t.raw.trim().to_string()).collect();
            let description = group
                .iter()
                .map(|t| t.description.trim())
                .fold("", |best, d| if is_better_description(best, d) { d } else { best })
                .to_string();

            let known_forms = self.entries.get(&key).map(|e| &e.raw_forms);
            let has_new_form = raw_forms
                .iter()
                .any(|f| known_forms.map(|k| !k.contains(f)).unwrap_or(true));
            if raw_forms.len() > 1 && has_new_form {
                warn!(
                    "章节 {} 中多个写法归并为同一命令 `{}`: {:?}",
                    chapter_index, key, raw_forms
                );
                delta.conflicts.push(IndexConflict {
                    canonical: key.clone(),
                    chapter_index,
                    raw_forms: raw_forms.iter().cloned().collect(),
                });
            }

            match self.entries.get_mut(&key) {
                None => {
                    self.entries.insert(
                        key.clone(),
                        CommandEntry {
                            command: key.clone(),
                            first_seen_chapter: chapter_index,
                            description,
                            chapters: BTreeSet::from([chapter_index]),
                            raw_forms,
                        },
                    );
                    delta.added.push(key);
                }
                Some(entry) => {
                    let mut changed = entry.chapters.insert(chapter_index);
                    if chapter_index < entry.first_seen_chapter {
                        entry.first_seen_chapter = chapter_index;
                    }
                    if is_better_description(&entry.description, &description) {
                        entry.description = description;
                        changed = true;
                    }
                    entry.raw_forms.extend(raw_forms);
                    if changed {
                        delta.updated.push(key);
                    }
                }
            }
        }

        debug!(
            "章节 {} 命令索引更新: 新增 {}，更新 {}，冲突 {}",
            chapter_index,
            delta.added.len(),
            delta.updated.len(),
            delta.conflicts.len()
        );
        delta
    }
}
