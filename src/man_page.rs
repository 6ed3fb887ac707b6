use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::ai::prompts::man_page_prompt;
use crate::ai::{GenerationOptions, TextGenerator};
use crate::config::{ManPageConfig, StudyConfig};
use crate::error::{Result, ServiceError, StudyError};
use crate::store::{get_json, put_json, KeyValueStore};

static COMMAND_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_.\-]+$").unwrap());
/// 终端加粗/下划线使用的退格叠印
static OVERSTRIKE: Lazy<Regex> = Lazy::new(|| Regex::new(r".\x08").unwrap());
static BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());
static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static HTML_ENTITY: Lazy<Regex> = Lazy::new(|| Regex::new(r"&[a-z]+;").unwrap());

const CACHE_PREFIX: &str = "man/";
const USER_AGENT: &str = "StudySage/1.0";
const TRUNCATION_NOTE: &str = "\n\n[... truncated for brevity ...]";
/// 本地输出少于该长度视为没有手册页
const MIN_LOCAL_CHARS: usize = 50;
/// 在线页面少于该长度多半是 404 页
const MIN_ONLINE_CHARS: usize = 200;
/// 随摘要保存的原文长度
const RAW_EXCERPT_CHARS: usize = 8_000;

const MAN_PAGE_OPTIONS: GenerationOptions = GenerationOptions {
    temperature: 0.2,
    max_output_tokens: 4096,
};

/// 手册页来自哪里
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManPageOrigin {
    Local,
    Online,
}

/// 手册页原文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManPage {
    pub text: String,
    pub origin: ManPageOrigin,
}

/// 整理后的手册页参考卡片
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManPageSummary {
    pub command: String,
    pub summary: String,
    pub origin: ManPageOrigin,
    /// 清理后的原文开头部分
    pub raw_excerpt: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub from_cache: bool,
}

/// 手册页来源
#[async_trait]
pub trait ManPageSource: Send + Sync {
    /// 获取命令的手册页原文，找不到时返回 None
    ///
    /// # 参数
    /// - `command`: 已校验过的命令名
    async fn fetch(&self, command: &str) -> Option<ManPage>;
}

/// 默认来源：先运行本地 `man`，失败时查询在线手册页站点
pub struct SystemManSource {
    http_client: reqwest::Client,
    config: ManPageConfig,
}

impl SystemManSource {
    pub fn new(config: &ManPageConfig) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            config: config.clone(),
        }
    }

    async fn fetch_local(&self, command: &str) -> Option<String> {
        let mut man = Command::new("man");
        man.arg(command)
            .env("MANPAGER", "cat")
            .env("COLUMNS", "120")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        match timeout(self.config.fetch_timeout(), man.output()).await {
            Ok(Ok(output)) if output.status.success() => {
                let text = String::from_utf8_lossy(&output.stdout);
                if text.trim().chars().count() > MIN_LOCAL_CHARS {
                    Some(text.into_owned())
                } else {
                    None
                }
            }
            Ok(Ok(output)) => {
                debug!("本地 man {} 退出码 {:?}", command, output.status.code());
                None
            }
            Ok(Err(e)) => {
                debug!("无法运行本地 man: {}", e);
                None
            }
            Err(_) => {
                warn!("本地 man {} 超时", command);
                None
            }
        }
    }

    async fn fetch_online(&self, command: &str) -> Option<String> {
        let url = format!("{}/{}?f=t", self.config.online_endpoint.trim_end_matches('/'), command);
        let response = match self
            .http_client
            .get(&url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .timeout(self.config.fetch_timeout())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("在线手册页请求失败 {}: {}", url, e);
                return None;
            }
        };
        if !response.status().is_success() {
            debug!("在线手册页 {} 返回 {}", url, response.status());
            return None;
        }
        let html = match response.text().await {
            Ok(html) => html,
            Err(e) => {
                warn!("在线手册页读取失败 {}: {}", url, e);
                return None;
            }
        };

        let text = html_to_text(&html);
        if looks_like_man_page(&text) {
            Some(text)
        } else {
            None
        }
    }
}

#[async_trait]
impl ManPageSource for SystemManSource {
    async fn fetch(&self, command: &str) -> Option<ManPage> {
        if let Some(text) = self.fetch_local(command).await {
            return Some(ManPage {
                text,
                origin: ManPageOrigin::Local,
            });
        }
        if !self.config.online_fallback {
            return None;
        }
        self.fetch_online(command).await.map(|text| ManPage {
            text,
            origin: ManPageOrigin::Online,
        })
    }
}

/// 取出要查询的命令名：去掉 `$ ` 提示符后的第一个词，且只含安全字符
pub fn command_name(input: &str) -> Option<String> {
    let trimmed = input.trim();
    let trimmed = trimmed.strip_prefix("$ ").unwrap_or(trimmed);
    let first = trimmed.split_whitespace().next()?;
    COMMAND_NAME.is_match(first).then(|| first.to_string())
}

/// 清理手册页文本：去掉退格叠印与行尾空白，合并连续空行，超长时截断
///
/// # 参数
/// - `text`: 手册页原文
/// - `max_chars`: 保留的最大字符数
pub fn clean_man_text(text: &str, max_chars: usize) -> String {
    let text = OVERSTRIKE.replace_all(text, "");
    let text = text.lines().map(str::trim_end).collect::<Vec<_>>().join("\n");
    let mut text = BLANK_RUNS.replace_all(&text, "\n\n").into_owned();
    if text.chars().count() > max_chars {
        text = text.chars().take(max_chars).collect::<String>() + TRUNCATION_NOTE;
    }
    text.trim().to_string()
}

fn html_to_text(html: &str) -> String {
    let text = HTML_TAG.replace_all(html, "");
    HTML_ENTITY.replace_all(&text, " ").trim().to_string()
}

fn looks_like_man_page(text: &str) -> bool {
    let upper = text.to_uppercase();
    text.chars().count() > MIN_ONLINE_CHARS && (upper.contains("SYNOPSIS") || upper.contains("DESCRIPTION"))
}

fn cache_key(command: &str) -> String {
    format!("{}{}", CACHE_PREFIX, command)
}

/// 手册页查询
///
/// 结果按命令名缓存在存储中，跨文档共用；失败不缓存
pub struct ManPageLookup {
    source: Arc<dyn ManPageSource>,
    generator: Arc<dyn TextGenerator>,
    store: Arc<dyn KeyValueStore>,
    config: StudyConfig,
}

impl ManPageLookup {
    pub fn new(
        source: Arc<dyn ManPageSource>,
        generator: Arc<dyn TextGenerator>,
        store: Arc<dyn KeyValueStore>,
        config: StudyConfig,
    ) -> Self {
        Self {
            source,
            generator,
            store,
            config,
        }
    }

    /// 查询命令的手册页并整理成参考卡片
    ///
    /// # 参数
    /// - `input`: 用户输入的命令，只取第一个词
    ///
    /// # 返回
    /// 缓存命中时 `from_cache` 为 true
    pub async fn lookup(&self, input: &str) -> Result<ManPageSummary> {
        let command = command_name(input).ok_or_else(|| StudyError::ManPage {
            command: input.trim().to_string(),
            reason: "命令名只能包含字母、数字、`_`、`.` 与 `-`".to_string(),
        })?;

        match get_json::<ManPageSummary>(self.store.as_ref(), &cache_key(&command)) {
            Ok(Some(mut cached)) => {
                debug!("手册页缓存命中: {}", command);
                cached.from_cache = true;
                return Ok(cached);
            }
            Ok(None) => {}
            Err(e) => warn!("手册页缓存读取失败，重新查询: {}", e),
        }

        let page = self.source.fetch(&command).await.ok_or_else(|| StudyError::ManPage {
            command: command.clone(),
            reason: format!(
                "本地与在线都没有找到手册页，可能是 shell 内建命令（试试 `help {}`）、别名或自定义脚本",
                command
            ),
        })?;
        let text = clean_man_text(&page.text, self.config.man_page.max_chars);

        let prompt = man_page_prompt(&command);
        let result = match timeout(
            self.config.call_timeout(),
            self.generator.generate(&prompt, &text, &MAN_PAGE_OPTIONS),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout(self.config.call_timeout_secs)),
        };
        let summary = result.map_err(|source| StudyError::ManPageService {
            command: command.clone(),
            source,
        })?;

        let entry = ManPageSummary {
            command,
            summary,
            origin: page.origin,
            raw_excerpt: text.chars().take(RAW_EXCERPT_CHARS).collect(),
            created_at: Utc::now(),
            from_cache: false,
        };
        if let Err(e) = put_json(self.store.as_ref(), &cache_key(&entry.command), &entry) {
            warn!("手册页摘要写入缓存失败: {}", e);
        }
        info!("手册页已整理: {}（{:?}）", entry.command, entry.origin);
        Ok(entry)
    }

    /// 所有已缓存的手册页摘要，按命令名排序
    pub fn cached(&self) -> Result<Vec<ManPageSummary>> {
        let entries = self.store.scan_prefix(CACHE_PREFIX)?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, bytes)| match serde_json::from_slice::<ManPageSummary>(&bytes) {
                Ok(mut entry) => {
                    entry.from_cache = true;
                    Some(entry)
                }
                Err(e) => {
                    warn!("跳过无法解析的手册页缓存 {}: {}", key, e);
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_support::{FakeGenerator, FakeManSource};

    fn lookup(source: Arc<FakeManSource>, generator: Arc<FakeGenerator>) -> ManPageLookup {
        ManPageLookup::new(source, generator, Arc::new(MemoryStore::new()), StudyConfig::default())
    }

    #[test]
    fn test_command_name() {
        assert_eq!(command_name("  tar -xzf archive.tgz"), Some("tar".to_string()));
        assert_eq!(command_name("$ ls -l"), Some("ls".to_string()));
        assert_eq!(command_name("rm;reboot"), None);
        assert_eq!(command_name("./configure"), None);
        assert_eq!(command_name("   "), None);
    }

    #[test]
    fn test_clean_man_text() {
        let raw = "N\x08NA\x08AM\x08ME\x08E  \n\n\n\nls - list   \n";
        assert_eq!(clean_man_text(raw, 1_000), "NAME\n\nls - list");

        let long = "a".repeat(50);
        assert_eq!(clean_man_text(&long, 10), format!("{}{}", "a".repeat(10), TRUNCATION_NOTE));
    }

    #[test]
    fn test_online_page_detection() {
        let html = format!("<html><b>NAME</b>&nbsp;grep<p>SYNOPSIS</p>{}</html>", "grep searches. ".repeat(20));
        let text = html_to_text(&html);
        assert!(text.starts_with("NAME grep"));
        assert!(looks_like_man_page(&text));
        assert!(!looks_like_man_page(&html_to_text("<h1>404 Not Found</h1>")));
    }

    #[tokio::test]
    async fn test_lookup_is_cached() {
        let source = Arc::new(FakeManSource::new().with_page("tar", "TAR(1)\n\n\n\nSYNOPSIS\n  tar [options]"));
        let generator = Arc::new(FakeGenerator::new());
        generator.reply_to("reference card", "## `tar` - archive files");
        let lookup = lookup(source.clone(), generator.clone());

        let first = lookup.lookup("tar -xzf backup.tgz").await.unwrap();
        assert!(!first.from_cache);
        assert_eq!(first.command, "tar");
        assert_eq!(first.summary, "## `tar` - archive files");
        assert_eq!(first.origin, ManPageOrigin::Local);
        assert_eq!(generator.contents(), vec!["TAR(1)\n\nSYNOPSIS\n  tar [options]".to_string()]);

        let second = lookup.lookup("tar").await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.summary, first.summary);
        assert_eq!(source.calls(), 1);
        assert_eq!(generator.calls(), 1);

        let cached = lookup.cached().unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].command, "tar");
    }

    #[tokio::test]
    async fn test_invalid_and_missing_commands() {
        let source = Arc::new(FakeManSource::new());
        let generator = Arc::new(FakeGenerator::new());
        let lookup = lookup(source.clone(), generator.clone());

        let err = lookup.lookup("rm;reboot").await.unwrap_err();
        assert!(matches!(err, StudyError::ManPage { .. }));
        assert_eq!(source.calls(), 0);

        let err = lookup.lookup("cd").await.unwrap_err();
        assert!(err.to_string().contains("help cd"));
        assert_eq!(source.calls(), 1);
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_summary_is_not_cached() {
        let source = Arc::new(FakeManSource::new().with_page("grep", "GREP(1)\nDESCRIPTION\n  grep searches"));
        let generator = Arc::new(FakeGenerator::new());
        generator.fail_times("GREP(1)", 1, ServiceError::RateLimited("quota".to_string()));
        let lookup = lookup(source.clone(), generator.clone());

        let err = lookup.lookup("grep").await.unwrap_err();
        assert!(matches!(err, StudyError::ManPageService { .. }));
        assert!(err.is_retryable());

        assert!(!lookup.lookup("grep").await.unwrap().from_cache);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_local_source_without_page() {
        let config = ManPageConfig {
            online_fallback: false,
            ..ManPageConfig::default()
        };
        let source = SystemManSource::new(&config);
        assert!(source.fetch("study-reader-no-such-command").await.is_none());
    }
}
