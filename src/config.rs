use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, StudyError};

/// 核心配置
///
/// 所有字段都有默认值，TOML 文件中只需写出要覆盖的部分
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StudyConfig {
    /// 单个分段正文的最大字符数（受生成服务输入上限约束）
    pub section_char_budget: usize,
    /// 章节总长度不超过此值时直接单次生成，不做合并
    pub direct_threshold_chars: usize,
    /// 单次合并调用可接受的最大输入字符数
    pub merge_char_budget: usize,
    /// 同时进行的外部调用上限
    pub max_concurrent_calls: usize,
    /// 单次外部调用超时（秒）
    pub call_timeout_secs: u64,
    /// 单次调用的最大尝试次数（含首次）
    pub max_attempts: u32,
    /// 重试退避的基础延迟（毫秒），每次翻倍
    pub retry_base_delay_ms: u64,
    /// 启发式章节边界的置信度阈值
    pub confidence_threshold: f32,
    /// 大纲解析的最大层级（1 = 只有章，2 = 章 + 节）
    pub max_outline_depth: u32,
    /// 问答时送入的章节文本上限
    pub qa_char_budget: usize,
    pub vision: VisionConfig,
    pub gemini: GeminiConfig,
    pub man_page: ManPageConfig,
}

/// 手册页查询配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManPageConfig {
    /// 本地 `man` 与在线查询各自的超时（秒）
    pub fetch_timeout_secs: u64,
    /// 在线手册页站点，请求 `{endpoint}/{命令}?f=t`
    pub online_endpoint: String,
    /// 为 false 时只查本地
    pub online_fallback: bool,
    /// 清理后手册页文本的上限
    pub max_chars: usize,
}

/// 图片提取与描述配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    /// 每章最多描述的图片数
    pub max_images: usize,
    /// 小于该尺寸（像素）的图片视为图标，跳过
    pub min_image_size: u32,
}

/// Gemini 服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    pub model: String,
    pub endpoint: String,
    /// 读取 API Key 的环境变量名
    pub api_key_env: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            section_char_budget: 12_000,
            direct_threshold_chars: 12_000,
            merge_char_budget: 60_000,
            max_concurrent_calls: 4,
            call_timeout_secs: 120,
            max_attempts: 3,
            retry_base_delay_ms: 2_000,
            confidence_threshold: 0.7,
            max_outline_depth: 2,
            qa_char_budget: 30_000,
            vision: VisionConfig::default(),
            gemini: GeminiConfig::default(),
            man_page: ManPageConfig::default(),
        }
    }
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            max_images: 15,
            min_image_size: 100,
        }
    }
}

impl Default for ManPageConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: 10,
            online_endpoint: "https://man.cx".to_string(),
            online_fallback: true,
            max_chars: 15_000,
        }
    }
}

impl ManPageConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-flash".to_string(),
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            temperature: 0.3,
            max_output_tokens: 65_536,
        }
    }
}

impl StudyConfig {
    /// 从 TOML 字符串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| StudyError::Config(format!("TOML 解析失败: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载配置
    ///
    /// # 参数
    /// - `path`: TOML 配置文件路径
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            StudyError::Config(format!("读取配置文件失败 {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// 检查配置取值是否自洽
    pub fn validate(&self) -> Result<()> {
        if self.section_char_budget == 0 {
            return Err(StudyError::Config("section_char_budget 必须大于 0".to_string()));
        }
        if self.merge_char_budget < self.section_char_budget {
            return Err(StudyError::Config(
                "merge_char_budget 不能小于 section_char_budget".to_string(),
            ));
        }
        if self.max_concurrent_calls == 0 || self.max_attempts == 0 {
            return Err(StudyError::Config(
                "max_concurrent_calls 与 max_attempts 必须大于 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(StudyError::Config("confidence_threshold 必须在 0 到 1 之间".to_string()));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}
