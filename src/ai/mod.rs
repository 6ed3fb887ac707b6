use async_trait::async_trait;

use crate::error::ServiceError;
use crate::parser::ExtractedImage;

// 子模块声明
pub mod gemini;
pub mod prompts;

pub use gemini::GeminiClient;

/// 单次生成调用的参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl GenerationOptions {
    pub fn new(temperature: f32, max_output_tokens: u32) -> Self {
        Self {
            temperature,
            max_output_tokens,
        }
    }
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self::new(0.3, 65_536)
    }
}

/// 文本生成协作方
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// 生成文本
    ///
    /// # 参数
    /// - `prompt`: 指令部分
    /// - `content`: 需要处理的正文
    /// - `options`: 温度与输出上限
    async fn generate(
        &self,
        prompt: &str,
        content: &str,
        options: &GenerationOptions,
    ) -> Result<String, ServiceError>;
}

/// 视觉描述协作方
#[async_trait]
pub trait VisionDescriber: Send + Sync {
    /// 描述一张图片或表格
    ///
    /// # 参数
    /// - `image`: 图片（含原始字节与 MIME 类型）
    /// - `instruction`: 描述指令
    async fn describe(&self, image: &ExtractedImage, instruction: &str) -> Result<String, ServiceError>;
}
