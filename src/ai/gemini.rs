use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde_json::{json, Value};
use std::env;
use std::time::Duration;
use tracing::debug;

use super::{GenerationOptions, TextGenerator, VisionDescriber};
use crate::config::{GeminiConfig, StudyConfig};
use crate::error::{Result, ServiceError, StudyError};
use crate::parser::ExtractedImage;

/// 视觉描述调用的参数
const VISION_OPTIONS: GenerationOptions = GenerationOptions {
    temperature: 0.2,
    max_output_tokens: 1024,
};

/// Gemini HTTP 客户端
///
/// 同时实现文本生成与视觉描述
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http_client: reqwest::Client,
    config: GeminiConfig,
    api_key: String,
    timeout_secs: u64,
}

impl GeminiClient {
    /// 按配置创建客户端，API Key 从配置指定的环境变量读取
    pub fn from_config(config: &StudyConfig) -> Result<Self> {
        let api_key = env::var(&config.gemini.api_key_env).map_err(|_| {
            StudyError::Config(format!("环境变量 {} 未设置", config.gemini.api_key_env))
        })?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &StudyConfig, api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(StudyError::Config("Gemini API Key 为空".to_string()));
        }
        // 外层还有 tokio 超时，这里多留一点余量
        let http_client = reqwest::Client::builder()
            .timeout(config.call_timeout() + Duration::from_secs(5))
            .build()
            .map_err(|e| StudyError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            http_client,
            config: config.gemini.clone(),
            api_key,
            timeout_secs: config.call_timeout_secs,
        })
    }

    fn url(&self) -> String {
        format!(
            "{}/models/{}:generateContent?key={}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model,
            self.api_key
        )
    }

    async fn send(&self, body: Value) -> std::result::Result<String, ServiceError> {
        let response = self
            .http_client
            .post(self.url())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ServiceError::Timeout(self.timeout_secs)
                } else {
                    ServiceError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        if status.as_u16() == 429 {
            return Err(ServiceError::RateLimited(truncate(&text, 200)));
        }
        if !status.is_success() {
            return Err(ServiceError::Http {
                status: status.as_u16(),
                body: truncate(&text, 500),
            });
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| ServiceError::Transport(format!("响应不是合法 JSON: {}", e)))?;
        parse_response(&value)
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate(
        &self,
        prompt: &str,
        content: &str,
        options: &GenerationOptions,
    ) -> std::result::Result<String, ServiceError> {
        debug!(
            "Gemini 生成请求: 模型 {}，正文 {} 字符",
            self.config.model,
            content.chars().count()
        );
        self.send(text_request(prompt, content, options)).await
    }
}

#[async_trait]
impl VisionDescriber for GeminiClient {
    async fn describe(
        &self,
        image: &ExtractedImage,
        instruction: &str,
    ) -> std::result::Result<String, ServiceError> {
        debug!("Gemini 视觉请求: 第 {} 页 {}", image.page, image.label);
        self.send(vision_request(image, instruction, &VISION_OPTIONS)).await
    }
}

fn generation_config(options: &GenerationOptions) -> Value {
    json!({
        "temperature": options.temperature,
        "maxOutputTokens": options.max_output_tokens,
    })
}

/// 构建文本生成请求体
pub fn text_request(prompt: &str, content: &str, options: &GenerationOptions) -> Value {
    json!({
        "contents": [{
            "role": "user",
            "parts": [{ "text": format!("{}\n\n{}", prompt, content) }],
        }],
        "generationConfig": generation_config(options),
    })
}

/// 构建视觉请求体，图片以 base64 内联
pub fn vision_request(image: &ExtractedImage, instruction: &str, options: &GenerationOptions) -> Value {
    json!({
        "contents": [{
            "role": "user",
            "parts": [
                { "text": instruction },
                {
                    "inline_data": {
                        "mime_type": image.mime_type,
                        "data": general_purpose::STANDARD.encode(&image.bytes),
                    }
                },
            ],
        }],
        "generationConfig": generation_config(options),
    })
}

/// 从响应中取出第一个候选的全部文本
pub fn parse_response(value: &Value) -> std::result::Result<String, ServiceError> {
    if let Some(reason) = value["promptFeedback"]["blockReason"].as_str() {
        return Err(ServiceError::Rejected(format!("提示被拦截: {}", reason)));
    }

    let text = value["candidates"][0]["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(ServiceError::EmptyResponse);
    }
    Ok(text)
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::FigureKind;

    #[test]
    fn test_text_request_shape() {
        let body = text_request("Summarize", "chapter text", &GenerationOptions::new(0.1, 2048));
        assert_eq!(body["contents"][0]["parts"][0]["text"], "Summarize\n\nchapter text");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 2048);
    }

    #[test]
    fn test_vision_request_inlines_base64() {
        let image = ExtractedImage {
            page: 4,
            paragraph: Some(1),
            kind: FigureKind::Image,
            label: "Figure 2".to_string(),
            mime_type: "image/jpeg".to_string(),
            width: 640,
            height: 480,
            bytes: b"jpeg".to_vec(),
            text: None,
        };
        let body = vision_request(&image, "Describe this image:", &VISION_OPTIONS);
        let inline = &body["contents"][0]["parts"][1]["inline_data"];
        assert_eq!(inline["mime_type"], "image/jpeg");
        assert_eq!(inline["data"], "anBlZw==");
    }

    #[test]
    fn test_parse_response_joins_parts() {
        let value = json!({
            "candidates": [{ "content": { "parts": [{ "text": "## [CMD] ls\n" }, { "text": "- lists files" }] } }]
        });
        assert_eq!(parse_response(&value).unwrap(), "## [CMD] ls\n- lists files");
    }

    #[test]
    fn test_parse_response_errors() {
        assert_eq!(parse_response(&json!({ "candidates": [] })), Err(ServiceError::EmptyResponse));

        let blocked = json!({ "promptFeedback": { "blockReason": "SAFETY" } });
        assert!(matches!(parse_response(&blocked), Err(ServiceError::Rejected(_))));
    }

    #[test]
    fn test_empty_api_key_rejected() {
        let result = GeminiClient::with_api_key(&StudyConfig::default(), "  ");
        assert!(matches!(result, Err(StudyError::Config(_))));
    }
}
