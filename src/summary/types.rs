use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::depth::DepthTier;
use crate::parser::FigureKind;

/// 内容在章节中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionAnchor {
    pub page: u32,
    /// 页内段落序号（未知时为 None）
    pub paragraph: Option<usize>,
}

/// 摘要中的内容块
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
        anchor: Option<PositionAnchor>,
    },
    Image {
        caption: String,
        /// 视觉服务给出的描述；描述失败时为空
        description: String,
        anchor: PositionAnchor,
        kind: FigureKind,
        /// 图片字节的 SHA256，用于定位原图
        image_hash: String,
    },
    /// 生成失败的分段占位
    Gap {
        section_index: usize,
        start_page: u32,
        end_page: u32,
        reason: String,
    },
}

impl ContentBlock {
    pub fn is_gap(&self) -> bool {
        matches!(self, Self::Gap { .. })
    }
}

/// 摘要请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRequest {
    pub document_id: String,
    pub chapter_index: usize,
    pub depth: DepthTier,
    pub instructions: Option<String>,
    pub vision_enabled: bool,
    pub force_regenerate: bool,
}

impl SummaryRequest {
    pub fn new(document_id: impl Into<String>, chapter_index: usize, depth: DepthTier) -> Self {
        Self {
            document_id: document_id.into(),
            chapter_index,
            depth,
            instructions: None,
            vision_enabled: false,
            force_regenerate: false,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_vision(mut self, enabled: bool) -> Self {
        self.vision_enabled = enabled;
        self
    }

    pub fn forced(mut self) -> Self {
        self.force_regenerate = true;
        self
    }

    /// 空白指令视为没有指令
    pub fn normalized_instructions(&self) -> Option<&str> {
        self.instructions.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

/// 摘要记录
///
/// 一经创建不再修改；重新生成会创建新的记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub record_id: String,
    pub fingerprint: String,
    pub document_id: String,
    pub chapter_index: usize,
    pub chapter_title: String,
    pub depth: DepthTier,
    pub instructions: Option<String>,
    pub vision_enabled: bool,
    pub blocks: Vec<ContentBlock>,
    pub category_tags: Vec<String>,
    /// 同一指纹的第几次生成（从 1 开始）
    pub generation: u32,
    /// 合并层数：0 = 直接生成，1 = 单次合并，2 = 分批合并后再合并
    pub merge_tiers: u32,
    pub created_at: DateTime<Utc>,
}

impl SummaryRecord {
    /// 把所有文本块拼接为 Markdown
    pub fn markdown(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text, .. } => Some(text.clone()),
                ContentBlock::Image { caption, description, .. } => {
                    Some(format!("> **{}**\n>\n> {}", caption, description))
                }
                ContentBlock::Gap { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn meta(&self, is_current: bool) -> SummaryMeta {
        SummaryMeta {
            record_id: self.record_id.clone(),
            fingerprint: self.fingerprint.clone(),
            chapter_index: self.chapter_index,
            chapter_title: self.chapter_title.clone(),
            depth: self.depth,
            instructions: self.instructions.clone(),
            vision_enabled: self.vision_enabled,
            generation: self.generation,
            created_at: self.created_at,
            is_current,
        }
    }
}

/// 已缓存摘要的列表项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryMeta {
    pub record_id: String,
    pub fingerprint: String,
    pub chapter_index: usize,
    pub chapter_title: String,
    pub depth: DepthTier,
    pub instructions: Option<String>,
    pub vision_enabled: bool,
    pub generation: u32,
    pub created_at: DateTime<Utc>,
    /// 是否为该指纹当前使用的记录
    pub is_current: bool,
}

/// 失败分段的说明
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedSection {
    pub section_index: usize,
    pub start_page: u32,
    pub end_page: u32,
    pub attempts: u32,
    pub reason: String,
    /// 失败能否在本次会话内重试
    pub retryable: bool,
}

/// 部分失败报告
///
/// 带有该报告的结果不会写入缓存，下次请求会重新生成
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialFailureReport {
    pub failed_sections: Vec<FailedSection>,
    pub total_sections: usize,
    /// 合并调用是否失败（失败时按顺序拼接分段摘要）
    pub merge_failed: bool,
}

impl PartialFailureReport {
    pub fn is_empty(&self) -> bool {
        self.failed_sections.is_empty() && !self.merge_failed
    }
}

/// 摘要请求的返回值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryResponse {
    pub record: SummaryRecord,
    pub from_cache: bool,
    pub warnings: Vec<String>,
    pub failure: Option<PartialFailureReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_block_serializes_with_type_tag() {
        let block = ContentBlock::Gap {
            section_index: 2,
            start_page: 10,
            end_page: 14,
            reason: "调用超时".to_string(),
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "gap");
        assert_eq!(json["section_index"], 2);
        assert!(block.is_gap());
    }

    #[test]
    fn test_request_normalizes_blank_instructions() {
        let request = SummaryRequest::new("doc", 0, DepthTier::Brief).with_instructions("   ");
        assert_eq!(request.normalized_instructions(), None);

        let request = request.with_instructions(" focus on flags ");
        assert_eq!(request.normalized_instructions(), Some("focus on flags"));
    }
}
