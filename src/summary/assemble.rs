use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

use super::types::{ContentBlock, FailedSection, PositionAnchor};
use crate::chunker::TextSection;
use crate::parser::{ChapterText, ExtractedImage};

static SECTION_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"<!--\s*section:(\d+)\s*-->").unwrap());

/// 带分段标记的摘要
pub fn mark_section(index: usize, summary: &str) -> String {
    format!("<!-- section:{} -->\n{}", index, summary.trim())
}

/// 按分段标记切分合并后的文本
///
/// 第一个标记之前的文字归入第一个出现的分段；同一分段出现多次时按出现顺序拼接。
/// 没有任何标记时返回 None
pub fn split_by_markers(text: &str) -> Option<BTreeMap<usize, String>> {
    let markers: Vec<(usize, usize, usize)> = SECTION_MARKER
        .captures_iter(text)
        .filter_map(|cap| {
            let whole = cap.get(0)?;
            let index = cap.get(1)?.as_str().parse::<usize>().ok()?;
            Some((index, whole.start(), whole.end()))
        })
        .collect();
    if markers.is_empty() {
        return None;
    }

    let mut parts: BTreeMap<usize, String> = BTreeMap::new();
    let preamble = text[..markers[0].1].trim();
    for (k, &(index, _, body_start)) in markers.iter().enumerate() {
        let body_end = markers.get(k + 1).map(|m| m.1).unwrap_or(text.len());
        let mut body = text[body_start..body_end].trim().to_string();
        if k == 0 && !preamble.is_empty() {
            body = format!("{}\n\n{}", preamble, body);
        }
        if body.is_empty() {
            continue;
        }
        let entry = parts.entry(index).or_default();
        if !entry.is_empty() {
            entry.push_str("\n\n");
        }
        entry.push_str(&body);
    }
    Some(parts)
}

/// 按 `## ` 标题切分文本，第一个标题之前的文字单独成块
pub fn split_by_headings(text: &str) -> Vec<String> {
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line.starts_with("## ") && !current.trim().is_empty() {
            chunks.push(current.trim().to_string());
            current.clear();
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        chunks.push(current.trim().to_string());
    }
    chunks
}

/// 章节内段落序号对应的位置锚点（页码 + 页内段落序号）
pub fn anchor_for(text: &ChapterText, paragraph: usize) -> Option<PositionAnchor> {
    let page = text.paragraphs.get(paragraph)?.page;
    let first = text.first_paragraph_on_page(page)?;
    Some(PositionAnchor {
        page,
        paragraph: Some(paragraph - first),
    })
}

/// 图片所在的章节段落序号
///
/// 页内段落序号超出该页段落数时取该页最后一段；图片所在页没有文字时取之前最近的段落
pub fn image_paragraph(text: &ChapterText, image: &ExtractedImage) -> Option<usize> {
    match text.first_paragraph_on_page(image.page) {
        Some(first) => {
            let last = text
                .paragraphs
                .iter()
                .rposition(|p| p.page == image.page)
                .unwrap_or(first);
            Some((first + image.paragraph.unwrap_or(0)).min(last))
        }
        None => text.paragraphs.iter().rposition(|p| p.page <= image.page),
    }
}

/// 图片归属的分段序号
pub fn owning_section(sections: &[TextSection], text: &ChapterText, image: &ExtractedImage) -> usize {
    let by_paragraph = image_paragraph(text, image)
        .and_then(|p| sections.iter().find(|s| s.contains_paragraph(p)));
    let by_page = || {
        sections
            .iter()
            .find(|s| image.page >= s.start_page && image.page <= s.end_page)
    };
    by_paragraph
        .or_else(by_page)
        .map(|s| s.index)
        .unwrap_or_else(|| sections.len().saturating_sub(1))
}

/// 已确定位置的图片块
#[derive(Debug, Clone)]
pub struct PlacedImage {
    pub owner: usize,
    pub page: u32,
    pub block: ContentBlock,
}

/// 章节的页码范围
#[derive(Debug, Clone, Copy)]
pub struct PageSpan {
    pub start: u32,
    pub end: u32,
}

impl PageSpan {
    fn pages(&self) -> u32 {
        self.end.saturating_sub(self.start) + 1
    }

    /// 页码在 `slots` 个等分位置中的序号
    fn slot(&self, page: u32, slots: usize) -> usize {
        if slots == 0 {
            return 0;
        }
        let offset = page.saturating_sub(self.start).min(self.pages() - 1) as usize;
        (offset * slots / self.pages() as usize).min(slots - 1)
    }
}

/// 把合并结果、失败分段和图片组装为按章节顺序排列的内容块
///
/// 有分段标记时严格按分段顺序输出，每个分段的图片紧跟在该分段文字之后；
/// 没有标记时按 `## ` 标题切分，图片与失败分段按页码比例插入
///
/// # 参数
/// - `merged`: 合并（或直接生成）得到的文本
/// - `sections`: 章节分段
/// - `failed`: 失败的分段
/// - `images`: 已描述的图片
/// - `span`: 章节页码范围
/// - `text`: 章节正文
pub fn assemble_blocks(
    merged: &str,
    sections: &[TextSection],
    failed: &[FailedSection],
    mut images: Vec<PlacedImage>,
    span: PageSpan,
    text: &ChapterText,
) -> Vec<ContentBlock> {
    images.sort_by_key(|img| img.page);
    let gap = |f: &FailedSection| ContentBlock::Gap {
        section_index: f.section_index,
        start_page: f.start_page,
        end_page: f.end_page,
        reason: f.reason.clone(),
    };

    if let Some(parts) = split_by_markers(merged) {
        let mut blocks = Vec::new();
        for section in sections {
            if let Some(f) = failed.iter().find(|f| f.section_index == section.index) {
                blocks.push(gap(f));
            } else if let Some(body) = parts.get(&section.index) {
                blocks.push(ContentBlock::Text {
                    text: body.clone(),
                    anchor: anchor_for(text, section.start_paragraph),
                });
            }
            blocks.extend(
                images
                    .iter()
                    .filter(|img| img.owner == section.index)
                    .map(|img| img.block.clone()),
            );
        }
        return blocks;
    }

    // 没有标记：按标题比例放置
    let chunks = split_by_headings(merged);
    let mut pending: Vec<(u32, ContentBlock)> = failed
        .iter()
        .map(|f| (f.start_page, gap(f)))
        .chain(images.into_iter().map(|img| (img.page, img.block)))
        .collect();
    pending.sort_by_key(|(page, _)| *page);

    let mut blocks = Vec::new();
    let slots = chunks.len();
    for (k, chunk) in chunks.into_iter().enumerate() {
        let page = span.start + (k as u32 * span.pages()) / slots as u32;
        blocks.push(ContentBlock::Text {
            text: chunk,
            anchor: Some(PositionAnchor { page, paragraph: None }),
        });
        blocks.extend(
            pending
                .iter()
                .filter(|(page, _)| span.slot(*page, slots) == k)
                .map(|(_, block)| block.clone()),
        );
    }
    if slots == 0 {
        blocks.extend(pending.into_iter().map(|(_, block)| block));
    }
    blocks
}
