use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

// 子模块声明
pub mod pdf_parser;
pub mod toc_resolver;
pub mod chapter_detector;

/// 文档解析器 trait
///
/// 文档解析协作方：把原始字节转换为页面文本、字体信息、大纲和图片
pub trait DocumentParser: Send + Sync {
    /// 解析文档
    ///
    /// # 参数
    /// - `bytes`: 文档原始字节
    ///
    /// # 返回
    /// 解析结果，失败时返回错误信息
    fn parse(&self, bytes: &[u8]) -> Result<ParsedDocument, String>;
}

/// 大纲（书签）条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineEntry {
    pub title: String,
    /// 目标页码（从 1 开始）
    pub page: u32,
    /// 嵌套层级（1 为顶层）
    pub level: u32,
}

/// 页面中的一行文本及其字体信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextLine {
    pub text: String,
    /// 字号；0 表示解析器未提供字体信息
    pub font_size: f32,
    pub is_bold: bool,
}

/// 单页内容
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageContent {
    /// 页码（从 1 开始）
    pub number: u32,
    /// 页面纯文本，段落之间以空行分隔
    pub text: String,
    pub lines: Vec<TextLine>,
}

/// 图片类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FigureKind {
    Image,
    Table,
}

/// 从文档中提取的图片或表格
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedImage {
    pub page: u32,
    /// 所在页内的段落序号（解析器无法给出时为 None）
    pub paragraph: Option<usize>,
    pub kind: FigureKind,
    pub label: String,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    #[serde(skip)]
    pub bytes: Vec<u8>,
    /// 表格的原始文本（可选，供视觉描述参考）
    pub text: Option<String>,
}

/// 解析结果
#[derive(Debug, Clone, Default)]
pub struct ParsedDocument {
    pub title: Option<String>,
    pub page_count: u32,
    pub pages: Vec<PageContent>,
    /// 结构化大纲；None 表示文档没有大纲
    pub outline: Option<Vec<OutlineEntry>>,
    pub images: Vec<ExtractedImage>,
}

/// 章节正文中的一个段落
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paragraph {
    pub text: String,
    pub page: u32,
    pub is_heading: bool,
}

/// 章节正文
///
/// 段落边界是显式的，分段器只在这些边界（或句子边界）处切分
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChapterText {
    pub paragraphs: Vec<Paragraph>,
}

impl ChapterText {
    /// 以空行连接所有段落
    pub fn text(&self) -> String {
        self.paragraphs
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn char_count(&self) -> usize {
        self.paragraphs.iter().map(|p| p.text.chars().count()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.paragraphs.is_empty()
    }

    /// 该页第一个段落在章节中的序号
    pub fn first_paragraph_on_page(&self, page: u32) -> Option<usize> {
        self.paragraphs.iter().position(|p| p.page == page)
    }
}

/// 分割文本为段落
///
/// 根据空行分割段落，段内的单个换行替换为空格
pub fn split_into_paragraphs(text: &str) -> Vec<String> {
    text.split("\n\n")
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.lines()
                .map(|l| l.trim())
                .filter(|l| !l.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|p| !p.is_empty())
        .collect()
}

/// 标题行的最大长度
pub(crate) const MAX_HEADING_CHARS: usize = 120;

/// 统计正文字号（出现次数最多的字号，只统计较长的行）
///
/// 没有字体信息时返回 None
pub fn body_font_size<'a, I>(lines: I) -> Option<f32>
where
    I: IntoIterator<Item = &'a TextLine>,
{
    let mut counts: HashMap<i32, usize> = HashMap::new();
    for line in lines {
        if line.font_size > 0.0 && line.text.trim().chars().count() > 10 {
            // 以 0.5 为粒度归并字号
            *counts.entry((line.font_size * 2.0).round() as i32).or_insert(0) += 1;
        }
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(size, _)| size as f32 / 2.0)
}

/// 判断一行是否为标题（字号明显大于正文，或加粗且略大）
pub fn is_heading_line(line: &TextLine, body_size: f32) -> bool {
    let len = line.text.trim().chars().count();
    if len == 0 || len >= MAX_HEADING_CHARS || line.font_size <= 0.0 {
        return false;
    }
    line.font_size > body_size + 1.0
        || (line.is_bold && line.font_size > body_size + 0.3)
        || line.font_size > body_size * 1.3
}

impl ParsedDocument {
    /// 是否含有可用的大纲
    pub fn has_outline(&self) -> bool {
        self.outline.as_ref().map(|o| !o.is_empty()).unwrap_or(false)
    }

    /// 获取指定页
    pub fn page(&self, number: u32) -> Option<&PageContent> {
        self.pages.iter().find(|p| p.number == number)
    }

    /// 提取页码范围内的章节正文
    ///
    /// # 参数
    /// - `start_page`: 起始页（含，从 1 开始）
    /// - `end_page`: 结束页（含）
    ///
    /// # 返回
    /// 按页序排列的段落，标题段落已标记
    pub fn chapter_text(&self, start_page: u32, end_page: u32) -> ChapterText {
        let pages: Vec<&PageContent> = self
            .pages
            .iter()
            .filter(|p| p.number >= start_page && p.number <= end_page)
            .collect();

        let heading_lines: HashSet<String> = match body_font_size(pages.iter().flat_map(|p| p.lines.iter())) {
            Some(body) => pages
                .iter()
                .flat_map(|p| p.lines.iter())
                .filter(|l| is_heading_line(l, body))
                .map(|l| l.text.trim().to_string())
                .collect(),
            None => HashSet::new(),
        };

        let mut paragraphs = Vec::new();
        for page in pages {
            for text in split_into_paragraphs(&page.text) {
                let is_heading = text.chars().count() < MAX_HEADING_CHARS
                    && (heading_lines.contains(&text) || chapter_detector::is_explicit_heading(&text));
                paragraphs.push(Paragraph {
                    text,
                    page: page.number,
                    is_heading,
                });
            }
        }

        ChapterText { paragraphs }
    }

    /// 获取页码范围内的图片
    pub fn images_in_range(&self, start_page: u32, end_page: u32, max_images: usize) -> Vec<&ExtractedImage> {
        self.images
            .iter()
            .filter(|img| img.page >= start_page && img.page <= end_page)
            .take(max_images)
            .collect()
    }
}
