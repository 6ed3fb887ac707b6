use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{body_font_size, PageContent, TextLine, MAX_HEADING_CHARS};
use crate::chapter_registry::{BoundarySource, Chapter};

/// 显式章节标记的置信度
const PATTERN_CONFIDENCE: f32 = 0.95;
/// 大字号编号标题的置信度
const NUMBERED_CONFIDENCE: f32 = 0.75;
/// 加粗标题的置信度
const BOLD_CONFIDENCE: f32 = 0.5;
/// 编号标题相对正文字号的最小倍数
const NUMBERED_FONT_RATIO: f32 = 1.3;
/// 每页只在前几行中寻找标题
const HEADING_SCAN_LINES: usize = 6;

/// 章级标记：Chapter N / Part N / 第N章 / 卷N
static CHAPTER_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"^(?i:chapter)\s+(\d+|[IVXLC]+)\b").unwrap(),
        Regex::new(r"^(?i:part)\s+(\d+|[IVXLC]+)\b").unwrap(),
        Regex::new(r"^第[零一二三四五六七八九十百千万\d]+[章篇部]").unwrap(),
        Regex::new(r"^卷\s*[零一二三四五六七八九十百千万\d]+").unwrap(),
    ]
});

/// 节级标记，只用于标记段落是否为标题
static SECTION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"^(?i:section|unit)\s+\d+").unwrap(),
        Regex::new(r"^第[零一二三四五六七八九十百千万\d]+节").unwrap(),
    ]
});

static NUMBERED_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{1,3}[.)]?\s+\w+").unwrap());

/// 小写罗马数字页码（前言部分的页码）
static ROMAN_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^l?x{0,3}(ix|iv|v?i{0,3})$").unwrap());

static FRONT_MATTER_TITLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?i:preface|foreword|contents|table of contents|acknowledg(e)?ments|dedication)$|^(前言|序言|序|目录|致谢)$")
        .unwrap()
});

/// 文本是否以章级标记开头
pub fn is_chapter_marker(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.chars().count() < MAX_HEADING_CHARS && CHAPTER_PATTERNS.iter().any(|p| p.is_match(trimmed))
}

/// 文本是否为显式的章/节标题
///
/// 用于在缺少字体信息时标记标题段落
pub fn is_explicit_heading(text: &str) -> bool {
    let trimmed = text.trim();
    is_chapter_marker(trimmed) || SECTION_PATTERNS.iter().any(|p| p.is_match(trimmed))
}

/// 章节边界信号
///
/// 按强度排序：显式标记 > 编号大标题 > 加粗标题
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    BoldHeading,
    NumberedHeading,
    Pattern,
}

impl Signal {
    pub fn confidence(self) -> f32 {
        match self {
            Self::Pattern => PATTERN_CONFIDENCE,
            Self::NumberedHeading => NUMBERED_CONFIDENCE,
            Self::BoldHeading => BOLD_CONFIDENCE,
        }
    }
}

/// 候选章节边界
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryCandidate {
    pub page: u32,
    pub title: String,
    pub confidence: f32,
    pub signal: Signal,
}

/// 检测结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionReport {
    /// 按页码排序的候选边界
    pub candidates: Vec<BoundaryCandidate>,
    /// 前言页（不参与章节编号）
    pub front_matter: Vec<u32>,
}

/// 启发式章节检测器
///
/// 没有可用大纲时，根据页面文本和字体信息给每页打分：
/// 1. 显式标记（Chapter N / Part N / 第N章）
/// 2. 字号至少为正文 1.3 倍的编号标题
/// 3. 比正文大的加粗标题
#[derive(Debug, Default)]
pub struct ChapterDetector;

impl ChapterDetector {
    pub fn new() -> Self {
        Self
    }

    /// 检测候选边界
    ///
    /// # 参数
    /// - `pages`: 按页序排列的页面内容
    ///
    /// # 返回
    /// 候选边界与前言页
    pub fn detect(&self, pages: &[PageContent]) -> DetectionReport {
        let body = body_font_size(pages.iter().flat_map(|p| p.lines.iter()));
        let first_pattern_page = pages
            .iter()
            .find(|p| heading_lines(p).iter().any(|l| is_chapter_marker(&l.text)))
            .map(|p| p.number);

        let mut report = DetectionReport::default();
        for page in pages {
            let lines = heading_lines(page);
            if is_front_matter(&lines, page.number, first_pattern_page) {
                report.front_matter.push(page.number);
                continue;
            }
            if let Some(candidate) = score_page(page.number, &lines, body) {
                report.candidates.push(candidate);
            }
        }

        report.candidates = filter_candidates(report.candidates);
        debug!(
            "启发式检测: {} 个候选边界, {} 个前言页",
            report.candidates.len(),
            report.front_matter.len()
        );
        report
    }
}

/// 页面顶部的非空行；没有字体信息时退回到纯文本行
fn heading_lines(page: &PageContent) -> Vec<TextLine> {
    let lines: Vec<TextLine> = if page.lines.is_empty() {
        page.text
            .lines()
            .map(|text| TextLine {
                text: text.to_string(),
                font_size: 0.0,
                is_bold: false,
            })
            .collect()
    } else {
        page.lines.clone()
    };

    lines
        .into_iter()
        .filter(|l| !l.text.trim().is_empty())
        .take(HEADING_SCAN_LINES)
        .collect()
}

fn is_front_matter(lines: &[TextLine], page: u32, first_pattern_page: Option<u32>) -> bool {
    let first = lines.first().map(|l| l.text.trim()).unwrap_or("");
    if !first.is_empty() && ROMAN_LABEL.is_match(first) {
        return true;
    }
    let before_first_chapter = first_pattern_page.map(|p| page < p).unwrap_or(true);
    before_first_chapter && FRONT_MATTER_TITLE.is_match(first)
}

/// 给单页打分，多个信号同时出现时取最强者
fn score_page(page: u32, lines: &[TextLine], body: Option<f32>) -> Option<BoundaryCandidate> {
    let mut best: Option<(Signal, usize)> = None;

    for (i, line) in lines.iter().enumerate() {
        let text = line.text.trim();
        if text.chars().count() >= MAX_HEADING_CHARS {
            continue;
        }

        let signal = if is_chapter_marker(text) {
            Some(Signal::Pattern)
        } else if let Some(body) = body {
            if line.font_size >= body * NUMBERED_FONT_RATIO && NUMBERED_HEADING.is_match(text) {
                Some(Signal::NumberedHeading)
            } else if line.is_bold && line.font_size > body {
                Some(Signal::BoldHeading)
            } else {
                None
            }
        } else {
            None
        };

        if let Some(signal) = signal {
            if best.map(|(s, _)| signal > s).unwrap_or(true) {
                best = Some((signal, i));
            }
        }
    }

    best.map(|(signal, i)| BoundaryCandidate {
        page,
        title: candidate_title(lines, i, signal, body),
        confidence: signal.confidence(),
        signal,
    })
}

/// 只有标记的标题行（如 "Chapter 3"）与下一行大字号短标题合并
fn candidate_title(lines: &[TextLine], i: usize, signal: Signal, body: Option<f32>) -> String {
    let text = lines[i].text.trim();
    if signal != Signal::Pattern || text.chars().count() > 12 {
        return text.to_string();
    }
    let (Some(body), Some(next)) = (body, lines.get(i + 1)) else {
        return text.to_string();
    };
    let next_text = next.text.trim();
    if next.font_size > body && next_text.chars().count() < 80 && !is_chapter_marker(next_text) {
        format!("{} {}", text, next_text)
    } else {
        text.to_string()
    }
}

/// 过滤候选边界
///
/// 至少出现在两页上的最强信号压制更弱的信号；连续相同标题（页眉）只保留第一个
fn filter_candidates(candidates: Vec<BoundaryCandidate>) -> Vec<BoundaryCandidate> {
    let dominant = [Signal::Pattern, Signal::NumberedHeading, Signal::BoldHeading]
        .into_iter()
        .find(|s| candidates.iter().filter(|c| c.signal == *s).count() >= 2);

    let mut kept: Vec<BoundaryCandidate> = Vec::new();
    for candidate in candidates {
        if let Some(dominant) = dominant {
            if candidate.signal < dominant {
                continue;
            }
        }
        if kept.last().map(|prev| prev.title == candidate.title).unwrap_or(false) {
            continue;
        }
        kept.push(candidate);
    }
    kept
}

/// 把候选边界转换为章节
///
/// 置信度低于阈值的章节标记为未确认，生成摘要前需要人工确认。
/// 没有任何候选时整本文档作为一个线性章节（置信度 0）
///
/// # 参数
/// - `report`: 检测结果
/// - `page_count`: 文档总页数
/// - `threshold`: 置信度阈值
pub fn candidates_to_chapters(report: &DetectionReport, page_count: u32, threshold: f32) -> Vec<Chapter> {
    // 前言之后的第一页
    let body_start = (1..=page_count)
        .find(|p| !report.front_matter.contains(p))
        .unwrap_or(1);

    let mut candidates: Vec<&BoundaryCandidate> = report
        .candidates
        .iter()
        .filter(|c| c.page >= 1 && c.page <= page_count)
        .collect();
    candidates.sort_by_key(|c| c.page);
    candidates.dedup_by_key(|c| c.page);

    if candidates.is_empty() {
        info!("未检测到章节边界，全文作为一章（需人工确认）");
        return vec![Chapter {
            index: 0,
            title: "全文".to_string(),
            start_page: body_start,
            end_page: page_count,
            sections: vec![],
            verified: false,
            confidence: 0.0,
            source: BoundarySource::Linear,
        }];
    }

    let mut chapters = Vec::with_capacity(candidates.len());
    for (i, candidate) in candidates.iter().enumerate() {
        // 第一章向前覆盖到前言之后的第一页
        let start_page = if i == 0 { candidate.page.min(body_start) } else { candidate.page };
        let end_page = candidates
            .get(i + 1)
            .map(|next| next.page - 1)
            .unwrap_or(page_count);

        chapters.push(Chapter {
            index: i,
            title: candidate.title.clone(),
            start_page,
            end_page,
            sections: vec![],
            verified: candidate.confidence >= threshold,
            confidence: candidate.confidence,
            source: BoundarySource::Heuristic,
        });
    }

    info!("启发式检测得到 {} 个章节", chapters.len());
    chapters
}
