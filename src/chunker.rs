use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::error::StudyError;
use crate::parser::ChapterText;

/// 段落之间的分隔符
const PARAGRAPH_SEPARATOR: &str = "\n\n";

/// 分段结果中的一段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSection {
    pub index: usize,
    /// 上下文行（章节标题 › 最近的小标题），不计入正文
    pub context: String,
    pub body: String,
    /// 覆盖的段落范围（章节内序号，含两端）
    pub start_paragraph: usize,
    pub end_paragraph: usize,
    pub start_page: u32,
    pub end_page: u32,
}

impl TextSection {
    pub fn char_count(&self) -> usize {
        self.body.chars().count()
    }

    pub fn contains_paragraph(&self, paragraph: usize) -> bool {
        paragraph >= self.start_paragraph && paragraph <= self.end_paragraph
    }
}

/// 单个句子超过分段上限，无法切分
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("章节 {chapter_index} 第 {paragraph_index} 段含有长度 {length} 的句子，超过分段上限 {budget}")]
pub struct ChunkingError {
    pub chapter_index: usize,
    pub paragraph_index: usize,
    pub length: usize,
    pub budget: usize,
}

impl From<ChunkingError> for StudyError {
    fn from(e: ChunkingError) -> Self {
        StudyError::Chunking {
            chapter_index: e.chapter_index,
            paragraph_index: e.paragraph_index,
            length: e.length,
            budget: e.budget,
        }
    }
}

/// 分段的最小单位：一个完整段落，或超长段落中的一组句子
struct Unit {
    text: String,
    paragraph: usize,
    page: u32,
    is_heading: bool,
}

impl Unit {
    fn len(&self) -> usize {
        self.text.chars().count()
    }
}

/// 把章节正文切分为不超过上限的分段
///
/// 只在段落边界处切分；单个段落超过上限时在句子边界处切分。
/// 分段末尾的标题移到下一段开头
///
/// # 参数
/// - `chapter_index`: 章节索引（用于错误信息）
/// - `chapter_title`: 章节标题（用于上下文行）
/// - `text`: 章节正文
/// - `budget`: 每段正文的最大字符数
///
/// # 返回
/// 按顺序排列的分段；单个句子超过上限时返回错误
pub fn chunk_chapter(
    chapter_index: usize,
    chapter_title: &str,
    text: &ChapterText,
    budget: usize,
) -> Result<Vec<TextSection>, ChunkingError> {
    let units = build_units(chapter_index, text, budget)?;

    let mut groups: Vec<Vec<Unit>> = Vec::new();
    let mut current: Vec<Unit> = Vec::new();
    let mut current_len = 0;

    for unit in units {
        let added = if current.is_empty() {
            unit.len()
        } else {
            PARAGRAPH_SEPARATOR.len() + unit.len()
        };
        if !current.is_empty() && current_len + added > budget {
            let mut carried = Vec::new();
            if current.len() > 1 && current.last().map(|u| u.is_heading).unwrap_or(false) {
                carried.extend(current.pop());
            }
            groups.push(std::mem::take(&mut current));
            current = carried;
            current_len = group_len(&current);
            // 带过来的标题加上新单元可能超限，此时标题单独成段
            if !current.is_empty() && current_len + PARAGRAPH_SEPARATOR.len() + unit.len() > budget {
                groups.push(std::mem::take(&mut current));
                current_len = 0;
            }
        }
        current_len += if current.is_empty() {
            unit.len()
        } else {
            PARAGRAPH_SEPARATOR.len() + unit.len()
        };
        current.push(unit);
    }
    if !current.is_empty() {
        groups.push(current);
    }

    let sections: Vec<TextSection> = groups
        .into_iter()
        .enumerate()
        .map(|(index, group)| to_section(index, chapter_title, text, group))
        .collect();

    debug!(
        "章节 {} 分为 {} 段（上限 {} 字符）",
        chapter_index,
        sections.len(),
        budget
    );
    Ok(sections)
}

fn group_len(units: &[Unit]) -> usize {
    let text: usize = units.iter().map(|u| u.len()).sum();
    text + PARAGRAPH_SEPARATOR.len() * units.len().saturating_sub(1)
}

fn build_units(chapter_index: usize, text: &ChapterText, budget: usize) -> Result<Vec<Unit>, ChunkingError> {
    let mut units = Vec::new();
    for (i, paragraph) in text.paragraphs.iter().enumerate() {
        let length = paragraph.text.chars().count();
        if length <= budget {
            units.push(Unit {
                text: paragraph.text.clone(),
                paragraph: i,
                page: paragraph.page,
                is_heading: paragraph.is_heading,
            });
            continue;
        }

        // 超长段落：按句子打包
        let mut piece = String::new();
        for sentence in split_sentences(&paragraph.text) {
            let sentence_len = sentence.chars().count();
            if sentence_len > budget {
                return Err(ChunkingError {
                    chapter_index,
                    paragraph_index: i,
                    length: sentence_len,
                    budget,
                });
            }
            let piece_len = piece.chars().count();
            if !piece.is_empty() && piece_len + 1 + sentence_len > budget {
                units.push(Unit {
                    text: std::mem::take(&mut piece),
                    paragraph: i,
                    page: paragraph.page,
                    is_heading: false,
                });
            }
            if !piece.is_empty() {
                piece.push(' ');
            }
            piece.push_str(sentence);
        }
        if !piece.is_empty() {
            units.push(Unit {
                text: piece,
                paragraph: i,
                page: paragraph.page,
                is_heading: false,
            });
        }
    }
    Ok(units)
}

/// 按句末标点切分句子，返回去掉首尾空白的句子
///
/// 中文句号等全角标点直接结束句子；半角标点后面必须是空白或文本结尾
pub fn split_sentences(text: &str) -> Vec<&str> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut sentences = Vec::new();
    let mut start = 0;

    for (k, &(i, c)) in chars.iter().enumerate() {
        let is_end = match c {
            '。' | '！' | '？' | '；' => true,
            '.' | '!' | '?' => chars.get(k + 1).map(|(_, next)| next.is_whitespace()).unwrap_or(true),
            _ => false,
        };
        if is_end {
            let end = i + c.len_utf8();
            sentences.push(&text[start..end]);
            start = end;
        }
    }
    if start < text.len() {
        sentences.push(&text[start..]);
    }

    sentences
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn to_section(index: usize, chapter_title: &str, text: &ChapterText, group: Vec<Unit>) -> TextSection {
    let start_paragraph = group.first().map(|u| u.paragraph).unwrap_or(0);
    let end_paragraph = group.last().map(|u| u.paragraph).unwrap_or(start_paragraph);
    let start_page = group.first().map(|u| u.page).unwrap_or(0);
    let end_page = group.last().map(|u| u.page).unwrap_or(start_page);

    let heading = text.paragraphs[..=start_paragraph.min(text.paragraphs.len().saturating_sub(1))]
        .iter()
        .rev()
        .find(|p| p.is_heading)
        .map(|p| p.text.as_str());
    let context = match heading {
        Some(h) if h != chapter_title => format!("{} › {}", chapter_title, h),
        _ => chapter_title.to_string(),
    };

    let body = group
        .iter()
        .map(|u| u.text.as_str())
        .collect::<Vec<_>>()
        .join(PARAGRAPH_SEPARATOR);

    TextSection {
        index,
        context,
        body,
        start_paragraph,
        end_paragraph,
        start_page,
        end_page,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Paragraph;

    fn paragraph(text: &str, page: u32, is_heading: bool) -> Paragraph {
        Paragraph {
            text: text.to_string(),
            page,
            is_heading,
        }
    }

    fn normalize(text: &str) -> String {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn assert_coverage(text: &ChapterText, sections: &[TextSection], budget: usize) {
        let joined = sections.iter().map(|s| s.body.as_str()).collect::<Vec<_>>().join(" ");
        assert_eq!(normalize(&joined), normalize(&text.text()));
        assert!(sections.iter().all(|s| s.char_count() <= budget));
        for (i, s) in sections.iter().enumerate() {
            assert_eq!(s.index, i);
        }
    }

    #[test]
    fn test_short_chapter_is_one_section() {
        let text = ChapterText {
            paragraphs: vec![paragraph("Pipes", 1, true), paragraph("A pipe connects two commands.", 1, false)],
        };
        let sections = chunk_chapter(0, "Chapter 6", &text, 1000).unwrap();

        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].context, "Chapter 6 › Pipes");
        assert_coverage(&text, &sections, 1000);
    }

    #[test]
    fn test_long_chapter_splits_at_paragraphs() {
        let paragraphs: Vec<Paragraph> = (0..40)
            .map(|i| paragraph(&format!("Paragraph {} talks about redirection and pipes in the shell.", i), 1 + i / 4, false))
            .collect();
        let text = ChapterText { paragraphs };
        let sections = chunk_chapter(2, "Chapter 3", &text, 300).unwrap();

        assert!(sections.len() > 5);
        assert_coverage(&text, &sections, 300);
        for pair in sections.windows(2) {
            assert_eq!(pair[0].end_paragraph + 1, pair[1].start_paragraph);
        }
        assert_eq!(sections.last().unwrap().end_page, 10);
    }

    #[test]
    fn test_oversized_paragraph_splits_at_sentences() {
        let long = "The shell expands wildcards before running a command. ".repeat(20);
        let text = ChapterText {
            paragraphs: vec![paragraph("Intro.", 1, false), paragraph(long.trim(), 1, false)],
        };
        let sections = chunk_chapter(0, "Chapter 1", &text, 200).unwrap();

        assert!(sections.len() > 1);
        assert_coverage(&text, &sections, 200);
        assert!(sections.iter().skip(1).all(|s| s.start_paragraph == 1));
    }

    #[test]
    fn test_sentence_longer_than_budget_is_error() {
        let text = ChapterText {
            paragraphs: vec![paragraph("ok", 1, false), paragraph(&"x".repeat(500), 2, false)],
        };
        let err = chunk_chapter(4, "Chapter 5", &text, 100).unwrap_err();
        assert_eq!(
            err,
            ChunkingError {
                chapter_index: 4,
                paragraph_index: 1,
                length: 500,
                budget: 100,
            }
        );
        assert!(matches!(StudyError::from(err), StudyError::Chunking { chapter_index: 4, .. }));
    }

    #[test]
    fn test_trailing_heading_moves_to_next_section() {
        let body = "b".repeat(80);
        let text = ChapterText {
            paragraphs: vec![
                paragraph(&body, 1, false),
                paragraph("Next Topic", 1, true),
                paragraph(&body, 2, false),
            ],
        };
        let sections = chunk_chapter(0, "Chapter 1", &text, 100).unwrap();

        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].end_paragraph, 0);
        assert!(sections[1].body.starts_with("Next Topic"));
        assert_eq!(sections[1].context, "Chapter 1 › Next Topic");
        assert_coverage(&text, &sections, 100);
    }

    #[test]
    fn test_empty_chapter_has_no_sections() {
        let sections = chunk_chapter(0, "Empty", &ChapterText::default(), 100).unwrap();
        assert!(sections.is_empty());
    }

    #[test]
    fn test_split_sentences() {
        let sentences = split_sentences("Run ls. Then run cd! Version 1.2 works?  第一句。第二句");
        assert_eq!(sentences, vec!["Run ls.", "Then run cd!", "Version 1.2 works?", "第一句。", "第二句"]);
    }
}
