use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{BoundaryInvariant, BoundaryValidationError, Result, StudyError};

/// 章节边界来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundarySource {
    /// 来自文档大纲（书签）
    Outline,
    /// 来自启发式检测
    Heuristic,
    /// 未检测到任何章节，全文作为一章
    Linear,
}

/// 小节
///
/// 嵌套在章节内的页码子范围，结构与章节相同
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub title: String,
    pub start_page: u32,
    pub end_page: u32,
    pub sections: Vec<Section>,
    pub verified: bool,
}

/// 章节
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub index: usize,
    pub title: String,
    /// 起始页（含，从 1 开始）
    pub start_page: u32,
    /// 结束页（含）
    pub end_page: u32,
    pub sections: Vec<Section>,
    pub verified: bool,
    /// 边界置信度 0.0 ~ 1.0
    pub confidence: f32,
    pub source: BoundarySource,
}

impl Chapter {
    /// 是否必须先经过人工确认才能生成摘要
    pub fn requires_review(&self, threshold: f32) -> bool {
        !self.verified && self.confidence < threshold
    }

    pub fn page_count(&self) -> u32 {
        self.end_page.saturating_sub(self.start_page) + 1
    }
}

/// 章节注册表
///
/// 保存一个文档的规范章节列表，保证：
/// - 章节按起始页排序且互不重叠
/// - 最后一章结束于文档最后一页
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterRegistry {
    page_count: u32,
    chapters: Vec<Chapter>,
}

impl ChapterRegistry {
    /// 创建注册表并校验所有不变量
    ///
    /// # 参数
    /// - `page_count`: 文档总页数
    /// - `chapters`: 解析得到的章节（索引会被重新编号）
    pub fn new(page_count: u32, mut chapters: Vec<Chapter>) -> Result<Self> {
        for (i, chapter) in chapters.iter_mut().enumerate() {
            chapter.index = i;
        }
        check_all(&chapters, page_count)?;
        Ok(Self { page_count, chapters })
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn chapters(&self) -> &[Chapter] {
        &self.chapters
    }

    pub fn get(&self, index: usize) -> Result<&Chapter> {
        self.chapters.get(index).ok_or(StudyError::ChapterNotFound(index))
    }

    /// 更新章节边界
    ///
    /// 编辑违反排序或不重叠约束时拒绝，并返回违反的不变量与相邻章节；
    /// 拒绝时注册表保持不变。接受的编辑视为人工确认
    ///
    /// # 参数
    /// - `index`: 章节索引
    /// - `start_page`: 新起始页
    /// - `end_page`: 新结束页
    pub fn update_boundary(&mut self, index: usize, start_page: u32, end_page: u32) -> Result<()> {
        if index >= self.chapters.len() {
            return Err(StudyError::ChapterNotFound(index));
        }
        validate_edit(&self.chapters, self.page_count, index, start_page, end_page)?;

        let chapter = &mut self.chapters[index];
        chapter.start_page = start_page;
        chapter.end_page = end_page;
        chapter.sections = clamp_sections(&chapter.sections, start_page, end_page);
        chapter.verified = true;
        info!(
            "章节 {} 边界更新为 {}-{} 页（已确认）",
            index, start_page, end_page
        );
        Ok(())
    }

    /// 人工确认章节边界，不修改页码范围
    pub fn verify(&mut self, index: usize) -> Result<()> {
        let chapter = self
            .chapters
            .get_mut(index)
            .ok_or(StudyError::ChapterNotFound(index))?;
        chapter.verified = true;
        debug!("章节 {} 已人工确认", index);
        Ok(())
    }

    /// 需要人工确认的章节索引
    pub fn pending_review(&self, threshold: f32) -> Vec<usize> {
        self.chapters
            .iter()
            .filter(|c| c.requires_review(threshold))
            .map(|c| c.index)
            .collect()
    }
}

fn violation(
    chapter_index: usize,
    invariant: BoundaryInvariant,
    neighbors: Vec<usize>,
    message: String,
) -> BoundaryValidationError {
    BoundaryValidationError {
        chapter_index,
        invariant,
        neighbors,
        message,
    }
}

/// 校验单个章节的新边界
fn validate_edit(
    chapters: &[Chapter],
    page_count: u32,
    index: usize,
    start: u32,
    end: u32,
) -> std::result::Result<(), BoundaryValidationError> {
    if start == 0 || start > end || end > page_count {
        return Err(violation(
            index,
            BoundaryInvariant::PageRange,
            vec![],
            format!("页码范围 {}-{} 不合法（文档共 {} 页）", start, end, page_count),
        ));
    }

    let mut invariant = None;
    let mut neighbors = Vec::new();
    let mut messages = Vec::new();

    if let Some(prev) = index.checked_sub(1).and_then(|i| chapters.get(i)) {
        if start <= prev.start_page {
            invariant.get_or_insert(BoundaryInvariant::Ordering);
            neighbors.push(prev.index);
            messages.push(format!(
                "起始页 {} 不在章节 {}（{} 页起）之后",
                start, prev.index, prev.start_page
            ));
        } else if start <= prev.end_page {
            invariant.get_or_insert(BoundaryInvariant::Overlap);
            neighbors.push(prev.index);
            messages.push(format!(
                "起始页 {} 与章节 {}（{}-{} 页）重叠",
                start, prev.index, prev.start_page, prev.end_page
            ));
        }
    }

    match chapters.get(index + 1) {
        Some(next) => {
            if start >= next.start_page {
                invariant.get_or_insert(BoundaryInvariant::Ordering);
                neighbors.push(next.index);
                messages.push(format!(
                    "起始页 {} 不在章节 {}（{} 页起）之前",
                    start, next.index, next.start_page
                ));
            } else if end >= next.start_page {
                invariant.get_or_insert(BoundaryInvariant::Overlap);
                neighbors.push(next.index);
                messages.push(format!(
                    "结束页 {} 与章节 {}（{}-{} 页）重叠",
                    end, next.index, next.start_page, next.end_page
                ));
            }
        }
        None => {
            if end != page_count {
                invariant.get_or_insert(BoundaryInvariant::LastChapterEnd);
                messages.push(format!("最后一章必须结束于第 {} 页，实际为 {}", page_count, end));
            }
        }
    }

    match invariant {
        Some(invariant) => Err(violation(index, invariant, neighbors, messages.join("；"))),
        None => Ok(()),
    }
}

/// 校验整个章节列表
fn check_all(chapters: &[Chapter], page_count: u32) -> std::result::Result<(), BoundaryValidationError> {
    for chapter in chapters {
        validate_edit(chapters, page_count, chapter.index, chapter.start_page, chapter.end_page)?;
    }
    Ok(())
}

/// 把小节裁剪到新的章节范围内，完全落在范围外的小节被丢弃
fn clamp_sections(sections: &[Section], start: u32, end: u32) -> Vec<Section> {
    sections
        .iter()
        .filter(|s| s.end_page >= start && s.start_page <= end)
        .map(|s| {
            let start_page = s.start_page.max(start);
            let end_page = s.end_page.min(end);
            Section {
                title: s.title.clone(),
                start_page,
                end_page,
                sections: clamp_sections(&s.sections, start_page, end_page),
                verified: s.verified,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn chapter(index: usize, start: u32, end: u32) -> Chapter {
        Chapter {
            index,
            title: format!("Chapter {}", index + 1),
            start_page: start,
            end_page: end,
            sections: vec![],
            verified: false,
            confidence: 1.0,
            source: BoundarySource::Outline,
        }
    }

    fn registry() -> ChapterRegistry {
        ChapterRegistry::new(100, vec![chapter(0, 1, 30), chapter(1, 31, 60), chapter(2, 61, 100)]).unwrap()
    }

    #[test]
    fn test_new_rejects_overlap() {
        let result = ChapterRegistry::new(100, vec![chapter(0, 1, 40), chapter(1, 30, 100)]);
        assert!(matches!(result, Err(StudyError::BoundaryValidation(_))));
    }

    #[test]
    fn test_new_rejects_short_last_chapter() {
        let result = ChapterRegistry::new(100, vec![chapter(0, 1, 40), chapter(1, 41, 90)]);
        match result {
            Err(StudyError::BoundaryValidation(err)) => {
                assert_eq!(err.invariant, BoundaryInvariant::LastChapterEnd);
                assert_eq!(err.chapter_index, 1);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_valid_update_marks_verified() {
        let mut reg = registry();
        reg.update_boundary(1, 35, 55).unwrap();
        let ch = reg.get(1).unwrap();
        assert_eq!((ch.start_page, ch.end_page), (35, 55));
        assert!(ch.verified);
    }

    #[test]
    fn test_overlap_rejected_and_registry_unchanged() {
        let mut reg = registry();
        let before = reg.clone();

        let err = reg.update_boundary(1, 25, 60).unwrap_err();
        match err {
            StudyError::BoundaryValidation(e) => {
                assert_eq!(e.invariant, BoundaryInvariant::Overlap);
                assert_eq!(e.neighbors, vec![0]);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(reg, before);
    }

    #[test]
    fn test_overlap_on_both_sides_names_both_neighbors() {
        let mut reg = registry();
        let err = reg.update_boundary(1, 20, 70).unwrap_err();
        match err {
            StudyError::BoundaryValidation(e) => assert_eq!(e.neighbors, vec![0, 2]),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_ordering_violation() {
        let mut reg = registry();
        let err = reg.update_boundary(1, 65, 70).unwrap_err();
        match err {
            StudyError::BoundaryValidation(e) => {
                assert_eq!(e.invariant, BoundaryInvariant::Ordering);
                assert_eq!(e.neighbors, vec![2]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_last_chapter_must_end_at_page_count() {
        let mut reg = registry();
        assert!(reg.update_boundary(2, 61, 99).is_err());
        assert!(reg.update_boundary(2, 70, 100).is_ok());
    }

    #[test]
    fn test_page_range_and_missing_chapter() {
        let mut reg = registry();
        assert!(matches!(
            reg.update_boundary(0, 10, 5),
            Err(StudyError::BoundaryValidation(BoundaryValidationError {
                invariant: BoundaryInvariant::PageRange,
                ..
            }))
        ));
        assert!(matches!(reg.update_boundary(9, 1, 2), Err(StudyError::ChapterNotFound(9))));
    }

    #[test]
    fn test_sections_clamped_on_edit() {
        let mut chapters = vec![chapter(0, 1, 30), chapter(1, 31, 100)];
        chapters[0].sections = vec![
            Section { title: "A".into(), start_page: 1, end_page: 10, sections: vec![], verified: true },
            Section { title: "B".into(), start_page: 11, end_page: 30, sections: vec![], verified: true },
        ];
        let mut reg = ChapterRegistry::new(100, chapters).unwrap();
        reg.update_boundary(0, 5, 20).unwrap();

        let sections = &reg.get(0).unwrap().sections;
        assert_eq!(sections.len(), 2);
        assert_eq!((sections[0].start_page, sections[0].end_page), (5, 10));
        assert_eq!((sections[1].start_page, sections[1].end_page), (11, 20));

        reg.update_boundary(0, 12, 20).unwrap();
        assert_eq!(reg.get(0).unwrap().sections.len(), 1);
    }

    #[test]
    fn test_pending_review() {
        let mut chapters = vec![chapter(0, 1, 50), chapter(1, 51, 100)];
        chapters[1].confidence = 0.4;
        let mut reg = ChapterRegistry::new(100, chapters).unwrap();
        assert_eq!(reg.pending_review(0.7), vec![1]);

        reg.verify(1).unwrap();
        assert!(reg.pending_review(0.7).is_empty());
    }

    #[test]
    fn test_registry_round_trips_through_json() {
        let reg = registry();
        let json = serde_json::to_string(&reg).unwrap();
        let restored: ChapterRegistry = serde_json::from_str(&json).unwrap();
        assert_eq!(reg, restored);
    }
}
