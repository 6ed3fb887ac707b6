use thiserror::Error;
use tracing::debug;

use super::OutlineEntry;
use crate::chapter_registry::{BoundarySource, Chapter, Section};

/// 大纲无法使用的原因
///
/// 属于预期的控制流：调用方据此回退到启发式检测，不向用户报告
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("文档没有大纲")]
    Absent,
    #[error("大纲中没有有效的顶层条目")]
    NoTopLevel,
    #[error("大纲条目 \"{title}\" 指向第 {page} 页，早于前一章")]
    Backwards { title: String, page: u32 },
}

/// 解析过程中的中间节点
struct OutlineNode {
    title: String,
    start: u32,
    end: u32,
    merged: bool,
    children: Vec<OutlineEntry>,
}

/// 把大纲转换为章节列表
///
/// 大纲缺失或格式错误时返回空列表，由调用方回退到启发式检测
///
/// # 参数
/// - `outline`: 文档大纲
/// - `page_count`: 文档总页数
/// - `max_depth`: 参与解析的最大层级数（1 = 只有章）
pub fn resolve_outline(outline: Option<&[OutlineEntry]>, page_count: u32, max_depth: u32) -> Vec<Chapter> {
    match try_resolve(outline, page_count, max_depth) {
        Ok(chapters) => chapters,
        Err(e) => {
            debug!("大纲不可用，回退到启发式检测: {}", e);
            Vec::new()
        }
    }
}

/// 大纲解析，失败时返回原因
pub fn try_resolve(
    outline: Option<&[OutlineEntry]>,
    page_count: u32,
    max_depth: u32,
) -> Result<Vec<Chapter>, ResolutionError> {
    let outline = match outline {
        Some(entries) if !entries.is_empty() && page_count > 0 => entries,
        _ => return Err(ResolutionError::Absent),
    };

    // 丢弃指向文档范围之外的条目
    let usable: Vec<OutlineEntry> = outline
        .iter()
        .filter(|e| e.page >= 1 && e.page <= page_count && !e.title.trim().is_empty())
        .cloned()
        .collect();

    let top_level = usable.iter().map(|e| e.level).min().ok_or(ResolutionError::NoTopLevel)?;
    let deepest = top_level.saturating_add(max_depth.max(1) - 1);
    let usable: Vec<OutlineEntry> = usable.into_iter().filter(|e| e.level <= deepest).collect();

    let nodes = build_level(&usable, 1, page_count, true)?;
    if nodes.is_empty() {
        return Err(ResolutionError::NoTopLevel);
    }

    let chapters = nodes
        .into_iter()
        .enumerate()
        .map(|(index, node)| {
            let sections = build_sections(&node);
            Chapter {
                index,
                title: node.title,
                start_page: node.start,
                end_page: node.end,
                sections,
                verified: !node.merged,
                confidence: 1.0,
                source: BoundarySource::Outline,
            }
        })
        .collect();

    Ok(chapters)
}

/// 构建同一层级的节点
///
/// 本层的层级取条目中最浅的层级；更深的条目作为前一个节点的子条目。
/// 连续指向同一页的条目合并为一个边界并标记为未确认
fn build_level(
    entries: &[OutlineEntry],
    range_start: u32,
    range_end: u32,
    is_top: bool,
) -> Result<Vec<OutlineNode>, ResolutionError> {
    let base = match entries.iter().map(|e| e.level).min() {
        Some(level) => level,
        None => return Ok(Vec::new()),
    };

    let mut nodes: Vec<OutlineNode> = Vec::new();
    let mut i = 0;
    while i < entries.len() {
        let entry = &entries[i];
        let mut j = i + 1;
        while j < entries.len() && entries[j].level > base {
            j += 1;
        }
        let children = &entries[i + 1..j];

        // 第一个本层条目之前的更深条目没有归属，跳过
        if entry.level != base || entry.page > range_end {
            i = j;
            continue;
        }

        let start = entry.page.max(range_start);
        let title = entry.title.trim().to_string();

        if let Some(last) = nodes.last_mut() {
            if start == last.start {
                last.title = format!("{} / {}", last.title, title);
                last.merged = true;
                last.children.extend_from_slice(children);
                i = j;
                continue;
            }
            if start < last.start {
                if is_top {
                    return Err(ResolutionError::Backwards { title, page: entry.page });
                }
                i = j;
                continue;
            }
        }

        nodes.push(OutlineNode {
            title,
            start,
            end: range_end,
            merged: false,
            children: children.to_vec(),
        });
        i = j;
    }

    // 每个节点结束于下一个节点起始页的前一页
    for k in 1..nodes.len() {
        let next_start = nodes[k].start;
        nodes[k - 1].end = next_start - 1;
    }

    Ok(nodes)
}

fn build_sections(node: &OutlineNode) -> Vec<Section> {
    // 子层级不会返回 Backwards，乱序条目直接跳过
    build_level(&node.children, node.start, node.end, false)
        .unwrap_or_default()
        .into_iter()
        .map(|child| Section {
            sections: build_sections(&child),
            title: child.title,
            start_page: child.start,
            end_page: child.end,
            verified: !child.merged,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(title: &str, page: u32, level: u32) -> OutlineEntry {
        OutlineEntry {
            title: title.to_string(),
            page,
            level,
        }
    }

    #[test]
    fn test_ten_chapter_outline_is_contiguous() {
        let outline: Vec<OutlineEntry> = (0..10)
            .map(|i| entry(&format!("Chapter {}", i + 1), 1 + i * 25, 1))
            .collect();

        let chapters = resolve_outline(Some(outline.as_slice()), 250, 2);
        assert_eq!(chapters.len(), 10);
        assert_eq!(chapters[0].start_page, 1);
        for pair in chapters.windows(2) {
            assert_eq!(pair[0].end_page + 1, pair[1].start_page);
            assert!(pair[0].start_page <= pair[0].end_page);
        }
        assert_eq!(chapters[9].end_page, 250);
        assert!(chapters.iter().all(|c| c.verified && c.source == BoundarySource::Outline));
    }

    #[test]
    fn test_absent_outline_returns_empty() {
        assert!(resolve_outline(None, 100, 2).is_empty());
        assert!(resolve_outline(Some(&[][..]), 100, 2).is_empty());
        assert_eq!(try_resolve(None, 100, 2), Err(ResolutionError::Absent));
    }

    #[test]
    fn test_backwards_outline_is_malformed() {
        let outline = vec![entry("One", 10, 1), entry("Two", 5, 1)];
        assert!(resolve_outline(Some(outline.as_slice()), 100, 2).is_empty());
        assert!(matches!(
            try_resolve(Some(outline.as_slice()), 100, 2),
            Err(ResolutionError::Backwards { page: 5, .. })
        ));
    }

    #[test]
    fn test_out_of_range_entries_dropped() {
        let outline = vec![entry("Zero", 0, 1), entry("One", 1, 1), entry("Ghost", 500, 1)];
        let chapters = resolve_outline(Some(outline.as_slice()), 100, 2);
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].title, "One");
        assert_eq!(chapters[0].end_page, 100);
    }

    #[test]
    fn test_same_page_entries_merge_unverified() {
        let outline = vec![
            entry("Part I", 1, 1),
            entry("Chapter 1", 1, 1),
            entry("Chapter 2", 40, 1),
        ];
        let chapters = resolve_outline(Some(outline.as_slice()), 80, 2);
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].title, "Part I / Chapter 1");
        assert!(!chapters[0].verified);
        assert_eq!(chapters[0].end_page, 39);
        assert!(chapters[1].verified);
    }

    #[test]
    fn test_nested_entries_become_sections() {
        let outline = vec![
            entry("Chapter 1", 1, 1),
            entry("1.1 Basics", 2, 2),
            entry("1.2 More", 8, 2),
            entry("1.2.1 Deep", 9, 3),
            entry("Chapter 2", 20, 1),
            entry("2.1 Next", 22, 2),
        ];
        let chapters = resolve_outline(Some(outline.as_slice()), 30, 3);
        assert_eq!(chapters.len(), 2);

        let first = &chapters[0].sections;
        assert_eq!(first.len(), 2);
        assert_eq!((first[0].start_page, first[0].end_page), (2, 7));
        assert_eq!((first[1].start_page, first[1].end_page), (8, 19));
        assert_eq!(first[1].sections.len(), 1);
        assert_eq!(first[1].sections[0].end_page, 19);

        assert_eq!(chapters[1].sections[0].end_page, 30);
    }

    #[test]
    fn test_max_depth_limits_sections() {
        let outline = vec![entry("Chapter 1", 1, 1), entry("1.1", 2, 2), entry("1.1.1", 3, 3)];
        let chapters = resolve_outline(Some(outline.as_slice()), 10, 2);
        assert_eq!(chapters[0].sections.len(), 1);
        assert!(chapters[0].sections[0].sections.is_empty());

        let flat = resolve_outline(Some(outline.as_slice()), 10, 1);
        assert!(flat[0].sections.is_empty());
    }

    #[test]
    fn test_outline_starting_at_level_two() {
        let outline = vec![entry("A", 3, 2), entry("B", 9, 2)];
        let chapters = resolve_outline(Some(outline.as_slice()), 12, 1);
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].start_page, 3);
        assert_eq!(chapters[1].end_page, 12);
    }
}
