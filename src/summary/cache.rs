use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::types::{SummaryMeta, SummaryRecord};
use crate::error::StoreError;
use crate::store::{doc_key, get_json, put_json, KeyValueStore};

/// 摘要缓存
///
/// 记录按指纹与代数存储，写入后不再修改；"当前"映射指向每个指纹最新的一代。
/// 旧记录保留，可以继续浏览
#[derive(Clone)]
pub struct SummaryCache {
    store: Arc<dyn KeyValueStore>,
}

/// 记录 ID：`{指纹}#{代数}`
pub fn record_id(fingerprint: &str, generation: u32) -> String {
    format!("{}#{:04}", fingerprint, generation)
}

fn record_key(document_id: &str, record_id: &str) -> String {
    doc_key(document_id, &format!("summary/record/{}", record_id))
}

fn current_key(document_id: &str, fingerprint: &str) -> String {
    doc_key(document_id, &format!("summary/current/{}", fingerprint))
}

impl SummaryCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// 查找指纹当前对应的记录
    pub fn lookup(&self, document_id: &str, fingerprint: &str) -> Result<Option<SummaryRecord>, StoreError> {
        let current: Option<String> = get_json(self.store.as_ref(), &current_key(document_id, fingerprint))?;
        match current {
            Some(id) => self.get_record(document_id, &id),
            None => Ok(None),
        }
    }

    pub fn get_record(&self, document_id: &str, record_id: &str) -> Result<Option<SummaryRecord>, StoreError> {
        get_json(self.store.as_ref(), &record_key(document_id, record_id))
    }

    /// 该指纹下一次生成的代数
    pub fn next_generation(&self, document_id: &str, fingerprint: &str) -> Result<u32, StoreError> {
        let prefix = record_key(document_id, &format!("{}#", fingerprint));
        let existing = self.store.scan_prefix(&prefix)?;
        let max = existing
            .iter()
            .filter_map(|(key, _)| key.rsplit('#').next().and_then(|g| g.parse::<u32>().ok()))
            .max()
            .unwrap_or(0);
        Ok(max + 1)
    }

    /// 写入新记录并把它设为该指纹的当前记录
    pub fn insert(&self, record: &SummaryRecord) -> Result<(), StoreError> {
        let store = self.store.as_ref();
        put_json(store, &record_key(&record.document_id, &record.record_id), record)?;
        put_json(store, &current_key(&record.document_id, &record.fingerprint), &record.record_id)?;
        debug!(
            "摘要已缓存: 章节 {} {} 第 {} 代",
            record.chapter_index, record.depth, record.generation
        );
        Ok(())
    }

    /// 列出文档的所有缓存摘要（含历史记录）
    ///
    /// 按章节、深度、代数排序
    pub fn list(&self, document_id: &str) -> Result<Vec<SummaryMeta>, StoreError> {
        let current: HashMap<String, String> = self
            .store
            .scan_prefix(&doc_key(document_id, "summary/current/"))?
            .into_iter()
            .map(|(key, value)| -> Result<(String, String), StoreError> {
                let fingerprint = key.rsplit('/').next().unwrap_or("").to_string();
                let id: String = serde_json::from_slice(&value)?;
                Ok((fingerprint, id))
            })
            .collect::<Result<_, StoreError>>()?;

        let mut metas = Vec::new();
        for (_, value) in self.store.scan_prefix(&doc_key(document_id, "summary/record/"))? {
            let record: SummaryRecord = serde_json::from_slice(&value)?;
            let is_current = current.get(&record.fingerprint) == Some(&record.record_id);
            metas.push(record.meta(is_current));
        }
        metas.sort_by(|a, b| {
            a.chapter_index
                .cmp(&b.chapter_index)
                .then(a.depth.cmp(&b.depth))
                .then(a.fingerprint.cmp(&b.fingerprint))
                .then(a.generation.cmp(&b.generation))
        });
        Ok(metas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::summary::depth::DepthTier;
    use crate::summary::types::ContentBlock;
    use chrono::Utc;

    fn record(document_id: &str, fingerprint: &str, generation: u32, chapter_index: usize) -> SummaryRecord {
        SummaryRecord {
            record_id: record_id(fingerprint, generation),
            fingerprint: fingerprint.to_string(),
            document_id: document_id.to_string(),
            chapter_index,
            chapter_title: format!("Chapter {}", chapter_index + 1),
            depth: DepthTier::Standard,
            instructions: None,
            vision_enabled: false,
            blocks: vec![ContentBlock::Text {
                text: format!("generation {}", generation),
                anchor: None,
            }],
            category_tags: vec![],
            generation,
            merge_tiers: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_lookup_follows_current_mapping() {
        let cache = SummaryCache::new(Arc::new(MemoryStore::new()));
        assert_eq!(cache.lookup("doc", "fp").unwrap(), None);
        assert_eq!(cache.next_generation("doc", "fp").unwrap(), 1);

        cache.insert(&record("doc", "fp", 1, 0)).unwrap();
        assert_eq!(cache.next_generation("doc", "fp").unwrap(), 2);
        cache.insert(&record("doc", "fp", 2, 0)).unwrap();

        let current = cache.lookup("doc", "fp").unwrap().unwrap();
        assert_eq!(current.generation, 2);

        // 旧记录仍可读取
        let old = cache.get_record("doc", &record_id("fp", 1)).unwrap().unwrap();
        assert_eq!(old.generation, 1);
    }

    #[test]
    fn test_list_marks_current_and_isolates_documents() {
        let cache = SummaryCache::new(Arc::new(MemoryStore::new()));
        cache.insert(&record("doc", "fp", 1, 1)).unwrap();
        cache.insert(&record("doc", "fp", 2, 1)).unwrap();
        cache.insert(&record("doc", "other", 1, 0)).unwrap();
        cache.insert(&record("elsewhere", "fp", 1, 0)).unwrap();

        let metas = cache.list("doc").unwrap();
        assert_eq!(metas.len(), 3);
        assert_eq!(metas[0].chapter_index, 0);
        assert!(metas[0].is_current);
        assert!(!metas[1].is_current);
        assert_eq!(metas[1].generation, 1);
        assert!(metas[2].is_current);
    }
}
