use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use crate::db;
use crate::error::StoreError;

/// 键值存储 trait
///
/// 摘要缓存、章节注册表和命令索引都通过它持久化。
/// 键以文档指纹开头划分命名空间，见 [`doc_key`]
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// 按键排序返回所有以 `prefix` 开头的条目
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// 把尚未落盘的写入持久化
    fn flush(&self) -> Result<(), StoreError>;
}

/// 文档命名空间下的键
///
/// # 参数
/// - `document_id`: 文档指纹
/// - `suffix`: 命名空间内的相对键
pub fn doc_key(document_id: &str, suffix: &str) -> String {
    format!("doc/{}/{}", document_id, suffix)
}

/// 读取并反序列化 JSON 值
pub fn get_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>, StoreError> {
    match store.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// 序列化为 JSON 并写入
pub fn put_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value)?;
    store.put(key, &bytes)
}

/// SQLite 存储
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// 打开数据库文件，不存在时创建
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Ok(Self {
            conn: Mutex::new(db::init_db(path)?),
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            conn: Mutex::new(db::init_memory_db()?),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Lock(format!("锁定数据库连接失败: {}", e)))
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.lock()?;
        let value: Option<Vec<u8>> = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, CURRENT_TIMESTAMP)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
            params![key, value],
        )?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT key, value FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![prefix], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    fn flush(&self) -> Result<(), StoreError> {
        // 每条语句自动提交，这里只确认连接仍然可用
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

/// 内存存储，进程退出即丢失
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>, StoreError> {
        self.entries
            .lock()
            .map_err(|e| StoreError::Lock(format!("锁定内存存储失败: {}", e)))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.lock()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let entries = self.lock()?;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        chapter: usize,
        text: String,
    }

    fn exercise(store: &dyn KeyValueStore) {
        assert_eq!(store.get("doc/a/x").unwrap(), None);

        store.put("doc/a/x", b"1").unwrap();
        store.put("doc/a/y", b"2").unwrap();
        store.put("doc/b/x", b"3").unwrap();
        store.put("doc/a/x", b"4").unwrap();

        assert_eq!(store.get("doc/a/x").unwrap(), Some(b"4".to_vec()));
        let scanned = store.scan_prefix("doc/a/").unwrap();
        assert_eq!(
            scanned,
            vec![("doc/a/x".to_string(), b"4".to_vec()), ("doc/a/y".to_string(), b"2".to_vec())]
        );
        assert!(store.flush().is_ok());
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_sqlite_store_in_memory() {
        exercise(&SqliteStore::in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("study.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            put_json(&store, &doc_key("abc", "note"), &Note { chapter: 2, text: "管道".to_string() }).unwrap();
            store.flush().unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let note: Option<Note> = get_json(&store, &doc_key("abc", "note")).unwrap();
        assert_eq!(note, Some(Note { chapter: 2, text: "管道".to_string() }));
    }

    #[test]
    fn test_get_json_reports_corrupt_value() {
        let store = MemoryStore::new();
        store.put("doc/a/bad", b"{not json").unwrap();
        let result: Result<Option<Note>, StoreError> = get_json(&store, "doc/a/bad");
        assert!(matches!(result, Err(StoreError::Serialization(_))));
    }
}
