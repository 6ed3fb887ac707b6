use sha2::{Digest, Sha256};

use crate::summary::depth::DepthTier;

/// 摘要缓存键格式版本，改变键的组成方式时递增
const SUMMARY_KEY_VERSION: &str = "summary-v1";

/// 文档指纹：整个文件字节的 SHA256
pub fn document_fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// 章节内容版本：章节正文的 SHA256
///
/// 章节边界被修改后正文随之改变，版本号也随之改变
pub fn content_version(chapter_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(chapter_text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// 摘要指纹
///
/// 由（章节内容版本、深度、附加指令、是否启用视觉）共同决定。
/// 每个字段都带长度前缀，不同输入不会拼接出相同的字节序列
///
/// # 参数
/// - `content_version`: [`content_version`] 的结果
/// - `depth`: 摘要深度
/// - `instructions`: 用户附加指令（`None` 与空字符串视为相同）
/// - `vision_enabled`: 是否启用图片描述
pub fn summary_fingerprint(
    content_version: &str,
    depth: DepthTier,
    instructions: Option<&str>,
    vision_enabled: bool,
) -> String {
    let mut hasher = Sha256::new();
    let fields: [&str; 5] = [
        SUMMARY_KEY_VERSION,
        content_version,
        depth.as_str(),
        instructions.unwrap_or(""),
        if vision_enabled { "vision" } else { "text" },
    ];
    for field in fields {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_fingerprint_is_stable() {
        let a = document_fingerprint(b"%PDF-1.7 test");
        let b = document_fingerprint(b"%PDF-1.7 test");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, document_fingerprint(b"%PDF-1.7 other"));
    }

    #[test]
    fn test_summary_fingerprint_sensitive_to_every_field() {
        let version = content_version("chapter body");
        let base = summary_fingerprint(&version, DepthTier::Standard, None, false);

        assert_eq!(base, summary_fingerprint(&version, DepthTier::Standard, None, false));
        assert_ne!(base, summary_fingerprint(&content_version("chapter body!"), DepthTier::Standard, None, false));
        assert_ne!(base, summary_fingerprint(&version, DepthTier::Brief, None, false));
        assert_ne!(base, summary_fingerprint(&version, DepthTier::Standard, Some("focus on flags"), false));
        assert_ne!(base, summary_fingerprint(&version, DepthTier::Standard, None, true));
    }

    #[test]
    fn test_length_prefix_prevents_field_shifting() {
        // 内容与指令之间的字节挪动不能产生相同指纹
        let a = summary_fingerprint("ab", DepthTier::Brief, Some("c"), false);
        let b = summary_fingerprint("a", DepthTier::Brief, Some("bc"), false);
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_instructions_equal_none() {
        let version = content_version("x");
        assert_eq!(
            summary_fingerprint(&version, DepthTier::Detailed, None, false),
            summary_fingerprint(&version, DepthTier::Detailed, Some(""), false)
        );
    }
}
