//! 分词
//!
//! 中英文混合：含 CJK 字符时用 jieba 搜索引擎模式，否则按非字母数字字符切分。
//! 供嵌入（特征哈希）与检索缓存键的查询归一化使用。

use std::sync::OnceLock;

use jieba_rs::Jieba;

static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn get_jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |   // CJK Unified Ideographs
        '\u{3400}'..='\u{4DBF}' |   // Extension A
        '\u{F900}'..='\u{FAFF}' |   // Compatibility Ideographs
        '\u{3040}'..='\u{309F}' |   // Hiragana
        '\u{30A0}'..='\u{30FF}'     // Katakana
    )
}

pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

pub fn tokenize(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    if contains_cjk(text) {
        get_jieba()
            .cut_for_search(text, true)
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| s.chars().count() > 1 || s.chars().next().map(is_cjk).unwrap_or(false))
            .collect()
    } else {
        text.split(|c: char| !c.is_alphanumeric() && c != '_')
            .map(|s| s.to_lowercase())
            .filter(|s| s.len() > 1)
            .collect()
    }
}

/// 查询归一化：去首尾空白、小写、折叠连续空白
///
/// "  Weather   Report " 与 "weather report" 得到相同的检索缓存键。
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|s| s.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_chinese() {
        let tokens = tokenize("我喜欢编程和人工智能");
        assert!(tokens.iter().any(|t| t.contains("编程") || t.contains("智能")));
    }

    #[test]
    fn test_tokenize_english_splits_punctuation() {
        let tokens = tokenize("Search: weather, report!");
        assert_eq!(tokens, vec!["search", "weather", "report"]);
    }

    #[test]
    fn test_contains_cjk() {
        assert!(contains_cjk("Hello 世界"));
        assert!(!contains_cjk("Hello World"));
    }

    #[test]
    fn test_normalize_query() {
        assert_eq!(normalize_query("  Weather   Report "), "weather report");
    }
}
