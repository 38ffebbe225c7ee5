//! Token 估算
//!
//! 两种粗略估算：
//! - 消息列表：按 (role + 1 + content + tool_calls JSON) 的总字符数 / 4 向上取整，用于上下文预算；
//! - 纯文本：非 ASCII 字符各计 1，ASCII 字符每 4 个计 1，用于限制进度摘要长度。

use crate::memory::Message;

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算消息列表的 token 数量
    pub fn estimate_messages(messages: &[Message]) -> usize {
        let total_chars: usize = messages.iter().map(Self::message_chars).sum();
        total_chars.div_ceil(4)
    }

    pub(crate) fn message_chars(msg: &Message) -> usize {
        let mut chars = msg.role.as_str().chars().count() + 1;
        if let Some(content) = &msg.content {
            chars += content.chars().count();
        }
        if !msg.tool_calls.is_empty() {
            chars += serde_json::to_string(&msg.tool_calls)
                .map(|s| s.chars().count())
                .unwrap_or(0);
        }
        chars
    }

    /// 估算文本的 token 数量：非 ASCII 每字 1 token，ASCII 约 4 字符/token
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0usize;
        let mut non_ascii_chars = 0usize;
        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }
        non_ascii_chars + ascii_chars.div_ceil(4)
    }

    /// 将文本截断到指定 token 数（二分查找最长前缀）；截断处非句末标点时追加 "..."
    pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
        if Self::estimate(text) <= max_tokens {
            return text.to_string();
        }
        let chars: Vec<char> = text.chars().collect();
        let (mut lo, mut hi) = (0usize, chars.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            let prefix: String = chars[..mid].iter().collect();
            if Self::estimate(&prefix) <= max_tokens {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let cut = lo.saturating_sub(1);
        let mut trimmed: String = chars[..cut].iter().collect::<String>().trim_end().to_string();
        if let Some(last) = trimmed.chars().last() {
            if !"。.!?".contains(last) {
                trimmed.push_str("...");
            }
        }
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ToolCall;

    #[test]
    fn test_token_estimator_messages() {
        // "user" 4 + 1 + 3 = 8 -> 2
        assert_eq!(TokenEstimator::estimate_messages(&[Message::user("abc")]), 2);
        // 9 chars -> ceil(9/4) = 3
        assert_eq!(TokenEstimator::estimate_messages(&[Message::user("abcd")]), 3);
        assert_eq!(TokenEstimator::estimate_messages(&[]), 0);
    }

    #[test]
    fn test_tool_calls_count_towards_estimate() {
        let plain = Message::assistant_with_tool_calls(None, vec![]);
        let with_calls = Message::assistant_with_tool_calls(
            None,
            vec![ToolCall::new("c1", "read", r#"{"path":"a"}"#)],
        );
        assert!(
            TokenEstimator::estimate_messages(&[with_calls])
                > TokenEstimator::estimate_messages(&[plain])
        );
    }

    #[test]
    fn test_token_estimator_chinese() {
        assert_eq!(TokenEstimator::estimate("你好世界"), 4);
        assert_eq!(TokenEstimator::estimate("abcde"), 2);
        assert_eq!(TokenEstimator::estimate("你好ab"), 3);
    }

    #[test]
    fn test_truncate_respects_budget() {
        let text = "工具调用".repeat(100);
        let out = TokenEstimator::truncate_to_tokens(&text, 200);
        assert!(TokenEstimator::estimate(&out) <= 203);
        assert!(out.ends_with("..."));

        let short = "已完成。";
        assert_eq!(TokenEstimator::truncate_to_tokens(short, 200), short);
    }
}
