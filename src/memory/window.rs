//! 上下文窗口管理
//!
//! 在每次模型调用前把消息序列压到 token 预算内：
//! - 触发式压缩：最近一条不是 assistant 且超预算时，把旧消息摘要成一条 `【ContextSummary】` user 消息，保留最后 3 条；
//! - 滑动窗口：压缩后仍超预算则只保留能放下的最长后缀；
//! - 超长工具输出落盘到 `tool_outputs/`，对话里只留路径说明 + 前缀预览。
//!
//! 两种裁剪都会移动切点，保证保留部分不会以孤立的 tool 消息开头。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::memory::summarizer::{summarize_with_fallback, Summarizer};
use crate::memory::token_budget::TokenEstimator;
use crate::memory::{count_rounds, Message, Role};

/// 摘要消息前缀
pub const SUMMARY_PREFIX: &str = "【ContextSummary】";

/// 落盘说明的固定开头；已带此开头的内容不会再次落盘
const SPILL_MARKER: &str = "该工具的返回结果因为超长被放到了";
const SPILL_PATH_OPEN: &str = "超长被放到了（";
const UNKNOWN_PATH: &str = "未知路径";

/// 压缩保留的尾部消息数
const KEEP_TAIL: usize = 3;

/// 一次压缩的结果报告（HistoryStore 据此写 compression_log）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionReport {
    pub summary: String,
    pub removed_count: usize,
    pub removed_rounds: usize,
}

/// 超长工具输出的落盘目录：`<root>/tool_outputs/tool_output_<时间戳>_<序号>.txt`
#[derive(Debug)]
pub struct SpillStore {
    root: PathBuf,
    dir: PathBuf,
    counter: AtomicU64,
}

impl SpillStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let dir = root.join("tool_outputs");
        Self {
            root,
            dir,
            counter: AtomicU64::new(0),
        }
    }

    /// 写入完整内容，返回相对 root 的路径
    pub fn write(&self, content: &str) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = self.dir.join(format!("tool_output_{ts}_{n}.txt"));
        std::fs::write(&path, content)?;
        Ok(path
            .strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or(path))
    }
}

/// 从落盘说明中取出路径
pub fn extract_spill_path(text: &str) -> Option<String> {
    let start = text.find(SPILL_PATH_OPEN)? + SPILL_PATH_OPEN.len();
    let rest = &text[start..];
    let end = rest.find('）').or_else(|| rest.find(')'))?;
    let path = rest[..end].trim();
    (!path.is_empty()).then(|| path.to_string())
}

/// 上下文窗口管理器
#[derive(Debug)]
pub struct ContextWindowManager {
    max_tokens: usize,
    tool_output_limit: usize,
    tool_output_preview: usize,
    spill: Option<SpillStore>,
}

impl ContextWindowManager {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            tool_output_limit: 10_000,
            tool_output_preview: 1_000,
            spill: None,
        }
    }

    pub fn with_spill_store(mut self, spill: SpillStore) -> Self {
        self.spill = Some(spill);
        self
    }

    pub fn with_tool_output_limits(mut self, limit: usize, preview: usize) -> Self {
        self.tool_output_limit = limit;
        self.tool_output_preview = preview;
        self
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn estimate_tokens(&self, messages: &[Message]) -> usize {
        TokenEstimator::estimate_messages(messages)
    }

    fn split_system(messages: &[Message], preserve_system: bool) -> (Option<&Message>, &[Message]) {
        match messages.first() {
            Some(first) if preserve_system && first.role == Role::System => {
                (Some(first), &messages[1..])
            }
            _ => (None, messages),
        }
    }

    /// 滑动窗口：保留 system + 能放进预算的最长后缀（至少 1 条正文）
    pub fn window_messages(&self, messages: &[Message], preserve_system: bool) -> Vec<Message> {
        if messages.is_empty() || self.estimate_tokens(messages) <= self.max_tokens {
            return messages.to_vec();
        }
        let (system, body) = Self::split_system(messages, preserve_system);
        if body.is_empty() {
            return messages.to_vec();
        }

        let system_chars = system.map(TokenEstimator::message_chars).unwrap_or(0);
        let budget_chars = self.max_tokens.saturating_mul(4);

        // 从尾部向前累加，找能放下的最小起点
        let mut start = body.len() - 1;
        let mut suffix_chars = TokenEstimator::message_chars(&body[start]);
        while start > 0 {
            let next = suffix_chars + TokenEstimator::message_chars(&body[start - 1]);
            if system_chars + next > budget_chars {
                break;
            }
            suffix_chars = next;
            start -= 1;
        }
        // 不以孤立 tool 开头（仅剩最后一条时例外）
        while start < body.len() - 1 && body[start].role == Role::Tool {
            start += 1;
        }

        debug!(dropped = start, kept = body.len() - start, "context windowed");
        let mut out = Vec::with_capacity(body.len() - start + 1);
        out.extend(system.cloned());
        out.extend_from_slice(&body[start..]);
        out
    }

    /// 触发式压缩，见 [`Self::compress_with_report`]
    pub async fn compress_messages(
        &self,
        messages: &[Message],
        summarizer: Option<&dyn Summarizer>,
        preserve_system: bool,
        triggered_by_non_assistant: bool,
    ) -> Vec<Message> {
        self.compress_with_report(messages, summarizer, preserve_system, triggered_by_non_assistant)
            .await
            .0
    }

    /// 触发且超预算且正文多于 3 条时，旧消息摘要为一条 user 消息，保留最后 3 条；
    /// 保留区若以 tool 开头则向前扩展到其 assistant 回合
    pub async fn compress_with_report(
        &self,
        messages: &[Message],
        summarizer: Option<&dyn Summarizer>,
        preserve_system: bool,
        triggered_by_non_assistant: bool,
    ) -> (Vec<Message>, Option<CompressionReport>) {
        if !triggered_by_non_assistant || self.estimate_tokens(messages) <= self.max_tokens {
            return (messages.to_vec(), None);
        }
        let (system, body) = Self::split_system(messages, preserve_system);
        if body.len() <= KEEP_TAIL {
            return (messages.to_vec(), None);
        }

        let mut keep_from = body.len() - KEEP_TAIL;
        while keep_from > 0 && body[keep_from].role == Role::Tool {
            keep_from -= 1;
        }
        if keep_from == 0 {
            return (messages.to_vec(), None);
        }

        let removed = &body[..keep_from];
        let summary = summarize_with_fallback(summarizer, removed).await;
        let report = CompressionReport {
            summary: summary.clone(),
            removed_count: removed.len(),
            removed_rounds: count_rounds(removed),
        };
        debug!(removed = report.removed_count, "context compressed");

        let mut out = Vec::with_capacity(body.len() - keep_from + 2);
        out.extend(system.cloned());
        out.push(Message::user(format!("{SUMMARY_PREFIX}{summary}")));
        out.extend_from_slice(&body[keep_from..]);
        (out, Some(report))
    }

    /// 每次模型调用前的统一入口：最近一条不是 assistant 时压缩，仍超预算再滑动窗口
    pub async fn prepare_for_model(
        &self,
        messages: &[Message],
        summarizer: Option<&dyn Summarizer>,
        preserve_system: bool,
    ) -> Vec<Message> {
        let mut working = messages.to_vec();
        self.prepare_in_place(&mut working, summarizer, preserve_system)
            .await
    }

    /// 同 [`Self::prepare_for_model`]，但压缩结果写回 `messages`，供多步循环复用；
    /// 滑动窗口只作用于返回值，不改动 `messages`
    pub async fn prepare_in_place(
        &self,
        messages: &mut Vec<Message>,
        summarizer: Option<&dyn Summarizer>,
        preserve_system: bool,
    ) -> Vec<Message> {
        let triggered = messages
            .last()
            .map(|m| m.role != Role::Assistant)
            .unwrap_or(false);
        let (compressed, report) = self
            .compress_with_report(messages.as_slice(), summarizer, preserve_system, triggered)
            .await;
        if report.is_some() {
            *messages = compressed;
        }
        if self.estimate_tokens(messages.as_slice()) > self.max_tokens {
            self.window_messages(messages.as_slice(), preserve_system)
        } else {
            messages.clone()
        }
    }

    /// 超长工具输出落盘，只保留说明 + 前缀预览；已落盘过的内容原样返回
    pub fn normalize_tool_output(&self, content: &str) -> String {
        if content.chars().count() <= self.tool_output_limit || content.starts_with(SPILL_MARKER) {
            return content.to_string();
        }
        let rel_path = match self.spill.as_ref().map(|s| s.write(content)) {
            Some(Ok(path)) => path.to_string_lossy().into_owned(),
            Some(Err(e)) => {
                warn!("failed to spill tool output: {}", e);
                UNKNOWN_PATH.to_string()
            }
            None => UNKNOWN_PATH.to_string(),
        };
        let preview: String = content.chars().take(self.tool_output_preview).collect();
        format!(
            "{SPILL_MARKER}（{rel_path}）下，你需要完整内容请用read工具进行读取，现在只展示前{}个字符：{preview}",
            self.tool_output_preview
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{HeuristicSummarizer, ToolCall};
    use tempfile::TempDir;

    fn long_user(n: usize) -> Message {
        Message::user("x".repeat(n))
    }

    #[test]
    fn within_budget_is_unchanged() {
        let mgr = ContextWindowManager::new(1000);
        let msgs = vec![Message::system("s"), Message::user("hi")];
        assert_eq!(mgr.window_messages(&msgs, true), msgs);
    }

    #[test]
    fn window_keeps_system_and_fitting_suffix() {
        let mgr = ContextWindowManager::new(60);
        let msgs = vec![
            Message::system("sys"),
            long_user(200),
            Message::assistant("a".repeat(200)),
            Message::user("last"),
        ];
        let out = mgr.window_messages(&msgs, true);
        assert_eq!(out[0].role, Role::System);
        assert_eq!(out.last().map(|m| m.text()), Some("last"));
        assert!(out.len() < msgs.len());
        assert!(mgr.estimate_tokens(&out) <= 60);
    }

    #[test]
    fn window_never_starts_with_orphan_tool() {
        let mgr = ContextWindowManager::new(30);
        let msgs = vec![
            Message::system("s"),
            Message::assistant_with_tool_calls(
                Some("x".repeat(200)),
                vec![ToolCall::new("c1", "read", "{}")],
            ),
            Message::tool("c1", "read", "r1"),
            Message::assistant("done"),
        ];
        let out = mgr.window_messages(&msgs, true);
        assert_ne!(out[1].role, Role::Tool);
        assert_eq!(out.last().map(|m| m.text()), Some("done"));
    }

    #[test]
    fn window_keeps_at_least_one_body_message() {
        let mgr = ContextWindowManager::new(5);
        let msgs = vec![Message::system("s"), long_user(500), long_user(500)];
        let out = mgr.window_messages(&msgs, true);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].role, Role::System);
    }

    #[tokio::test]
    async fn compress_requires_trigger_and_budget() {
        let mgr = ContextWindowManager::new(10);
        let msgs: Vec<Message> = (0..6).map(|_| long_user(100)).collect();
        let (out, report) = mgr.compress_with_report(&msgs, None, true, false).await;
        assert_eq!(out, msgs);
        assert!(report.is_none());

        let big = ContextWindowManager::new(100_000);
        let (out, report) = big.compress_with_report(&msgs, None, true, true).await;
        assert_eq!(out, msgs);
        assert!(report.is_none());
    }

    #[tokio::test]
    async fn compress_keeps_tail_and_summarizes_rest() {
        let mgr = ContextWindowManager::new(10);
        let msgs = vec![
            Message::system("sys"),
            Message::user("请帮我写报告"),
            Message::assistant("已完成大纲"),
            Message::user("q2"),
            Message::assistant("a2"),
            Message::user("q3"),
        ];
        let (out, report) = mgr
            .compress_with_report(&msgs, Some(&HeuristicSummarizer), true, true)
            .await;
        let report = report.unwrap();
        assert_eq!(report.removed_count, 2);
        assert_eq!(report.removed_rounds, 1);
        assert_eq!(out.len(), 5);
        assert_eq!(out[0].role, Role::System);
        assert!(out[1].text().starts_with(SUMMARY_PREFIX));
        assert_eq!(&out[2..], &msgs[3..]);
    }

    #[tokio::test]
    async fn compress_extends_past_leading_tool_messages() {
        let mgr = ContextWindowManager::new(10);
        let msgs = vec![
            long_user(100),
            Message::assistant("ok"),
            Message::assistant_with_tool_calls(
                None,
                vec![
                    ToolCall::new("c1", "read", "{}"),
                    ToolCall::new("c2", "read", "{}"),
                ],
            ),
            Message::tool("c1", "read", "r1"),
            Message::tool("c2", "read", "r2"),
            Message::assistant("final"),
        ];
        let out = mgr.compress_messages(&msgs, None, false, true).await;
        // 保留区从 assistant(tool_calls) 开始
        assert!(out[0].text().starts_with(SUMMARY_PREFIX));
        assert_eq!(out[1].tool_calls.len(), 2);
        assert_eq!(out.len(), 5);
    }

    #[tokio::test]
    async fn prepare_in_place_keeps_compression_but_not_windowing() {
        let mgr = ContextWindowManager::new(60);
        let original = vec![
            Message::system("sys"),
            long_user(100),
            Message::assistant("a1"),
            Message::user("q2"),
            Message::assistant("a".repeat(400)),
            Message::user("q3"),
        ];

        let mut working = original.clone();
        let sent = mgr.prepare_in_place(&mut working, None, true).await;
        // 压缩写回工作上下文
        assert_eq!(working.len(), 5);
        assert!(working[1].text().starts_with(SUMMARY_PREFIX));
        assert_eq!(&working[2..], &original[3..]);
        // 滑动窗口只影响本次发送
        assert_eq!(sent, vec![Message::system("sys"), Message::user("q3")]);

        assert_eq!(mgr.prepare_for_model(&original, None, true).await, sent);
    }

    #[test]
    fn short_tool_output_passes_through() {
        let mgr = ContextWindowManager::new(1000);
        assert_eq!(mgr.normalize_tool_output("short"), "short");
    }

    #[test]
    fn long_tool_output_is_spilled_once() {
        let dir = TempDir::new().unwrap();
        let mgr = ContextWindowManager::new(1000).with_spill_store(SpillStore::new(dir.path()));
        let content = "字".repeat(10_001);

        let out = mgr.normalize_tool_output(&content);
        assert!(out.starts_with(SPILL_MARKER));
        let rel = extract_spill_path(&out).unwrap();
        assert!(rel.starts_with("tool_outputs"));
        let saved = std::fs::read_to_string(dir.path().join(&rel)).unwrap();
        assert_eq!(saved, content);
        assert!(out.ends_with(&"字".repeat(1000)));

        // 幂等：再次规范化不产生新文件
        assert_eq!(mgr.normalize_tool_output(&out), out);
        assert_eq!(std::fs::read_dir(dir.path().join("tool_outputs")).unwrap().count(), 1);
    }

    #[test]
    fn spill_failure_names_unknown_path() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("root_is_file");
        std::fs::write(&blocker, "x").unwrap();
        let mgr = ContextWindowManager::new(1000).with_spill_store(SpillStore::new(&blocker));

        let out = mgr.normalize_tool_output(&"a".repeat(10_500));
        assert_eq!(extract_spill_path(&out).as_deref(), Some(UNKNOWN_PATH));
        assert!(out.ends_with(&"a".repeat(1000)));
    }
}
