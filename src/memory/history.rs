//! 按用户隔离的对话历史
//!
//! 目录结构：`<history_dir>/<user_id>/{<name>.json, <name>_full.json, state.json}`。
//! 一次任务的生命周期：open_session 保存记录与镜像的快照 → append 若干次 →
//! finalize（成功）或 rollback（取消 / 失败，写回快照）。
//! 同一用户同一时刻只有一个任务在写，由 TaskCoordinator 保证。

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use regex::Regex;
use tracing::{debug, info};

use crate::memory::persistence::{
    is_record_file, load_pointer, save_pointer, timestamp, CompressionEvent,
    ConversationPersistence, ConversationRecord,
};
use crate::memory::summarizer::Summarizer;
use crate::memory::window::ContextWindowManager;
use crate::memory::{Message, Role};

/// 达到该轮数后按首条 user 消息重命名
const RENAME_AFTER_ROUNDS: usize = 3;
const SLUG_CHARS: usize = 20;

/// 一次任务打开的会话：记录文件路径 + 打开时的记录与镜像快照
///
/// append 可能把记录整体替换为压缩版本，按条数截断无法还原，所以回滚写回完整快照。
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub user_id: String,
    pub path: PathBuf,
    snapshot: ConversationRecord,
    mirror_snapshot: Option<ConversationRecord>,
}

impl SessionHandle {
    /// 打开时记录中的消息数
    pub fn baseline(&self) -> usize {
        self.snapshot.messages.len()
    }
}

/// 对话历史存储
pub struct HistoryStore {
    base_dir: PathBuf,
    window: Arc<ContextWindowManager>,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl HistoryStore {
    pub fn new(base_dir: impl Into<PathBuf>, window: Arc<ContextWindowManager>) -> Self {
        Self {
            base_dir: base_dir.into(),
            window,
            summarizer: None,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    fn user_dir(&self, user_id: &str) -> PathBuf {
        self.base_dir.join(user_id)
    }

    /// 解析当前会话：state.json 指针 → 最近修改的记录 → 新建
    pub fn current_path(&self, user_id: &str) -> anyhow::Result<PathBuf> {
        let user_dir = self.user_dir(user_id);
        std::fs::create_dir_all(&user_dir)?;

        if let Some(current) = load_pointer(&user_dir)?.current_file {
            let path = user_dir.join(&current);
            if path.exists() {
                return Ok(path);
            }
        }
        if let Some(latest) = latest_record(&user_dir)? {
            save_pointer(&user_dir, &file_name(&latest))?;
            return Ok(latest);
        }
        self.create_session(user_id)
    }

    pub fn open_session(&self, user_id: &str) -> anyhow::Result<SessionHandle> {
        let path = self.current_path(user_id)?;
        let store = ConversationPersistence::new(&path);
        let snapshot = store.load()?;
        let mirror = store.mirror();
        let mirror_snapshot = if mirror.exists() {
            Some(mirror.load()?)
        } else {
            None
        };
        debug!(user_id, path = %path.display(), baseline = snapshot.messages.len(), "session opened");
        Ok(SessionHandle {
            user_id: user_id.to_string(),
            path,
            snapshot,
            mirror_snapshot,
        })
    }

    /// tool 消息（skill 除外）经过超长输出规范化
    fn normalize(&self, message: &Message) -> Message {
        let mut message = message.clone();
        if message.role == Role::Tool && message.tool_name.as_deref() != Some("skill") {
            if let Some(content) = message.content.as_deref() {
                message.content = Some(self.window.normalize_tool_output(content));
            }
        }
        message
    }

    /// 追加消息到记录与镜像；含非 assistant 消息时尝试自动压缩
    pub async fn append(&self, handle: &SessionHandle, messages: &[Message]) -> anyhow::Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let store = ConversationPersistence::new(&handle.path);
        let mut record = store.load()?;
        record
            .messages
            .extend(messages.iter().map(|m| self.normalize(m)));
        record.recount();
        store.save(&record)?;
        self.append_mirror(&store, &record, messages)?;

        if messages.iter().any(|m| m.role != Role::Assistant) {
            self.maybe_compress(&store, record).await?;
        }
        Ok(())
    }

    fn append_mirror(
        &self,
        store: &ConversationPersistence,
        record: &ConversationRecord,
        messages: &[Message],
    ) -> anyhow::Result<()> {
        let mirror = store.mirror();
        let mut full = if mirror.exists() {
            mirror.load()?
        } else {
            ConversationRecord {
                compression_log: Vec::new(),
                messages: Vec::new(),
                ..record.clone()
            }
        };
        full.messages.extend_from_slice(messages);
        full.recount();
        mirror.save(&full)
    }

    async fn maybe_compress(
        &self,
        store: &ConversationPersistence,
        mut record: ConversationRecord,
    ) -> anyhow::Result<()> {
        let (messages, report) = self
            .window
            .compress_with_report(&record.messages, self.summarizer.as_deref(), false, true)
            .await;
        let Some(report) = report else {
            return Ok(());
        };
        info!(
            path = %store.path().display(),
            removed = report.removed_count,
            "history compressed"
        );
        record.messages = messages;
        record.recount();
        record.compression_log.push(CompressionEvent {
            summary: report.summary,
            removed_count: report.removed_count,
            removed_rounds: report.removed_rounds,
            timestamp: timestamp(),
        });
        store.save(&record)
    }

    /// 回滚到打开时的状态：记录（含压缩日志）与镜像都写回快照
    pub fn rollback(&self, handle: &SessionHandle) -> anyhow::Result<()> {
        let store = ConversationPersistence::new(&handle.path);
        if store.load()? != handle.snapshot {
            store.save(&handle.snapshot)?;
        }
        let mirror = store.mirror();
        match &handle.mirror_snapshot {
            Some(full) => {
                if mirror.load()? != *full {
                    mirror.save(full)?;
                }
            }
            None if mirror.exists() => std::fs::remove_file(mirror.path())?,
            None => {}
        }
        debug!(user_id = %handle.user_id, baseline = handle.baseline(), "session rolled back");
        Ok(())
    }

    /// 轮数达到 3 且未重命名过时，改名为 `<created_at>_<slug>` 并更新指针；返回是否改名
    pub fn finalize(&self, handle: &mut SessionHandle) -> anyhow::Result<bool> {
        let store = ConversationPersistence::new(&handle.path);
        let mut record = store.load()?;
        if record.renamed || record.rounds < RENAME_AFTER_ROUNDS {
            return Ok(false);
        }

        let first_user = record
            .messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.text().to_string())
            .unwrap_or_default();
        let slug = slugify(&first_user);
        let created_at = if record.created_at.is_empty() {
            timestamp()
        } else {
            record.created_at.clone()
        };
        let user_dir = self.user_dir(&handle.user_id);
        let new_name = unique_name(&user_dir, &format!("{created_at}_{slug}"));
        let new_path = user_dir.join(format!("{new_name}.json"));

        record.name = new_name.clone();
        record.renamed = true;
        store.save(&record)?;
        let mirror = store.mirror();
        if mirror.exists() {
            let mut full = mirror.load()?;
            full.name = new_name.clone();
            full.renamed = true;
            mirror.save(&full)?;
        }

        std::fs::rename(store.path(), &new_path)?;
        let new_store = ConversationPersistence::new(&new_path);
        if mirror.exists() {
            std::fs::rename(mirror.path(), new_store.mirror().path())?;
        }
        save_pointer(&user_dir, &file_name(&new_path))?;
        info!(user_id = %handle.user_id, name = %new_name, "session renamed");
        handle.path = new_path;
        Ok(true)
    }

    /// 所有会话的显示名（按文件名排序）
    pub fn list_sessions(&self, user_id: &str) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        for path in record_files(&self.user_dir(user_id))? {
            names.push(self.display_name(&path)?);
        }
        Ok(names)
    }

    /// 按显示名或文件名切换当前会话
    pub fn switch_session(&self, user_id: &str, name: &str) -> anyhow::Result<Option<PathBuf>> {
        let user_dir = self.user_dir(user_id);
        for path in record_files(&user_dir)? {
            let record = ConversationPersistence::new(&path).load()?;
            if record.name == name || file_name(&path) == name {
                save_pointer(&user_dir, &file_name(&path))?;
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    /// 新建会话（名称为当前时间戳，冲突时加 `_<n>`）并设为当前会话
    pub fn create_session(&self, user_id: &str) -> anyhow::Result<PathBuf> {
        let user_dir = self.user_dir(user_id);
        std::fs::create_dir_all(&user_dir)?;
        let ts = timestamp();
        let name = unique_name(&user_dir, &ts);
        let path = user_dir.join(format!("{name}.json"));
        let store = ConversationPersistence::new(&path);
        let record = ConversationRecord::new(name, ts);
        store.save(&record)?;
        store.mirror().save(&record)?;
        save_pointer(&user_dir, &file_name(&path))?;
        Ok(path)
    }

    pub fn display_name(&self, path: &Path) -> anyhow::Result<String> {
        let record = ConversationPersistence::new(path).load()?;
        if record.name.is_empty() {
            Ok(file_name(path))
        } else {
            Ok(record.name)
        }
    }

    pub fn rounds(&self, path: &Path) -> anyhow::Result<usize> {
        Ok(ConversationPersistence::new(path).load()?.rounds)
    }

    pub fn message_count(&self, path: &Path) -> anyhow::Result<usize> {
        Ok(ConversationPersistence::new(path).load()?.messages.len())
    }

    pub fn load_messages(&self, path: &Path) -> anyhow::Result<Vec<Message>> {
        Ok(ConversationPersistence::new(path).load()?.messages)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn record_files(user_dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if !user_dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(user_dir)? {
        let path = entry?.path();
        if path.is_file() && is_record_file(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn latest_record(user_dir: &Path) -> anyhow::Result<Option<PathBuf>> {
    let mut latest: Option<(SystemTime, PathBuf)> = None;
    for path in record_files(user_dir)? {
        let modified = std::fs::metadata(&path)?.modified()?;
        if latest.as_ref().map_or(true, |(t, _)| modified > *t) {
            latest = Some((modified, path));
        }
    }
    Ok(latest.map(|(_, p)| p))
}

/// `<base>` 已被占用时依次尝试 `<base>_2`、`<base>_3` ...
fn unique_name(user_dir: &Path, base: &str) -> String {
    let taken = |name: &str| user_dir.join(format!("{name}.json")).exists();
    if !taken(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{base}_{n}"))
        .find(|name| !taken(name))
        .unwrap_or_else(|| base.to_string())
}

static WHITESPACE_RE: OnceLock<Regex> = OnceLock::new();
static SLUG_DISALLOWED_RE: OnceLock<Regex> = OnceLock::new();

/// 文件名短标题：空白转 `_`，截 20 字，只留字母数字 `_` `-` 与 CJK，去首尾 `_`；为空时为 `chat`
pub fn slugify(text: &str) -> String {
    let ws = WHITESPACE_RE.get_or_init(|| Regex::new(r"\s+").unwrap());
    let disallowed =
        SLUG_DISALLOWED_RE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9_\x{4e00}-\x{9fff}-]").unwrap());

    let collapsed = ws.replace_all(text.trim(), "_");
    let head: String = collapsed.chars().take(SLUG_CHARS).collect();
    let cleaned = disallowed.replace_all(&head, "");
    let slug = cleaned.trim_matches('_');
    if slug.is_empty() {
        "chat".to_string()
    } else {
        slug.to_string()
    }
}
