//! 对话持久化
//!
//! 单个会话记录以 JSON 文件保存：`<name>.json` 为送入模型的记录（可被压缩），
//! `<name>_full.json` 为只追加的完整镜像。所有写入先写临时文件再 rename，保证原子性。

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::memory::{count_rounds, Message};

/// 一次自动压缩的记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionEvent {
    pub summary: String,
    pub removed_count: usize,
    pub removed_rounds: usize,
    pub timestamp: String,
}

/// 会话记录（文件内容）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub name: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub renamed: bool,
    #[serde(default)]
    pub rounds: usize,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compression_log: Vec<CompressionEvent>,
}

impl ConversationRecord {
    pub fn new(name: impl Into<String>, created_at: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            created_at: created_at.into(),
            renamed: false,
            rounds: 0,
            messages: Vec::new(),
            compression_log: Vec::new(),
        }
    }

    /// 重新计算轮数
    pub fn recount(&mut self) {
        self.rounds = count_rounds(&self.messages);
    }
}

/// 统一时间戳格式（本地时间）
pub fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// 单个记录文件的读写
#[derive(Debug, Clone)]
pub struct ConversationPersistence {
    path: PathBuf,
}

impl ConversationPersistence {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 对应的完整镜像文件：`<stem>_full.json`
    pub fn mirror(&self) -> ConversationPersistence {
        Self::new(mirror_path(&self.path))
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// 从 JSON 文件加载；文件不存在时返回以文件名命名的空记录
    pub fn load(&self) -> anyhow::Result<ConversationRecord> {
        if !self.path.exists() {
            let name = self
                .path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            return Ok(ConversationRecord::new(name, String::new()));
        }
        let data = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        let record = serde_json::from_str(&data)
            .with_context(|| format!("parse {}", self.path.display()))?;
        Ok(record)
    }

    /// 原子写入；父目录不存在时自动创建
    pub fn save(&self, record: &ConversationRecord) -> anyhow::Result<()> {
        write_json_atomic(&self.path, record)
    }
}

/// 完整镜像路径；已是镜像路径时原样返回
pub fn mirror_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    if stem.ends_with("_full") {
        return path.to_path_buf();
    }
    path.with_file_name(format!("{stem}_full.json"))
}

/// 是否为会话记录文件（排除镜像与 state.json）
pub fn is_record_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.ends_with(".json") && !name.ends_with("_full.json") && name != STATE_FILE
}

pub const STATE_FILE: &str = "state.json";

/// state.json：当前会话指针
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionPointer {
    pub current_file: Option<String>,
}

pub fn load_pointer(user_dir: &Path) -> anyhow::Result<SessionPointer> {
    let path = user_dir.join(STATE_FILE);
    if !path.exists() {
        return Ok(SessionPointer::default());
    }
    let data = std::fs::read_to_string(&path)?;
    match serde_json::from_str(&data) {
        Ok(pointer) => Ok(pointer),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt session pointer, ignoring");
            Ok(SessionPointer::default())
        }
    }
}

pub fn save_pointer(user_dir: &Path, current_file: &str) -> anyhow::Result<()> {
    write_json_atomic(
        &user_dir.join(STATE_FILE),
        &SessionPointer {
            current_file: Some(current_file.to_string()),
        },
    )
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename to {}", path.display()))?;
    Ok(())
}
