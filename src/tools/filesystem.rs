//! 沙箱文件系统工具
//!
//! SafeFs 绑定 root_dir，所有路径经 resolve 校验必须在 root 下（禁止 ../ 逃逸）；
//! ReadTool 基于 SafeFs 按行读取文本文件，主要用于回读落盘的超长工具输出。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::core::AgentError;
use crate::tools::schema::{parameters_for, parse_args};
use crate::tools::{Tool, ToolContext};

const DEFAULT_LIMIT: usize = 200;
const MAX_LIMIT: usize = 500;
/// 单次返回的字符上限，保持在超长落盘阈值之下
const MAX_CHARS: usize = 9_000;

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下，防止路径逃逸
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    /// 检查路径是否在沙箱内
    pub fn resolve(&self, path: &str) -> Result<PathBuf, AgentError> {
        let path = path.trim().trim_start_matches("./");
        let full = self.root_dir.join(path);
        let canonical = full
            .canonicalize()
            .map_err(|_| AgentError::ToolExecutionFailed(format!("文件不存在: {}", path)))?;
        let root_canon = self
            .root_dir
            .canonicalize()
            .unwrap_or_else(|_| self.root_dir.clone());
        if canonical.starts_with(root_canon) {
            Ok(canonical)
        } else {
            Err(AgentError::PathEscape(path.to_string())) // 如 ../../etc/passwd
        }
    }

    pub fn read_file(&self, path: &str) -> Result<String, AgentError> {
        let resolved = self.resolve(path)?;
        if !resolved.is_file() {
            return Err(AgentError::ToolExecutionFailed(format!("不是文件: {}", path)));
        }
        let bytes = std::fs::read(&resolved)
            .map_err(|e| AgentError::ToolExecutionFailed(format!("Read failed: {}", e)))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ReadArgs {
    /// 相对工作目录的文件路径
    path: String,
    /// 起始行（从 1 开始）
    #[serde(default)]
    offset: Option<usize>,
    /// 最多返回的行数（默认 200，上限 500）
    #[serde(default)]
    limit: Option<usize>,
}

/// Read 工具：带行号读取文本文件
pub struct ReadTool {
    fs: SafeFs,
}

impl ReadTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }

    fn render(content: &str, offset: usize, limit: usize) -> String {
        let mut out = String::new();
        let mut chars = 0usize;
        for (idx, line) in content.lines().enumerate().skip(offset - 1).take(limit) {
            let line = format!("{:>6}: {}\n", idx + 1, line.trim_end());
            chars += line.chars().count();
            if chars > MAX_CHARS {
                out.push_str("...\n");
                break;
            }
            out.push_str(&line);
        }
        if out.is_empty() {
            "没有可展示的内容。".to_string()
        } else {
            out.trim_end().to_string()
        }
    }
}

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read a text file with line numbers (agent working directory only). \
         Use offset/limit to page through long files, e.g. spilled tool outputs under tool_outputs/."
    }

    fn parameters_schema(&self) -> Value {
        parameters_for::<ReadArgs>()
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<String, String> {
        let args: ReadArgs = parse_args(args)?;
        tracing::info!(path = %args.path, "read tool execute");
        let content = self.fs.read_file(&args.path).map_err(|e| e.to_string())?;
        let offset = args.offset.unwrap_or(1).max(1);
        let limit = args.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        Ok(Self::render(&content, offset, limit))
    }
}
