//! 记忆层：消息模型、token 估算、摘要、上下文窗口、会话持久化与按用户历史

pub mod conversation;
pub mod history;
pub mod persistence;
pub mod summarizer;
pub mod token_budget;
pub mod window;

pub use conversation::{count_rounds, latest_user_text, Message, Role, ToolCall};
pub use history::{slugify, HistoryStore, SessionHandle};
pub use persistence::{CompressionEvent, ConversationPersistence, ConversationRecord};
pub use summarizer::{
    summarize_with_fallback, HeuristicSummarizer, LlmSummarizer, StructuredSummary, Summarizer,
};
pub use token_budget::TokenEstimator;
pub use window::{extract_spill_path, CompressionReport, ContextWindowManager, SpillStore};
