//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use traits::{ChatRequest, ChatResponse, LlmClient, LlmError};

use crate::config::LlmSection;

/// 按配置创建 LLM 客户端；provider=mock 或未设置 API Key 时退回 Mock
pub fn create_llm_from_config(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    if cfg.provider.eq_ignore_ascii_case("mock") {
        return Arc::new(MockLlmClient::new());
    }
    let api_key = match std::env::var(&cfg.api_key_env) {
        Ok(k) if !k.trim().is_empty() => k,
        _ => {
            tracing::warn!(env = %cfg.api_key_env, "API key not set, falling back to mock LLM");
            return Arc::new(MockLlmClient::new());
        }
    };
    let base_url = cfg
        .base_url
        .clone()
        .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
    match OpenAiClient::new(
        &base_url,
        &cfg.model,
        &api_key,
        Duration::from_secs(cfg.timeout_secs),
    ) {
        Ok(client) => {
            tracing::info!(model = %cfg.model, base_url = %base_url, "LLM client ready");
            Arc::new(client)
        }
        Err(e) => {
            tracing::error!("failed to create LLM client: {}, falling back to mock", e);
            Arc::new(MockLlmClient::new())
        }
    }
}
