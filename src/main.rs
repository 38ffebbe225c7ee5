//! Angel CLI
//!
//! 入口：初始化日志、加载配置、创建 Agent 与任务协调器，然后按行读取标准输入。
//! 每行作为一条用户消息提交；回复、提问与提示从 Outbound 通道打印到标准输出。

use std::path::PathBuf;
use std::sync::Arc;

use angel::config::{load_config, AppConfig};
use angel::core::{Outbound, Submission, TaskCoordinator};
use angel::Agent;
use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const CLI_USER: &str = "cli";

fn render(message: &Outbound) -> String {
    match message {
        Outbound::Reply { seq, text, .. } => format!("[{seq}] {text}"),
        Outbound::Question { text, .. } => format!("? {text}"),
        Outbound::Notice { text, .. } => format!("* {text}"),
        Outbound::Error { text, .. } => format!("! {text}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖；写到 stderr，避免与对话输出混在一起
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("failed to load config, using defaults: {}", e);
        AppConfig::default()
    });

    let agent = Arc::new(Agent::from_config(&cfg).context("Failed to create agent")?);
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let coordinator = TaskCoordinator::new(agent, cfg.app.cancel_keyword.clone(), outbound_tx);

    let printer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            println!("{}", render(&message));
        }
    });

    println!(
        "angel 已就绪。输入任务开始对话，输入【{}】取消当前任务，/quit 退出。",
        cfg.app.cancel_keyword
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if matches!(line, "/quit" | "/exit") {
            break;
        }
        if coordinator.submit(CLI_USER, line) == Submission::Cancelled {
            tracing::debug!("cancel requested from cli");
        }
    }

    drop(coordinator);
    printer.abort();
    Ok(())
}
