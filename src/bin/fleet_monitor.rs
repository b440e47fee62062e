//! fleet-monitor - Gateway Agent 集群监控
//!
//! 子命令：
//! - `watch`（默认）：连接所有 Gateway，先输出快照，再逐行输出事件（JSONL），Ctrl-C 退出
//! - `sessions`：列出归档会话
//! - `trace <key>`：单个会话的逐条轨迹
//! - `delegations [--days N]`：委派树及汇总
//!
//! 配置文件：`--config <path>` > `FLEET_MONITOR_CONFIG` > `~/.fleet-monitor/config.json`

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use gateway_fleet_monitor::{spawn_collector, EventType, MonitorConfig, SessionArchive};
use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const USAGE: &str = "用法: fleet-monitor [--config <path>] [watch | sessions | trace <key> | delegations [--days N]]";

enum Command {
    Watch,
    Sessions,
    Trace(String),
    Delegations { days: Option<i64> },
}

struct Args {
    config: Option<PathBuf>,
    command: Command,
}

fn parse_args(args: &[String]) -> Result<Args> {
    let mut config = None;
    let mut positional = Vec::new();
    let mut days = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = iter.next().context("--config 需要路径参数")?;
                config = Some(PathBuf::from(path));
            }
            "--days" => {
                let value = iter.next().context("--days 需要数字参数")?;
                days = Some(value.parse::<i64>().context("--days 必须是整数")?);
            }
            "-h" | "--help" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            _ => positional.push(arg.clone()),
        }
    }

    let command = match positional.first().map(String::as_str) {
        None | Some("watch") => Command::Watch,
        Some("sessions") => Command::Sessions,
        Some("trace") => match positional.get(1) {
            Some(key) => Command::Trace(key.clone()),
            None => bail!("trace 需要会话 key\n{}", USAGE),
        },
        Some("delegations") => Command::Delegations { days },
        Some(other) => bail!("未知命令: {}\n{}", other, USAGE),
    };

    Ok(Args { config, command })
}

fn load_config(path: Option<PathBuf>) -> Result<MonitorConfig> {
    let path = path.unwrap_or_else(MonitorConfig::default_path);
    if !path.exists() {
        tracing::warn!("Config {:?} not found, using defaults", path);
        return Ok(MonitorConfig::default());
    }
    MonitorConfig::load(&path).with_context(|| format!("加载配置失败: {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn watch(config: MonitorConfig) -> Result<()> {
    if config.agents.is_empty() {
        bail!("配置中没有 agent");
    }

    tracing::info!(
        "🚀 Watching {} agents over {} gateways",
        config.agents.len(),
        config.gateway_count()
    );

    let handle = spawn_collector(config.collector_config(), config.agents.clone());
    let mut events = handle.subscribe(&[EventType::Update, EventType::HostMetrics]);

    let snapshot = handle.snapshot().await?;
    println!("{}", serde_json::to_string(&snapshot)?);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if let Some(line) = event.to_json_line() {
                        let mut stdout = std::io::stdout().lock();
                        stdout.write_all(line.as_bytes())?;
                        stdout.flush()?;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl-C");
                break;
            }
        }
    }

    handle.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志（输出到 stderr，stdout 只有 JSON）
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("gateway_fleet_monitor=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args = parse_args(&args)?;
    let config = load_config(args.config)?;

    match args.command {
        Command::Watch => watch(config).await?,
        Command::Sessions => {
            let archive = SessionArchive::new(config.agents_dir());
            print_json(&archive.list_sessions())?;
        }
        Command::Trace(key) => {
            let archive = SessionArchive::new(config.agents_dir());
            match archive.get_session_trace(&key) {
                Some(trace) => print_json(&trace)?,
                None => bail!("会话不存在: {}", key),
            }
        }
        Command::Delegations { days } => {
            let mut archive = SessionArchive::new(config.agents_dir());
            if let Some(days) = days {
                archive = archive.with_window(chrono::Duration::days(days));
            }
            print_json(&archive.get_delegation_traces())?;
        }
    }

    tracing::info!("👋 fleet-monitor exiting");
    Ok(())
}
