//! 聊天 CLI 客户端
//!
//! 非交互式 CLI：按手机号登录，打印会话列表变化和收到的消息，可选打开一个会话并发送一条消息。
//! `--demo` 使用进程内网关和预置数据，无需后端。

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use clap::Parser;
use periskope_chat_core::im::auth::DEMO_OTP;
use periskope_chat_core::im::client::{ChatClient, ClientConfig};
use periskope_chat_core::im::conversation::{ChatSummary, RosterListener};
use periskope_chat_core::im::error::ChatError;
use periskope_chat_core::im::gateway::{Gateway, MemoryGateway};
use periskope_chat_core::im::message::{
    day_label, format_message_time, format_roster_date, group_by_day, TranscriptEntry,
    TranscriptItem, TranscriptListener,
};
use periskope_chat_core::im::session::{MemoryStorage, SessionStore};
use periskope_chat_core::im::types::{tables, Message};
use serde_json::json;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

/// 聊天 CLI 客户端
#[derive(Parser, Debug)]
#[command(name = "chat-cli")]
#[command(about = "聊天 CLI 客户端 - 登录后展示会话列表和实时消息", long_about = None)]
struct Args {
    /// 10 位手机号（不含区号）
    #[arg(short, long, default_value = "9876543210")]
    phone: String,

    /// 验证码（演示环境固定为 123456）
    #[arg(long, default_value = DEMO_OTP)]
    otp: String,

    /// 手机号未注册时用这个名字注册
    #[arg(long)]
    name: Option<String>,

    /// 后端 API 地址
    #[arg(long, env = "CHAT_API_URL")]
    api_url: Option<String>,

    /// 后端访问密钥
    #[arg(long, env = "CHAT_API_KEY")]
    api_key: Option<String>,

    /// 本地会话数据库 URL
    #[arg(long)]
    session_db: Option<String>,

    /// 使用内置演示数据，不连接后端
    #[arg(long)]
    demo: bool,

    /// 要打开的会话 ID（默认打开列表中的第一个会话）
    #[arg(short, long)]
    chat: Option<String>,

    /// 打开会话后发送的一条消息
    #[arg(short, long)]
    send: Option<String>,

    /// 运行时长（秒），0 表示持续运行
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// 日志级别（默认: info,periskope_chat_core=debug）
    #[arg(long, default_value = "info,periskope_chat_core=debug")]
    log_level: String,
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG（如果设置了），否则使用命令行参数
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("debug.log")
        .context("无法创建日志文件 debug.log")?;

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    // 文件不需要颜色
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    info!("[CLI] 📝 日志已同时输出到控制台和文件: debug.log");
    Ok(())
}

struct CliRosterListener;

#[async_trait::async_trait]
impl RosterListener for CliRosterListener {
    async fn on_roster_changed(&self, roster: Vec<ChatSummary>) {
        info!("[CLI/Roster] 📋 会话列表（共 {} 个）:", roster.len());
        for chat in roster.iter().take(5) {
            let date = chat
                .latest_message
                .as_ref()
                .map(|m| format_roster_date(m.created_at, &Local))
                .unwrap_or_default();
            let labels: Vec<&str> = chat.labels.iter().map(|l| l.name.as_str()).collect();
            info!(
                "[CLI/Roster]   - {} [{}] {} | {} {}",
                chat.title(),
                chat.kind().as_str(),
                date,
                chat.preview(),
                if labels.is_empty() {
                    String::new()
                } else {
                    format!("#{}", labels.join(" #"))
                }
            );
        }
    }

    async fn on_sync_failed(&self, reason: String) {
        error!("[CLI/Roster] ❌ 会话列表同步失败: {}", reason);
    }
}

struct CliTranscriptListener;

#[async_trait::async_trait]
impl TranscriptListener for CliTranscriptListener {
    async fn on_history(&self, messages: Vec<Message>) {
        let entries: Vec<TranscriptEntry> =
            messages.into_iter().map(TranscriptEntry::confirmed).collect();
        let today = Local::now().date_naive();
        for item in group_by_day(&entries, &Local) {
            match item {
                TranscriptItem::DaySeparator(day) => {
                    info!("[CLI/Chat] ──── {} ────", day_label(day, today))
                }
                TranscriptItem::Entry(entry) => info!(
                    "[CLI/Chat] {} {}: {}",
                    format_message_time(entry.message.created_at, &Local),
                    entry.message.sender_name(),
                    entry.message.content
                ),
            }
        }
    }

    async fn on_new_message(&self, message: Message) {
        info!(
            "[CLI/Chat] 📨 {} {}: {}",
            format_message_time(message.created_at, &Local),
            message.sender_name(),
            message.content
        );
    }

    async fn on_transcript_changed(&self, _entries: Vec<TranscriptEntry>) {}

    async fn on_sync_failed(&self, reason: String) {
        error!("[CLI/Chat] ❌ 消息同步失败: {}", reason);
    }
}

/// 演示数据：演示用户（手机号 9876543210）和两位同事，一个私聊一个群聊
fn seed_demo(gateway: &MemoryGateway) {
    let day = |offset: i64| (Utc::now() - chrono::Duration::days(offset)).to_rfc3339();
    gateway.seed(
        tables::USERS,
        vec![
            json!({"id": "demo-me", "full_name": "Periskope Demo", "mobile_number": "+919876543210", "role": "member"}),
            json!({"id": "demo-roshan", "full_name": "Roshnag Airtel", "mobile_number": "+919718440010", "role": "member"}),
            json!({"id": "demo-bharat", "full_name": "Bharat Kumar", "mobile_number": "+919811112222", "role": "member"}),
        ],
    );
    gateway.seed(
        tables::CHATS,
        vec![
            json!({"id": "demo-private", "type": "private", "created_by": "demo-me", "created_at": day(3)}),
            json!({"id": "demo-group", "type": "group", "name": "Test Skope Final 5", "created_by": "demo-me", "created_at": day(2)}),
        ],
    );
    gateway.seed(
        tables::CHAT_MEMBERS,
        vec![
            json!({"chat_id": "demo-private", "user_id": "demo-me", "joined_at": day(3)}),
            json!({"chat_id": "demo-private", "user_id": "demo-roshan", "joined_at": day(3)}),
            json!({"chat_id": "demo-group", "user_id": "demo-me", "joined_at": day(2)}),
            json!({"chat_id": "demo-group", "user_id": "demo-roshan", "joined_at": day(2)}),
            json!({"chat_id": "demo-group", "user_id": "demo-bharat", "joined_at": day(2)}),
        ],
    );
    gateway.seed(
        tables::MESSAGES,
        vec![
            json!({"id": "demo-m1", "chat_id": "demo-private", "sender_id": "demo-roshan", "content": "Hi there!", "type": "text", "created_at": day(3)}),
            json!({"id": "demo-m2", "chat_id": "demo-group", "sender_id": "demo-bharat", "content": "Support2: This doesn't go on Tuesday...", "type": "text", "created_at": day(1)}),
            json!({"id": "demo-m3", "chat_id": "demo-group", "sender_id": "demo-me", "content": "Noted, thanks", "type": "text", "created_at": day(0)}),
        ],
    );
    gateway.seed(
        tables::LABELS,
        vec![
            json!({"id": "demo-l1", "name": "Demo", "color": "#fff7ed", "text_color": "#c2410c"}),
            json!({"id": "demo-l2", "name": "internal", "color": "#f0fdf4", "text_color": "#15803d"}),
        ],
    );
    gateway.seed(
        tables::CHAT_LABELS,
        vec![json!({"chat_id": "demo-group", "label_id": "demo-l1", "assigned_by": "demo-me"})],
    );
}

/// 演示模式下模拟对方发来一条消息
fn spawn_demo_peer(gateway: MemoryGateway) {
    tokio::spawn(async move {
        sleep(Duration::from_secs(2)).await;
        let result = gateway
            .insert(
                tables::MESSAGES,
                json!({"chat_id": "demo-group", "sender_id": "demo-roshan", "content": "Live from the demo peer 👋", "type": "text"}),
            )
            .await;
        if let Err(e) = result {
            warn!("[CLI] 演示消息写入失败: {:#}", e);
        }
    });
}

async fn build_client(args: &Args) -> Result<ChatClient> {
    if args.demo {
        let gateway = MemoryGateway::new();
        seed_demo(&gateway);
        spawn_demo_peer(gateway.clone());
        let config = ClientConfig::new("http://localhost".to_string(), "demo".to_string());
        return Ok(ChatClient::with_gateway(
            config,
            Arc::new(gateway),
            SessionStore::new(Arc::new(MemoryStorage::new())),
        ));
    }

    let api_url = args
        .api_url
        .clone()
        .context("缺少 --api-url（或环境变量 CHAT_API_URL），也可以使用 --demo")?;
    let api_key = args
        .api_key
        .clone()
        .context("缺少 --api-key（或环境变量 CHAT_API_KEY）")?;
    let mut config = ClientConfig::new(api_url, api_key);
    if let Some(db) = &args.session_db {
        config.session_db_url = db.clone();
    }
    Ok(ChatClient::connect(config).await?)
}

async fn sign_in(client: &mut ChatClient, args: &Args) -> Result<()> {
    if let Some(user) = client.restore_session().await {
        if user.mobile_number.ends_with(&args.phone) {
            info!("[CLI] ✅ 使用已保存的登录会话: {}", user.full_name);
            return Ok(());
        }
    }

    info!("[CLI] 🔐 正在登录...");
    let user = match client.sign_in(&args.phone, &args.otp).await {
        Ok(user) => user,
        Err(ChatError::NotFound(_)) if args.name.is_some() => {
            let name = args.name.clone().unwrap_or_default();
            info!("[CLI] 手机号未注册，使用名字 {} 注册", name);
            client.sign_up(&args.phone, &args.otp, &name).await?
        }
        Err(e) => return Err(anyhow::anyhow!("登录失败: {}", e.user_message())),
    };
    info!("[CLI] ✅ 登录成功！{}（{}）", user.full_name, user.id);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(&args.log_level)?;

    info!("[CLI] 🚀 聊天 CLI 客户端{}", if args.demo { "（演示模式）" } else { "" });
    info!("[CLI] 📱 手机号: {}", args.phone);
    info!("[CLI] ⏱️  运行时长: {} 秒（0=持续运行）", args.duration);

    let mut client = build_client(&args).await?;
    client.set_roster_listener(Arc::new(CliRosterListener));
    client.set_transcript_listener(Arc::new(CliTranscriptListener));
    sign_in(&mut client, &args).await?;

    let roster = client.start_roster().await?;

    // 等首次拉取完成后决定打开哪个会话
    let mut chat_id = args.chat.clone();
    if chat_id.is_none() {
        for _ in 0..50 {
            if let Some(first) = roster.roster().first() {
                chat_id = Some(first.id().to_string());
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
    }

    if let Some(chat_id) = chat_id {
        info!("[CLI] 📂 打开会话: {}", chat_id);
        let transcript = client.select_conversation(&chat_id).await?;
        if let Some(text) = &args.send {
            for _ in 0..50 {
                if transcript.is_loaded() {
                    break;
                }
                sleep(Duration::from_millis(100)).await;
            }
            match client.send_text(text).await {
                Ok(message) => info!("[CLI] ✅ 已发送: {}", message.id),
                Err(e) => error!("[CLI] ❌ 发送失败: {}", e.user_message()),
            }
        }
    } else {
        info!("[CLI] 会话列表为空，只监听会话列表变化");
    }

    info!("[CLI] 📥 开始监听消息...");
    if args.duration > 0 {
        info!("[CLI] ⏰ {} 秒后自动退出", args.duration);
        tokio::select! {
            _ = sleep(Duration::from_secs(args.duration)) => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    } else {
        info!("[CLI] ⏰ 持续运行中，按 Ctrl+C 退出");
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("[CLI] 监听 Ctrl+C 失败: {}", e);
        }
    }

    client.shutdown().await;
    info!("[CLI] 👋 程序退出");
    Ok(())
}
