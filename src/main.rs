use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tracing::{error, info, warn};

use chaos_core::{logging::init_tracing, AppConfig};

mod app;
mod shutdown;

use app::Application;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("chaos-orchestrator")
        .version(env!("CARGO_PKG_VERSION"))
        .about("混沌工程分布式故障编排引擎")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时按默认路径查找"),
        )
        .arg(
            Arg::new("node-id")
                .long("node-id")
                .value_name("ID")
                .help("节点ID，覆盖配置文件中的值"),
        )
        .arg(
            Arg::new("members")
                .long("members")
                .value_name("COUNT")
                .help("本进程内模拟的集群成员数量")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty", "compact"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mut config = AppConfig::load(config_path).with_context(|| {
        format!("加载配置失败: {}", config_path.unwrap_or("<默认路径>"))
    })?;

    if let Some(node_id) = matches.get_one::<String>("node-id") {
        config.node.node_id = node_id.clone();
    }
    if let Some(members) = matches.get_one::<usize>("members") {
        config.node.local_members = *members;
    }
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format.clone();
    }
    config.validate()?;

    init_tracing(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;

    info!("启动混沌故障编排引擎");
    info!(
        "节点: {}，本地成员数: {}，存储: {:?}",
        config.node.node_id, config.node.local_members, config.store.backend
    );

    let app = Arc::new(Application::new(config).await?);
    let (trigger, signal) = shutdown::channel();

    let app_handle = {
        let app = Arc::clone(&app);
        tokio::spawn(async move {
            if let Err(e) = app.run(signal).await {
                error!("应用运行失败: {e}");
            }
        })
    };

    let received = shutdown::wait_for_os_signal().await;
    info!("收到{received}信号，开始优雅关闭...");
    trigger.trigger(received);

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Ok(())) => info!("应用已优雅关闭"),
        Ok(Err(e)) => error!("应用关闭时发生错误: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    info!("混沌故障编排引擎已退出");
    Ok(())
}
