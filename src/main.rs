use anyhow::{Context, Result};
use clap::{Arg, Command};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use longtask_core::NodeConfig;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // 解析命令行参数
    let matches = Command::new("longtask")
        .version("0.1.0")
        .about("PostgreSQL协调的分布式长任务节点")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径"),
        )
        .arg(
            Arg::new("worker-id")
                .short('w')
                .long("worker-id")
                .value_name("ID")
                .help("本节点worker编号，每个运行实例必须唯一")
                .value_parser(clap::value_parser!(i32)),
        )
        .arg(
            Arg::new("group-id")
                .short('g')
                .long("group-id")
                .value_name("ID")
                .help("竞争组编号")
                .value_parser(clap::value_parser!(i32)),
        )
        .arg(
            Arg::new("max-tasks")
                .short('n')
                .long("max-tasks")
                .value_name("COUNT")
                .help("最大并发任务数")
                .value_parser(clap::value_parser!(i32)),
        )
        .arg(
            Arg::new("node-name")
                .long("node-name")
                .value_name("NAME")
                .help("节点显示名，默认为主机名"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .default_value("info"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"])
                .default_value("pretty"),
        )
        .get_matches();

    let log_level = matches.get_one::<String>("log-level").expect("有默认值");
    let log_format = matches.get_one::<String>("log-format").expect("有默认值");
    init_logging(log_level, log_format)?;

    // 加载配置并用命令行覆盖节点身份
    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mut config = NodeConfig::load(config_path)
        .with_context(|| format!("加载配置失败: {}", config_path.unwrap_or("(默认)")))?;
    if let Some(id) = matches.get_one::<i32>("worker-id") {
        config.worker_id = *id;
    }
    if let Some(id) = matches.get_one::<i32>("group-id") {
        config.group_id = *id;
    }
    if let Some(n) = matches.get_one::<i32>("max-tasks") {
        config.max_task_count = *n;
    }
    if let Some(name) = matches.get_one::<String>("node-name") {
        config.node_name = name.clone();
    }
    config.validate().context("配置校验失败")?;

    info!("启动长任务节点");
    longtask_worker::run(config).await?;
    Ok(())
}

/// 初始化日志系统
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}
