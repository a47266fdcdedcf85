use std::path::Path;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use draftwork::{
    Application, DocumentParseTask, PutOptions, TaskAdapter, TextEnhanceTask, TextProcessTask,
    TypedTask,
};
use draftwork_config::AppConfig;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn cli() -> Command {
    Command::new("draftwork")
        .version(env!("CARGO_PKG_VERSION"))
        .about("后台任务执行: 文档解析, 文本处理与分层存储")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"])
                .global(true),
        )
        .subcommand(
            Command::new("parse")
                .about("解析文档 (txt, docx, pdf)")
                .arg(Arg::new("file").value_name("FILE").required(true))
                .arg(
                    Arg::new("mime")
                        .long("mime")
                        .value_name("TYPE")
                        .help("MIME type, overrides the file extension"),
                )
                .arg(
                    Arg::new("save")
                        .long("save")
                        .action(ArgAction::SetTrue)
                        .help("将解析结果保存到存储"),
                ),
        )
        .subcommand(
            Command::new("enhance")
                .about("规范化文本中的空白和标点")
                .arg(Arg::new("text").value_name("TEXT").required(true)),
        )
        .subcommand(
            Command::new("process")
                .about("将文本文件切分为块")
                .arg(Arg::new("file").value_name("FILE").required(true))
                .arg(
                    Arg::new("chunk-size")
                        .long("chunk-size")
                        .value_name("CHARS")
                        .value_parser(clap::value_parser!(usize)),
                ),
        )
        .subcommand(Command::new("storage-stats").about("显示存储指标"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config_path = matches.get_one::<String>("config");
    let config = AppConfig::load(config_path.map(String::as_str))
        .with_context(|| format!("加载配置失败: {}", config_path.map_or("<default>", |p| p)))?;

    let log_level = matches
        .get_one::<String>("log-level")
        .cloned()
        .unwrap_or_else(|| config.logging.level.to_string());
    let log_format = matches
        .get_one::<String>("log-format")
        .cloned()
        .unwrap_or_else(|| format!("{:?}", config.logging.format).to_lowercase());
    init_logging(&log_level, &log_format)?;

    let app = Application::new(config).await?;
    app.init().await;

    let outcome = run_command(&app, &matches).await;
    app.shutdown().await;
    outcome
}

async fn run_command(app: &Application, matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("parse", args)) => {
            let path = required(args, "file")?;
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("读取文件失败: {path}"))?;
            let file_name = Path::new(path)
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or(path)
                .to_string();

            let mut task = DocumentParseTask::new(bytes, file_name);
            if let Some(mime) = args.get_one::<String>("mime") {
                task = task.with_mime_type(mime.clone());
            }
            let submitted = task.submit(app.pool())?;
            let task_id = submitted.id().to_string();
            let parsed = wait_or_cancel(app, submitted).await?;

            if args.get_flag("save") {
                let key = format!("document_{task_id}");
                let metadata = serde_json::json!({
                    "file_name": parsed.file_name,
                    "format": parsed.format,
                    "word_count": parsed.word_count,
                });
                if app
                    .storage()
                    .put(&key, &parsed.text, metadata, PutOptions::default())
                    .await
                {
                    info!("解析结果已保存: {}", key);
                } else {
                    warn!("解析结果保存失败: {}", key);
                }
            }
            print_json(&parsed)
        }
        Some(("enhance", args)) => {
            let text = required(args, "text")?;
            let submitted = TextEnhanceTask::new(text.clone()).submit(app.pool())?;
            print_json(&wait_or_cancel(app, submitted).await?)
        }
        Some(("process", args)) => {
            let path = required(args, "file")?;
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("读取文件失败: {path}"))?;
            let mut task = TextProcessTask::new(text);
            if let Some(size) = args.get_one::<usize>("chunk-size") {
                task = task.with_chunk_size(*size);
            }
            let submitted = task.submit(app.pool())?;
            print_json(&wait_or_cancel(app, submitted).await?)
        }
        Some(("storage-stats", _)) => {
            print_json(&serde_json::json!({
                "storage": app.storage().metrics().await,
                "circuit_breakers": app.circuit_breakers().stats().await,
                "pool": app.pool().pool_status().await,
            }))
        }
        _ => Err(anyhow::anyhow!("未知的子命令")),
    }
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a String> {
    args.get_one::<String>(name)
        .with_context(|| format!("缺少参数: {name}"))
}

/// Waits for the task; Ctrl+C cancels it instead.
async fn wait_or_cancel<T: DeserializeOwned>(app: &Application, task: TypedTask<T>) -> Result<T> {
    let task_id = task.id().to_string();
    tokio::select! {
        result = task.wait() => result.with_context(|| format!("任务执行失败: {task_id}")),
        _ = signal::ctrl_c() => {
            info!("收到Ctrl+C信号, 取消任务 {}", task_id);
            app.pool().cancel(&task_id).await;
            Err(anyhow::anyhow!("任务已取消: {task_id}"))
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("序列化输出失败")?;
    println!("{rendered}");
    Ok(())
}

/// 初始化日志系统. Logs go to stderr so stdout stays machine readable.
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .pretty()
                        .with_writer(std::io::stderr),
                )
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let matches = cli()
            .try_get_matches_from([
                "draftwork",
                "process",
                "notes.txt",
                "--chunk-size",
                "500",
                "--log-format",
                "json",
            ])
            .unwrap();
        assert_eq!(
            matches.get_one::<String>("log-format").map(String::as_str),
            Some("json")
        );
        let (name, args) = matches.subcommand().unwrap();
        assert_eq!(name, "process");
        assert_eq!(args.get_one::<usize>("chunk-size"), Some(&500));
    }

    #[test]
    fn test_unknown_log_format_is_rejected() {
        assert!(cli()
            .try_get_matches_from(["draftwork", "--log-format", "xml", "storage-stats"])
            .is_err());
    }
}
