use clap::{Args, Parser, Subcommand};
use lazymirror_lib::commands::{backup, sync};
use lazymirror_lib::watch::WatcherKind;
use lazymirror_lib::{app_config_dir, logging, SyncError};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// 懒加载的双向目录镜像
#[derive(Debug, Parser)]
#[command(name = "lazymirror", version, about)]
struct Cli {
    /// 配置目录（config.json 和日志所在位置）
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// 输出调试日志
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 持续同步两个目录，直到 Ctrl-C
    Sync(SyncArgs),
    /// 查看或恢复备份
    #[command(subcommand)]
    Backups(BackupsCommand),
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// 远程目录（数据的权威来源）
    #[arg(short, long)]
    remote: PathBuf,

    /// 本地目录
    #[arg(short, long)]
    local: PathBuf,

    /// 只记录将要执行的操作，不修改文件
    #[arg(long)]
    dry_run: bool,

    /// 关闭懒加载，远程文件立即下载
    #[arg(long)]
    eager: bool,

    /// 文件变更监听方式
    #[arg(long, value_enum, default_value_t = WatcherKind::Kernel)]
    watcher: WatcherKind,

    /// 忽略的相对路径前缀或 glob 模式，可重复
    #[arg(long = "ignore", value_name = "PATTERN")]
    ignore: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum BackupsCommand {
    /// 列出备份记录
    List {
        /// 同步根目录
        root: PathBuf,
        /// 只列出该相对路径
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// 将备份恢复到原位置
    Restore {
        root: PathBuf,
        /// 相对于根目录的路径
        relative: PathBuf,
        /// 版本号，0 为最新
        #[arg(long, default_value_t = 0)]
        version: usize,
    },
}

/// 中断返回 0，参数或配置错误返回 2，其他启动失败返回 1
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<SyncError>() {
        Some(SyncError::Cancelled) => 0,
        Some(e) if e.is_user_error() => 2,
        _ => 1,
    }
}

async fn run(cli: Cli, config_dir: PathBuf) -> anyhow::Result<()> {
    match cli.command {
        Command::Sync(args) => {
            let options = sync::SyncOptions {
                remote: args.remote,
                local: args.local,
                dry_run: args.dry_run,
                eager: args.eager,
                watcher: args.watcher,
                ignore: args.ignore,
            };
            let config = sync::build_config(&options, &config_dir)?;

            let token = CancellationToken::new();
            let signal_token = token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("收到中断信号，正在停止...");
                }
                signal_token.cancel();
            });

            sync::run_sync(config, options.watcher, token).await?;
        }
        Command::Backups(BackupsCommand::List { root, path }) => {
            let listings = backup::list(&root, path.as_deref())?;
            backup::print_listing(&listings);
        }
        Command::Backups(BackupsCommand::Restore {
            root,
            relative,
            version,
        }) => {
            let restored = backup::restore(&root, &relative, version)?;
            println!("已恢复: {}", restored.display());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_dir = app_config_dir(cli.config_dir.as_deref());
    let _ = std::fs::create_dir_all(&config_dir);

    // guard 需要一直持有到进程退出
    let _log_guard = logging::init_logging(&config_dir, cli.verbose);

    match run(cli, config_dir).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = exit_code(&e);
            if code != 0 {
                error!("{:#}", e);
            }
            ExitCode::from(code)
        }
    }
}
