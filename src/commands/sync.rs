use super::resolve_root;
use crate::config::{IgnoreRules, SyncConfig, TuningConfig};
use crate::core::{wait_for_roots, EngineStats, SyncEngine};
use crate::error::SyncError;
use crate::watch::{create_source, spawn_pump, WatcherKind};
use anyhow::Result;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// `sync` 子命令的参数
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub remote: PathBuf,
    pub local: PathBuf,
    pub dry_run: bool,
    /// 关闭懒加载，所有文件立即下载
    pub eager: bool,
    pub watcher: WatcherKind,
    pub ignore: Vec<String>,
}

/// 根据命令行参数和配置文件构建同步配置并校验
pub fn build_config(options: &SyncOptions, config_dir: &Path) -> Result<SyncConfig, SyncError> {
    let mut ignore = IgnoreRules::new();
    for rule in &options.ignore {
        ignore.add(rule)?;
    }

    let config = SyncConfig::new(resolve_root(&options.remote)?, resolve_root(&options.local)?)
        .with_lazy(!options.eager)
        .with_dry_run(options.dry_run)
        .with_ignore(ignore)
        .with_tuning(TuningConfig::load(config_dir));
    config.validate()?;
    Ok(config)
}

/// 等待目录可用后运行同步引擎，直到令牌被取消
pub async fn run_sync(
    config: SyncConfig,
    watcher: WatcherKind,
    token: CancellationToken,
) -> Result<EngineStats> {
    wait_for_roots(&config, &token).await?;

    let mut engine = SyncEngine::new(config)?.with_cancel(token.clone());
    if !engine.config().ignore.rules().is_empty() {
        info!("忽略规则: {}", engine.config().ignore.rules().join(", "));
    }

    // 监听线程使用子令牌，引擎退出时一并停止
    let pump_token = token.child_token();
    let pump = match create_source(watcher, engine.config()) {
        Ok(Some(source)) => Some(spawn_pump(source, engine.sender(), pump_token.clone())),
        Ok(None) => {
            info!("未启用文件监听，仅依靠定期扫描");
            None
        }
        Err(e) => {
            warn!("文件监听启动失败，仅依靠定期扫描: {:#}", e);
            None
        }
    };

    let stats = engine.run(token).await;

    pump_token.cancel();
    if let Some(pump) = pump {
        if let Err(e) = pump.await {
            warn!("文件监听线程异常退出: {}", e);
        }
    }
    Ok(stats)
}
