//! 暂存目录清理的后台任务。

use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::config::SPOOL_CLEAN_INTERVAL_SECS;
use crate::spool::cleanup_stale_spool;

/// 启动后台任务（清理崩溃遗留的暂存文件）。
pub fn spawn_background_tasks(spool_dir: PathBuf, spool_ttl: Duration) {
    if spool_ttl.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SPOOL_CLEAN_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if let Err(err) = cleanup_stale_spool(&spool_dir, spool_ttl).await {
                warn!(error = %err, "spool cleanup failed");
            }
        }
    });
}
