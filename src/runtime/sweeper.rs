use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::executor::FlowEngine;

/// 周期性检查 input 等待期限的后台任务
pub struct TimeoutSweeper {
    engine: FlowEngine,
    period: Duration,
}

/// 运行中的清扫任务句柄
pub struct SweeperHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl TimeoutSweeper {
    pub fn new(engine: FlowEngine, period: Duration) -> Self {
        Self {
            engine,
            period: period.max(Duration::from_millis(10)),
        }
    }

    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(sweep_loop(self.engine, self.period, shutdown_rx));
        SweeperHandle {
            shutdown_tx: Some(shutdown_tx),
            join,
        }
    }
}

impl SweeperHandle {
    /// 停止清扫并等待任务退出
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.join.await;
    }
}

async fn sweep_loop(engine: FlowEngine, period: Duration, mut shutdown_rx: oneshot::Receiver<()>) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => {
                debug!("timeout sweeper stopped");
                return;
            }
            _ = interval.tick() => {
                if let Err(error) = engine.check_timeouts(Utc::now()).await {
                    warn!(%error, "timeout sweep failed");
                }
            }
        }
    }
}
