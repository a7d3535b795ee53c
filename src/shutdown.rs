//! 进程级关闭信号
//!
//! 操作系统信号或内部错误触发一次关闭，进程内所有成员节点等待同一个信号后依次停止。

use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// 创建一对关闭触发器与关闭信号
pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// 返回本次调用是否真正触发了关闭
    pub fn trigger(&self, reason: &str) -> bool {
        let fired = self.tx.send_if_modified(|stopping| {
            if *stopping {
                false
            } else {
                *stopping = true;
                true
            }
        });
        if fired {
            info!("触发关闭: {}，等待中的节点数: {}", reason, self.tx.receiver_count());
        } else {
            debug!("关闭已经触发过，忽略: {}", reason);
        }
        fired
    }
}

/// 可克隆给任意数量的等待者；触发之后才克隆的信号同样立即就绪
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// 触发器被丢弃也视为关闭
    pub async fn wait(mut self) {
        let _ = self.rx.wait_for(|stopping| *stopping).await;
    }
}

/// 等待 Ctrl+C 或 SIGTERM，返回收到的信号名
pub async fn wait_for_os_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "Ctrl+C",
        _ = terminate => "SIGTERM",
    }
}
