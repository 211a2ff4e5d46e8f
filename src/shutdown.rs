//! シグナル連動のシャットダウン制御。
//!
//! SIGINT / SIGTERM を監視し、受信時にキャンセルされる
//! CancellationToken を提供する。コンシューマーの反復へ渡すことで
//! プロセス終了時に現在のメッセージ処理を終えてから停止できる。

use tokio_util::sync::CancellationToken;
use tracing::info;

/// プロセスシグナルでキャンセルされるトークンを返す。
///
/// 返したトークンの clone をワーカーへ配布する。シグナル監視タスクは
/// バックグラウンドで動き続け、最初のシグナル受信でキャンセルする。
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        trigger.cancel();
    });
    token
}

async fn wait_for_signal() {
    use tokio::signal;

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!(signal = "SIGINT", "shutdown signal received");
        }
        _ = terminate => {
            info!(signal = "SIGTERM", "shutdown signal received");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_starts_uncancelled() {
        let token = shutdown_token();
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_clones_share_cancellation() {
        let token = CancellationToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
