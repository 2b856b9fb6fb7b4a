//! 実行キャンセル通知

use std::future::Future;
use std::io;

use tokio::sync::watch;
use tracing::warn;

/// キャンセル要求を受け取る側
#[derive(Debug, Clone)]
pub struct Shutdown {
    receiver: watch::Receiver<bool>,
}

/// キャンセル要求を送る側
#[derive(Debug)]
pub struct ShutdownTrigger {
    sender: watch::Sender<bool>,
}

impl Shutdown {
    pub fn channel() -> (ShutdownTrigger, Shutdown) {
        let (sender, receiver) = watch::channel(false);
        (ShutdownTrigger { sender }, Shutdown { receiver })
    }

    /// キャンセルされることのない通知
    pub fn never() -> Shutdown {
        let (_trigger, shutdown) = Self::channel();
        shutdown
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// キャンセル要求まで待機
    pub async fn cancelled(&mut self) {
        loop {
            if *self.receiver.borrow_and_update() {
                return;
            }
            if self.receiver.changed().await.is_err() {
                // 送信側が消えたら以後キャンセルは来ない
                std::future::pending::<()>().await;
            }
        }
    }
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }
}

/// シグナル待ちが成功したときだけ完了する
///
/// 待機自体が失敗した場合は警告を出し、以後は完了しない（キャンセル扱いにしない）。
pub async fn signal_received<F>(name: &str, signal: F)
where
    F: Future<Output = io::Result<()>>,
{
    if let Err(e) = signal.await {
        warn!("Failed to listen for {}: {}", name, e);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_trigger_wakes_waiter() {
        let (trigger, mut shutdown) = Shutdown::channel();
        assert!(!shutdown.is_cancelled());

        let waiter = tokio::spawn(async move {
            shutdown.cancelled().await;
            shutdown.is_cancelled()
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.trigger();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_does_not_fire() {
        let mut shutdown = Shutdown::never();
        let fired = tokio::time::timeout(Duration::from_secs(3600), shutdown.cancelled()).await;
        assert!(fired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_received_completes_on_signal() {
        let done = tokio::time::timeout(
            Duration::from_secs(1),
            signal_received("SIGINT", std::future::ready(Ok(()))),
        )
        .await;
        assert!(done.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_listener_error_does_not_cancel() {
        let listener = std::future::ready(Err(io::Error::other("no signal driver")));
        let done =
            tokio::time::timeout(Duration::from_secs(3600), signal_received("SIGINT", listener)).await;
        assert!(done.is_err());
    }
}
