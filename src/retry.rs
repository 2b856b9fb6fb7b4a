//! リトライ・ポーリング設定

use std::time::Duration;

use tokio::time::Instant;

/// ステージ単位のリトライ設定（指数バックオフ）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// `attempt` 回目（1始まり）が失敗した後の待機時間
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay)
    }

    pub fn allows_another(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// 外部システム待機のポーリング設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    pub fn new(initial_interval: Duration, max_interval: Duration, timeout: Duration) -> Self {
        Self {
            initial_interval,
            max_interval: max_interval.max(initial_interval),
            timeout,
        }
    }

    /// ダウンロード待機の既定値: 2s, 4s, 8s, 8s ... 合計60秒
    pub fn download() -> Self {
        Self::new(
            Duration::from_secs(2),
            Duration::from_secs(8),
            Duration::from_secs(60),
        )
    }

    /// 画面要素待機の既定値
    pub fn element(timeout: Duration) -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(2), timeout)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 現在時刻からポーリングを開始
    pub fn start(&self) -> PollSchedule {
        PollSchedule {
            deadline: Instant::now() + self.timeout,
            next: self.initial_interval,
            max: self.max_interval,
        }
    }
}

/// 1回分のポーリング進行状況
#[derive(Debug)]
pub struct PollSchedule {
    deadline: Instant,
    next: Duration,
    max: Duration,
}

impl PollSchedule {
    /// 次の待機時間。期限切れなら `None`。
    pub fn next_wait(&mut self) -> Option<Duration> {
        let remaining = self.deadline.checked_duration_since(Instant::now())?;
        if remaining.is_zero() {
            return None;
        }
        let wait = self.next.min(remaining);
        self.next = self.next.saturating_mul(2).min(self.max);
        Some(wait)
    }

    /// 待機して次のポーリングへ進む。期限切れなら `false`。
    pub async fn tick(&mut self) -> bool {
        match self.next_wait() {
            Some(wait) => {
                tokio::time::sleep(wait).await;
                true
            }
            None => false,
        }
    }
}
