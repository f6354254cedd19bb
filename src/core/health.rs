use crate::config::stack::HealthSettings;
use crate::core::cancel::CancelSignal;
use crate::domain::ports::ReadyProbe;
use std::time::Duration;

/// Health Gate 的輪詢結果；失敗以回傳值表達，由 Lifecycle
/// Controller 決定後果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Ready,
    Failed,
    Cancelled,
}

/// 以有界的指數退避輪詢 ready probe
pub struct HealthGate {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl HealthGate {
    pub fn new(settings: HealthSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// 第一次立即輪詢，之後每次間隔加倍直到上限；
    /// 取消訊號在睡眠中也會立刻中斷
    pub async fn await_ready(
        &self,
        service: &str,
        probe: &dyn ReadyProbe,
        cancel: &mut CancelSignal,
    ) -> GateOutcome {
        let mut delay = self.initial_delay;

        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return GateOutcome::Cancelled;
            }

            if probe.check().await {
                tracing::debug!(
                    "✅ {} ready after {} attempt(s) ({})",
                    service,
                    attempt,
                    probe.describe()
                );
                return GateOutcome::Ready;
            }

            if attempt == self.max_attempts {
                break;
            }

            tracing::debug!(
                "⏳ {} not ready (attempt {}/{}), next poll in {:?}",
                service,
                attempt,
                self.max_attempts,
                delay
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return GateOutcome::Cancelled,
            }

            delay = (delay * 2).min(self.max_delay);
        }

        GateOutcome::Failed
    }
}
