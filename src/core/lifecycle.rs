use crate::config::env::ResolvedConfig;
use crate::core::cancel::{CancelSignal, CancelToken};
use crate::core::health::{GateOutcome, HealthGate};
use crate::domain::model::{
    ExecutionPlan, RunOutcome, RunReport, RunState, ServiceDescriptor, ServiceKind,
    ServiceReport, TierReport,
};
use crate::domain::ports::{ServiceHandle, ServiceRuntime};
use crate::utils::error::{OrchError, Result};
use crate::utils::monitor::SystemMonitor;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// worker → controller 的狀態回報
///
/// worker 從不改共享狀態；RunState 只有 controller 這一個寫者。
#[derive(Debug)]
enum StatusEvent {
    Starting {
        service: String,
    },
    Launched {
        service: String,
        handle: ServiceHandle,
    },
    Ready {
        service: String,
    },
    Completed {
        service: String,
    },
    Failed {
        service: String,
        error: OrchError,
    },
    Cancelled {
        service: String,
    },
}

/// Lifecycle Controller：依計畫逐 tier 啟動服務
///
/// tier 內併發、tier 間嚴格循序；任何成員失敗即中止並
/// 反向 teardown 已就緒的服務。
pub struct Orchestrator<R: ServiceRuntime + 'static> {
    runtime: Arc<R>,
    gate: Arc<HealthGate>,
    monitor: Option<SystemMonitor>,
}

impl<R: ServiceRuntime + 'static> Orchestrator<R> {
    pub fn new(runtime: R, gate: HealthGate) -> Self {
        Self {
            runtime: Arc::new(runtime),
            gate: Arc::new(gate),
            monitor: None,
        }
    }

    pub fn with_monitoring(mut self, enabled: bool) -> Self {
        if enabled {
            self.monitor = Some(SystemMonitor::new());
        }
        self
    }

    /// 執行整個啟動計畫
    ///
    /// 回傳的 RunReport 無論成敗都帶有逐 tier 的最終狀態；
    /// 失敗原因放在 outcome / failed_service / cause。
    pub async fn run(
        &self,
        stack_name: &str,
        plan: &ExecutionPlan,
        descriptors: &[ServiceDescriptor],
        config: &ResolvedConfig,
        cancel: CancelSignal,
    ) -> Result<RunReport> {
        let by_name: HashMap<&str, &ServiceDescriptor> =
            descriptors.iter().map(|d| (d.name.as_str(), d)).collect();

        let mut states: BTreeMap<String, RunState> = plan
            .start_order()
            .map(|name| (name.to_string(), RunState::Pending))
            .collect();
        let mut start_times: HashMap<String, Instant> = HashMap::new();
        let mut durations: BTreeMap<String, Duration> = BTreeMap::new();
        let mut handles: HashMap<String, ServiceHandle> = HashMap::new();
        let mut ready_order: Vec<String> = Vec::new();

        let started_at = Utc::now();
        let mut failure: Option<OrchError> = None;
        let mut outer = cancel;
        let mut cancelled = outer.is_cancelled();

        if let Some(monitor) = &self.monitor {
            monitor.log_stats("Run started");
        }

        for (tier_idx, tier) in plan.tiers.iter().enumerate() {
            if outer.is_cancelled() {
                cancelled = true;
            }
            if cancelled || failure.is_some() {
                break;
            }

            tracing::info!(
                "🚀 Starting tier {}/{}: [{}]",
                tier_idx + 1,
                plan.tiers.len(),
                tier.services.join(", ")
            );

            let tier_token = CancelToken::new();
            let (tx, mut rx) = mpsc::channel::<StatusEvent>(tier.services.len().max(1) * 4);
            let mut workers = Vec::new();

            for name in &tier.services {
                let descriptor = match by_name.get(name.as_str()) {
                    Some(descriptor) => (*descriptor).clone(),
                    None => {
                        return Err(OrchError::ConfigValidationError {
                            field: "plan".to_string(),
                            message: format!("Plan references undeclared service '{}'", name),
                        })
                    }
                };
                let env = config.render_env(&descriptor.env);
                let runtime = Arc::clone(&self.runtime);
                let gate = Arc::clone(&self.gate);
                let tx = tx.clone();
                let signal = tier_token.signal();

                workers.push(tokio::spawn(async move {
                    run_service(runtime, gate, descriptor, env, tx, signal).await;
                }));
            }
            drop(tx);

            let mut remaining = tier.services.len();
            while remaining > 0 {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(StatusEvent::Starting { service }) => {
                            advance(&mut states, &service, RunState::Starting);
                            start_times.insert(service, Instant::now());
                        }
                        Some(StatusEvent::Launched { service, handle }) => {
                            handles.insert(service, handle);
                        }
                        Some(StatusEvent::Ready { service }) => {
                            advance(&mut states, &service, RunState::Ready);
                            record_duration(&start_times, &mut durations, &service);
                            tracing::info!("✅ {} is ready", service);
                            ready_order.push(service);
                            remaining -= 1;
                        }
                        Some(StatusEvent::Completed { service }) => {
                            advance(&mut states, &service, RunState::Stopped);
                            record_duration(&start_times, &mut durations, &service);
                            tracing::info!("✅ {} completed", service);
                            handles.remove(&service);
                            remaining -= 1;
                        }
                        Some(StatusEvent::Failed { service, error }) => {
                            advance(&mut states, &service, RunState::Failed);
                            record_duration(&start_times, &mut durations, &service);
                            tracing::error!("❌ {} failed: {}", service, error);
                            if failure.is_none() {
                                failure = Some(error);
                                tier_token.cancel();
                            }
                            remaining -= 1;
                        }
                        Some(StatusEvent::Cancelled { service }) => {
                            tracing::warn!("🛑 {} interrupted by cancellation", service);
                            remaining -= 1;
                        }
                        None => {
                            if failure.is_none() {
                                failure = Some(OrchError::StartFailedError {
                                    service: tier.services.join(","),
                                    reason: "status channel closed before tier completed"
                                        .to_string(),
                                });
                            }
                            break;
                        }
                    },
                    _ = outer.cancelled(), if !cancelled => {
                        tracing::warn!("🛑 Cancellation requested, aborting startup");
                        cancelled = true;
                        tier_token.cancel();
                    }
                }
            }

            for worker in workers {
                let _ = worker.await;
            }
        }

        if failure.is_some() || cancelled {
            self.teardown_started(&mut states, &mut handles, &ready_order)
                .await;
        }

        if let Some(monitor) = &self.monitor {
            monitor.log_stats("Run finished");
        }

        let outcome = if failure.is_some() {
            RunOutcome::Failed
        } else if cancelled {
            RunOutcome::Cancelled
        } else {
            RunOutcome::Completed
        };

        let cause = match (&failure, outcome) {
            (Some(error), _) => Some(error.to_string()),
            (None, RunOutcome::Cancelled) => Some(OrchError::CancelledError.to_string()),
            _ => None,
        };

        Ok(RunReport {
            stack: stack_name.to_string(),
            outcome,
            failed_service: failure.as_ref().and_then(failing_service),
            cause,
            started_at,
            tiers: plan
                .tiers
                .iter()
                .map(|tier| TierReport {
                    services: tier
                        .services
                        .iter()
                        .map(|name| ServiceReport {
                            name: name.clone(),
                            state: states.get(name).copied().unwrap_or(RunState::Pending),
                            duration_ms: durations
                                .get(name)
                                .map(|d| d.as_millis() as u64),
                        })
                        .collect(),
                })
                .collect(),
        })
    }

    /// 反向停掉本次執行已啟動的服務
    ///
    /// 先依就緒順序的反向停已就緒者，再清掉已啟動但未就緒
    /// 的殘留，不讓任何已啟動資源外洩。
    async fn teardown_started(
        &self,
        states: &mut BTreeMap<String, RunState>,
        handles: &mut HashMap<String, ServiceHandle>,
        ready_order: &[String],
    ) {
        if !ready_order.is_empty() {
            tracing::warn!(
                "🧹 Tearing down {} ready service(s) in reverse start order",
                ready_order.len()
            );
        }

        for service in ready_order.iter().rev() {
            if let Some(handle) = handles.remove(service) {
                match self.runtime.stop(&handle).await {
                    Ok(()) => {
                        advance(states, service, RunState::Stopped);
                        tracing::info!("🛑 {} stopped", service);
                    }
                    Err(error) => {
                        tracing::error!("⚠️ Failed to stop {}: {}", service, error);
                    }
                }
            }
        }

        let leftovers: Vec<String> = states
            .iter()
            .filter(|(name, state)| {
                handles.contains_key(*name)
                    && matches!(**state, RunState::Starting | RunState::Failed)
            })
            .map(|(name, _)| name.clone())
            .collect();

        for service in leftovers {
            if let Some(handle) = handles.remove(&service) {
                match self.runtime.stop(&handle).await {
                    Ok(()) => {
                        advance(states, &service, RunState::Stopped);
                        tracing::info!("🛑 {} stopped (was not ready)", service);
                    }
                    Err(error) => {
                        tracing::error!("⚠️ Failed to stop {}: {}", service, error);
                    }
                }
            }
        }
    }

    /// 獨立的 teardown 操作：依計畫反向停掉所有宣告的服務
    ///
    /// 沒有本次執行的 handle 可用，依賴各服務宣告的 stop_command；
    /// 未宣告者跳過。全部嘗試後回報第一個錯誤。
    pub async fn teardown(
        &self,
        plan: &ExecutionPlan,
        descriptors: &[ServiceDescriptor],
    ) -> Result<()> {
        let by_name: HashMap<&str, &ServiceDescriptor> =
            descriptors.iter().map(|d| (d.name.as_str(), d)).collect();

        let mut first_error: Option<OrchError> = None;

        for name in plan.teardown_order() {
            let Some(descriptor) = by_name.get(name) else {
                continue;
            };

            if descriptor.stop_command.is_none() {
                tracing::warn!("⏭️ {} declares no stop_command, skipping", name);
                continue;
            }

            match self.runtime.stop_external(descriptor).await {
                Ok(()) => tracing::info!("🛑 {} stopped", name),
                Err(error) => {
                    tracing::error!("⚠️ Failed to stop {}: {}", name, error);
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// 單一服務的啟動 worker；只透過 channel 回報，不碰共享狀態
async fn run_service<R: ServiceRuntime>(
    runtime: Arc<R>,
    gate: Arc<HealthGate>,
    descriptor: ServiceDescriptor,
    env: BTreeMap<String, String>,
    tx: mpsc::Sender<StatusEvent>,
    mut cancel: CancelSignal,
) {
    let service = descriptor.name.clone();

    if cancel.is_cancelled() {
        let _ = tx.send(StatusEvent::Cancelled { service }).await;
        return;
    }

    let _ = tx
        .send(StatusEvent::Starting {
            service: service.clone(),
        })
        .await;

    match descriptor.kind {
        ServiceKind::LongRunning => {
            run_long_running(runtime, gate, &descriptor, &env, &tx, &mut cancel, &service).await;
        }
        ServiceKind::OneShot => {
            run_one_shot(runtime, &descriptor, &env, &tx, &mut cancel, &service).await;
        }
    }
}

async fn run_long_running<R: ServiceRuntime>(
    runtime: Arc<R>,
    gate: Arc<HealthGate>,
    descriptor: &ServiceDescriptor,
    env: &BTreeMap<String, String>,
    tx: &mpsc::Sender<StatusEvent>,
    cancel: &mut CancelSignal,
    service: &str,
) {
    let handle = match runtime.start(descriptor, env).await {
        Ok(handle) => handle,
        Err(error) => {
            let _ = tx
                .send(StatusEvent::Failed {
                    service: service.to_string(),
                    error: as_start_failure(service, error),
                })
                .await;
            return;
        }
    };

    let _ = tx
        .send(StatusEvent::Launched {
            service: service.to_string(),
            handle,
        })
        .await;

    let probe = runtime.probe(descriptor);
    match gate.await_ready(service, probe.as_ref(), cancel).await {
        GateOutcome::Ready => {
            let _ = tx
                .send(StatusEvent::Ready {
                    service: service.to_string(),
                })
                .await;
        }
        GateOutcome::Failed => {
            let _ = tx
                .send(StatusEvent::Failed {
                    service: service.to_string(),
                    error: OrchError::ReadyTimeoutError {
                        service: service.to_string(),
                        attempts: gate.max_attempts(),
                    },
                })
                .await;
        }
        GateOutcome::Cancelled => {
            let _ = tx
                .send(StatusEvent::Cancelled {
                    service: service.to_string(),
                })
                .await;
        }
    }
}

enum OneShotAttempt {
    Exit(i32),
    StartError(OrchError),
    Cancelled,
}

async fn run_one_shot<R: ServiceRuntime>(
    runtime: Arc<R>,
    descriptor: &ServiceDescriptor,
    env: &BTreeMap<String, String>,
    tx: &mpsc::Sender<StatusEvent>,
    cancel: &mut CancelSignal,
    service: &str,
) {
    let total_attempts = descriptor.retry.attempts + 1;
    let retry_delay = Duration::from_secs(descriptor.retry.delay_seconds);
    let mut last_error: Option<OrchError> = None;

    for attempt in 1..=total_attempts {
        if attempt > 1 {
            tokio::select! {
                _ = tokio::time::sleep(retry_delay) => {}
                _ = cancel.cancelled() => {
                    let _ = tx.send(StatusEvent::Cancelled { service: service.to_string() }).await;
                    return;
                }
            }
        }

        match one_shot_attempt(&runtime, descriptor, env, tx, cancel, service).await {
            OneShotAttempt::Exit(0) => {
                let _ = tx
                    .send(StatusEvent::Completed {
                        service: service.to_string(),
                    })
                    .await;
                return;
            }
            OneShotAttempt::Exit(code) => {
                if attempt < total_attempts {
                    tracing::warn!(
                        "🔁 {} exited with code {} (attempt {}/{}), retrying in {:?}",
                        service,
                        code,
                        attempt,
                        total_attempts,
                        retry_delay
                    );
                }
                last_error = Some(OrchError::OneShotFailedError {
                    service: service.to_string(),
                    code,
                });
            }
            OneShotAttempt::StartError(error) => {
                if attempt < total_attempts {
                    tracing::warn!(
                        "🔁 {} failed to launch (attempt {}/{}): {}",
                        service,
                        attempt,
                        total_attempts,
                        error
                    );
                }
                last_error = Some(as_start_failure(service, error));
            }
            OneShotAttempt::Cancelled => {
                let _ = tx
                    .send(StatusEvent::Cancelled {
                        service: service.to_string(),
                    })
                    .await;
                return;
            }
        }
    }

    let error = last_error.unwrap_or_else(|| OrchError::StartFailedError {
        service: service.to_string(),
        reason: "one-shot made no attempts".to_string(),
    });
    let _ = tx
        .send(StatusEvent::Failed {
            service: service.to_string(),
            error,
        })
        .await;
}

async fn one_shot_attempt<R: ServiceRuntime>(
    runtime: &Arc<R>,
    descriptor: &ServiceDescriptor,
    env: &BTreeMap<String, String>,
    tx: &mpsc::Sender<StatusEvent>,
    cancel: &mut CancelSignal,
    service: &str,
) -> OneShotAttempt {
    let handle = match runtime.start(descriptor, env).await {
        Ok(handle) => handle,
        Err(error) => return OneShotAttempt::StartError(error),
    };

    let _ = tx
        .send(StatusEvent::Launched {
            service: service.to_string(),
            handle: handle.clone(),
        })
        .await;

    tokio::select! {
        result = runtime.wait(&handle) => match result {
            Ok(code) => OneShotAttempt::Exit(code),
            Err(error) => OneShotAttempt::StartError(error),
        },
        _ = cancel.cancelled() => {
            let _ = runtime.stop(&handle).await;
            OneShotAttempt::Cancelled
        }
    }
}

/// RunState 的唯一寫入點；違反單調轉移的事件只記警告
fn advance(states: &mut BTreeMap<String, RunState>, service: &str, next: RunState) {
    match states.get_mut(service) {
        Some(state) if state.can_advance_to(next) => *state = next,
        Some(state) => {
            tracing::warn!(
                "Ignoring invalid state transition {:?} -> {:?} for {}",
                state,
                next,
                service
            );
        }
        None => {
            tracing::warn!("Status event for unknown service {}", service);
        }
    }
}

fn record_duration(
    start_times: &HashMap<String, Instant>,
    durations: &mut BTreeMap<String, Duration>,
    service: &str,
) {
    if let Some(started) = start_times.get(service) {
        durations.insert(service.to_string(), started.elapsed());
    }
}

fn failing_service(error: &OrchError) -> Option<String> {
    match error {
        OrchError::StartFailedError { service, .. }
        | OrchError::ReadyTimeoutError { service, .. }
        | OrchError::OneShotFailedError { service, .. } => Some(service.clone()),
        _ => None,
    }
}

fn as_start_failure(service: &str, error: OrchError) -> OrchError {
    match error {
        error @ OrchError::StartFailedError { .. } => error,
        other => OrchError::StartFailedError {
            service: service.to_string(),
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_enforces_monotonic_transitions() {
        let mut states = BTreeMap::new();
        states.insert("db".to_string(), RunState::Pending);

        advance(&mut states, "db", RunState::Starting);
        assert_eq!(states["db"], RunState::Starting);

        advance(&mut states, "db", RunState::Ready);
        assert_eq!(states["db"], RunState::Ready);

        advance(&mut states, "db", RunState::Failed);
        assert_eq!(states["db"], RunState::Ready, "Ready -> Failed is not a legal transition");

        advance(&mut states, "db", RunState::Stopped);
        assert_eq!(states["db"], RunState::Stopped);
    }

    #[test]
    fn test_failing_service_extraction() {
        let error = OrchError::OneShotFailedError {
            service: "migrate".to_string(),
            code: 1,
        };
        assert_eq!(failing_service(&error), Some("migrate".to_string()));

        assert_eq!(failing_service(&OrchError::CancelledError), None);
    }
}
