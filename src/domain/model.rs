use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;

/// 服務種類：常駐服務或一次性任務（例如 schema migration）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    LongRunning,
    OneShot,
}

/// 就緒檢查方式，由 descriptor 宣告
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReadyCheckSpec {
    /// TCP 連線成功即視為就緒
    Tcp { port: u16 },
    /// HTTP GET 回應 2xx 即視為就緒
    Http { url: String },
    /// One-shot 任務：退出碼 0 即視為完成，不經過 Health Gate
    Exit,
}

/// One-shot 任務的重試策略（Health Gate 之外唯一的重試窗口）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay_seconds: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 0,
            delay_seconds: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub kind: ServiceKind,
    pub image: Option<String>,
    pub command: Option<String>,
    pub stop_command: Option<String>,
    pub ports: Vec<u16>,
    pub depends_on: Vec<String>,
    /// key → 值或 `${KEY}` 佔位符，啟動時以 ResolvedConfig 渲染
    pub env: BTreeMap<String, String>,
    pub ready_check: ReadyCheckSpec,
    pub retry: RetryPolicy,
}

impl ServiceDescriptor {
    pub fn is_one_shot(&self) -> bool {
        self.kind == ServiceKind::OneShot
    }
}

/// 單次執行中每個服務的狀態
///
/// 同一次執行內單調前進，僅 teardown 時允許 Ready → Stopped。
/// One-shot 成功結束記為 Stopped（意為「已完成」）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Pending,
    Starting,
    Ready,
    Failed,
    Stopped,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Failed | RunState::Stopped)
    }

    /// 允許的轉移：Pending→Starting→Ready→Stopped、Starting→{Failed,Stopped}
    pub fn can_advance_to(&self, next: RunState) -> bool {
        matches!(
            (self, next),
            (RunState::Pending, RunState::Starting)
                | (RunState::Starting, RunState::Ready)
                | (RunState::Starting, RunState::Failed)
                | (RunState::Starting, RunState::Stopped)
                | (RunState::Ready, RunState::Stopped)
        )
    }
}

/// 一個 tier：彼此無依賴、可併發啟動的服務集合
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub services: Vec<String>,
    /// One-shot 永遠獨占一個 tier
    pub one_shot: bool,
}

/// 由 descriptor 集合推導出的啟動計畫；每次執行推導一次，不可變
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub tiers: Vec<Tier>,
}

impl ExecutionPlan {
    /// 啟動順序（tier 順序攤平）
    pub fn start_order(&self) -> impl Iterator<Item = &str> {
        self.tiers
            .iter()
            .flat_map(|tier| tier.services.iter().map(String::as_str))
    }

    /// Teardown 順序 = 啟動順序的反向
    pub fn teardown_order(&self) -> Vec<&str> {
        let mut order: Vec<&str> = self.start_order().collect();
        order.reverse();
        order
    }

    pub fn service_count(&self) -> usize {
        self.tiers.iter().map(|t| t.services.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceReport {
    pub name: String,
    pub state: RunState,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierReport {
    pub services: Vec<ServiceReport>,
}

/// 執行結果：結果、失敗原因，以及逐 tier 的最終狀態
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub stack: String,
    pub outcome: RunOutcome,
    pub failed_service: Option<String>,
    pub cause: Option<String>,
    pub started_at: DateTime<Utc>,
    pub tiers: Vec<TierReport>,
}

impl RunReport {
    /// 執行摘要，供 CLI 輸出
    pub fn summary(&self) -> HashMap<String, serde_json::Value> {
        let mut summary = HashMap::new();

        let total: usize = self.tiers.iter().map(|t| t.services.len()).sum();
        let ready = self.count_state(RunState::Ready);
        let completed = self.count_state(RunState::Stopped);
        let failed = self.count_state(RunState::Failed);

        summary.insert(
            "stack".to_string(),
            serde_json::Value::String(self.stack.clone()),
        );
        summary.insert(
            "outcome".to_string(),
            serde_json::Value::String(format!("{:?}", self.outcome).to_lowercase()),
        );
        summary.insert("total_services".to_string(), serde_json::Value::Number(total.into()));
        summary.insert("ready".to_string(), serde_json::Value::Number(ready.into()));
        summary.insert(
            "completed_or_stopped".to_string(),
            serde_json::Value::Number(completed.into()),
        );
        summary.insert("failed".to_string(), serde_json::Value::Number(failed.into()));

        if let Some(name) = &self.failed_service {
            summary.insert(
                "failed_service".to_string(),
                serde_json::Value::String(name.clone()),
            );
        }

        summary
    }

    fn count_state(&self, state: RunState) -> usize {
        self.tiers
            .iter()
            .flat_map(|t| t.services.iter())
            .filter(|s| s.state == state)
            .count()
    }
}
