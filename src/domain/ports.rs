use crate::domain::model::ServiceDescriptor;
use crate::utils::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Runtime 發給每個已啟動服務實例的識別
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceHandle {
    pub service: String,
    pub id: u64,
}

/// 實際啟動/停止服務的外部協作者（本機程序、容器引擎等）
///
/// 協調核心只透過這個 seam 操作服務，測試以 mock 實現替換。
#[async_trait]
pub trait ServiceRuntime: Send + Sync {
    /// 啟動服務；`env` 已由 ResolvedConfig 渲染完成
    async fn start(
        &self,
        descriptor: &ServiceDescriptor,
        env: &BTreeMap<String, String>,
    ) -> Result<ServiceHandle>;

    /// 停止先前啟動的服務；對未知 handle 必須冪等
    async fn stop(&self, handle: &ServiceHandle) -> Result<()>;

    /// 等待 one-shot 任務結束，回傳退出碼
    async fn wait(&self, handle: &ServiceHandle) -> Result<i32>;

    /// 依 descriptor 的 ready_check 建立 probe
    fn probe(&self, descriptor: &ServiceDescriptor) -> Box<dyn ReadyProbe>;

    /// 停止非本程序啟動的服務（`teardown` 子命令使用 stop_command）
    async fn stop_external(&self, descriptor: &ServiceDescriptor) -> Result<()>;
}

/// 就緒檢查述詞；Health Gate 反覆輪詢，不自行重試
#[async_trait]
pub trait ReadyProbe: Send + Sync {
    async fn check(&self) -> bool;

    fn describe(&self) -> String;
}
