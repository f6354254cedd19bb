use crate::domain::model::{ReadyCheckSpec, ServiceDescriptor};
use crate::domain::ports::{ReadyProbe, ServiceHandle, ServiceRuntime};
use crate::utils::error::{OrchError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

type SharedChild = Arc<Mutex<Child>>;

/// 以本機程序實現 ServiceRuntime；宣告的 command 經 `sh -c` 執行
///
/// 成功結束的 run 不停掉常駐服務（detached 語意），之後以
/// `teardown` 子命令經 stop_command 停止。
pub struct ProcessRuntime {
    next_id: AtomicU64,
    children: Mutex<HashMap<u64, SharedChild>>,
    http: reqwest::Client,
}

impl ProcessRuntime {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            children: Mutex::new(HashMap::new()),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(2))
                .build()
                .expect("Failed to build HTTP client"),
        }
    }
}

impl Default for ProcessRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceRuntime for ProcessRuntime {
    async fn start(
        &self,
        descriptor: &ServiceDescriptor,
        env: &BTreeMap<String, String>,
    ) -> Result<ServiceHandle> {
        let command = descriptor.command.as_deref().ok_or_else(|| {
            OrchError::StartFailedError {
                service: descriptor.name.clone(),
                reason: "no command declared".to_string(),
            }
        })?;

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .envs(env)
            .spawn()
            .map_err(|e| OrchError::StartFailedError {
                service: descriptor.name.clone(),
                reason: format!("spawn failed: {}", e),
            })?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.children
            .lock()
            .await
            .insert(id, Arc::new(Mutex::new(child)));

        tracing::debug!("🚀 spawned {} (handle {})", descriptor.name, id);

        Ok(ServiceHandle {
            service: descriptor.name.clone(),
            id,
        })
    }

    async fn stop(&self, handle: &ServiceHandle) -> Result<()> {
        let child = self.children.lock().await.remove(&handle.id);
        match child {
            Some(child) => {
                let mut child = child.lock().await;
                // 已自行結束的 child kill 會回錯，視為已停止
                if let Err(error) = child.kill().await {
                    tracing::debug!("kill {} returned: {}", handle.service, error);
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn wait(&self, handle: &ServiceHandle) -> Result<i32> {
        let child = self
            .children
            .lock()
            .await
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| OrchError::StartFailedError {
                service: handle.service.clone(),
                reason: "unknown service handle".to_string(),
            })?;

        // wait 與 stop 不會同時作用在同一個 handle：取消路徑會先
        // drop 這個 future（釋放 child 鎖）才呼叫 stop
        let status = child.lock().await.wait().await.map_err(OrchError::IoError)?;
        self.children.lock().await.remove(&handle.id);

        Ok(status.code().unwrap_or(-1))
    }

    fn probe(&self, descriptor: &ServiceDescriptor) -> Box<dyn ReadyProbe> {
        match &descriptor.ready_check {
            ReadyCheckSpec::Tcp { port } => Box::new(TcpProbe::new(format!("127.0.0.1:{}", port))),
            ReadyCheckSpec::Http { url } => {
                Box::new(HttpProbe::with_client(self.http.clone(), url.clone()))
            }
            // One-shot 由 controller 等待退出碼，不會走到 Health Gate
            ReadyCheckSpec::Exit => Box::new(ExitProbe),
        }
    }

    async fn stop_external(&self, descriptor: &ServiceDescriptor) -> Result<()> {
        let command = descriptor.stop_command.as_deref().ok_or_else(|| {
            OrchError::StartFailedError {
                service: descriptor.name.clone(),
                reason: "no stop_command declared".to_string(),
            }
        })?;

        let status = Command::new("sh")
            .arg("-c")
            .arg(command)
            .status()
            .await
            .map_err(OrchError::IoError)?;

        if status.success() {
            Ok(())
        } else {
            Err(OrchError::StartFailedError {
                service: descriptor.name.clone(),
                reason: format!("stop_command exited with code {}", status.code().unwrap_or(-1)),
            })
        }
    }
}

/// TCP 連線成功即就緒
pub struct TcpProbe {
    addr: String,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl ReadyProbe for TcpProbe {
    async fn check(&self) -> bool {
        matches!(
            tokio::time::timeout(Duration::from_secs(1), TcpStream::connect(&self.addr)).await,
            Ok(Ok(_))
        )
    }

    fn describe(&self) -> String {
        format!("tcp connect {}", self.addr)
    }
}

/// HTTP GET 回應 2xx 即就緒
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(
            reqwest::Client::builder()
                .timeout(Duration::from_secs(2))
                .build()
                .expect("Failed to build HTTP client"),
            url.into(),
        )
    }

    pub fn with_client(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl ReadyProbe for HttpProbe {
    async fn check(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    fn describe(&self) -> String {
        format!("http get {}", self.url)
    }
}

struct ExitProbe;

#[async_trait]
impl ReadyProbe for ExitProbe {
    async fn check(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        "exit code".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{RetryPolicy, ServiceKind};

    fn one_shot_descriptor(name: &str, command: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.to_string(),
            kind: ServiceKind::OneShot,
            image: None,
            command: Some(command.to_string()),
            stop_command: None,
            ports: Vec::new(),
            depends_on: Vec::new(),
            env: BTreeMap::new(),
            ready_check: ReadyCheckSpec::Exit,
            retry: RetryPolicy::default(),
        }
    }

    #[tokio::test]
    async fn test_one_shot_exit_codes() {
        let runtime = ProcessRuntime::new();
        let env = BTreeMap::new();

        let ok = runtime
            .start(&one_shot_descriptor("ok", "exit 0"), &env)
            .await
            .unwrap();
        assert_eq!(runtime.wait(&ok).await.unwrap(), 0);

        let bad = runtime
            .start(&one_shot_descriptor("bad", "exit 3"), &env)
            .await
            .unwrap();
        assert_eq!(runtime.wait(&bad).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_env_is_injected() {
        let runtime = ProcessRuntime::new();
        let mut env = BTreeMap::new();
        env.insert("EXPECTED".to_string(), "yes".to_string());

        let handle = runtime
            .start(
                &one_shot_descriptor("check-env", "test \"$EXPECTED\" = yes"),
                &env,
            )
            .await
            .unwrap();
        assert_eq!(runtime.wait(&handle).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_for_unknown_handles() {
        let runtime = ProcessRuntime::new();
        let handle = ServiceHandle {
            service: "ghost".to_string(),
            id: 42,
        };
        assert!(runtime.stop(&handle).await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_kills_long_running_process() {
        let runtime = ProcessRuntime::new();
        let mut descriptor = one_shot_descriptor("sleeper", "sleep 30");
        descriptor.kind = ServiceKind::LongRunning;
        descriptor.ready_check = ReadyCheckSpec::Tcp { port: 1 };

        let handle = runtime.start(&descriptor, &BTreeMap::new()).await.unwrap();
        runtime.stop(&handle).await.unwrap();

        // 停止後 handle 失效
        assert!(runtime.wait(&handle).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_command_is_a_start_failure() {
        let runtime = ProcessRuntime::new();
        let mut descriptor = one_shot_descriptor("no-command", "");
        descriptor.command = None;

        let err = runtime.start(&descriptor, &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, OrchError::StartFailedError { .. }));
    }
}
