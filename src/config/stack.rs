use crate::domain::model::{ReadyCheckSpec, RetryPolicy, ServiceDescriptor, ServiceKind};
use crate::utils::error::{OrchError, Result};
use crate::utils::validation::{
    self, validate_non_empty_string, validate_port, validate_positive_number,
    validate_service_name, validate_url,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

/// Stack 檔：一個部署單位的靜態服務拓撲宣告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    pub stack: StackInfo,
    pub config: Option<ConfigSection>,
    pub health: Option<HealthSection>,
    pub services: Vec<ServiceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackInfo {
    pub name: String,
    pub description: Option<String>,
    pub version: Option<String>,
}

/// 組態解析來源：env 檔路徑與必要鍵
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSection {
    pub env_file: Option<String>,
    pub required_keys: Option<Vec<String>>,
}

/// Health Gate 預設參數，可整組省略
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSection {
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct HealthSettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    pub description: Option<String>,
    pub image: Option<String>,
    pub command: Option<String>,
    pub stop_command: Option<String>,
    pub ports: Option<Vec<u16>>,
    pub depends_on: Option<Vec<String>>,
    pub one_shot: Option<bool>,
    /// 值可含 `${KEY}` 佔位符，啟動時以 ResolvedConfig 渲染
    pub env: Option<HashMap<String, String>>,
    pub ready_check: Option<ReadyCheckEntry>,
    pub retry_attempts: Option<u32>,
    pub retry_delay_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyCheckEntry {
    pub r#type: String,
    pub port: Option<u16>,
    pub url: Option<String>,
}

impl StackConfig {
    /// 從 TOML 檔案載入 stack 宣告
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(OrchError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析 stack 宣告
    ///
    /// `${KEY}` 佔位符在這裡原樣保留，於服務啟動時才以
    /// ResolvedConfig 渲染，讓 env 檔與程序環境走同一條路。
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| OrchError::ConfigValidationError {
            field: "stack_toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    pub fn env_file(&self) -> Option<&str> {
        self.config.as_ref().and_then(|c| c.env_file.as_deref())
    }

    pub fn required_keys(&self) -> Vec<String> {
        self.config
            .as_ref()
            .and_then(|c| c.required_keys.clone())
            .unwrap_or_default()
    }

    pub fn health_settings(&self) -> HealthSettings {
        let defaults = HealthSettings::default();
        match &self.health {
            Some(section) => HealthSettings {
                max_attempts: section.max_attempts.unwrap_or(defaults.max_attempts),
                initial_delay_ms: section.initial_delay_ms.unwrap_or(defaults.initial_delay_ms),
                max_delay_ms: section.max_delay_ms.unwrap_or(defaults.max_delay_ms),
            },
            None => defaults,
        }
    }

    /// 驗證 stack 宣告的合理性
    ///
    /// 依賴存在性與循環偵測屬於圖層（build_plan）的責任，
    /// 這裡只驗證每個條目自身的形狀。
    pub fn validate_stack(&self) -> Result<()> {
        validate_non_empty_string("stack.name", &self.stack.name)?;

        if self.services.is_empty() {
            return Err(OrchError::ConfigValidationError {
                field: "services".to_string(),
                message: "At least one [[services]] entry is required".to_string(),
            });
        }

        let settings = self.health_settings();
        validate_positive_number("health.max_attempts", settings.max_attempts as u64, 1)?;
        validate_positive_number("health.initial_delay_ms", settings.initial_delay_ms, 1)?;
        if settings.max_delay_ms < settings.initial_delay_ms {
            return Err(OrchError::ConfigValidationError {
                field: "health.max_delay_ms".to_string(),
                message: "max_delay_ms must be >= initial_delay_ms".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for service in &self.services {
            validate_service_name("services.name", &service.name)?;

            if !seen.insert(service.name.as_str()) {
                return Err(OrchError::ConfigValidationError {
                    field: "services.name".to_string(),
                    message: format!("Duplicate service name '{}'", service.name),
                });
            }

            self.validate_service(service)?;
        }

        Ok(())
    }

    fn validate_service(&self, service: &ServiceEntry) -> Result<()> {
        let field = |suffix: &str| format!("services.{}.{}", service.name, suffix);

        for port in service.ports.iter().flatten() {
            validate_port(&field("ports"), *port)?;
        }

        let one_shot = service.one_shot.unwrap_or(false);

        if one_shot {
            // One-shot 的完成條件是退出碼 0，不接受額外的 ready_check
            if service.ready_check.is_some() {
                return Err(OrchError::ConfigValidationError {
                    field: field("ready_check"),
                    message: "One-shot services are gated on exit code, not a ready_check"
                        .to_string(),
                });
            }
        } else {
            if service.retry_attempts.is_some() || service.retry_delay_seconds.is_some() {
                return Err(OrchError::ConfigValidationError {
                    field: field("retry_attempts"),
                    message: "Retry policy applies to one-shot services only; long-running \
                              readiness is governed by [health]"
                        .to_string(),
                });
            }
            // 解析一次以驗證；結果在 descriptors 再算一次
            resolve_ready_check(service)?;
        }

        Ok(())
    }

    /// 降階為協調核心使用的 descriptor 集合
    pub fn descriptors(&self) -> Result<Vec<ServiceDescriptor>> {
        self.services
            .iter()
            .map(|service| {
                let one_shot = service.one_shot.unwrap_or(false);
                let ready_check = if one_shot {
                    ReadyCheckSpec::Exit
                } else {
                    resolve_ready_check(service)?
                };

                Ok(ServiceDescriptor {
                    name: service.name.clone(),
                    kind: if one_shot {
                        ServiceKind::OneShot
                    } else {
                        ServiceKind::LongRunning
                    },
                    image: service.image.clone(),
                    command: service.command.clone(),
                    stop_command: service.stop_command.clone(),
                    ports: service.ports.clone().unwrap_or_default(),
                    depends_on: service.depends_on.clone().unwrap_or_default(),
                    env: service
                        .env
                        .as_ref()
                        .map(|env| env.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                        .unwrap_or_else(BTreeMap::new),
                    ready_check,
                    retry: RetryPolicy {
                        attempts: service.retry_attempts.unwrap_or(0),
                        delay_seconds: service.retry_delay_seconds.unwrap_or(1),
                    },
                })
            })
            .collect()
    }
}

/// 長駐服務的 ready check：宣告優先，否則從第一個 port 推導 TCP 檢查
fn resolve_ready_check(service: &ServiceEntry) -> Result<ReadyCheckSpec> {
    let field = format!("services.{}.ready_check", service.name);

    match &service.ready_check {
        Some(entry) => match entry.r#type.as_str() {
            "tcp" => {
                let port = entry
                    .port
                    .or_else(|| service.ports.as_ref().and_then(|p| p.first().copied()))
                    .ok_or_else(|| OrchError::ConfigValidationError {
                        field: field.clone(),
                        message: "tcp ready_check needs a port (or a ports list)".to_string(),
                    })?;
                validate_port(&format!("{}.port", field), port)?;
                Ok(ReadyCheckSpec::Tcp { port })
            }
            "http" => {
                let url = entry.url.as_deref().ok_or_else(|| {
                    OrchError::ConfigValidationError {
                        field: field.clone(),
                        message: "http ready_check needs a url".to_string(),
                    }
                })?;
                validate_url(&format!("{}.url", field), url)?;
                Ok(ReadyCheckSpec::Http {
                    url: url.to_string(),
                })
            }
            other => Err(OrchError::InvalidConfigValueError {
                field: format!("{}.type", field),
                value: other.to_string(),
                reason: "Supported ready_check types: tcp, http".to_string(),
            }),
        },
        None => {
            let port = service
                .ports
                .as_ref()
                .and_then(|p| p.first().copied())
                .ok_or_else(|| OrchError::ConfigValidationError {
                    field,
                    message: "Long-running services need a ready_check or a ports list \
                              to derive one"
                        .to_string(),
                })?;
            Ok(ReadyCheckSpec::Tcp { port })
        }
    }
}

impl validation::Validate for StackConfig {
    fn validate(&self) -> Result<()> {
        self.validate_stack()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC_STACK: &str = r#"
[stack]
name = "apixy"
description = "web API + postgres + migration"
version = "1.0.0"

[config]
env_file = ".env"
required_keys = ["POSTGRES_HOST", "POSTGRES_PASSWORD"]

[health]
max_attempts = 5
initial_delay_ms = 50
max_delay_ms = 1000

[[services]]
name = "db"
image = "postgres:13"
command = "postgres"
ports = [5432]

[[services]]
name = "migrate"
command = "aerich upgrade"
one_shot = true
depends_on = ["db"]
retry_attempts = 2
retry_delay_seconds = 3

[services.env]
POSTGRES_HOST = "${POSTGRES_HOST}"

[[services]]
name = "api"
command = "uvicorn app:app"
ports = [8000]
depends_on = ["migrate"]

[services.ready_check]
type = "http"
url = "http://localhost:8000/health"
"#;

    #[test]
    fn test_parse_and_validate_basic_stack() {
        let config = StackConfig::from_toml_str(BASIC_STACK).unwrap();
        config.validate_stack().unwrap();

        assert_eq!(config.stack.name, "apixy");
        assert_eq!(config.env_file(), Some(".env"));
        assert_eq!(
            config.required_keys(),
            vec!["POSTGRES_HOST".to_string(), "POSTGRES_PASSWORD".to_string()]
        );

        let settings = config.health_settings();
        assert_eq!(settings.max_attempts, 5);
        assert_eq!(settings.initial_delay_ms, 50);
        assert_eq!(settings.max_delay_ms, 1000);
    }

    #[test]
    fn test_lowering_to_descriptors() {
        let config = StackConfig::from_toml_str(BASIC_STACK).unwrap();
        let descriptors = config.descriptors().unwrap();
        assert_eq!(descriptors.len(), 3);

        let db = descriptors.iter().find(|d| d.name == "db").unwrap();
        assert_eq!(db.kind, ServiceKind::LongRunning);
        // ready_check 未宣告時從 ports 推導 TCP
        assert_eq!(db.ready_check, ReadyCheckSpec::Tcp { port: 5432 });

        let migrate = descriptors.iter().find(|d| d.name == "migrate").unwrap();
        assert_eq!(migrate.kind, ServiceKind::OneShot);
        assert_eq!(migrate.ready_check, ReadyCheckSpec::Exit);
        assert_eq!(migrate.retry.attempts, 2);
        assert_eq!(migrate.retry.delay_seconds, 3);
        assert_eq!(
            migrate.env.get("POSTGRES_HOST").map(String::as_str),
            Some("${POSTGRES_HOST}")
        );

        let api = descriptors.iter().find(|d| d.name == "api").unwrap();
        assert_eq!(
            api.ready_check,
            ReadyCheckSpec::Http {
                url: "http://localhost:8000/health".to_string()
            }
        );
        assert_eq!(api.depends_on, vec!["migrate".to_string()]);
    }

    #[test]
    fn test_duplicate_service_names_rejected() {
        let toml = r#"
[stack]
name = "dup"

[[services]]
name = "db"
ports = [5432]

[[services]]
name = "db"
ports = [5433]
"#;
        let config = StackConfig::from_toml_str(toml).unwrap();
        let err = config.validate_stack().unwrap_err();
        assert!(matches!(err, OrchError::ConfigValidationError { .. }));
    }

    #[test]
    fn test_one_shot_with_ready_check_rejected() {
        let toml = r#"
[stack]
name = "bad"

[[services]]
name = "migrate"
one_shot = true

[services.ready_check]
type = "tcp"
port = 5432
"#;
        let config = StackConfig::from_toml_str(toml).unwrap();
        assert!(config.validate_stack().is_err());
    }

    #[test]
    fn test_retry_on_long_running_rejected() {
        let toml = r#"
[stack]
name = "bad"

[[services]]
name = "api"
ports = [8000]
retry_attempts = 3
"#;
        let config = StackConfig::from_toml_str(toml).unwrap();
        assert!(config.validate_stack().is_err());
    }

    #[test]
    fn test_long_running_without_ports_or_check_rejected() {
        let toml = r#"
[stack]
name = "bad"

[[services]]
name = "worker"
command = "run-worker"
"#;
        let config = StackConfig::from_toml_str(toml).unwrap();
        assert!(config.validate_stack().is_err());
    }

    #[test]
    fn test_invalid_ready_check_url_rejected() {
        let toml = r#"
[stack]
name = "bad"

[[services]]
name = "api"
ports = [8000]

[services.ready_check]
type = "http"
url = "not-a-url"
"#;
        let config = StackConfig::from_toml_str(toml).unwrap();
        assert!(config.validate_stack().is_err());
    }

    #[test]
    fn test_unknown_ready_check_type_rejected() {
        let toml = r#"
[stack]
name = "bad"

[[services]]
name = "api"
ports = [8000]

[services.ready_check]
type = "grpc"
"#;
        let config = StackConfig::from_toml_str(toml).unwrap();
        let err = config.validate_stack().unwrap_err();
        assert!(matches!(err, OrchError::InvalidConfigValueError { .. }));
    }
}
