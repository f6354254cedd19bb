use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing required configuration key: {key}")]
    MissingConfigError { key: String },

    #[error("Configuration error in {field}: {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Invalid value '{value}' for {field}: {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependencyError { service: String, dependency: String },

    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    CycleDetectedError { path: Vec<String> },

    #[error("Service '{service}' failed to start: {reason}")]
    StartFailedError { service: String, reason: String },

    #[error("Service '{service}' not ready after {attempts} attempts")]
    ReadyTimeoutError { service: String, attempts: u32 },

    #[error("One-shot service '{service}' exited with code {code}")]
    OneShotFailedError { service: String, code: i32 },

    #[error("Run cancelled")]
    CancelledError,
}

pub type Result<T> = std::result::Result<T, OrchError>;

/// 錯誤分類，對應 CLI 退出碼
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Config,
    Graph,
    Service,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl OrchError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            OrchError::IoError(_)
            | OrchError::MissingConfigError { .. }
            | OrchError::ConfigValidationError { .. }
            | OrchError::InvalidConfigValueError { .. } => ErrorCategory::Config,
            OrchError::UnknownDependencyError { .. } | OrchError::CycleDetectedError { .. } => {
                ErrorCategory::Graph
            }
            OrchError::StartFailedError { .. }
            | OrchError::ReadyTimeoutError { .. }
            | OrchError::OneShotFailedError { .. }
            | OrchError::CancelledError => ErrorCategory::Service,
            OrchError::SerializationError(_) => ErrorCategory::System,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            OrchError::IoError(_) | OrchError::SerializationError(_) => ErrorSeverity::Critical,
            OrchError::MissingConfigError { .. }
            | OrchError::ConfigValidationError { .. }
            | OrchError::InvalidConfigValueError { .. }
            | OrchError::UnknownDependencyError { .. }
            | OrchError::CycleDetectedError { .. } => ErrorSeverity::Medium,
            OrchError::StartFailedError { .. }
            | OrchError::ReadyTimeoutError { .. }
            | OrchError::OneShotFailedError { .. } => ErrorSeverity::High,
            OrchError::CancelledError => ErrorSeverity::Low,
        }
    }

    /// 退出碼: 2 = 配置/圖驗證錯誤, 1 = 執行期失敗
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::Config | ErrorCategory::Graph => 2,
            ErrorCategory::Service | ErrorCategory::System => 1,
        }
    }

    pub fn recovery_suggestion(&self) -> String {
        match self {
            OrchError::IoError(_) => "Check that the file exists and is readable".to_string(),
            OrchError::SerializationError(_) => {
                "This is likely a bug; re-run with --verbose and report it".to_string()
            }
            OrchError::MissingConfigError { key } => format!(
                "Set {} in the environment or in the env file referenced by the stack file",
                key
            ),
            OrchError::ConfigValidationError { field, .. } => {
                format!("Fix the '{}' section of the stack file", field)
            }
            OrchError::InvalidConfigValueError { field, .. } => {
                format!("Fix the value of '{}' in the stack file", field)
            }
            OrchError::UnknownDependencyError { dependency, .. } => format!(
                "Declare a [[services]] entry named '{}' or remove it from depends_on",
                dependency
            ),
            OrchError::CycleDetectedError { .. } => {
                "Break the cycle by removing one of the depends_on edges".to_string()
            }
            OrchError::StartFailedError { service, .. } => {
                format!("Check the command declared for service '{}'", service)
            }
            OrchError::ReadyTimeoutError { service, .. } => format!(
                "Check the logs of '{}', or raise max_attempts / max_delay_ms under [health]",
                service
            ),
            OrchError::OneShotFailedError { service, .. } => format!(
                "Inspect the output of '{}'; transient failures can be retried via retry_attempts",
                service
            ),
            OrchError::CancelledError => "Re-run when ready".to_string(),
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self.category() {
            ErrorCategory::Config => format!("Configuration problem: {}", self),
            ErrorCategory::Graph => format!("Invalid service topology: {}", self),
            ErrorCategory::Service => format!("Startup failed: {}", self),
            ErrorCategory::System => format!("Internal error: {}", self),
        }
    }
}
