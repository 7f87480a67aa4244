use std::fmt;
use thiserror::Error;

/// 命令执行失败时返回给调用方的错误
///
/// 这些错误都是同步的：命令被拒绝时状态机不发生任何变化，也不会向引擎发出请求。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SipError {
    /// 命令需要已注册状态
    #[error("Not registered with a SIP server")]
    NotRegistered,

    /// 当前状态不允许该命令
    #[error("Cannot {command} while {state}")]
    InvalidTransition {
        command: &'static str,
        state: &'static str,
    },

    /// 呼叫目标无效
    #[error("Invalid call target: {target}")]
    InvalidTarget { target: String },

    /// 配置校验失败
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// 会话驱动任务已停止
    #[error("Session driver is closed")]
    Closed,
}

impl SipError {
    /// 创建状态不匹配错误
    pub fn invalid_transition(command: &'static str, state: &'static str) -> Self {
        SipError::InvalidTransition { command, state }
    }

    /// 创建无效目标错误
    pub fn invalid_target(target: impl Into<String>) -> Self {
        SipError::InvalidTarget {
            target: target.into(),
        }
    }

    /// 判断错误是否可恢复（换个时机重试可能成功）
    pub fn is_recoverable(&self) -> bool {
        match self {
            SipError::NotRegistered => true,
            SipError::InvalidTransition { .. } => true,
            SipError::InvalidTarget { .. } => false,
            SipError::Config(_) => false,
            SipError::Closed => false,
        }
    }

    /// 获取标准错误代码，用于日志分析
    pub fn error_code(&self) -> &'static str {
        match self {
            SipError::NotRegistered => "NOT_REGISTERED",
            SipError::InvalidTransition { .. } => "INVALID_TRANSITION",
            SipError::InvalidTarget { .. } => "INVALID_TARGET",
            SipError::Config(_) => "INVALID_CONFIG",
            SipError::Closed => "CLOSED",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing required field: {0}")]
    Missing(String),
}

/// 引擎适配器请求失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineFailure {
    /// 对端或服务器拒绝，例如 "403 Forbidden"
    #[error("{reason}")]
    Refused { reason: String },

    /// 引擎内部的意外错误
    #[error("{0}")]
    Internal(String),
}

impl EngineFailure {
    pub fn refused(reason: impl Into<String>) -> Self {
        EngineFailure::Refused {
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        EngineFailure::Internal(message.into())
    }
}

/// 引擎请求的结果类型
pub type EngineResult<T> = Result<T, EngineFailure>;

/// 快照中记录的错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    RegistrationFailed,
    CallSetupFailed,
    NotRegistered,
    InvalidTransition,
    EngineError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RegistrationFailed => "RegistrationFailed",
            ErrorKind::CallSetupFailed => "CallSetupFailed",
            ErrorKind::NotRegistered => "NotRegistered",
            ErrorKind::InvalidTransition => "InvalidTransition",
            ErrorKind::EngineError => "EngineError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 最近一次异步失败，作为快照的一部分交给订阅者
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    pub kind: ErrorKind,
    pub message: String,
}

impl LastError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// 注册失败：拒绝归为 RegistrationFailed，内部错误归为 EngineError
    pub fn from_registration(failure: EngineFailure) -> Self {
        match failure {
            EngineFailure::Refused { reason } => Self::new(ErrorKind::RegistrationFailed, reason),
            EngineFailure::Internal(message) => Self::new(ErrorKind::EngineError, message),
        }
    }

    /// 呼叫建立失败：拒绝归为 CallSetupFailed，内部错误归为 EngineError
    pub fn from_call_setup(failure: EngineFailure) -> Self {
        match failure {
            EngineFailure::Refused { reason } => Self::new(ErrorKind::CallSetupFailed, reason),
            EngineFailure::Internal(message) => Self::new(ErrorKind::EngineError, message),
        }
    }
}

impl fmt::Display for LastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
