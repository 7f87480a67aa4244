// 声明所有模块
pub mod config;
pub mod console;
pub mod engine;
pub mod error;
pub mod phone;
pub mod session;
pub mod utils;

/// 重新导出thiserror错误类型
pub use crate::error::{ConfigError, EngineFailure, EngineResult, ErrorKind, LastError, SipError};

/// 主要API重新导出，简化使用
pub use crate::config::{SessionConfig, SessionHooks};
pub use crate::engine::{ScriptMode, ScriptedEngine, SipEngine};
pub use crate::phone::SipPhone;
pub use crate::session::{CallDirection, CallPhase, RegistrationStatus, Snapshot, StateKind};

use std::sync::Arc;

/// 库版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 便捷函数：基于给定引擎创建软电话
pub fn create_phone(engine: Arc<dyn SipEngine>) -> SipPhone {
    SipPhone::new(engine)
}

/// 便捷函数：创建使用脚本化引擎的软电话，同时返回引擎以便扮演远端
pub fn create_scripted_phone(mode: ScriptMode) -> (SipPhone, Arc<ScriptedEngine>) {
    let engine = Arc::new(ScriptedEngine::new(mode));
    (SipPhone::new(engine.clone()), engine)
}
