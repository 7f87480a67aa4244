/// Engine 模块
///
/// SIP 引擎适配器的边界定义。协议事务、SDP 协商、WebSocket 传输和音频都在引擎内部，
/// 会话核心只通过 `SipEngine` trait 驱动它，并通过 `EventSink` 接收它的事件。
///
/// ## 使用示例
///
/// ```rust,no_run
/// use sip_phone::engine::{ScriptedEngine, ScriptMode};
/// use sip_phone::SipPhone;
/// use std::sync::Arc;
///
/// # async fn demo() {
/// let engine = Arc::new(ScriptedEngine::new(ScriptMode::Auto));
/// let phone = SipPhone::new(engine.clone());
/// engine.invite_from("sip:bob@example.com");
/// # }
/// ```
mod scripted;

pub use scripted::{EngineCall, ScriptMode, ScriptedEngine};

use crate::error::EngineResult;
pub use crate::session::EventSink;
use async_trait::async_trait;
use std::fmt;
use uuid::Uuid;

/// 引擎分配的呼叫句柄
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallHandle(String);

impl CallHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// 生成基于 UUID 的句柄
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 引擎的来电邀请句柄
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InvitationHandle(String);

impl InvitationHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InvitationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 拒绝来电的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// 用户拒接
    Declined,

    /// 已有通话
    Busy,
}

impl RejectReason {
    /// 对应的 SIP 状态码
    pub fn status_code(&self) -> u16 {
        match self {
            RejectReason::Declined => 603,
            RejectReason::Busy => 486,
        }
    }
}

/// 注册请求参数
#[derive(Clone)]
pub struct RegisterRequest {
    pub identity: String,
    pub auth_username: String,
    pub credentials: String,
    pub server_address: String,
    pub user_agent: String,
    pub expires: u32,
}

impl fmt::Debug for RegisterRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterRequest")
            .field("identity", &self.identity)
            .field("auth_username", &self.auth_username)
            .field("credentials", &"<redacted>")
            .field("server_address", &self.server_address)
            .field("user_agent", &self.user_agent)
            .field("expires", &self.expires)
            .finish()
    }
}

/// 引擎发出的生命周期事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// 来电邀请
    IncomingInvitation {
        invitation: InvitationHandle,
        caller: String,
    },

    /// 主叫在应答前取消了邀请
    InvitationCancelled { invitation: InvitationHandle },

    /// 媒体已建立
    CallEstablished { call: CallHandle },

    /// 呼叫结束（包括从未建立就结束的呼叫）
    CallTerminated {
        call: CallHandle,
        reason: Option<String>,
    },

    /// 非请求触发的注册结果，例如刷新失败
    RegistrationResult(EngineResult<()>),
}

/// SIP 引擎适配器
///
/// 每个请求都是异步的；它的最终结果或随后的事件驱动下一次状态转换。
#[async_trait]
pub trait SipEngine: Send + Sync {
    /// 绑定事件出口，会话核心创建时调用一次
    fn attach(&self, events: EventSink);

    /// 向服务器注册
    async fn register(&self, request: &RegisterRequest) -> EngineResult<()>;

    /// 注销
    async fn unregister(&self) -> EngineResult<()>;

    /// 发起呼叫，成功时返回引擎分配的句柄
    async fn place_call(&self, target: &str) -> EngineResult<CallHandle>;

    /// 接受来电邀请
    async fn accept_invitation(&self, invitation: &InvitationHandle) -> EngineResult<CallHandle>;

    /// 拒绝来电邀请
    async fn reject_invitation(
        &self,
        invitation: &InvitationHandle,
        reason: RejectReason,
    ) -> EngineResult<()>;

    /// 结束呼叫 (BYE / CANCEL)
    async fn terminate_call(&self, call: &CallHandle) -> EngineResult<()>;
}
