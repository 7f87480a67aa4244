/// 会话状态
///
/// 唯一的事实来源是一个带标签的状态值；快照和 UI 布尔值都从它派生。
use crate::config::SessionConfig;
use crate::engine::{CallHandle, InvitationHandle};
use crate::error::LastError;
use std::fmt;
use std::sync::Arc;

/// 单调递增的代次，用来识别过期的引擎结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(pub(crate) u64);

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 一次 connect 产生的注册记录
#[derive(Debug, Clone)]
pub struct Registration {
    pub epoch: Epoch,
    pub config: Arc<SessionConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outbound,
    Inbound,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallDirection::Outbound => "outbound",
            CallDirection::Inbound => "inbound",
        }
    }
}

/// 句柄尚未知时先到达的呼叫事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CallSignal {
    Established,
    Terminated { reason: Option<String> },
}

/// 单个呼叫
#[derive(Debug, Clone)]
pub struct Call {
    pub epoch: Epoch,
    pub direction: CallDirection,
    pub remote_party: String,
    /// 引擎结果返回前为 None
    pub handle: Option<CallHandle>,
    pub(crate) early_signals: Vec<(CallHandle, CallSignal)>,
}

impl Call {
    pub(crate) fn new(epoch: Epoch, direction: CallDirection, remote_party: String) -> Self {
        Self {
            epoch,
            direction,
            remote_party,
            handle: None,
            early_signals: Vec::new(),
        }
    }
}

/// 已注册状态下的呼叫槽位
#[derive(Debug, Clone)]
pub enum CallSlot {
    Idle,
    Calling(Call),
    Ringing {
        call: Call,
        invitation: InvitationHandle,
    },
    Ongoing(Call),
}

impl CallSlot {
    pub fn call(&self) -> Option<&Call> {
        match self {
            CallSlot::Idle => None,
            CallSlot::Calling(call) | CallSlot::Ongoing(call) => Some(call),
            CallSlot::Ringing { call, .. } => Some(call),
        }
    }

    pub fn phase(&self) -> CallPhase {
        match self {
            CallSlot::Idle => CallPhase::Idle,
            CallSlot::Calling(_) => CallPhase::Calling,
            CallSlot::Ringing { .. } => CallPhase::Ringing,
            CallSlot::Ongoing(_) => CallPhase::Ongoing,
        }
    }
}

/// 会话状态：注册状态与呼叫状态的合法组合
#[derive(Debug, Clone, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting {
        registration: Registration,
    },
    Registered {
        registration: Registration,
        call: CallSlot,
    },
}

impl SessionState {
    pub fn kind(&self) -> StateKind {
        match self {
            SessionState::Disconnected => StateKind::Disconnected,
            SessionState::Connecting { .. } => StateKind::Connecting,
            SessionState::Registered { call, .. } => match call {
                CallSlot::Idle => StateKind::Idle,
                CallSlot::Calling(_) => StateKind::Calling,
                CallSlot::Ringing { .. } => StateKind::Ringing,
                CallSlot::Ongoing(_) => StateKind::Ongoing,
            },
        }
    }

    pub fn registration(&self) -> Option<&Registration> {
        match self {
            SessionState::Disconnected => None,
            SessionState::Connecting { registration }
            | SessionState::Registered { registration, .. } => Some(registration),
        }
    }
}

/// 六个可达状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    Disconnected,
    Connecting,
    Idle,
    Calling,
    Ringing,
    Ongoing,
}

impl StateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateKind::Disconnected => "disconnected",
            StateKind::Connecting => "connecting",
            StateKind::Idle => "registered/idle",
            StateKind::Calling => "registered/calling",
            StateKind::Ringing => "registered/ringing",
            StateKind::Ongoing => "registered/ongoing",
        }
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationStatus {
    #[default]
    Disconnected,
    Connecting,
    Registered,
}

impl RegistrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationStatus::Disconnected => "disconnected",
            RegistrationStatus::Connecting => "connecting",
            RegistrationStatus::Registered => "registered",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallPhase {
    #[default]
    Idle,
    Calling,
    Ringing,
    Ongoing,
}

impl CallPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallPhase::Idle => "idle",
            CallPhase::Calling => "calling",
            CallPhase::Ringing => "ringing",
            CallPhase::Ongoing => "ongoing",
        }
    }
}

/// 交给订阅者的不可变快照
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    /// 每次变化加一
    pub revision: u64,
    pub registration_status: RegistrationStatus,
    pub identity: Option<String>,
    pub call_phase: CallPhase,
    pub call_id: Option<CallHandle>,
    pub direction: Option<CallDirection>,
    pub remote_party: Option<String>,
    pub last_error: Option<LastError>,
}

impl Snapshot {
    pub(crate) fn capture(state: &SessionState, last_error: Option<&LastError>) -> Self {
        let (registration_status, call) = match state {
            SessionState::Disconnected => (RegistrationStatus::Disconnected, None),
            SessionState::Connecting { .. } => (RegistrationStatus::Connecting, None),
            SessionState::Registered { call, .. } => (RegistrationStatus::Registered, Some(call)),
        };
        let active = call.and_then(CallSlot::call);

        Self {
            revision: 0,
            registration_status,
            identity: state
                .registration()
                .map(|registration| registration.config.identity.clone()),
            call_phase: call.map(CallSlot::phase).unwrap_or_default(),
            call_id: active.and_then(|c| c.handle.clone()),
            direction: active.map(|c| c.direction),
            remote_party: active.map(|c| c.remote_party.clone()),
            last_error: last_error.cloned(),
        }
    }

    /// 快照对应的状态
    pub fn state(&self) -> StateKind {
        match self.registration_status {
            RegistrationStatus::Disconnected => StateKind::Disconnected,
            RegistrationStatus::Connecting => StateKind::Connecting,
            RegistrationStatus::Registered => match self.call_phase {
                CallPhase::Idle => StateKind::Idle,
                CallPhase::Calling => StateKind::Calling,
                CallPhase::Ringing => StateKind::Ringing,
                CallPhase::Ongoing => StateKind::Ongoing,
            },
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registration_status == RegistrationStatus::Registered
    }

    pub fn in_call(&self) -> bool {
        self.call_phase != CallPhase::Idle
    }

    /// 忽略 revision 比较内容
    pub(crate) fn same_view(&self, other: &Snapshot) -> bool {
        Snapshot {
            revision: other.revision,
            ..self.clone()
        } == *other
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} call={}",
            self.revision,
            self.registration_status.as_str(),
            self.call_phase.as_str()
        )?;
        if let Some(remote) = &self.remote_party {
            write!(f, " remote={}", remote)?;
        }
        if let Some(error) = &self.last_error {
            write!(f, " error=({})", error)?;
        }
        Ok(())
    }
}
