/// 会话状态机
///
/// 纯同步的状态转换逻辑：输入是命令、引擎事件和引擎请求结果，输出是 `Step`
/// （需要发给引擎的请求 + 需要触发的回调）。所有输入由驱动任务串行送入。
use super::state::{
    Call, CallDirection, CallSignal, CallSlot, Epoch, Registration, SessionState, Snapshot,
    StateKind,
};
use crate::config::SessionConfig;
use crate::engine::{CallHandle, EngineEvent, InvitationHandle, RegisterRequest, RejectReason};
use crate::error::{EngineResult, ErrorKind, LastError, SipError};
use crate::utils::normalize_target;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 句柄未知前最多缓存的呼叫事件数
const MAX_EARLY_SIGNALS: usize = 8;

/// 界面发出的命令
#[derive(Debug)]
pub enum Command {
    Connect(SessionConfig),
    Disconnect,
    MakeCall(String),
    AnswerCall,
    RejectCall,
    EndCall,
}

/// 引擎请求的最终结果，带发出请求时的代次
#[derive(Debug)]
pub enum Outcome {
    Registered {
        epoch: Epoch,
        result: EngineResult<()>,
    },
    CallPlaced {
        epoch: Epoch,
        result: EngineResult<CallHandle>,
    },
    InvitationAccepted {
        epoch: Epoch,
        result: EngineResult<CallHandle>,
    },
}

/// 需要发给引擎的请求
#[derive(Debug, Clone)]
pub enum Effect {
    Register {
        epoch: Epoch,
        request: RegisterRequest,
    },
    Unregister,
    PlaceCall {
        epoch: Epoch,
        target: String,
    },
    AcceptInvitation {
        epoch: Epoch,
        invitation: InvitationHandle,
    },
    RejectInvitation {
        invitation: InvitationHandle,
        reason: RejectReason,
    },
    TerminateCall {
        call: CallHandle,
    },
}

/// 触发本地回调的转换
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Registered,
    RegistrationFailed(LastError),
    IncomingCall { caller: String },
    CallEstablished,
    CallEnded,
}

/// 一次转换的输出
#[derive(Debug, Default)]
pub struct Step {
    pub effects: Vec<Effect>,
    pub events: Vec<SessionEvent>,
    /// 一次输入引起多次转换时，最终状态之前的中间快照
    pub views: Vec<Snapshot>,
    /// 转换开始时的注册配置，回调从这里取
    pub config: Option<Arc<SessionConfig>>,
}

impl Step {
    pub fn is_empty(&self) -> bool {
        self.effects.is_empty() && self.events.is_empty()
    }
}

/// 会话状态机
#[derive(Debug, Clone, Default)]
pub struct SessionMachine {
    state: SessionState,
    last_error: Option<LastError>,
    last_epoch: u64,
}

impl SessionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn kind(&self) -> StateKind {
        self.state.kind()
    }

    pub fn last_error(&self) -> Option<&LastError> {
        self.last_error.as_ref()
    }

    /// 当前状态的快照（revision 由驱动任务填写）
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::capture(&self.state, self.last_error.as_ref())
    }

    fn next_epoch(&mut self) -> Epoch {
        self.last_epoch += 1;
        Epoch(self.last_epoch)
    }

    fn step(&self) -> Step {
        Step {
            config: self
                .state
                .registration()
                .map(|registration| registration.config.clone()),
            ..Step::default()
        }
    }

    /// 校验并执行命令；被拒绝的命令不改变任何状态
    pub fn handle_command(&mut self, command: Command) -> Result<Step, SipError> {
        match command {
            Command::Connect(config) => self.connect(config),
            Command::Disconnect => Ok(self.disconnect()),
            Command::MakeCall(target) => self.make_call(&target),
            Command::AnswerCall => self.answer_call(),
            Command::RejectCall => self.reject_call(),
            Command::EndCall => Ok(self.end_call()),
        }
    }

    fn connect(&mut self, config: SessionConfig) -> Result<Step, SipError> {
        if !matches!(self.state, SessionState::Disconnected) {
            return Err(SipError::invalid_transition("connect", self.kind().as_str()));
        }

        let epoch = self.next_epoch();
        let config = Arc::new(config);
        let request = RegisterRequest {
            identity: config.identity.clone(),
            auth_username: config.auth_username().to_string(),
            credentials: config.credentials.clone(),
            server_address: config.server_address.clone(),
            user_agent: config.user_agent.clone(),
            expires: config.register_expires,
        };

        info!(
            "开始注册: {} -> {} (epoch {})",
            config.identity, config.server_address, epoch
        );
        self.state = SessionState::Connecting {
            registration: Registration { epoch, config },
        };
        self.last_error = None;

        let mut step = self.step();
        step.effects.push(Effect::Register { epoch, request });
        Ok(step)
    }

    fn disconnect(&mut self) -> Step {
        let mut step = self.step();
        match std::mem::take(&mut self.state) {
            SessionState::Disconnected => {
                debug!("已经处于断开状态，忽略 disconnect");
            }
            SessionState::Connecting { registration } => {
                // 注册请求仍在途中，迟到的成功结果会触发注销
                info!("取消注册 (epoch {})", registration.epoch);
            }
            SessionState::Registered { registration, call } => {
                info!("断开连接: {}", registration.config.identity);
                tear_down(call, &mut step);
                step.effects.push(Effect::Unregister);
            }
        }
        step
    }

    fn make_call(&mut self, target: &str) -> Result<Step, SipError> {
        match &self.state {
            SessionState::Disconnected | SessionState::Connecting { .. } => {
                return Err(SipError::NotRegistered)
            }
            SessionState::Registered {
                call: CallSlot::Idle,
                ..
            } => {}
            SessionState::Registered { .. } => {
                return Err(SipError::invalid_transition(
                    "make a call",
                    self.kind().as_str(),
                ))
            }
        }

        let target = normalize_target(target)?;
        let epoch = self.next_epoch();
        if let SessionState::Registered { call, .. } = &mut self.state {
            *call = CallSlot::Calling(Call::new(epoch, CallDirection::Outbound, target.clone()));
        }
        self.last_error = None;
        info!("📞发起呼叫到: {} (epoch {})", target, epoch);

        let mut step = self.step();
        step.effects.push(Effect::PlaceCall { epoch, target });
        Ok(step)
    }

    fn answer_call(&mut self) -> Result<Step, SipError> {
        let kind = self.kind();
        let mut step = self.step();

        let SessionState::Registered { call: slot, .. } = &mut self.state else {
            return Err(SipError::invalid_transition("answer a call", kind.as_str()));
        };
        match std::mem::replace(slot, CallSlot::Idle) {
            CallSlot::Ringing { call, invitation } => {
                info!("接听来电: {}", call.remote_party);
                step.effects.push(Effect::AcceptInvitation {
                    epoch: call.epoch,
                    invitation,
                });
                *slot = CallSlot::Calling(call);
            }
            other => {
                *slot = other;
                return Err(SipError::invalid_transition("answer a call", kind.as_str()));
            }
        }

        self.last_error = None;
        Ok(step)
    }

    fn reject_call(&mut self) -> Result<Step, SipError> {
        let kind = self.kind();
        let mut step = self.step();

        let SessionState::Registered { call: slot, .. } = &mut self.state else {
            return Err(SipError::invalid_transition("reject a call", kind.as_str()));
        };
        match std::mem::replace(slot, CallSlot::Idle) {
            CallSlot::Ringing { call, invitation } => {
                info!("拒接来电: {}", call.remote_party);
                step.effects.push(Effect::RejectInvitation {
                    invitation,
                    reason: RejectReason::Declined,
                });
                step.events.push(SessionEvent::CallEnded);
                Ok(step)
            }
            other => {
                *slot = other;
                Err(SipError::invalid_transition("reject a call", kind.as_str()))
            }
        }
    }

    fn end_call(&mut self) -> Step {
        let mut step = self.step();

        let SessionState::Registered { call: slot, .. } = &mut self.state else {
            debug!("未注册，忽略挂断");
            return step;
        };
        match std::mem::replace(slot, CallSlot::Idle) {
            CallSlot::Calling(call) | CallSlot::Ongoing(call) => {
                info!("挂断呼叫: {}", call.remote_party);
                match call.handle {
                    Some(handle) => step.effects.push(Effect::TerminateCall { call: handle }),
                    // 句柄到达时按过期结果处理，由那时补发结束请求
                    None => debug!("呼叫句柄尚未返回 (epoch {})", call.epoch),
                }
                step.events.push(SessionEvent::CallEnded);
            }
            other => {
                debug!("没有进行中的呼叫，忽略挂断");
                *slot = other;
            }
        }
        step
    }

    /// 处理引擎事件
    pub fn handle_event(&mut self, event: EngineEvent) -> Step {
        let mut step = self.step();
        match event {
            EngineEvent::IncomingInvitation { invitation, caller } => {
                self.on_invitation(invitation, caller, &mut step)
            }
            EngineEvent::InvitationCancelled { invitation } => {
                self.on_invitation_cancelled(&invitation, &mut step)
            }
            EngineEvent::CallEstablished { call } => {
                self.on_call_signal(call, CallSignal::Established, &mut step)
            }
            EngineEvent::CallTerminated { call, reason } => {
                self.on_call_signal(call, CallSignal::Terminated { reason }, &mut step)
            }
            EngineEvent::RegistrationResult(result) => self.on_registration_event(result, &mut step),
        }
        step
    }

    fn on_invitation(&mut self, invitation: InvitationHandle, caller: String, step: &mut Step) {
        let epoch = self.next_epoch();
        match &mut self.state {
            SessionState::Registered { call: slot, .. } if matches!(slot, CallSlot::Idle) => {
                info!("收到来电: {} (epoch {})", caller, epoch);
                *slot = CallSlot::Ringing {
                    call: Call::new(epoch, CallDirection::Inbound, caller.clone()),
                    invitation,
                };
                step.events.push(SessionEvent::IncomingCall { caller });
            }
            SessionState::Registered { .. } => {
                warn!("已有呼叫，忙线拒绝来电: {}", caller);
                step.effects.push(Effect::RejectInvitation {
                    invitation,
                    reason: RejectReason::Busy,
                });
            }
            _ => {
                warn!("未注册，拒绝来电: {}", caller);
                step.effects.push(Effect::RejectInvitation {
                    invitation,
                    reason: RejectReason::Declined,
                });
            }
        }
    }

    fn on_invitation_cancelled(&mut self, invitation: &InvitationHandle, step: &mut Step) {
        if let SessionState::Registered { call: slot, .. } = &mut self.state {
            let pending = matches!(
                &*slot,
                CallSlot::Ringing { invitation: current, .. } if current == invitation
            );
            if pending {
                if let Some(call) = slot.call() {
                    info!("主叫取消了来电: {}", call.remote_party);
                }
                *slot = CallSlot::Idle;
                step.events.push(SessionEvent::CallEnded);
                return;
            }
        }
        debug!("丢弃过期的取消事件: {}", invitation);
    }

    fn on_call_signal(&mut self, handle: CallHandle, signal: CallSignal, step: &mut Step) {
        let SessionState::Registered { call: slot, .. } = &mut self.state else {
            debug!("未注册，丢弃呼叫事件: {} {:?}", handle, signal);
            return;
        };
        let current = match &mut *slot {
            CallSlot::Calling(call) | CallSlot::Ongoing(call) => call,
            _ => {
                debug!("没有进行中的呼叫，丢弃呼叫事件: {} {:?}", handle, signal);
                return;
            }
        };

        match &current.handle {
            Some(known) if *known == handle => {}
            Some(_) => {
                debug!("丢弃过期的呼叫事件: {} {:?}", handle, signal);
                return;
            }
            None => {
                if current.early_signals.len() < MAX_EARLY_SIGNALS {
                    debug!("呼叫句柄未知，暂存事件: {} {:?}", handle, signal);
                    current.early_signals.push((handle, signal));
                } else {
                    warn!("暂存的呼叫事件过多，丢弃: {} {:?}", handle, signal);
                }
                return;
            }
        }

        if let Some(error) = apply_signal(slot, signal, step) {
            self.last_error = Some(error);
        }
    }

    fn on_registration_event(&mut self, result: EngineResult<()>, step: &mut Step) {
        let failure = match result {
            Ok(()) => {
                debug!("注册刷新结果: 成功");
                return;
            }
            Err(failure) => failure,
        };

        match std::mem::take(&mut self.state) {
            SessionState::Registered { registration, call } => {
                let error = LastError::from_registration(failure);
                warn!("注册丢失: {} ({})", registration.config.identity, error);
                tear_down(call, step);
                self.last_error = Some(error.clone());
                step.events.push(SessionEvent::RegistrationFailed(error));
            }
            state => {
                // Connecting 时以带代次的注册结果为准
                debug!("忽略注册事件: {} ({})", failure, state.kind());
                self.state = state;
            }
        }
    }

    /// 处理引擎请求结果，代次不匹配的结果被丢弃
    pub fn handle_outcome(&mut self, outcome: Outcome) -> Step {
        let mut step = self.step();
        match outcome {
            Outcome::Registered { epoch, result } => {
                self.on_register_outcome(epoch, result, &mut step)
            }
            Outcome::CallPlaced { epoch, result } | Outcome::InvitationAccepted { epoch, result } => {
                self.on_call_outcome(epoch, result, &mut step)
            }
        }
        step
    }

    fn on_register_outcome(&mut self, epoch: Epoch, result: EngineResult<()>, step: &mut Step) {
        match std::mem::take(&mut self.state) {
            SessionState::Connecting { registration } if registration.epoch == epoch => {
                match result {
                    Ok(()) => {
                        info!("✔ 注册成功: {}", registration.config.identity);
                        self.state = SessionState::Registered {
                            registration,
                            call: CallSlot::Idle,
                        };
                        step.events.push(SessionEvent::Registered);
                    }
                    Err(failure) => {
                        let error = LastError::from_registration(failure);
                        warn!("注册失败: {} ({})", registration.config.identity, error);
                        self.last_error = Some(error.clone());
                        step.events.push(SessionEvent::RegistrationFailed(error));
                    }
                }
            }
            state => {
                let disconnected = matches!(state, SessionState::Disconnected);
                self.state = state;
                if result.is_ok() && disconnected {
                    info!("迟到的注册成功 (epoch {})，补发注销", epoch);
                    step.effects.push(Effect::Unregister);
                } else {
                    debug!("丢弃过期的注册结果 (epoch {})", epoch);
                }
            }
        }
    }

    fn on_call_outcome(
        &mut self,
        epoch: Epoch,
        result: EngineResult<CallHandle>,
        step: &mut Step,
    ) {
        let current = matches!(
            &self.state,
            SessionState::Registered { call: CallSlot::Calling(call), .. } if call.epoch == epoch
        );
        if !current {
            match result {
                Ok(handle) => {
                    info!("呼叫已被取代 (epoch {})，结束孤儿呼叫: {}", epoch, handle);
                    step.effects.push(Effect::TerminateCall { call: handle });
                }
                Err(failure) => debug!("丢弃过期的呼叫结果 (epoch {}): {}", epoch, failure),
            }
            return;
        }
        let SessionState::Registered { call: slot, .. } = &mut self.state else {
            return;
        };

        match result {
            Ok(handle) => {
                debug!("呼叫句柄: {} (epoch {})", handle, epoch);
                let early = match &mut *slot {
                    CallSlot::Calling(call) => {
                        call.handle = Some(handle);
                        std::mem::take(&mut call.early_signals)
                    }
                    _ => Vec::new(),
                };
                // 暂存的事件逐个重放，每次转换都留下自己的快照
                for (signal_handle, signal) in early {
                    step.views.push(self.snapshot());
                    self.on_call_signal(signal_handle, signal, step);
                }
            }
            Err(failure) => {
                let e = LastError::from_call_setup(failure);
                warn!("呼叫建立失败: {}", e);
                *slot = CallSlot::Idle;
                step.events.push(SessionEvent::CallEnded);
                self.last_error = Some(e);
            }
        }
    }
}

/// 结束当前呼叫（断开或注册丢失时）
fn tear_down(call: CallSlot, step: &mut Step) {
    match call {
        CallSlot::Idle => {}
        CallSlot::Ringing { invitation, .. } => {
            step.effects.push(Effect::RejectInvitation {
                invitation,
                reason: RejectReason::Declined,
            });
            step.events.push(SessionEvent::CallEnded);
        }
        CallSlot::Calling(call) | CallSlot::Ongoing(call) => {
            if let Some(handle) = call.handle {
                step.effects.push(Effect::TerminateCall { call: handle });
            }
            step.events.push(SessionEvent::CallEnded);
        }
    }
}

/// 对句柄匹配的呼叫应用事件，返回需要记录的错误
fn apply_signal(slot: &mut CallSlot, signal: CallSignal, step: &mut Step) -> Option<LastError> {
    match (std::mem::replace(slot, CallSlot::Idle), signal) {
        (CallSlot::Calling(call), CallSignal::Established) => {
            info!("✅ 通话建立: {}", call.remote_party);
            *slot = CallSlot::Ongoing(call);
            step.events.push(SessionEvent::CallEstablished);
            None
        }
        (CallSlot::Calling(call), CallSignal::Terminated { reason }) => {
            let message = reason.unwrap_or_else(|| "call ended before it was established".to_string());
            warn!("呼叫未建立即结束: {} ({})", call.remote_party, message);
            step.events.push(SessionEvent::CallEnded);
            Some(LastError::new(ErrorKind::CallSetupFailed, message))
        }
        (CallSlot::Ongoing(call), CallSignal::Terminated { .. }) => {
            info!("对端挂断: {}", call.remote_party);
            step.events.push(SessionEvent::CallEnded);
            None
        }
        (other, signal) => {
            debug!("忽略重复的呼叫事件: {:?}", signal);
            *slot = other;
            None
        }
    }
}
