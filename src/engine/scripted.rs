/// 脚本化的内存引擎
///
/// 记录每一个请求，并由调用方扮演远端：来电、应答、挂断、取消、注册丢失。
/// `Auto` 模式下请求立即完成；`Manual` 模式下注册和呼叫请求挂起，直到调用
/// `resolve_register` / `resolve_call`。
use super::{
    CallHandle, EngineEvent, EventSink, InvitationHandle, RegisterRequest, RejectReason, SipEngine,
};
use crate::error::{EngineFailure, EngineResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// 请求的完成方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptMode {
    /// 立即完成
    Auto,

    /// 挂起，等待手动完成
    Manual,
}

/// 引擎收到的请求记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Register {
        identity: String,
        server_address: String,
    },
    Unregister,
    PlaceCall {
        target: String,
    },
    AcceptInvitation {
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

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 脚本化引擎
pub struct ScriptedEngine {
    mode: ScriptMode,
    answer_delay: Option<Duration>,
    unregister_delay: Option<Duration>,
    registered: AtomicBool,
    sink: Mutex<Option<EventSink>>,
    requests: Mutex<Vec<EngineCall>>,
    request_tx: mpsc::UnboundedSender<EngineCall>,
    request_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<EngineCall>>,
    pending_registers: Mutex<VecDeque<oneshot::Sender<EngineResult<()>>>>,
    pending_calls: Mutex<VecDeque<oneshot::Sender<EngineResult<CallHandle>>>>,
    register_failure: Mutex<Option<EngineFailure>>,
    unregister_failure: Mutex<Option<EngineFailure>>,
    last_call: Mutex<Option<CallHandle>>,
    last_invitation: Mutex<Option<InvitationHandle>>,
}

impl ScriptedEngine {
    pub fn new(mode: ScriptMode) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        Self {
            mode,
            answer_delay: None,
            unregister_delay: None,
            registered: AtomicBool::new(false),
            sink: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            request_tx,
            request_rx: tokio::sync::Mutex::new(request_rx),
            pending_registers: Mutex::new(VecDeque::new()),
            pending_calls: Mutex::new(VecDeque::new()),
            register_failure: Mutex::new(None),
            unregister_failure: Mutex::new(None),
            last_call: Mutex::new(None),
            last_invitation: Mutex::new(None),
        }
    }

    /// `Auto` 模式下，外呼在给定延迟后被远端应答
    pub fn with_remote_answer(mut self, delay: Duration) -> Self {
        self.answer_delay = Some(delay);
        self
    }

    /// 注销请求在给定延迟后才完成
    pub fn with_unregister_delay(mut self, delay: Duration) -> Self {
        self.unregister_delay = Some(delay);
        self
    }

    pub fn mode(&self) -> ScriptMode {
        self.mode
    }

    /// 之后的注册请求以该错误失败（仅 `Auto` 模式）
    pub fn fail_registration(&self, failure: EngineFailure) {
        *lock(&self.register_failure) = Some(failure);
    }

    /// 之后的注销请求以该错误失败
    pub fn fail_unregister(&self, failure: EngineFailure) {
        *lock(&self.unregister_failure) = Some(failure);
    }

    /// 引擎一侧当前是否处于注册状态
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// 到目前为止收到的全部请求
    pub fn requests(&self) -> Vec<EngineCall> {
        lock(&self.requests).clone()
    }

    /// 等待下一个请求
    pub async fn next_request(&self) -> Option<EngineCall> {
        self.request_rx.lock().await.recv().await
    }

    /// 完成最早挂起的注册请求；没有挂起请求时返回 false
    pub fn resolve_register(&self, result: EngineResult<()>) -> bool {
        match lock(&self.pending_registers).pop_front() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// 完成最早挂起的外呼或接听请求
    pub fn resolve_call(&self, result: EngineResult<CallHandle>) -> bool {
        if let Ok(handle) = &result {
            *lock(&self.last_call) = Some(handle.clone());
        }
        match lock(&self.pending_calls).pop_front() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// 直接投递引擎事件；尚未绑定或会话已关闭时返回 false
    pub fn emit(&self, event: EngineEvent) -> bool {
        let sink = lock(&self.sink).clone();
        match sink {
            Some(sink) => sink.emit(event),
            None => false,
        }
    }

    /// 远端来电
    pub fn invite_from(&self, caller: &str) -> InvitationHandle {
        let invitation = InvitationHandle::generate();
        *lock(&self.last_invitation) = Some(invitation.clone());
        info!("模拟来电: {} ({})", caller, invitation);
        self.emit(EngineEvent::IncomingInvitation {
            invitation: invitation.clone(),
            caller: caller.to_string(),
        });
        invitation
    }

    /// 远端应答最近的外呼
    pub fn remote_answer(&self) -> bool {
        let call = lock(&self.last_call).clone();
        match call {
            Some(call) => self.emit(EngineEvent::CallEstablished { call }),
            None => false,
        }
    }

    /// 远端挂断最近的呼叫
    pub fn remote_hangup(&self) -> bool {
        let call = lock(&self.last_call).take();
        match call {
            Some(call) => self.emit(EngineEvent::CallTerminated {
                call,
                reason: Some("remote hangup".to_string()),
            }),
            None => false,
        }
    }

    /// 主叫在应答前取消最近的来电
    pub fn cancel_invitation(&self) -> bool {
        let invitation = lock(&self.last_invitation).take();
        match invitation {
            Some(invitation) => self.emit(EngineEvent::InvitationCancelled { invitation }),
            None => false,
        }
    }

    /// 服务器端注册丢失，例如刷新被拒
    pub fn lose_registration(&self, reason: &str) -> bool {
        self.emit(EngineEvent::RegistrationResult(Err(EngineFailure::refused(
            reason,
        ))))
    }

    fn record(&self, call: EngineCall) {
        debug!("引擎请求: {:?}", call);
        lock(&self.requests).push(call.clone());
        let _ = self.request_tx.send(call);
    }

    /// 挂起一个外呼或接听请求，在记录之前入队，保证观察者看到请求时已可完成
    async fn park_call(&self, call: EngineCall) -> EngineResult<CallHandle> {
        let (tx, rx) = oneshot::channel();
        lock(&self.pending_calls).push_back(tx);
        self.record(call);
        rx.await
            .unwrap_or_else(|_| Err(EngineFailure::internal("request abandoned")))
    }

    fn spawn_remote_answer(&self, call: CallHandle) {
        let (Some(delay), Some(sink)) = (self.answer_delay, lock(&self.sink).clone()) else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!("模拟远端应答: {}", call);
            sink.emit(EngineEvent::CallEstablished { call });
        });
    }
}

#[async_trait]
impl SipEngine for ScriptedEngine {
    fn attach(&self, events: EventSink) {
        *lock(&self.sink) = Some(events);
    }

    async fn register(&self, request: &RegisterRequest) -> EngineResult<()> {
        let call = EngineCall::Register {
            identity: request.identity.clone(),
            server_address: request.server_address.clone(),
        };
        let result = match self.mode {
            ScriptMode::Auto => {
                self.record(call);
                let failure = lock(&self.register_failure).clone();
                match failure {
                    Some(failure) => Err(failure),
                    None => Ok(()),
                }
            }
            ScriptMode::Manual => {
                let (tx, rx) = oneshot::channel();
                lock(&self.pending_registers).push_back(tx);
                self.record(call);
                rx.await
                    .unwrap_or_else(|_| Err(EngineFailure::internal("request abandoned")))
            }
        };
        if result.is_ok() {
            self.registered.store(true, Ordering::SeqCst);
        }
        result
    }

    async fn unregister(&self) -> EngineResult<()> {
        self.record(EngineCall::Unregister);
        if let Some(delay) = self.unregister_delay {
            tokio::time::sleep(delay).await;
        }
        let failure = lock(&self.unregister_failure).clone();
        match failure {
            Some(failure) => Err(failure),
            None => {
                self.registered.store(false, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    async fn place_call(&self, target: &str) -> EngineResult<CallHandle> {
        let call = EngineCall::PlaceCall {
            target: target.to_string(),
        };
        match self.mode {
            ScriptMode::Auto => {
                self.record(call);
                let handle = CallHandle::generate();
                *lock(&self.last_call) = Some(handle.clone());
                self.spawn_remote_answer(handle.clone());
                Ok(handle)
            }
            ScriptMode::Manual => self.park_call(call).await,
        }
    }

    async fn accept_invitation(&self, invitation: &InvitationHandle) -> EngineResult<CallHandle> {
        let call = EngineCall::AcceptInvitation {
            invitation: invitation.clone(),
        };
        lock(&self.last_invitation).take();
        match self.mode {
            ScriptMode::Auto => {
                self.record(call);
                let handle = CallHandle::generate();
                *lock(&self.last_call) = Some(handle.clone());
                // 应答后媒体立即建立；事件先于本结果进入会话队列
                self.emit(EngineEvent::CallEstablished {
                    call: handle.clone(),
                });
                Ok(handle)
            }
            ScriptMode::Manual => self.park_call(call).await,
        }
    }

    async fn reject_invitation(
        &self,
        invitation: &InvitationHandle,
        reason: RejectReason,
    ) -> EngineResult<()> {
        {
            let mut last = lock(&self.last_invitation);
            if last.as_ref() == Some(invitation) {
                last.take();
            }
        }
        self.record(EngineCall::RejectInvitation {
            invitation: invitation.clone(),
            reason,
        });
        Ok(())
    }

    async fn terminate_call(&self, call: &CallHandle) -> EngineResult<()> {
        {
            let mut last = lock(&self.last_call);
            if last.as_ref() == Some(call) {
                last.take();
            }
        }
        self.record(EngineCall::TerminateCall { call: call.clone() });
        Ok(())
    }
}
