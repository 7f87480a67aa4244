/// 软电话命令门面
///
/// 对外提供 connect / disconnect / make_call / answer_call / reject_call / end_call，
/// 命令在会话队列中校验并执行，返回时状态已经转换、引擎请求已经发出，
/// 但不等待协议层的最终结果。最终结果通过订阅快照或回调获得。
use crate::config::{SessionConfig, SessionHooks};
use crate::engine::SipEngine;
use crate::error::SipError;
use crate::session::{
    Command, Driver, EventSink, Input, ObserverHub, Snapshot, SnapshotStream, SubscriptionId,
};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// SIP 软电话
pub struct SipPhone {
    queue: mpsc::UnboundedSender<Input>,
    hub: Arc<ObserverHub>,
    cancel_token: CancellationToken,
}

impl SipPhone {
    /// 创建软电话并启动会话驱动任务
    ///
    /// 必须在 tokio 运行时内调用。引擎在这里绑定事件出口。
    pub fn new(engine: Arc<dyn SipEngine>) -> Self {
        let (queue, inbox) = mpsc::unbounded_channel();
        let hub = Arc::new(ObserverHub::new(Snapshot::default()));
        let cancel_token = CancellationToken::new();

        engine.attach(EventSink::new(queue.clone()));
        Driver::new(engine, hub.clone(), queue.clone()).spawn(inbox, cancel_token.clone());

        Self {
            queue,
            hub,
            cancel_token,
        }
    }

    async fn send(&self, command: Command) -> Result<(), SipError> {
        let (reply, rx) = oneshot::channel();
        self.queue
            .send(Input::Command { command, reply })
            .map_err(|_| SipError::Closed)?;
        rx.await.map_err(|_| SipError::Closed)?
    }

    /// 注册到服务器
    pub async fn connect(&self, config: SessionConfig) -> Result<(), SipError> {
        self.send(Command::Connect(config)).await
    }

    /// 校验配置后注册；配置无效时返回 `SipError::Config`，不改变状态
    pub async fn connect_with(
        &self,
        identity: &str,
        credentials: &str,
        server_address: &str,
        hooks: SessionHooks,
    ) -> Result<(), SipError> {
        let config = SessionConfig::new(identity, credentials, server_address)?.with_hooks(hooks);
        self.connect(config).await
    }

    /// 断开：结束当前呼叫并注销。已断开时什么也不做
    pub async fn disconnect(&self) -> Result<(), SipError> {
        self.send(Command::Disconnect).await
    }

    /// 发起呼叫，裸号码会被加上 `sip:` 前缀
    pub async fn make_call(&self, target: &str) -> Result<(), SipError> {
        self.send(Command::MakeCall(target.to_string())).await
    }

    /// 接听来电
    pub async fn answer_call(&self) -> Result<(), SipError> {
        self.send(Command::AnswerCall).await
    }

    /// 拒接来电
    pub async fn reject_call(&self) -> Result<(), SipError> {
        self.send(Command::RejectCall).await
    }

    /// 挂断；没有进行中的呼叫时什么也不做
    pub async fn end_call(&self) -> Result<(), SipError> {
        self.send(Command::EndCall).await
    }

    /// 等待此前进入队列的输入全部处理完
    pub async fn flush(&self) -> Result<(), SipError> {
        let (done, rx) = oneshot::channel();
        self.queue
            .send(Input::Flush(done))
            .map_err(|_| SipError::Closed)?;
        rx.await.map_err(|_| SipError::Closed)
    }

    /// 最新快照
    pub fn snapshot(&self) -> Snapshot {
        self.hub.latest()
    }

    /// 订阅快照变化
    pub fn subscribe(
        &self,
        callback: impl Fn(&Snapshot) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.hub.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.hub.unsubscribe(id)
    }

    /// 以 Stream 形式接收每一个快照
    pub fn changes(&self) -> SnapshotStream {
        self.hub.stream()
    }

    /// 等待满足条件的快照；当前快照已满足时立即返回
    pub async fn wait_for(
        &self,
        predicate: impl Fn(&Snapshot) -> bool,
    ) -> Result<Snapshot, SipError> {
        // 先订阅再检查，避免错过两者之间的变化
        let mut changes = self.changes();
        let current = self.snapshot();
        if predicate(&current) {
            return Ok(current);
        }
        while let Some(snapshot) = changes.next().await {
            if predicate(&snapshot) {
                return Ok(snapshot);
            }
        }
        Err(SipError::Closed)
    }

    /// 断开并停止驱动任务
    pub async fn shutdown(self) {
        if let Err(e) = self.disconnect().await {
            warn!("关闭时断开失败: {}", e);
        }
        if let Err(e) = self.flush().await {
            debug!("关闭时队列已停止: {}", e);
        }
        info!("关闭软电话");
        self.cancel_token.cancel();
    }
}

impl Drop for SipPhone {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        CallHandle, EngineCall, EngineEvent, InvitationHandle, RejectReason, ScriptMode,
        ScriptedEngine,
    };
    use crate::error::{EngineFailure, ErrorKind, LastError};
    use crate::session::{CallPhase, RegistrationStatus, StateKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn config() -> SessionConfig {
        SessionConfig::new(
            "sip:alice@example.com",
            "secret",
            "wss://sip.example.com:8089/ws",
        )
        .unwrap()
    }

    fn phone(mode: ScriptMode) -> (SipPhone, Arc<ScriptedEngine>) {
        let engine = Arc::new(ScriptedEngine::new(mode));
        (SipPhone::new(engine.clone()), engine)
    }

    async fn wait_state(phone: &SipPhone, kind: StateKind) -> Snapshot {
        timeout(WAIT, phone.wait_for(|s| s.state() == kind))
            .await
            .expect("timed out waiting for state")
            .unwrap()
    }

    async fn next_call(engine: &ScriptedEngine) -> EngineCall {
        timeout(WAIT, engine.next_request())
            .await
            .expect("timed out waiting for engine request")
            .expect("engine request channel closed")
    }

    async fn registered(mode: ScriptMode) -> (SipPhone, Arc<ScriptedEngine>) {
        let (phone, engine) = phone(mode);
        phone.connect(config()).await.unwrap();
        assert!(matches!(next_call(&engine).await, EngineCall::Register { .. }));
        if mode == ScriptMode::Manual {
            assert!(engine.resolve_register(Ok(())));
        }
        wait_state(&phone, StateKind::Idle).await;
        (phone, engine)
    }

    #[tokio::test]
    async fn test_round_trip_call() {
        let (phone, engine) = registered(ScriptMode::Auto).await;

        phone.make_call("bob@example.com").await.unwrap();
        assert_eq!(
            next_call(&engine).await,
            EngineCall::PlaceCall {
                target: "sip:bob@example.com".into()
            }
        );
        let calling = timeout(WAIT, phone.wait_for(|s| s.call_id.is_some()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(calling.state(), StateKind::Calling);

        assert!(engine.remote_answer());
        wait_state(&phone, StateKind::Ongoing).await;

        phone.end_call().await.unwrap();
        let snapshot = phone.snapshot();
        assert_eq!(snapshot.state(), StateKind::Idle);
        assert_eq!(snapshot.last_error, None);
        assert!(matches!(
            next_call(&engine).await,
            EngineCall::TerminateCall { .. }
        ));
    }

    #[tokio::test]
    async fn test_registration_failure_scenario() {
        let (phone, engine) = phone(ScriptMode::Manual);
        phone.connect(config()).await.unwrap();
        assert_eq!(phone.snapshot().registration_status, RegistrationStatus::Connecting);

        assert_eq!(
            next_call(&engine).await,
            EngineCall::Register {
                identity: "sip:alice@example.com".into(),
                server_address: "wss://sip.example.com:8089/ws".into(),
            }
        );
        assert!(engine.resolve_register(Err(EngineFailure::refused("403 Forbidden"))));

        let snapshot = wait_state(&phone, StateKind::Disconnected).await;
        assert_eq!(snapshot.registration_status, RegistrationStatus::Disconnected);
        assert_eq!(
            snapshot.last_error,
            Some(LastError::new(ErrorKind::RegistrationFailed, "403 Forbidden"))
        );
    }

    #[tokio::test]
    async fn test_make_call_when_disconnected_issues_nothing() {
        let (phone, engine) = phone(ScriptMode::Auto);

        assert_eq!(
            phone.make_call("1001").await.unwrap_err(),
            SipError::NotRegistered
        );
        phone.flush().await.unwrap();
        assert!(engine.requests().is_empty());
        assert_eq!(phone.snapshot().revision, 0);
    }

    #[tokio::test]
    async fn test_inbound_reject_scenario() {
        let (phone, engine) = registered(ScriptMode::Auto).await;

        let invitation = engine.invite_from("sip:bob@example.com");
        let ringing = wait_state(&phone, StateKind::Ringing).await;
        assert_eq!(ringing.call_phase, CallPhase::Ringing);
        assert_eq!(ringing.remote_party.as_deref(), Some("sip:bob@example.com"));

        phone.reject_call().await.unwrap();
        assert_eq!(phone.snapshot().call_phase, CallPhase::Idle);
        assert_eq!(
            next_call(&engine).await,
            EngineCall::RejectInvitation {
                invitation,
                reason: RejectReason::Declined
            }
        );

        phone.flush().await.unwrap();
        let rejects = engine
            .requests()
            .into_iter()
            .filter(|c| matches!(c, EngineCall::RejectInvitation { .. }))
            .count();
        assert_eq!(rejects, 1);
    }

    #[tokio::test]
    async fn test_inbound_answer_establishes() {
        let (phone, engine) = registered(ScriptMode::Auto).await;
        let established = Arc::new(AtomicUsize::new(0));

        engine.invite_from("sip:bob@example.com");
        wait_state(&phone, StateKind::Ringing).await;
        phone.answer_call().await.unwrap();

        let ongoing = wait_state(&phone, StateKind::Ongoing).await;
        assert_eq!(ongoing.remote_party.as_deref(), Some("sip:bob@example.com"));
        assert!(ongoing.call_id.is_some());

        let counter = established.clone();
        phone.subscribe(move |s| {
            if s.state() == StateKind::Idle {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(engine.remote_hangup());
        wait_state(&phone, StateKind::Idle).await;
        assert_eq!(established.load(Ordering::SeqCst), 1);
        assert_eq!(phone.snapshot().last_error, None);
    }

    #[tokio::test]
    async fn test_end_call_is_idempotent() {
        let (phone, engine) = registered(ScriptMode::Auto).await;

        phone.end_call().await.unwrap();
        phone.make_call("1001").await.unwrap();
        timeout(WAIT, phone.wait_for(|s| s.call_id.is_some()))
            .await
            .unwrap()
            .unwrap();
        phone.end_call().await.unwrap();
        phone.end_call().await.unwrap();
        phone.flush().await.unwrap();

        // PlaceCall 之后恰好一个 TerminateCall
        let _ = next_call(&engine).await;
        assert!(matches!(
            next_call(&engine).await,
            EngineCall::TerminateCall { .. }
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let terminates = engine
            .requests()
            .into_iter()
            .filter(|c| matches!(c, EngineCall::TerminateCall { .. }))
            .count();
        assert_eq!(terminates, 1);
    }

    #[tokio::test]
    async fn test_stale_established_does_not_resurrect() {
        let (phone, engine) = registered(ScriptMode::Auto).await;

        phone.make_call("1001").await.unwrap();
        let calling = timeout(WAIT, phone.wait_for(|s| s.call_id.is_some()))
            .await
            .unwrap()
            .unwrap();
        let old = calling.call_id.unwrap();

        assert!(engine.remote_hangup());
        wait_state(&phone, StateKind::Idle).await;

        engine.emit(EngineEvent::CallEstablished { call: old });
        phone.flush().await.unwrap();
        assert_eq!(phone.snapshot().state(), StateKind::Idle);
    }

    #[tokio::test]
    async fn test_make_call_and_disconnect_same_tick() {
        let (phone, engine) = registered(ScriptMode::Manual).await;

        let (call, disconnect) = tokio::join!(phone.make_call("1001"), phone.disconnect());
        call.unwrap();
        disconnect.unwrap();
        assert_eq!(phone.snapshot().state(), StateKind::Disconnected);

        // 迟到的呼叫结果被丢弃，并补发结束请求
        loop {
            if let EngineCall::PlaceCall { .. } = next_call(&engine).await {
                break;
            }
        }
        assert!(engine.resolve_call(Ok(CallHandle::new("late"))));
        loop {
            if let EngineCall::TerminateCall { call } = next_call(&engine).await {
                assert_eq!(call.as_str(), "late");
                break;
            }
        }
        phone.flush().await.unwrap();
        assert_eq!(phone.snapshot().state(), StateKind::Disconnected);
    }

    #[tokio::test]
    async fn test_late_registration_after_disconnect() {
        let (phone, engine) = phone(ScriptMode::Manual);
        phone.connect(config()).await.unwrap();
        let _ = next_call(&engine).await;
        phone.disconnect().await.unwrap();

        assert!(engine.resolve_register(Ok(())));
        assert_eq!(next_call(&engine).await, EngineCall::Unregister);
        phone.flush().await.unwrap();
        assert_eq!(phone.snapshot().state(), StateKind::Disconnected);
    }

    #[tokio::test]
    async fn test_unregister_failure_still_disconnects() {
        let (phone, engine) = registered(ScriptMode::Auto).await;
        engine.fail_unregister(EngineFailure::internal("socket closed"));

        phone.disconnect().await.unwrap();
        assert_eq!(phone.snapshot().state(), StateKind::Disconnected);
        assert_eq!(next_call(&engine).await, EngineCall::Unregister);
        phone.flush().await.unwrap();
        assert_eq!(phone.snapshot().last_error, None);
    }

    #[tokio::test]
    async fn test_hooks_fire_once_per_transition() {
        let (phone, engine) = phone(ScriptMode::Auto);
        let log = Arc::new(Mutex::new(Vec::new()));

        let hooks = {
            let (a, b, c, d) = (log.clone(), log.clone(), log.clone(), log.clone());
            SessionHooks::new()
                .on_registered(move || a.lock().unwrap().push("registered".to_string()))
                .on_incoming_call(move |caller| b.lock().unwrap().push(format!("incoming {caller}")))
                .on_call_established(move || c.lock().unwrap().push("established".to_string()))
                .on_call_ended(move || d.lock().unwrap().push("ended".to_string()))
        };
        phone.connect(config().with_hooks(hooks)).await.unwrap();
        wait_state(&phone, StateKind::Idle).await;

        engine.invite_from("sip:bob@example.com");
        wait_state(&phone, StateKind::Ringing).await;
        phone.answer_call().await.unwrap();
        wait_state(&phone, StateKind::Ongoing).await;
        phone.end_call().await.unwrap();
        phone.end_call().await.unwrap();
        phone.flush().await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "registered",
                "incoming sip:bob@example.com",
                "established",
                "ended"
            ]
        );
    }

    #[tokio::test]
    async fn test_invitation_while_busy_is_rejected_busy() {
        let (phone, engine) = registered(ScriptMode::Auto).await;
        phone.make_call("1001").await.unwrap();

        let second = InvitationHandle::new("inv-busy");
        engine.emit(EngineEvent::IncomingInvitation {
            invitation: second.clone(),
            caller: "sip:carol@example.com".into(),
        });
        phone.flush().await.unwrap();
        assert_eq!(phone.snapshot().state(), StateKind::Calling);

        loop {
            if let EngineCall::RejectInvitation { invitation, reason } = next_call(&engine).await {
                assert_eq!(invitation, second);
                assert_eq!(reason, RejectReason::Busy);
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_registration_lost() {
        let (phone, engine) = registered(ScriptMode::Auto).await;
        assert!(engine.lose_registration("408 Request Timeout"));

        let snapshot = wait_state(&phone, StateKind::Disconnected).await;
        assert_eq!(
            snapshot.last_error.map(|e| e.kind),
            Some(ErrorKind::RegistrationFailed)
        );
    }

    #[tokio::test]
    async fn test_every_transition_is_delivered() {
        let (phone, engine) = registered(ScriptMode::Auto).await;
        let phases = Arc::new(Mutex::new(Vec::new()));
        let sink = phases.clone();
        let id = phone.subscribe(move |s| sink.lock().unwrap().push(s.call_phase));

        phone.make_call("1001").await.unwrap();
        let calling = timeout(WAIT, phone.wait_for(|s| s.call_id.is_some()))
            .await
            .unwrap()
            .unwrap();
        let handle = calling.call_id.unwrap();

        // 建立后立即结束，两个状态都要被看到
        engine.emit(EngineEvent::CallEstablished {
            call: handle.clone(),
        });
        engine.emit(EngineEvent::CallTerminated {
            call: handle,
            reason: None,
        });
        phone.flush().await.unwrap();

        assert!(phone.unsubscribe(id));
        let phases = phases.lock().unwrap();
        assert_eq!(
            phases.as_slice(),
            [
                CallPhase::Calling,
                CallPhase::Calling,
                CallPhase::Ongoing,
                CallPhase::Idle
            ]
        );
    }

    #[tokio::test]
    async fn test_early_signals_on_answer_publish_ongoing() {
        let (phone, engine) = registered(ScriptMode::Manual).await;
        engine.invite_from("sip:bob@example.com");
        wait_state(&phone, StateKind::Ringing).await;

        let phases = Arc::new(Mutex::new(Vec::new()));
        let sink = phases.clone();
        phone.subscribe(move |s| sink.lock().unwrap().push(s.call_phase));

        phone.answer_call().await.unwrap();
        assert!(matches!(
            next_call(&engine).await,
            EngineCall::AcceptInvitation { .. }
        ));

        // 接听请求完成前，远端已建立并挂断
        let handle = CallHandle::new("in-1");
        engine.emit(EngineEvent::CallEstablished {
            call: handle.clone(),
        });
        engine.emit(EngineEvent::CallTerminated {
            call: handle.clone(),
            reason: None,
        });
        phone.flush().await.unwrap();
        assert!(engine.resolve_call(Ok(handle)));
        wait_state(&phone, StateKind::Idle).await;
        phone.flush().await.unwrap();

        let phases = phases.lock().unwrap();
        assert_eq!(
            phases.as_slice(),
            [
                CallPhase::Calling,
                CallPhase::Calling,
                CallPhase::Ongoing,
                CallPhase::Idle
            ]
        );
        assert_eq!(phone.snapshot().last_error, None);
    }

    #[tokio::test]
    async fn test_reconnect_waits_for_slow_unregister() {
        let engine = Arc::new(
            ScriptedEngine::new(ScriptMode::Auto).with_unregister_delay(Duration::from_millis(50)),
        );
        let phone = SipPhone::new(engine.clone());
        phone.connect(config()).await.unwrap();
        wait_state(&phone, StateKind::Idle).await;

        phone.disconnect().await.unwrap();
        phone.connect(config()).await.unwrap();
        wait_state(&phone, StateKind::Idle).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(phone.snapshot().state(), StateKind::Idle);
        assert!(engine.is_registered());
        let requests = engine.requests();
        assert!(matches!(
            requests.as_slice(),
            [
                EngineCall::Register { .. },
                EngineCall::Unregister,
                EngineCall::Register { .. }
            ]
        ));
    }

    #[tokio::test]
    async fn test_connect_with_invalid_config() {
        let (phone, engine) = phone(ScriptMode::Auto);
        let result = phone
            .connect_with(
                "sip:alice@example.com",
                "secret",
                "http://sip.example.com/ws",
                SessionHooks::new(),
            )
            .await;
        assert!(matches!(result, Err(SipError::Config(_))));
        assert_eq!(result.unwrap_err().error_code(), "INVALID_CONFIG");

        phone.flush().await.unwrap();
        let snapshot = phone.snapshot();
        assert_eq!(snapshot.state(), StateKind::Disconnected);
        assert_eq!(snapshot.revision, 0);
        assert!(engine.requests().is_empty());

        phone
            .connect_with(
                "sip:alice@example.com",
                "secret",
                "wss://sip.example.com:8089/ws",
                SessionHooks::new(),
            )
            .await
            .unwrap();
        wait_state(&phone, StateKind::Idle).await;
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let (phone, _engine) = registered(ScriptMode::Auto).await;
        assert!(matches!(
            phone.connect(config()).await,
            Err(SipError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_disconnects() {
        let (phone, engine) = registered(ScriptMode::Auto).await;
        let mut changes = phone.changes();
        phone.shutdown().await;

        let snapshot = timeout(WAIT, changes.next()).await.unwrap().unwrap();
        assert_eq!(snapshot.state(), StateKind::Disconnected);
        assert_eq!(next_call(&engine).await, EngineCall::Unregister);
    }
}
