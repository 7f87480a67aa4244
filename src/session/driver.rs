/// 会话驱动任务
///
/// 命令、引擎事件和引擎请求结果都进入同一个队列，由一个任务按顺序交给状态机，
/// 因此状态只有一个写者，不需要锁。
use super::machine::{Command, Effect, Outcome, SessionMachine, Step};
use super::observer::ObserverHub;
use super::state::Snapshot;
use crate::engine::{EngineEvent, SipEngine};
use crate::error::SipError;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 队列中的输入
pub(crate) enum Input {
    Command {
        command: Command,
        reply: oneshot::Sender<Result<(), SipError>>,
    },
    Engine(EngineEvent),
    Outcome(Outcome),
    Flush(oneshot::Sender<()>),
}

/// 引擎事件出口
///
/// 事件直接进入会话队列，与之后发出的命令保持先后顺序。
#[derive(Clone)]
pub struct EventSink {
    queue: mpsc::UnboundedSender<Input>,
}

impl EventSink {
    pub(crate) fn new(queue: mpsc::UnboundedSender<Input>) -> Self {
        Self { queue }
    }

    /// 投递事件；会话已关闭时返回 false
    pub fn emit(&self, event: EngineEvent) -> bool {
        self.queue.send(Input::Engine(event)).is_ok()
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("closed", &self.queue.is_closed())
            .finish()
    }
}

pub(crate) struct Driver {
    machine: SessionMachine,
    hub: Arc<ObserverHub>,
    effects: mpsc::UnboundedSender<Effect>,
    executor: Option<Executor>,
}

impl Driver {
    pub(crate) fn new(
        engine: Arc<dyn SipEngine>,
        hub: Arc<ObserverHub>,
        queue: mpsc::UnboundedSender<Input>,
    ) -> Self {
        let (effects, pending) = mpsc::unbounded_channel();
        Self {
            machine: SessionMachine::new(),
            hub,
            effects,
            executor: Some(Executor {
                engine,
                pending,
                queue,
            }),
        }
    }

    /// 启动驱动任务和引擎请求执行任务
    pub(crate) fn spawn(
        mut self,
        inbox: mpsc::UnboundedReceiver<Input>,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        if let Some(executor) = self.executor.take() {
            tokio::spawn(executor.run());
        }
        tokio::spawn(self.run(inbox, cancel_token))
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Input>, cancel_token: CancellationToken) {
        info!("会话驱动任务已启动");
        while let Some(input) = tokio::select! {
            input = inbox.recv() => input,
            _ = cancel_token.cancelled() => None,
        } {
            self.dispatch(input);
        }
        info!("会话驱动任务已停止");
    }

    fn dispatch(&mut self, input: Input) {
        match input {
            Input::Command { command, reply } => {
                debug!("处理命令: {:?}", command);
                match self.machine.handle_command(command) {
                    Ok(step) => {
                        self.apply(step);
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        debug!("命令被拒绝: {} ({})", e, e.error_code());
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Input::Engine(event) => {
                debug!("引擎事件: {:?}", event);
                let step = self.machine.handle_event(event);
                self.apply(step);
            }
            Input::Outcome(outcome) => {
                debug!("引擎结果: {:?}", outcome);
                let step = self.machine.handle_outcome(outcome);
                self.apply(step);
            }
            Input::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    /// 发出请求、投递快照、触发回调
    fn apply(&mut self, step: Step) {
        let Step {
            effects,
            events,
            views,
            config,
        } = step;

        for effect in effects {
            if self.effects.send(effect).is_err() {
                warn!("引擎请求执行任务已停止，丢弃请求");
            }
        }

        // 中间状态也要交给订阅者，例如刚建立就结束的呼叫
        for view in views {
            self.publish(view);
        }
        self.publish(self.machine.snapshot());

        if let Some(config) = config {
            for event in &events {
                config.hooks.dispatch(event);
            }
        }
    }

    /// 与上一次投递的内容不同才投递
    fn publish(&self, mut next: Snapshot) {
        let current = self.hub.latest();
        if !next.same_view(&current) {
            next.revision = current.revision + 1;
            debug!("状态变化: {}", next);
            self.hub.publish(next);
        }
    }
}

type Pending = Pin<Box<dyn Future<Output = Option<Outcome>> + Send>>;

/// 引擎请求执行任务
///
/// 请求按发出顺序交给引擎。注销、拒绝、结束呼叫等待完成后才发下一个请求；
/// 注册、外呼、接听在首次轮询后挂起等待，结果稍后回到会话队列。
struct Executor {
    engine: Arc<dyn SipEngine>,
    pending: mpsc::UnboundedReceiver<Effect>,
    queue: mpsc::UnboundedSender<Input>,
}

impl Executor {
    async fn run(mut self) {
        let mut in_flight: FuturesUnordered<Pending> = FuturesUnordered::new();
        loop {
            tokio::select! {
                Some(outcome) = in_flight.next(), if !in_flight.is_empty() => {
                    self.report(outcome);
                }
                effect = self.pending.recv() => {
                    let Some(effect) = effect else {
                        break;
                    };
                    let awaits_outcome = matches!(
                        effect,
                        Effect::Register { .. } | Effect::PlaceCall { .. } | Effect::AcceptInvitation { .. }
                    );
                    let mut request: Pending = Box::pin(perform(self.engine.clone(), effect));
                    if awaits_outcome {
                        // 先轮询一次，让请求在下一个请求之前到达引擎
                        match (&mut request).now_or_never() {
                            Some(outcome) => self.report(outcome),
                            None => in_flight.push(request),
                        }
                    } else {
                        let outcome = request.await;
                        self.report(outcome);
                    }
                }
            }
        }
        debug!("引擎请求执行任务已停止");
    }

    fn report(&self, outcome: Option<Outcome>) {
        if let Some(outcome) = outcome {
            if self.queue.send(Input::Outcome(outcome)).is_err() {
                debug!("会话已关闭，丢弃引擎结果");
            }
        }
    }
}

/// 执行单个引擎请求；需要回到状态机的结果以 Outcome 返回
async fn perform(engine: Arc<dyn SipEngine>, effect: Effect) -> Option<Outcome> {
    match effect {
        Effect::Register { epoch, request } => {
            info!("正在注册到 SIP 服务器: {}", request.server_address);
            let result = engine.register(&request).await;
            Some(Outcome::Registered { epoch, result })
        }
        Effect::Unregister => {
            info!("正在从SIP服务器注销...");
            if let Err(e) = engine.unregister().await {
                warn!("注销失败: {}", e);
            }
            None
        }
        Effect::PlaceCall { epoch, target } => {
            let result = engine.place_call(&target).await;
            Some(Outcome::CallPlaced { epoch, result })
        }
        Effect::AcceptInvitation { epoch, invitation } => {
            let result = engine.accept_invitation(&invitation).await;
            Some(Outcome::InvitationAccepted { epoch, result })
        }
        Effect::RejectInvitation { invitation, reason } => {
            if let Err(e) = engine.reject_invitation(&invitation, reason).await {
                warn!("拒绝来电失败: {} ({})", invitation, e);
            }
            None
        }
        Effect::TerminateCall { call } => {
            if let Err(e) = engine.terminate_call(&call).await {
                error!("结束呼叫失败: {} ({})", call, e);
            }
            None
        }
    }
}
