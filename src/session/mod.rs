/// Session 模块
///
/// 注册/呼叫会话核心：
///
/// - `SessionMachine`: 纯同步状态机，唯一的状态来源
/// - `Driver`: 串行队列驱动任务，连接状态机与引擎
/// - `ObserverHub`: 快照订阅
mod driver;
mod machine;
mod observer;
mod state;

pub(crate) use driver::{Driver, Input};
pub use driver::EventSink;
pub use machine::{Command, Effect, Outcome, SessionEvent, SessionMachine, Step};
pub use observer::{ObserverHub, SnapshotStream, SubscriptionId};
pub use state::{
    Call, CallDirection, CallPhase, CallSlot, Epoch, Registration, RegistrationStatus,
    SessionState, Snapshot, StateKind,
};
