/// 会话配置
///
/// `connect` 接收的配置记录：身份、凭证、WebSocket 服务器地址，以及可选的完成回调。
use crate::error::{ConfigError, LastError};
use std::fmt;
use std::sync::Arc;

/// 默认注册过期时间（秒）
pub const DEFAULT_REGISTER_EXPIRES: u32 = 3600;

type Hook = Arc<dyn Fn() + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&LastError) + Send + Sync>;
type CallerHook = Arc<dyn Fn(&str) + Send + Sync>;

/// 会话配置
#[derive(Clone)]
pub struct SessionConfig {
    /// SIP 身份 URI (例如 "sip:alice@example.com")
    pub identity: String,

    /// 认证密码
    pub credentials: String,

    /// WebSocket 服务器地址 (例如 "wss://sip.example.com:8089/ws")
    pub server_address: String,

    /// User-Agent字符串
    pub user_agent: String,

    /// 注册过期时间（秒）
    pub register_expires: u32,

    /// 完成回调
    pub hooks: SessionHooks,

    auth_username: String,
}

impl SessionConfig {
    /// 创建并校验配置
    pub fn new(
        identity: impl Into<String>,
        credentials: impl Into<String>,
        server_address: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let identity = identity.into().trim().to_string();
        let credentials = credentials.into();
        let server_address = server_address.into().trim().to_string();

        let auth_username = parse_identity(&identity)?;
        if credentials.is_empty() {
            return Err(ConfigError::Missing("credentials".to_string()));
        }
        validate_server_address(&server_address)?;

        Ok(Self {
            identity,
            credentials,
            server_address,
            user_agent: format!("sip-phone/{}", crate::VERSION),
            register_expires: DEFAULT_REGISTER_EXPIRES,
            hooks: SessionHooks::default(),
            auth_username,
        })
    }

    /// 设置 User-Agent
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// 设置注册过期时间
    pub fn with_expires(mut self, expires: u32) -> Self {
        self.register_expires = expires;
        self
    }

    /// 设置完成回调
    pub fn with_hooks(mut self, hooks: SessionHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// 认证用户名，取自身份 URI 的用户部分
    pub fn auth_username(&self) -> &str {
        &self.auth_username
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("identity", &self.identity)
            .field("credentials", &"<redacted>")
            .field("server_address", &self.server_address)
            .field("user_agent", &self.user_agent)
            .field("register_expires", &self.register_expires)
            .field("hooks", &self.hooks)
            .finish()
    }
}

/// 解析身份 URI，返回用户部分
fn parse_identity(identity: &str) -> Result<String, ConfigError> {
    if identity.is_empty() {
        return Err(ConfigError::Missing("identity".to_string()));
    }

    let uri: rsip::Uri = identity
        .try_into()
        .map_err(|e| ConfigError::Invalid(format!("identity {}: {}", identity, e)))?;

    match uri.scheme {
        Some(rsip::Scheme::Sip) | Some(rsip::Scheme::Sips) => {}
        _ => {
            return Err(ConfigError::Invalid(format!(
                "identity must be a sip: or sips: URI: {}",
                identity
            )))
        }
    }

    uri.auth
        .map(|auth| auth.user)
        .filter(|user| !user.is_empty())
        .ok_or_else(|| ConfigError::Invalid(format!("identity has no user part: {}", identity)))
}

/// 服务器地址必须是 ws:// 或 wss:// 且带主机名
fn validate_server_address(server_address: &str) -> Result<(), ConfigError> {
    if server_address.is_empty() {
        return Err(ConfigError::Missing("server_address".to_string()));
    }

    let lower = server_address.to_ascii_lowercase();
    let rest = lower
        .strip_prefix("wss://")
        .or_else(|| lower.strip_prefix("ws://"))
        .ok_or_else(|| {
            ConfigError::Invalid(format!(
                "server address must be a ws:// or wss:// URL: {}",
                server_address
            ))
        })?;

    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if host.is_empty() || host.starts_with(':') {
        return Err(ConfigError::Invalid(format!(
            "server address has no host: {}",
            server_address
        )));
    }
    Ok(())
}

/// 本地完成回调
///
/// 与订阅状态变化等价的便捷方式；每个回调在对应的状态转换上恰好触发一次。
#[derive(Clone, Default)]
pub struct SessionHooks {
    on_registered: Option<Hook>,
    on_registration_failed: Option<ErrorHook>,
    on_incoming_call: Option<CallerHook>,
    on_call_established: Option<Hook>,
    on_call_ended: Option<Hook>,
}

impl SessionHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册成功
    pub fn on_registered(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_registered = Some(Arc::new(f));
        self
    }

    /// 注册失败（包括已注册后丢失注册）
    pub fn on_registration_failed(
        mut self,
        f: impl Fn(&LastError) + Send + Sync + 'static,
    ) -> Self {
        self.on_registration_failed = Some(Arc::new(f));
        self
    }

    /// 来电，参数为主叫 URI
    pub fn on_incoming_call(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_incoming_call = Some(Arc::new(f));
        self
    }

    /// 通话建立
    pub fn on_call_established(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_call_established = Some(Arc::new(f));
        self
    }

    /// 呼叫回到空闲（任何原因）
    pub fn on_call_ended(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_call_ended = Some(Arc::new(f));
        self
    }

    pub(crate) fn dispatch(&self, event: &crate::session::SessionEvent) {
        use crate::session::SessionEvent;

        match event {
            SessionEvent::Registered => {
                if let Some(f) = &self.on_registered {
                    f();
                }
            }
            SessionEvent::RegistrationFailed(error) => {
                if let Some(f) = &self.on_registration_failed {
                    f(error);
                }
            }
            SessionEvent::IncomingCall { caller } => {
                if let Some(f) = &self.on_incoming_call {
                    f(caller);
                }
            }
            SessionEvent::CallEstablished => {
                if let Some(f) = &self.on_call_established {
                    f();
                }
            }
            SessionEvent::CallEnded => {
                if let Some(f) = &self.on_call_ended {
                    f();
                }
            }
        }
    }
}

impl fmt::Debug for SessionHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHooks")
            .field("on_registered", &self.on_registered.is_some())
            .field("on_registration_failed", &self.on_registration_failed.is_some())
            .field("on_incoming_call", &self.on_incoming_call.is_some())
            .field("on_call_established", &self.on_call_established.is_some())
            .field("on_call_ended", &self.on_call_ended.is_some())
            .finish()
    }
}
