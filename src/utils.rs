/// 工具函数模块
///
/// 提供日志初始化与呼叫目标规范化等辅助函数
use crate::error::SipError;
use regex::Regex;
use std::sync::OnceLock;
use tracing::{error, Level};

/// 初始化 tracing 日志输出
///
/// 无法识别的级别回退到 `info`。重复初始化会被忽略。
pub fn initialize_logging(level: &str) {
    let level = level.parse::<Level>().unwrap_or(Level::INFO);
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}

/// 拨号串或 `user@host`
fn target_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^[A-Za-z0-9\-_.!~*'()&=+$,;?/%#]+(@[A-Za-z0-9\-.:\[\]]+)?$")
                .map_err(|e| error!("呼叫目标正则无效，所有目标都会被拒绝: {}", e))
                .ok()
        })
        .as_ref()
}

/// 规范化呼叫目标
///
/// 没有 `sip:`/`sips:` scheme 的目标会被加上 `sip:` 前缀。
///
/// # 示例
/// ```rust
/// use sip_phone::utils::normalize_target;
///
/// assert_eq!(normalize_target("1001").unwrap(), "sip:1001");
/// assert_eq!(normalize_target("sip:bob@example.com").unwrap(), "sip:bob@example.com");
/// ```
pub fn normalize_target(raw: &str) -> Result<String, SipError> {
    let target = raw.trim();
    if target.is_empty() {
        return Err(SipError::invalid_target(raw));
    }

    let lower = target.to_ascii_lowercase();
    let (scheme, rest) = if lower.starts_with("sips:") {
        ("sips:", &target[5..])
    } else if lower.starts_with("sip:") {
        ("sip:", &target[4..])
    } else {
        ("sip:", target)
    };

    if !target_pattern().is_some_and(|pattern| pattern.is_match(rest)) {
        return Err(SipError::invalid_target(raw));
    }

    Ok(format!("{}{}", scheme, rest))
}
