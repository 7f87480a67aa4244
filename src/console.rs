/// 交互式控制台命令解析
use thiserror::Error;

/// 帮助文本
pub const HELP: &str = "\
commands:
  connect                 register with the configured server
  disconnect              end any call and unregister
  call <target>           place an outbound call (e.g. 1001, bob@example.com)
  answer                  answer the ringing call
  reject                  reject the ringing call
  hangup                  end the current call
  status                  print the current snapshot
  help                    show this help
  quit                    disconnect and exit
simulated remote side:
  remote invite <uri>     incoming call from <uri>
  remote answer           remote party answers the outbound call
  remote hangup           remote party hangs up
  remote cancel           caller cancels the incoming call
  remote drop <reason>    server drops the registration";

/// 控制台命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Connect,
    Disconnect,
    Call(String),
    Answer,
    Reject,
    Hangup,
    Status,
    Help,
    Quit,
    RemoteInvite(String),
    RemoteAnswer,
    RemoteHangup,
    RemoteCancel,
    RemoteDrop(String),
}

/// 解析错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("unexpected argument: {0}")]
    UnexpectedArgument(String),
}

impl ConsoleCommand {
    /// 解析一行输入；空行返回 `Ok(None)`
    pub fn parse(line: &str) -> Result<Option<Self>, ParseError> {
        let mut words = line.split_whitespace();
        let Some(head) = words.next() else {
            return Ok(None);
        };
        let rest: Vec<&str> = words.collect();

        let command = match head.to_ascii_lowercase().as_str() {
            "connect" => no_args(Self::Connect, &rest)?,
            "disconnect" => no_args(Self::Disconnect, &rest)?,
            "call" | "dial" => Self::Call(one_arg("target", &rest)?),
            "answer" => no_args(Self::Answer, &rest)?,
            "reject" => no_args(Self::Reject, &rest)?,
            "hangup" | "bye" => no_args(Self::Hangup, &rest)?,
            "status" => no_args(Self::Status, &rest)?,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            "remote" => parse_remote(&rest)?,
            other => return Err(ParseError::Unknown(other.to_string())),
        };
        Ok(Some(command))
    }
}

fn parse_remote(words: &[&str]) -> Result<ConsoleCommand, ParseError> {
    let Some((action, rest)) = words.split_first() else {
        return Err(ParseError::MissingArgument("remote action"));
    };
    match action.to_ascii_lowercase().as_str() {
        "invite" => Ok(ConsoleCommand::RemoteInvite(one_arg("caller uri", rest)?)),
        "answer" => no_args(ConsoleCommand::RemoteAnswer, rest),
        "hangup" => no_args(ConsoleCommand::RemoteHangup, rest),
        "cancel" => no_args(ConsoleCommand::RemoteCancel, rest),
        // 原因可以包含空格，例如 "408 Request Timeout"
        "drop" if !rest.is_empty() => Ok(ConsoleCommand::RemoteDrop(rest.join(" "))),
        "drop" => Err(ParseError::MissingArgument("reason")),
        other => Err(ParseError::Unknown(format!("remote {}", other))),
    }
}

fn no_args(command: ConsoleCommand, rest: &[&str]) -> Result<ConsoleCommand, ParseError> {
    match rest.first() {
        Some(extra) => Err(ParseError::UnexpectedArgument(extra.to_string())),
        None => Ok(command),
    }
}

fn one_arg(name: &'static str, rest: &[&str]) -> Result<String, ParseError> {
    match rest {
        [value] => Ok(value.to_string()),
        [] => Err(ParseError::MissingArgument(name)),
        [_, extra, ..] => Err(ParseError::UnexpectedArgument(extra.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_local_commands() {
        assert_eq!(ConsoleCommand::parse("connect"), Ok(Some(ConsoleCommand::Connect)));
        assert_eq!(
            ConsoleCommand::parse("  call  bob@example.com "),
            Ok(Some(ConsoleCommand::Call("bob@example.com".into())))
        );
        assert_eq!(ConsoleCommand::parse("HANGUP"), Ok(Some(ConsoleCommand::Hangup)));
        assert_eq!(ConsoleCommand::parse("exit"), Ok(Some(ConsoleCommand::Quit)));
        assert_eq!(ConsoleCommand::parse("   "), Ok(None));
    }

    #[test]
    fn test_parse_remote_commands() {
        assert_eq!(
            ConsoleCommand::parse("remote invite sip:bob@example.com"),
            Ok(Some(ConsoleCommand::RemoteInvite("sip:bob@example.com".into())))
        );
        assert_eq!(
            ConsoleCommand::parse("remote drop 408 Request Timeout"),
            Ok(Some(ConsoleCommand::RemoteDrop("408 Request Timeout".into())))
        );
        assert_eq!(
            ConsoleCommand::parse("remote cancel"),
            Ok(Some(ConsoleCommand::RemoteCancel))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            ConsoleCommand::parse("call"),
            Err(ParseError::MissingArgument("target"))
        );
        assert_eq!(
            ConsoleCommand::parse("answer now"),
            Err(ParseError::UnexpectedArgument("now".into()))
        );
        assert_eq!(
            ConsoleCommand::parse("remote"),
            Err(ParseError::MissingArgument("remote action"))
        );
        assert_eq!(
            ConsoleCommand::parse("remote drop"),
            Err(ParseError::MissingArgument("reason"))
        );
        assert!(matches!(
            ConsoleCommand::parse("transfer 1002"),
            Err(ParseError::Unknown(_))
        ));
    }
}
