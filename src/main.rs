use clap::Parser;
use futures_util::StreamExt;
use sip_phone::console::{ConsoleCommand, HELP};
use sip_phone::{utils, ScriptMode, ScriptedEngine, SessionHooks, SipPhone};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// SIP Phone console
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// SIP identity URI (e.g., sip:alice@example.com)
    #[arg(short, long, env = "SIP_IDENTITY")]
    identity: Option<String>,

    /// SIP password
    #[arg(short, long, env = "SIP_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// WebSocket server address (e.g., wss://sip.example.com:8089/ws)
    #[arg(short, long, env = "SIP_SERVER")]
    server: Option<String>,

    /// Simulated remote answer delay for outbound calls, in milliseconds
    #[arg(short, long)]
    answer_delay_ms: Option<u64>,

    /// Register immediately on start
    #[arg(long)]
    auto_connect: bool,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    utils::initialize_logging(args.log_level.as_str());

    let mut engine = ScriptedEngine::new(ScriptMode::Auto);
    if let Some(ms) = args.answer_delay_ms {
        engine = engine.with_remote_answer(Duration::from_millis(ms));
    }
    let engine = Arc::new(engine);
    let phone = SipPhone::new(engine.clone());

    let mut changes = phone.changes();
    let printer = tokio::spawn(async move {
        while let Some(snapshot) = changes.next().await {
            println!("{}", snapshot);
        }
    });

    info!("sip-phone {} 已启动，输入 help 查看命令", sip_phone::VERSION);
    if args.auto_connect {
        connect(&phone, &args).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        let command = match ConsoleCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("{}", e);
                continue;
            }
        };
        if command == ConsoleCommand::Quit {
            break;
        }
        execute(&phone, &engine, &args, command).await;
    }

    info!("Shutting down...");
    phone.shutdown().await;
    printer.abort();
    Ok(())
}

async fn execute(phone: &SipPhone, engine: &ScriptedEngine, args: &Args, command: ConsoleCommand) {
    let result = match command {
        ConsoleCommand::Connect => {
            connect(phone, args).await;
            Ok(())
        }
        ConsoleCommand::Disconnect => phone.disconnect().await,
        ConsoleCommand::Call(target) => phone.make_call(&target).await,
        ConsoleCommand::Answer => phone.answer_call().await,
        ConsoleCommand::Reject => phone.reject_call().await,
        ConsoleCommand::Hangup => phone.end_call().await,
        ConsoleCommand::Status => {
            println!("{}", phone.snapshot());
            Ok(())
        }
        ConsoleCommand::Help | ConsoleCommand::Quit => {
            println!("{}", HELP);
            Ok(())
        }
        ConsoleCommand::RemoteInvite(caller) => {
            engine.invite_from(&caller);
            Ok(())
        }
        ConsoleCommand::RemoteAnswer => {
            remote(engine.remote_answer(), "no outbound call to answer");
            Ok(())
        }
        ConsoleCommand::RemoteHangup => {
            remote(engine.remote_hangup(), "no call to hang up");
            Ok(())
        }
        ConsoleCommand::RemoteCancel => {
            remote(engine.cancel_invitation(), "no invitation to cancel");
            Ok(())
        }
        ConsoleCommand::RemoteDrop(reason) => {
            remote(engine.lose_registration(&reason), "session closed");
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("命令失败: {} ({})", e, e.error_code());
    }
}

fn remote(delivered: bool, reason: &str) {
    if !delivered {
        warn!("远端操作未生效: {}", reason);
    }
}

async fn connect(phone: &SipPhone, args: &Args) {
    let identity = args.identity.as_deref().unwrap_or_default();
    let password = args.password.as_deref().unwrap_or_default();
    let server = args.server.as_deref().unwrap_or_default();

    info!("正在连接: {} -> {}", identity, server);
    if let Err(e) = phone
        .connect_with(identity, password, server, console_hooks())
        .await
    {
        error!("连接失败: {} ({})", e, e.error_code());
    }
}

fn console_hooks() -> SessionHooks {
    SessionHooks::new()
        .on_registered(|| info!("注册成功"))
        .on_registration_failed(|e| error!("注册失败: {}", e))
        .on_incoming_call(|caller| info!("来电: {} (answer / reject)", caller))
        .on_call_established(|| info!("通话已建立"))
        .on_call_ended(|| info!("通话结束"))
}
