//! Kommandozeilen-Treiber für manuelle Tests gegen ein Relay
//!
//! Befehle (eine Zeile pro Befehl auf stdin):
//! `call <user> [text|audio|video]`, `accept <id>`, `reject <id>`,
//! `hangup <id>`, `status <id>`, `list`, `quit`

use anyhow::{bail, Context, Result};
use doorbell_lib::call_engine::{CallId, CallMedia};
use doorbell_lib::{CallAgent, CallEvent, Config};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Call { to: String, media: CallMedia },
    Accept(CallId),
    Reject(CallId),
    Hangup(CallId),
    Status(CallId),
    List,
    Quit,
}

fn next_call_id<'a>(parts: &mut impl Iterator<Item = &'a str>) -> Result<CallId> {
    parts.next().map(CallId::from).context("missing call id")
}

fn parse_command(line: &str) -> Result<Command> {
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else {
        bail!("empty command");
    };

    let command = match verb {
        "call" => {
            let to = parts.next().context("missing user")?.to_string();
            let media = match parts.next() {
                None | Some("audio") => CallMedia::Audio,
                Some("video") => CallMedia::Video,
                Some("text") => CallMedia::Text,
                Some(other) => bail!("unknown media kind '{}'", other),
            };
            Command::Call { to, media }
        }
        "accept" => Command::Accept(next_call_id(&mut parts)?),
        "reject" => Command::Reject(next_call_id(&mut parts)?),
        "hangup" => Command::Hangup(next_call_id(&mut parts)?),
        "status" => Command::Status(next_call_id(&mut parts)?),
        "list" => Command::List,
        "quit" | "exit" => Command::Quit,
        other => bail!("unknown command '{}'", other),
    };
    Ok(command)
}

async fn execute(agent: &CallAgent, command: Command) -> Result<()> {
    match command {
        Command::Call { to, media } => {
            let call_id = agent.start_call(&to, media).await?;
            println!("calling {} ({})", to, call_id);
        }
        Command::Accept(call_id) => agent.accept(&call_id).await?,
        Command::Reject(call_id) => agent.reject(&call_id).await?,
        Command::Hangup(call_id) => agent.hangup(&call_id).await?,
        Command::Status(call_id) => {
            let entry = agent.get(&call_id).context("unknown call")?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
            agent.announce_status(&call_id).await?;
        }
        Command::List => {
            let calls = agent.active_calls();
            if calls.is_empty() {
                println!("no active calls");
            }
            for call in calls {
                println!(
                    "{}  {:<8} {:?} {} -> {}",
                    call.call_id, call.state, call.media, call.from, call.to
                );
            }
        }
        Command::Quit => {}
    }
    Ok(())
}

fn spawn_event_printer(agent: &Arc<CallAgent>) {
    let mut events = agent.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                CallEvent::IncomingCall(entry) => println!(
                    "incoming {:?} call {} from {} (accept/reject {})",
                    entry.media, entry.call_id, entry.from, entry.call_id
                ),
                CallEvent::StateChanged {
                    call_id,
                    state,
                    reason: Some(reason),
                } => println!("{} -> {} ({})", call_id, state, reason),
                CallEvent::StateChanged { call_id, state, .. } => {
                    println!("{} -> {}", call_id, state)
                }
                CallEvent::Removed(call_id) => tracing::debug!("Call {} removed", call_id),
                CallEvent::Error { call_id, message } => {
                    println!("{} error: {}", call_id, message)
                }
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    doorbell_lib::init_tracing();

    let config = Config::from_env().context("invalid configuration")?;
    let agent = doorbell_lib::connect(&config)
        .await
        .context("failed to start call agent")?;
    spawn_event_printer(&agent);

    println!("ready as {}", config.user_id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Ok(Command::Quit) => break,
            Ok(command) => {
                if let Err(e) = execute(&agent, command).await {
                    println!("error: {:#}", e);
                }
            }
            Err(e) => println!("error: {}", e),
        }
    }

    tracing::info!("Shutting down");
    Ok(())
}
