//! Interactive share client
//!
//! Line-oriented front end over the reconnecting client. Re-registers the
//! username every time a connection opens.

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::client::{
    ClientHandle, ConnectionState, ControllerEvent, ReconnectingClient, WsConnector,
};
use crate::config::ClientConfig;
use crate::ws::{ClientMessage, PresenceAction, ServerMessage};

const HELP: &str = "commands: /share <json>, /who, /retry, /quit";

#[derive(Debug, PartialEq)]
enum Command {
    Share(serde_json::Value),
    Who,
    Retry,
    Quit,
    Help,
}

fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };
    let command = match head {
        "/share" => {
            if rest.is_empty() {
                return Err("usage: /share <json>".to_string());
            }
            let content: serde_json::Value =
                serde_json::from_str(rest).map_err(|e| format!("invalid JSON: {e}"))?;
            Command::Share(content)
        }
        "/who" => Command::Who,
        "/retry" => Command::Retry,
        "/quit" | "/exit" => Command::Quit,
        "/help" => Command::Help,
        other => return Err(format!("unknown command {other}; {HELP}")),
    };
    Ok(Some(command))
}

/// One-line rendering of a server message for the terminal.
fn describe(msg: &ServerMessage) -> String {
    match msg {
        ServerMessage::ConnectionEstablished { message } => message.clone(),
        ServerMessage::OnlineUsers { users } if users.is_empty() => "online: nobody".to_string(),
        ServerMessage::OnlineUsers { users } => format!("online: {}", users.join(", ")),
        ServerMessage::UserStatus {
            action: PresenceAction::Join,
            username,
        } => format!("{username} joined"),
        ServerMessage::UserStatus {
            action: PresenceAction::Leave,
            username,
        } => format!("{username} left"),
        ServerMessage::RegisterConfirmed { message } => message.clone(),
        ServerMessage::SharedCharacter { content, shared_by } => {
            format!("{shared_by} shared a character: {content}")
        }
        ServerMessage::ShareConfirmed { message, .. } => message.clone(),
        ServerMessage::Error { message, .. } => format!("error: {message}"),
    }
}

fn handle_command(client: &ClientHandle, command: Command, online: &[String]) -> bool {
    match command {
        Command::Share(content) => {
            if let Err(e) = client.send(&ClientMessage::ShareCharacter {
                content,
                username: None,
            }) {
                println!("share failed: {e}");
            }
        }
        Command::Who => {
            if online.is_empty() {
                println!("online: nobody");
            } else {
                println!("online: {}", online.join(", "));
            }
        }
        Command::Retry => match client.state() {
            ConnectionState::Open => println!("already connected"),
            _ => {
                if let Err(e) = client.reconnect() {
                    println!("retry failed: {e}");
                }
            }
        },
        Command::Help => println!("{HELP}"),
        Command::Quit => {
            client.close();
            return false;
        }
    }
    true
}

pub async fn connect_command(config: ClientConfig, username: String) -> Result<()> {
    println!("connecting to {} as {username}", config.url);
    println!("{HELP}");

    let (client, mut events) =
        ReconnectingClient::spawn(WsConnector::new(config.url.clone()), config.policy.clone());

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut online: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ControllerEvent::Opened => {
                        println!("connected");
                        let register = ClientMessage::RegisterUser { username: username.clone() };
                        if let Err(e) = client.send(&register) {
                            println!("register failed: {e}");
                        }
                    }
                    ControllerEvent::Message(msg) => {
                        if let ServerMessage::OnlineUsers { users } = &msg {
                            online = users.clone();
                        }
                        println!("{}", describe(&msg));
                    }
                    ControllerEvent::Closed { deliberate: true, .. } => println!("disconnected"),
                    ControllerEvent::Closed { deliberate: false, reason } => {
                        online.clear();
                        println!("connection lost: {}", reason.as_deref().unwrap_or("unknown"));
                    }
                    ControllerEvent::Reconnecting { attempt, delay } => {
                        println!("reconnecting in {:.1}s (attempt {attempt})", delay.as_secs_f64());
                    }
                    ControllerEvent::GaveUp { attempts } => {
                        println!("gave up after {attempts} attempts; type /retry to try again");
                    }
                }
            }
            line = stdin.next_line(), if stdin_open => {
                match line? {
                    Some(line) => match parse_command(&line) {
                        Ok(Some(command)) => {
                            if !handle_command(&client, command, &online) {
                                stdin_open = false;
                            }
                        }
                        Ok(None) => {}
                        Err(message) => println!("{message}"),
                    },
                    None => {
                        stdin_open = false;
                        client.close();
                    }
                }
            }
        }
    }
    Ok(())
}
