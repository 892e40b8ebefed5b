//! Operator commands read from stdin:
//!
//! - `send <file>` broadcasts the EIDO in `<file>` to every subscriber
//! - `status` prints the number of open connections
//! - `quit` shuts the notifier down

use eido_common::{Dispatcher, EidoDocument};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Send(PathBuf),
    Status,
    Quit,
    Unknown(String),
}

pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let command = match (verb.to_lowercase().as_str(), rest.trim()) {
        ("send", file) if !file.is_empty() => Command::Send(PathBuf::from(file)),
        ("status", _) => Command::Status,
        ("quit" | "exit", _) => Command::Quit,
        _ => Command::Unknown(line.to_string()),
    };
    Some(command)
}

/// Reads commands until `quit` or end of input. `quit` is reported on `quit_tx`.
pub async fn run(dispatcher: Arc<Dispatcher>, quit_tx: mpsc::Sender<()>) {
    // A detached reader thread; a blocking stdin read must not hold up runtime shutdown.
    let (line_tx, mut lines) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("Console input failed: {}", e);
                    break;
                }
            }
        }
    });

    while let Some(line) = lines.recv().await {
        match parse_command(&line) {
            None => {}
            Some(Command::Send(path)) => send_file(&dispatcher, path).await,
            Some(Command::Status) => {
                println!("{} connection(s) open", dispatcher.connection_count());
            }
            Some(Command::Quit) => {
                let _ = quit_tx.send(()).await;
                break;
            }
            Some(Command::Unknown(line)) => {
                println!("Unknown command {:?}. Commands: send <file>, status, quit", line);
            }
        }
    }
    log::debug!("Console closed");
}

async fn send_file(dispatcher: &Dispatcher, path: PathBuf) {
    let text = match tokio::fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(e) => {
            log::error!("Failed to read {}: {}", path.display(), e);
            return;
        }
    };
    let eido = match EidoDocument::from_json(&text) {
        Ok(eido) => eido,
        Err(e) => {
            log::error!("{} is not an EIDO: {}", path.display(), e);
            return;
        }
    };
    match dispatcher.broadcast(eido) {
        Ok(count) => log::info!("Queued {} on {} connection(s)", path.display(), count),
        Err(e) => log::warn!("Broadcast of {} failed: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("  "), None);
        assert_eq!(parse_command("send  eidos/one.json "), Some(Command::Send(PathBuf::from("eidos/one.json"))));
        assert_eq!(parse_command("STATUS"), Some(Command::Status));
        assert_eq!(parse_command("exit"), Some(Command::Quit));
        assert_eq!(parse_command("send"), Some(Command::Unknown("send".into())));
    }
}
