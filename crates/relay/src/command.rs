//! Parsing of interactive input lines.
//!
//! ```text
//! %ONE <user> <text>   send <text> to <user>
//! %LIST                list connected users
//! %EXIT                leave the relay
//! anything else        broadcast to everyone
//! ```

use relay_protocol::WireMessage;

/// Usage hint shown for a malformed `%` command.
pub const USAGE: &str = "usage: %ONE <user> <text> | %LIST | %EXIT | <text> to broadcast";

/// A command typed by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ToOne { receiver: String, body: String },
    Broadcast(String),
    List,
    Exit,
}

impl Command {
    /// Frame to send for this command.
    pub fn to_message(&self) -> WireMessage {
        match self {
            Self::ToOne { receiver, body } => WireMessage::to_one(receiver, body),
            Self::Broadcast(body) => WireMessage::bcast(body),
            Self::List => WireMessage::list(),
            Self::Exit => WireMessage::exit(),
        }
    }
}

/// A `%` line that is not a valid command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}; {USAGE}")]
pub struct UsageError {
    reason: &'static str,
}

/// Parses one input line.
///
/// Blank lines yield `Ok(None)` and are not sent.
pub fn parse_line(line: &str) -> Result<Option<Command>, UsageError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(None);
    }

    let Some(rest) = line.strip_prefix('%') else {
        return Ok(Some(Command::Broadcast(line.to_string())));
    };

    let (word, args) = match rest.split_once(char::is_whitespace) {
        Some((word, args)) => (word, args.trim_start()),
        None => (rest, ""),
    };

    match word {
        "ONE" => {
            let Some((receiver, body)) = args.split_once(char::is_whitespace) else {
                return Err(UsageError {
                    reason: "%ONE needs a user and a message",
                });
            };
            let body = body.trim_start();
            if body.is_empty() {
                return Err(UsageError {
                    reason: "%ONE needs a message",
                });
            }
            Ok(Some(Command::ToOne {
                receiver: receiver.to_string(),
                body: body.to_string(),
            }))
        }
        "LIST" if args.trim().is_empty() => Ok(Some(Command::List)),
        "EXIT" if args.trim().is_empty() => Ok(Some(Command::Exit)),
        "LIST" | "EXIT" => Err(UsageError {
            reason: "command takes no arguments",
        }),
        _ => Err(UsageError {
            reason: "unknown command",
        }),
    }
}
