use std::fmt;

use thiserror::Error;

/// Outbound control verbs (supervisor -> collector).
///
/// Each command is written as a single line terminated by `\n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Begin collecting
    Start,

    /// Exit cleanly
    Shutdown,

    /// Liveness probe, must be answered with `PONG <agentID>`
    Ping,

    /// Push fresh HostInfo for every known node
    Refresh,
}

impl Command {
    pub fn verb(self) -> &'static str {
        match self {
            Command::Start => "START",
            Command::Shutdown => "SHUTDOWN",
            Command::Ping => "PING",
            Command::Refresh => "REFRESH",
        }
    }

    /// Wire form including the trailing newline.
    pub fn encode(self) -> String {
        format!("{}\n", self.verb())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// Severity carried by a collector `LOG` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Unknown levels fall back to `Debug`.
    fn parse(raw: &str) -> Self {
        match raw {
            "INFO" => LogLevel::Info,
            "WARN" => LogLevel::Warn,
            "ERROR" => LogLevel::Error,
            _ => LogLevel::Debug,
        }
    }

    pub fn as_log(self) -> log::Level {
        match self {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

/// Inbound messages (collector -> supervisor), one per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentMessage {
    /// `READY <agentID>`
    Ready { agent_id: String },

    /// `PONG <agentID>`
    Pong { agent_id: String },

    /// `HOSTINFO <nodeID> <jsonPayload>`
    ///
    /// The payload is kept raw; the supervisor decides what to do
    /// with JSON that does not parse.
    HostInfo { node_id: String, payload: String },

    /// `ERROR <message>`
    Error { message: String },

    /// `LOG <LEVEL> <message...>`
    Log { level: LogLevel, message: String },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty line")]
    Empty,

    #[error("unknown verb `{0}`")]
    UnknownVerb(String),

    #[error("`{verb}` is missing its {field}")]
    MissingField {
        verb: &'static str,
        field: &'static str,
    },
}

/// Splits off the first whitespace-delimited word.
fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(idx) => (&s[..idx], s[idx..].trim_start()),
        None => (s, ""),
    }
}

/// Parses one line read from the collector's stdout.
///
/// Trailing `\r`/`\n` and surrounding whitespace are ignored.
/// A malformed line is reported as an error and never panics.
pub fn parse_line(line: &str) -> Result<AgentMessage, ProtocolError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ProtocolError::Empty);
    }

    let (verb, rest) = split_word(line);
    let rest = rest.trim_end();

    match verb {
        "READY" => Ok(AgentMessage::Ready {
            agent_id: required(rest, "READY", "agent id")?.to_string(),
        }),

        "PONG" => Ok(AgentMessage::Pong {
            agent_id: required(rest, "PONG", "agent id")?.to_string(),
        }),

        "HOSTINFO" => {
            let (node_id, payload) = split_word(rest);
            let node_id = required(node_id, "HOSTINFO", "node id")?;
            let payload = required(payload, "HOSTINFO", "payload")?;

            Ok(AgentMessage::HostInfo {
                node_id: node_id.to_string(),
                payload: payload.to_string(),
            })
        }

        "ERROR" => Ok(AgentMessage::Error {
            message: rest.to_string(),
        }),

        "LOG" => {
            let (level, message) = split_word(rest);
            let level = required(level, "LOG", "level")?;

            Ok(AgentMessage::Log {
                level: LogLevel::parse(level),
                message: message.to_string(),
            })
        }

        other => Err(ProtocolError::UnknownVerb(other.to_string())),
    }
}

fn required<'a>(
    value: &'a str,
    verb: &'static str,
    field: &'static str,
) -> Result<&'a str, ProtocolError> {
    if value.is_empty() {
        Err(ProtocolError::MissingField { verb, field })
    } else {
        Ok(value)
    }
}
