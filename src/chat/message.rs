/// mChat wire messages: parsing and serialization.
///
/// Every frame is a single line of space-separated fields:
///   COMMAND [SPACE field]*
///
/// Lines are terminated by `\n` on the wire, but parsing operates on the
/// content without the terminator.
use std::fmt;
use std::str::FromStr;

/// Longest accepted nickname, in characters.
pub const MAX_NICK_LEN: usize = 32;

/// Longest accepted channel name, in characters.
pub const MAX_CHANNEL_LEN: usize = 64;

/// The listen address a server node advertises to its peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parses `host:port`, `[v6]:port` and bare `v6:port` forms.
impl FromStr for PeerAddr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseError::BadAddress(s.to_owned()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(ParseError::BadAddress(s.to_owned()));
        }
        let port = port
            .parse()
            .map_err(|_| ParseError::BadPort(port.to_owned()))?;
        Ok(Self::new(host, port))
    }
}

/// A parsed protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Join { channel: String },
    Part { channel: String },
    Nick { name: String },
    /// Channel traffic. `text` keeps its inner spaces.
    Msg {
        nick: String,
        channel: String,
        text: String,
    },
    Heart,
    Bleed,
    /// Server-generated notice; relayed between peers, never accepted from clients.
    System { channel: String, text: String },
    AllAddrs(Vec<PeerAddr>),
    MyAddr(PeerAddr),
}

/// Errors that can occur during message parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("{command} expects {expected} field(s)")]
    Arity {
        command: &'static str,
        expected: usize,
    },
    #[error("nickname must be 1..={max} characters", max = MAX_NICK_LEN)]
    BadNick,
    #[error("channel name must be 1..={max} characters", max = MAX_CHANNEL_LEN)]
    BadChannel,
    #[error("invalid port {0:?}")]
    BadPort(String),
    #[error("invalid address {0:?}")]
    BadAddress(String),
    #[error("address list has a host without a port")]
    UnpairedAddress,
}

fn nick(s: &str) -> Result<String, ParseError> {
    let len = s.chars().count();
    if len == 0 || len > MAX_NICK_LEN {
        return Err(ParseError::BadNick);
    }
    Ok(s.to_owned())
}

fn channel(s: &str) -> Result<String, ParseError> {
    let len = s.chars().count();
    if len == 0 || len > MAX_CHANNEL_LEN {
        return Err(ParseError::BadChannel);
    }
    Ok(s.to_owned())
}

fn port(s: &str) -> Result<u16, ParseError> {
    s.parse().map_err(|_| ParseError::BadPort(s.to_owned()))
}

/// Split `rest` into exactly `n` single-space separated fields.
fn exact<'a>(rest: &'a str, command: &'static str, n: usize) -> Result<Vec<&'a str>, ParseError> {
    let fields: Vec<&str> = if rest.is_empty() {
        Vec::new()
    } else {
        rest.split(' ').collect()
    };
    if fields.len() != n {
        return Err(ParseError::Arity {
            command,
            expected: n,
        });
    }
    Ok(fields)
}

impl Message {
    /// Parse a single frame (without the trailing `\n`).
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let input = input.trim_end_matches(['\r', '\n']);

        if input.is_empty() {
            return Err(ParseError::Empty);
        }

        let (command, rest) = input.split_once(' ').unwrap_or((input, ""));

        match command {
            "JOIN" => {
                let f = exact(rest, "JOIN", 1)?;
                Ok(Message::Join {
                    channel: channel(f[0])?,
                })
            }
            "PART" => {
                let f = exact(rest, "PART", 1)?;
                Ok(Message::Part {
                    channel: channel(f[0])?,
                })
            }
            "NICK" => {
                let f = exact(rest, "NICK", 1)?;
                Ok(Message::Nick { name: nick(f[0])? })
            }
            "MSG" => {
                let f: Vec<&str> = rest.splitn(3, ' ').collect();
                if f.len() != 3 {
                    return Err(ParseError::Arity {
                        command: "MSG",
                        expected: 3,
                    });
                }
                Ok(Message::Msg {
                    nick: nick(f[0])?,
                    channel: channel(f[1])?,
                    text: f[2].to_owned(),
                })
            }
            "SYSTEM" => {
                let (ch, text) = rest.split_once(' ').ok_or(ParseError::Arity {
                    command: "SYSTEM",
                    expected: 2,
                })?;
                Ok(Message::System {
                    channel: channel(ch)?,
                    text: text.to_owned(),
                })
            }
            "HEART" => Ok(Message::Heart),
            "BLEED" => Ok(Message::Bleed),
            "MY_ADDR" => {
                let f = exact(rest, "MY_ADDR", 2)?;
                if f[0].is_empty() {
                    return Err(ParseError::BadAddress(rest.to_owned()));
                }
                Ok(Message::MyAddr(PeerAddr::new(f[0], port(f[1])?)))
            }
            "ALL_ADDRS" => {
                let fields: Vec<&str> = if rest.is_empty() {
                    Vec::new()
                } else {
                    rest.split(' ').collect()
                };
                if fields.len() % 2 != 0 {
                    return Err(ParseError::UnpairedAddress);
                }
                let addrs = fields
                    .chunks(2)
                    .map(|pair| {
                        if pair[0].is_empty() {
                            return Err(ParseError::BadAddress(pair.join(" ")));
                        }
                        Ok(PeerAddr::new(pair[0], port(pair[1])?))
                    })
                    .collect::<Result<Vec<_>, ParseError>>()?;
                Ok(Message::AllAddrs(addrs))
            }
            other => Err(ParseError::UnknownCommand(other.to_owned())),
        }
    }

    /// Serialize to the wire format (without trailing `\n`).
    pub fn to_wire(&self) -> String {
        match self {
            Message::Join { channel } => format!("JOIN {channel}"),
            Message::Part { channel } => format!("PART {channel}"),
            Message::Nick { name } => format!("NICK {name}"),
            Message::Msg {
                nick,
                channel,
                text,
            } => format!("MSG {nick} {channel} {text}"),
            Message::Heart => "HEART".into(),
            Message::Bleed => "BLEED".into(),
            Message::System { channel, text } => format!("SYSTEM {channel} {text}"),
            Message::AllAddrs(addrs) => {
                let mut out = String::from("ALL_ADDRS");
                for addr in addrs {
                    out.push(' ');
                    out.push_str(&addr.host);
                    out.push(' ');
                    out.push_str(&addr.port.to_string());
                }
                out
            }
            Message::MyAddr(addr) => format!("MY_ADDR {} {}", addr.host, addr.port),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}
