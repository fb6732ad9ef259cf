//! Line protocol spoken with the entry store
//!
//! ## Format
//!
//! Client lines are JSON objects tagged by `cmd`; once insert mode is
//! acknowledged every client line is one entry document instead.
//!
//! Store lines are `TAG[ payload]`:
//!
//! ```text
//! ok
//! err <message>
//! meta <metadata json>
//! data <entry json>
//! end
//! ```
//!
//! ## Example session
//!
//! ```text
//! > {"cmd":"mode","mode":"query"}
//! ok
//! > {"cmd":"fetch","leftOff":"latest","direction":-1,"query":"http","limit":2}
//! meta {"leftOff":"c9",...}
//! data {...}
//! data {...}
//! meta {"leftOff":"c7",...}
//! end
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{AdminCommand, Direction, FetchRequest, Mode, StoreError};

/// A client command line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum Command {
    Mode {
        mode: Mode,
    },
    Validate {
        query: String,
    },
    Fetch {
        #[serde(rename = "leftOff")]
        left_off: String,
        direction: Direction,
        query: String,
        limit: u64,
    },
    Query {
        #[serde(rename = "leftOff")]
        left_off: String,
        query: String,
    },
    Single {
        id: String,
        query: String,
    },
    Macro {
        #[serde(rename = "macro")]
        name: String,
        expanded: String,
    },
    Limit {
        bytes: u64,
    },
    InsertionFilter {
        filter: String,
    },
}

impl Command {
    /// Encode as one newline-terminated line
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let mut line =
            serde_json::to_vec(self).map_err(|e| StoreError::Protocol(e.to_string()))?;
        line.push(b'\n');
        Ok(line)
    }

    pub fn fetch(request: &FetchRequest) -> Self {
        Command::Fetch {
            left_off: request.left_off.clone(),
            direction: request.direction,
            query: request.query.clone(),
            limit: request.limit,
        }
    }
}

impl From<AdminCommand> for Command {
    fn from(command: AdminCommand) -> Self {
        match command {
            AdminCommand::Macro { name, expanded } => Command::Macro { name, expanded },
            AdminCommand::Limit(bytes) => Command::Limit { bytes },
            AdminCommand::InsertionFilter(filter) => Command::InsertionFilter { filter },
        }
    }
}

/// A store reply line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Err(String),
    Meta(Bytes),
    Data(Bytes),
    End,
}

impl Reply {
    /// Parse one line (trailing newline tolerated). Payloads are kept as
    /// raw bytes; only the tag has to be ASCII.
    pub fn parse(line: &[u8]) -> Result<Self, StoreError> {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let (tag, payload) = match line.iter().position(|b| *b == b' ') {
            Some(at) => (&line[..at], &line[at + 1..]),
            None => (line, &[][..]),
        };

        match tag {
            b"ok" => Ok(Reply::Ok),
            b"end" => Ok(Reply::End),
            b"err" => Ok(Reply::Err(String::from_utf8_lossy(payload).into_owned())),
            b"meta" => Ok(Reply::Meta(Bytes::copy_from_slice(payload))),
            b"data" => Ok(Reply::Data(Bytes::copy_from_slice(payload))),
            other => Err(StoreError::Protocol(format!(
                "unknown reply tag `{}`",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    /// Encode as one newline-terminated line
    pub fn encode(&self) -> Vec<u8> {
        let (tag, payload): (&[u8], &[u8]) = match self {
            Reply::Ok => return b"ok\n".to_vec(),
            Reply::End => return b"end\n".to_vec(),
            Reply::Err(message) => (&b"err"[..], message.as_bytes()),
            Reply::Meta(payload) => (&b"meta"[..], payload.as_ref()),
            Reply::Data(payload) => (&b"data"[..], payload.as_ref()),
        };
        let mut line = Vec::with_capacity(tag.len() + payload.len() + 2);
        line.extend_from_slice(tag);
        line.push(b' ');
        line.extend_from_slice(payload);
        line.push(b'\n');
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_command_wire_shape() {
        let command = Command::fetch(&FetchRequest {
            left_off: "C".to_string(),
            direction: Direction::Backward,
            query: "http".to_string(),
            limit: 3,
        });
        let line = String::from_utf8(command.encode().unwrap()).unwrap();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["cmd"], "fetch");
        assert_eq!(value["leftOff"], "C");
        assert_eq!(value["direction"], -1);
        assert_eq!(value["limit"], 3);
    }

    #[test]
    fn test_admin_commands_wire_tags() {
        let tag = |c: AdminCommand| {
            let line = Command::from(c).encode().unwrap();
            let value: serde_json::Value = serde_json::from_slice(&line).unwrap();
            value["cmd"].as_str().unwrap().to_string()
        };
        assert_eq!(
            tag(AdminCommand::Macro {
                name: "http".to_string(),
                expanded: "proto.name == \"http\"".to_string()
            }),
            "macro"
        );
        assert_eq!(tag(AdminCommand::Limit(10)), "limit");
        assert_eq!(
            tag(AdminCommand::InsertionFilter(String::new())),
            "insertionFilter"
        );
    }

    #[test]
    fn test_parse_replies() {
        assert_eq!(Reply::parse(b"ok\n").unwrap(), Reply::Ok);
        assert_eq!(Reply::parse(b"end").unwrap(), Reply::End);
        assert_eq!(
            Reply::parse(b"err syntax error at 3\r\n").unwrap(),
            Reply::Err("syntax error at 3".to_string())
        );
        assert_eq!(
            Reply::parse(b"data {\"id\":\"1\"}").unwrap(),
            Reply::Data(Bytes::from_static(b"{\"id\":\"1\"}"))
        );
    }

    #[test]
    fn test_parse_keeps_spaces_inside_payload() {
        let reply = Reply::parse(b"meta {\"leftOff\": \"c 1\"}").unwrap();
        assert_eq!(reply, Reply::Meta(Bytes::from_static(b"{\"leftOff\": \"c 1\"}")));
    }

    #[test]
    fn test_parse_unknown_tag() {
        assert!(matches!(
            Reply::parse(b"hello there"),
            Err(StoreError::Protocol(_))
        ));
    }

    #[test]
    fn test_parse_keeps_non_utf8_payload() {
        let reply = Reply::parse(b"data \xff\xfe\n").unwrap();
        assert_eq!(reply, Reply::Data(Bytes::from_static(b"\xff\xfe")));
        assert_eq!(reply.encode(), b"data \xff\xfe\n".to_vec());
    }
}
