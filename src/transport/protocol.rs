//! Wire protocol definitions.
//!
//! Every frame is one line of UTF-8 JSON, `{"command", "content", "sender"}`.
//! JSON escapes newlines inside strings, so the delimiter never appears in a
//! payload. The command vocabulary is closed: [`Command`] parses
//! case-insensitively and always transmits the lower-case form.

use crate::network::{AddressBookSnapshot, AddressRecord};
use crate::utils::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Protocol command vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Command {
    /// Ask the name server for the chat server role
    RequestServerPrivileges,
    /// Privileges granted
    Accepted,
    /// Privileges refused, a server is active or locked in
    Rejected,
    /// The elected peer is listening at the given address
    ServerEstablished,
    /// The chat server released its role
    ServerTerminated,
    /// The chat server is shutting down
    ChatServerShutdown,
    /// The chat server role is vacant
    ChatServerDead,
    /// Discovery query
    RequestCurrentServer,
    /// Discovery answer carrying the chat server address
    ServerExists,
    /// Discovery answer when nobody holds the role
    NoChatServer,
    /// Ask the name server to probe the registered chat server
    ChatServerTerminated,
    /// Bulk address book sync request
    UpdateAddressBook,
    /// Bulk address book sync reply
    AddressBookData,
    /// Single-record announcement
    NewClient,
    /// Relayed chat message
    Message,
    /// Chat message acknowledgement
    MessageSent,
    /// Liveness probe
    Ping,
    /// Liveness answer
    Pong,
}

impl Command {
    /// Every command, in vocabulary order
    pub const ALL: [Command; 18] = [
        Command::RequestServerPrivileges,
        Command::Accepted,
        Command::Rejected,
        Command::ServerEstablished,
        Command::ServerTerminated,
        Command::ChatServerShutdown,
        Command::ChatServerDead,
        Command::RequestCurrentServer,
        Command::ServerExists,
        Command::NoChatServer,
        Command::ChatServerTerminated,
        Command::UpdateAddressBook,
        Command::AddressBookData,
        Command::NewClient,
        Command::Message,
        Command::MessageSent,
        Command::Ping,
        Command::Pong,
    ];

    /// Canonical transmitted form
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::RequestServerPrivileges => "request server privileges",
            Command::Accepted => "accepted",
            Command::Rejected => "rejected",
            Command::ServerEstablished => "server established",
            Command::ServerTerminated => "server terminated",
            Command::ChatServerShutdown => "chat server shutdown",
            Command::ChatServerDead => "chat server dead",
            Command::RequestCurrentServer => "request current server ip and port",
            Command::ServerExists => "server exists",
            Command::NoChatServer => "no chat server",
            Command::ChatServerTerminated => "chat server terminated",
            Command::UpdateAddressBook => "update address book",
            Command::AddressBookData => "address book data",
            Command::NewClient => "new client",
            Command::Message => "message",
            Command::MessageSent => "message sent",
            Command::Ping => "ping",
            Command::Pong => "pong",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Command::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == wanted)
            .ok_or(ProtocolError::UnknownCommand {
                command: s.to_string(),
            })
    }
}

impl TryFrom<String> for Command {
    type Error = ProtocolError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Command> for String {
    fn from(command: Command) -> Self {
        command.as_str().to_string()
    }
}

/// One framed protocol unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// What the frame asks for or answers
    pub command: Command,
    /// Plain JSON, or a JSON string holding a ciphertext array
    #[serde(default)]
    pub content: Value,
    /// Logical name of the sending process
    #[serde(default)]
    pub sender: String,
}

impl Envelope {
    /// Encode as one line without the trailing delimiter
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode one line
    pub fn from_line(line: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(line).map_err(|e| ProtocolError::MalformedFrame {
            reason: e.to_string(),
        })?;
        let command = raw
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::MalformedFrame {
                reason: "missing command".to_string(),
            })?
            .parse::<Command>()?;
        let sender = raw
            .get("sender")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let content = raw.get("content").cloned().unwrap_or(Value::Null);
        Ok(Self {
            command,
            content,
            sender,
        })
    }

    /// Interpret `content` as plain JSON or ciphertext
    pub fn payload(&self) -> Payload {
        Payload::from_value(&self.content)
    }
}

/// Content as it appears on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Unencrypted JSON value
    Plain(Value),
    /// Encrypted integer sequence
    Ciphertext(Vec<u64>),
}

impl Payload {
    /// Classify wire content. Ciphertext travels as a JSON string that itself
    /// decodes to an array of integers; no plain body has that shape because
    /// structured bodies are objects and empty bodies are `""`.
    pub fn from_value(value: &Value) -> Self {
        if let Value::String(s) = value {
            if s.starts_with('[') {
                if let Ok(blocks) = serde_json::from_str::<Vec<u64>>(s) {
                    return Payload::Ciphertext(blocks);
                }
            }
        }
        Payload::Plain(value.clone())
    }

    /// Wire form of this payload
    pub fn into_value(self) -> Result<Value> {
        Ok(match self {
            Payload::Plain(value) => value,
            Payload::Ciphertext(blocks) => Value::String(serde_json::to_string(&blocks)?),
        })
    }
}

/// Text relayed between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique message id
    pub id: uuid::Uuid,
    /// Message body
    pub text: String,
    /// When the author sent it
    pub sent_at: chrono::DateTime<chrono::Utc>,
}

impl ChatMessage {
    /// New message stamped now
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            text: text.into(),
            sent_at: chrono::Utc::now(),
        }
    }
}

/// Decoded protocol message with typed content
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Claim the chat server role at this address
    RequestServerPrivileges(AddressRecord),
    /// Claim granted
    Accepted,
    /// Claim refused
    Rejected,
    /// Claimed role is now served at this address
    ServerEstablished(AddressRecord),
    /// Role released
    ServerTerminated,
    /// Role released during shutdown
    ChatServerShutdown,
    /// Role is vacant
    ChatServerDead,
    /// Who is the chat server?
    RequestCurrentServer,
    /// This is the chat server
    ServerExists(AddressRecord),
    /// Nobody is the chat server
    NoChatServer,
    /// Probe the registered chat server
    ChatServerTerminated,
    /// Merge my book into yours
    UpdateAddressBook(AddressBookSnapshot),
    /// Merged book
    AddressBookData(AddressBookSnapshot),
    /// Register or replace one record
    NewClient(AddressRecord),
    /// Chat text
    Chat(ChatMessage),
    /// Chat text accepted
    MessageSent,
    /// Are you alive?
    Ping,
    /// Alive
    Pong,
}

impl Message {
    /// The command that carries this message
    pub fn command(&self) -> Command {
        match self {
            Message::RequestServerPrivileges(_) => Command::RequestServerPrivileges,
            Message::Accepted => Command::Accepted,
            Message::Rejected => Command::Rejected,
            Message::ServerEstablished(_) => Command::ServerEstablished,
            Message::ServerTerminated => Command::ServerTerminated,
            Message::ChatServerShutdown => Command::ChatServerShutdown,
            Message::ChatServerDead => Command::ChatServerDead,
            Message::RequestCurrentServer => Command::RequestCurrentServer,
            Message::ServerExists(_) => Command::ServerExists,
            Message::NoChatServer => Command::NoChatServer,
            Message::ChatServerTerminated => Command::ChatServerTerminated,
            Message::UpdateAddressBook(_) => Command::UpdateAddressBook,
            Message::AddressBookData(_) => Command::AddressBookData,
            Message::NewClient(_) => Command::NewClient,
            Message::Chat(_) => Command::Message,
            Message::MessageSent => Command::MessageSent,
            Message::Ping => Command::Ping,
            Message::Pong => Command::Pong,
        }
    }

    /// Plain JSON body, before any encryption
    pub fn body(&self) -> Result<Value> {
        Ok(match self {
            Message::RequestServerPrivileges(record)
            | Message::ServerEstablished(record)
            | Message::ServerExists(record)
            | Message::NewClient(record) => serde_json::to_value(record)?,
            Message::UpdateAddressBook(book) | Message::AddressBookData(book) => {
                serde_json::to_value(book)?
            }
            Message::Chat(chat) => serde_json::to_value(chat)?,
            Message::Accepted
            | Message::Rejected
            | Message::ServerTerminated
            | Message::ChatServerShutdown
            | Message::ChatServerDead
            | Message::RequestCurrentServer
            | Message::NoChatServer
            | Message::ChatServerTerminated
            | Message::MessageSent
            | Message::Ping
            | Message::Pong => Value::String(String::new()),
        })
    }

    /// Rebuild a message from its command and plain body
    pub fn from_parts(command: Command, body: Value) -> Result<Self> {
        fn typed<T: serde::de::DeserializeOwned>(command: Command, body: Value) -> Result<T> {
            serde_json::from_value(body).map_err(|e| {
                ProtocolError::InvalidContent {
                    command: command.to_string(),
                    reason: e.to_string(),
                }
                .into()
            })
        }

        Ok(match command {
            Command::RequestServerPrivileges => {
                Message::RequestServerPrivileges(typed(command, body)?)
            }
            Command::Accepted => Message::Accepted,
            Command::Rejected => Message::Rejected,
            Command::ServerEstablished => Message::ServerEstablished(typed(command, body)?),
            Command::ServerTerminated => Message::ServerTerminated,
            Command::ChatServerShutdown => Message::ChatServerShutdown,
            Command::ChatServerDead => Message::ChatServerDead,
            Command::RequestCurrentServer => Message::RequestCurrentServer,
            Command::ServerExists => Message::ServerExists(typed(command, body)?),
            Command::NoChatServer => Message::NoChatServer,
            Command::ChatServerTerminated => Message::ChatServerTerminated,
            Command::UpdateAddressBook => Message::UpdateAddressBook(typed(command, body)?),
            Command::AddressBookData => Message::AddressBookData(typed(command, body)?),
            Command::NewClient => Message::NewClient(typed(command, body)?),
            Command::Message => Message::Chat(typed(command, body)?),
            Command::MessageSent => Message::MessageSent,
            Command::Ping => Message::Ping,
            Command::Pong => Message::Pong,
        })
    }

    /// Unencrypted envelope, used for the name server and replies to
    /// unknown senders
    pub fn into_plain_envelope(self, sender: &str) -> Result<Envelope> {
        Ok(Envelope {
            command: self.command(),
            content: self.body()?,
            sender: sender.to_string(),
        })
    }

    /// Decode an unencrypted envelope
    pub fn from_plain_envelope(envelope: Envelope) -> Result<Self> {
        match envelope.payload() {
            Payload::Plain(body) => Self::from_parts(envelope.command, body),
            Payload::Ciphertext(_) => Err(ProtocolError::InvalidContent {
                command: envelope.command.to_string(),
                reason: "encrypted content where plaintext was expected".to_string(),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_vocabulary() {
        for command in Command::ALL {
            assert_eq!(command.as_str().parse::<Command>().unwrap(), command);
        }
        assert_eq!(
            "Request Server Privileges".parse::<Command>().unwrap(),
            Command::RequestServerPrivileges
        );
        assert_eq!("SERVER ESTABLISHED".parse::<Command>().unwrap(), Command::ServerEstablished);
        assert!("shout".parse::<Command>().is_err());
    }

    #[test]
    fn test_envelope_line_format() {
        let envelope = Message::Accepted.into_plain_envelope("name_server").unwrap();
        let line = envelope.to_line().unwrap();

        assert!(!line.contains('\n'));
        assert_eq!(line, r#"{"command":"accepted","content":"","sender":"name_server"}"#);
        assert_eq!(Envelope::from_line(&line).unwrap(), envelope);
    }

    #[test]
    fn test_newlines_in_content_stay_escaped() {
        let chat = Message::Chat(ChatMessage::new("line one\nline two"));
        let line = chat.into_plain_envelope("alice").unwrap().to_line().unwrap();
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_malformed_frames() {
        assert!(Envelope::from_line("not json").is_err());
        assert!(Envelope::from_line(r#"{"content":""}"#).is_err());
        assert!(Envelope::from_line(r#"{"command":"shout","content":""}"#).is_err());

        // Missing sender and content are tolerated
        let envelope = Envelope::from_line(r#"{"command":"Ping"}"#).unwrap();
        assert_eq!(envelope.command, Command::Ping);
        assert_eq!(envelope.sender, "");
    }

    #[test]
    fn test_payload_classification() {
        let cipher = Payload::Ciphertext(vec![12, 34, 56]);
        let value = cipher.clone().into_value().unwrap();
        assert_eq!(value, Value::String("[12,34,56]".to_string()));
        assert_eq!(Payload::from_value(&value), cipher);

        let empty = Value::String(String::new());
        assert_eq!(Payload::from_value(&empty), Payload::Plain(empty.clone()));

        let object = serde_json::json!({"ip": "127.0.0.1"});
        assert_eq!(Payload::from_value(&object), Payload::Plain(object.clone()));
    }

    #[test]
    fn test_typed_content_by_command() {
        let record = AddressRecord::plaintext("alice", "127.0.0.1", 9000);
        let message = Message::ServerEstablished(record.clone());

        let decoded = Message::from_parts(message.command(), message.body().unwrap()).unwrap();
        assert_eq!(decoded, Message::ServerEstablished(record));

        let err = Message::from_parts(Command::ServerExists, Value::String(String::new()));
        assert!(err.is_err());
    }

    #[test]
    fn test_plain_envelope_rejects_ciphertext() {
        let envelope = Envelope {
            command: Command::Ping,
            content: Value::String("[1,2]".to_string()),
            sender: "alice".to_string(),
        };
        assert!(Message::from_plain_envelope(envelope).is_err());
    }
}
