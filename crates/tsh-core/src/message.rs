//! Shell multiplexing messages.
//!
//! Every frame on the wire carries exactly one [`ShellMessage`]. Output
//! produced by a shell travels back in a `shell_command` message tagged with
//! the originating session id.

use serde::{Deserialize, Serialize};

/// Message type tags as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "spawn_shell")]
    SpawnShell,
    #[serde(rename = "shell_command")]
    ShellCommand,
    #[serde(rename = "stop_shell")]
    StopShell,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpawnShell => "spawn_shell",
            Self::ShellCommand => "shell_command",
            Self::StopShell => "stop_shell",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message status, numeric on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MessageStatus {
    #[default]
    Normal = 0,
    Error = 1,
}

impl From<MessageStatus> for u8 {
    fn from(s: MessageStatus) -> u8 {
        s as u8
    }
}

impl TryFrom<u8> for MessageStatus {
    type Error = String;
    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            0 => Ok(Self::Normal),
            1 => Ok(Self::Error),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellMessage {
    #[serde(rename = "type")]
    pub msg_type: MessageType,

    /// Target session; empty for spawn requests.
    #[serde(default)]
    pub session_id: String,

    /// Owning user for spawn and bulk-stop requests.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,

    #[serde(default)]
    pub status: MessageStatus,

    #[serde(default, with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl ShellMessage {
    pub fn new(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            session_id: String::new(),
            user_id: String::new(),
            status: MessageStatus::Normal,
            data: Vec::new(),
        }
    }

    pub fn spawn_shell(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::new(MessageType::SpawnShell)
        }
    }

    /// Input for a session (server → device) or output from it (device → server).
    pub fn shell_command(session_id: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            session_id: session_id.into(),
            data: data.into(),
            ..Self::new(MessageType::ShellCommand)
        }
    }

    pub fn stop_shell(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            ..Self::new(MessageType::StopShell)
        }
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_error(&self) -> bool {
        self.status == MessageStatus::Error
    }
}

/// Byte-string serde for `data`; also accepts CBOR arrays of integers.
mod serde_bytes {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let buf: ByteBuf = Deserialize::deserialize(deserializer)?;
        Ok(buf.0)
    }

    struct ByteBuf(Vec<u8>);

    impl<'de> Deserialize<'de> for ByteBuf {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            struct ByteBufVisitor;

            impl<'de> serde::de::Visitor<'de> for ByteBufVisitor {
                type Value = ByteBuf;

                fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                    formatter.write_str("bytes")
                }

                fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E> {
                    Ok(ByteBuf(v.to_vec()))
                }

                fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                    Ok(ByteBuf(v))
                }

                fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> {
                    Ok(ByteBuf(v.as_bytes().to_vec()))
                }

                fn visit_unit<E>(self) -> Result<Self::Value, E> {
                    Ok(ByteBuf(Vec::new()))
                }

                fn visit_none<E>(self) -> Result<Self::Value, E> {
                    Ok(ByteBuf(Vec::new()))
                }

                fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
                where
                    A: serde::de::SeqAccess<'de>,
                {
                    let mut bytes = Vec::new();
                    while let Some(b) = seq.next_element::<u8>()? {
                        bytes.push(b);
                    }
                    Ok(ByteBuf(bytes))
                }
            }

            deserializer.deserialize_any(ByteBufVisitor)
        }
    }
}
