//! STOMP-style frame codec for the broker transport
//!
//! Frames travel as text messages over the WebSocket channel. The wire shape
//! follows STOMP 1.2: a command line, header lines (`name:value`), a blank
//! line, then the body terminated by a NUL octet.

use std::fmt;

use thiserror::Error;

/// Frame commands exchanged with the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameCommand {
    /// Client handshake
    Connect,
    /// Server handshake confirmation
    Connected,
    /// Client subscription to a destination
    Subscribe,
    /// Client publish to a destination
    Send,
    /// Server delivery of a frame from a destination
    Message,
    /// Client acknowledgment of a delivered frame
    Ack,
    /// Server-side error report
    Error,
}

impl FrameCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameCommand::Connect => "CONNECT",
            FrameCommand::Connected => "CONNECTED",
            FrameCommand::Subscribe => "SUBSCRIBE",
            FrameCommand::Send => "SEND",
            FrameCommand::Message => "MESSAGE",
            FrameCommand::Ack => "ACK",
            FrameCommand::Error => "ERROR",
        }
    }

    fn parse(input: &str) -> Option<Self> {
        match input {
            "CONNECT" => Some(FrameCommand::Connect),
            "CONNECTED" => Some(FrameCommand::Connected),
            "SUBSCRIBE" => Some(FrameCommand::Subscribe),
            "SEND" => Some(FrameCommand::Send),
            "MESSAGE" => Some(FrameCommand::Message),
            "ACK" => Some(FrameCommand::Ack),
            "ERROR" => Some(FrameCommand::Error),
            _ => None,
        }
    }
}

impl fmt::Display for FrameCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message unit on the broker transport: command, headers, body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: FrameCommand,
    headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    /// Create an empty frame for the given command
    pub fn new(command: FrameCommand) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Builder-style header append
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Builder-style body assignment
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First header value for `name`, if present
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Serialize to the wire format
    pub fn serialize(&self) -> String {
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push(':');
            out.push_str(value);
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse a frame from its wire representation
    pub fn parse(input: &str) -> Result<Self, FrameError> {
        let input = input.trim_end_matches('\0');
        let (head, body) = match input.split_once("\n\n") {
            Some((head, body)) => (head, body),
            None => (input, ""),
        };

        let mut lines = head.lines();
        let command_line = lines.next().unwrap_or("").trim();
        if command_line.is_empty() {
            return Err(FrameError::Empty);
        }
        let command = FrameCommand::parse(command_line)
            .ok_or_else(|| FrameError::UnknownCommand(command_line.to_string()))?;

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
            headers.push((name.to_string(), value.to_string()));
        }

        Ok(Self {
            command,
            headers,
            body: body.to_string(),
        })
    }
}

/// Frame codec errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("unknown frame command: {0}")]
    UnknownCommand(String),

    #[error("malformed frame header: {0}")]
    MalformedHeader(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_message_frame() {
        let frame = Frame::new(FrameCommand::Message)
            .header("message-id", "m-1")
            .header("message", r#"{"requestType":"PING","payload":{}}"#)
            .with_body("m-1");

        let parsed = Frame::parse(&frame.serialize()).unwrap();
        assert_eq!(parsed.command, FrameCommand::Message);
        assert_eq!(parsed.get_header("message-id"), Some("m-1"));
        assert_eq!(parsed.body, "m-1");
    }

    #[test]
    fn header_values_keep_embedded_colons() {
        let frame = Frame::new(FrameCommand::Send).header("destination", "/queue/responses:u1");
        let parsed = Frame::parse(&frame.serialize()).unwrap();
        assert_eq!(parsed.get_header("destination"), Some("/queue/responses:u1"));
    }

    #[test]
    fn rejects_unknown_commands() {
        let err = Frame::parse("BEGIN\n\n\0").unwrap_err();
        assert!(matches!(err, FrameError::UnknownCommand(c) if c == "BEGIN"));
    }

    #[test]
    fn rejects_headers_without_separator() {
        let err = Frame::parse("SEND\nbroken header\n\nbody\0").unwrap_err();
        assert!(matches!(err, FrameError::MalformedHeader(_)));
    }

    #[test]
    fn rejects_empty_input() {
        assert!(matches!(Frame::parse("\0"), Err(FrameError::Empty)));
    }

    #[test]
    fn missing_header_is_none() {
        let frame = Frame::new(FrameCommand::Ack);
        assert_eq!(frame.get_header("id"), None);
    }
}
