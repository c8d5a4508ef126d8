//! JSON frames exchanged over `/ws`: `{"event": <name>, "data": <payload>}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::annotate::Review;
use crate::event::{ExitReason, SessionEvent, StreamKind};

const CYAN: &str = "\x1b[36m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunPayload {
    #[serde(alias = "sourceCode")]
    pub code: String,
    #[serde(default)]
    pub stdin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InputPayload {
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Run(RunPayload),
    Input(InputPayload),
    Kill,
    Resize,
    Ping,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, String> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| format!("invalid frame: {e}"))?;
        let payload = |what: &str| format!("invalid {what} payload");
        match envelope.event.as_str() {
            "terminal:run" => serde_json::from_value(envelope.data)
                .map(ClientMessage::Run)
                .map_err(|e| format!("{}: {e}", payload("terminal:run"))),
            "terminal:input" => serde_json::from_value(envelope.data)
                .map(ClientMessage::Input)
                .map_err(|e| format!("{}: {e}", payload("terminal:input"))),
            "terminal:kill" => Ok(ClientMessage::Kill),
            "terminal:resize" => Ok(ClientMessage::Resize),
            "ping" => Ok(ClientMessage::Ping),
            other => Err(format!("unknown event: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "connected")]
    Connected { sid: String },
    #[serde(rename = "terminal:output")]
    Output {
        data: String,
        stream: StreamKind,
        seq: u64,
    },
    #[serde(rename = "terminal:exit")]
    Exit {
        code: i32,
        reason: ExitReason,
        seq: u64,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        needs_input: bool,
    },
    #[serde(rename = "terminal:error")]
    Error { message: String },
    #[serde(rename = "pong")]
    Pong,
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        // Only strings, integers and unit enums; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// Turns session events into terminal frames.
#[derive(Debug, Clone, Copy)]
pub struct TerminalRenderer {
    /// Translate `\n` to `\r\n` for xterm-style clients.
    pub crlf: bool,
}

impl TerminalRenderer {
    pub fn render(&self, event: SessionEvent) -> ServerMessage {
        match event {
            SessionEvent::Output(chunk) => {
                let text = String::from_utf8_lossy(&chunk.data);
                let data = match chunk.stream {
                    StreamKind::System => status_line(&text),
                    StreamKind::Stdout | StreamKind::Stderr => text.into_owned(),
                };
                self.output(data, chunk.stream, chunk.seq)
            }
            SessionEvent::Diagnostics { seq, report, .. } => {
                let mut text = report.diagnostics;
                if !text.ends_with('\n') {
                    text.push('\n');
                }
                self.output(text, StreamKind::Stderr, seq)
            }
            SessionEvent::Review { seq, review, .. } => {
                let title = match review {
                    Review::Ai(_) => "💡 AI Suggestion:",
                    Review::Rules(_) => "💡 Suggestion:",
                };
                let text = format!("\n{YELLOW}{title}{RESET}\n{}\n", review.render());
                self.output(text, StreamKind::System, seq)
            }
            SessionEvent::Exit(exit) => ServerMessage::Exit {
                code: exit.code,
                reason: exit.reason,
                seq: exit.seq,
                needs_input: exit.needs_input,
            },
            SessionEvent::Error { message, .. } => ServerMessage::Error { message },
        }
    }

    fn output(&self, data: String, stream: StreamKind, seq: u64) -> ServerMessage {
        let data = if self.crlf { to_crlf(&data) } else { data };
        ServerMessage::Output { data, stream, seq }
    }
}

fn status_line(text: &str) -> String {
    let color = match text.chars().next() {
        Some('✓') => GREEN,
        Some('✗') => RED,
        Some('⏱') => YELLOW,
        _ => CYAN,
    };
    format!("{color}{text}{RESET}\n")
}

/// `\n` → `\r\n`, leaving existing `\r\n` pairs alone.
pub fn to_crlf(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 16);
    let mut prev = '\0';
    for c in text.chars() {
        if c == '\n' && prev != '\r' {
            out.push('\r');
        }
        out.push(c);
        prev = c;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ExitReport, OutputChunk};
    use bytes::Bytes;

    #[test]
    fn parses_client_events() {
        let run = ClientMessage::parse(r#"{"event":"terminal:run","data":{"code":"class A{}"}}"#).unwrap();
        assert_eq!(
            run,
            ClientMessage::Run(RunPayload {
                code: "class A{}".to_string(),
                stdin: None
            })
        );

        let alias = ClientMessage::parse(
            r#"{"event":"terminal:run","data":{"sourceCode":"x","stdin":"1\n"}}"#,
        )
        .unwrap();
        assert_eq!(
            alias,
            ClientMessage::Run(RunPayload {
                code: "x".to_string(),
                stdin: Some("1\n".to_string())
            })
        );

        assert_eq!(ClientMessage::parse(r#"{"event":"terminal:kill"}"#), Ok(ClientMessage::Kill));
        assert_eq!(
            ClientMessage::parse(r#"{"event":"terminal:kill","data":{}}"#),
            Ok(ClientMessage::Kill)
        );
        assert_eq!(
            ClientMessage::parse(r#"{"event":"terminal:input","data":{"data":"5\n"}}"#),
            Ok(ClientMessage::Input(InputPayload {
                data: "5\n".to_string()
            }))
        );
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(ClientMessage::parse("not json").is_err());
        assert!(ClientMessage::parse(r#"{"event":"terminal:run","data":{}}"#).is_err());
        let err = ClientMessage::parse(r#"{"event":"nope"}"#).unwrap_err();
        assert_eq!(err, "unknown event: nope");
    }

    #[test]
    fn exit_frame_omits_needs_input_unless_set() {
        let msg = ServerMessage::Exit {
            code: 0,
            reason: ExitReason::Normal,
            seq: 4,
            needs_input: false,
        };
        assert_eq!(
            msg.to_json(),
            r#"{"event":"terminal:exit","data":{"code":0,"reason":"normal","seq":4}}"#
        );
        let msg = ServerMessage::Exit {
            code: 124,
            reason: ExitReason::Timeout,
            seq: 9,
            needs_input: true,
        };
        assert_eq!(
            msg.to_json(),
            r#"{"event":"terminal:exit","data":{"code":124,"reason":"timeout","seq":9,"needs_input":true}}"#
        );
        assert_eq!(ServerMessage::Pong.to_json(), r#"{"event":"pong"}"#);
    }

    #[test]
    fn renders_output_with_crlf_and_colored_status() {
        let renderer = TerminalRenderer { crlf: true };
        let out = renderer.render(SessionEvent::Output(OutputChunk {
            run_id: 1,
            seq: 2,
            stream: StreamKind::Stdout,
            data: Bytes::from_static(b"a\nb\r\n"),
        }));
        assert_eq!(
            out,
            ServerMessage::Output {
                data: "a\r\nb\r\n".to_string(),
                stream: StreamKind::Stdout,
                seq: 2
            }
        );

        let status = renderer.render(SessionEvent::Output(OutputChunk {
            run_id: 1,
            seq: 3,
            stream: StreamKind::System,
            data: Bytes::from_static("✓ Compiled successfully".as_bytes()),
        }));
        match status {
            ServerMessage::Output { data, stream, .. } => {
                assert_eq!(stream, StreamKind::System);
                assert_eq!(data, "\x1b[32m✓ Compiled successfully\x1b[0m\r\n");
            }
            other => panic!("unexpected {other:?}"),
        }

        let exit = renderer.render(SessionEvent::Exit(ExitReport {
            run_id: 1,
            seq: 7,
            code: 1,
            reason: ExitReason::RuntimeError,
            needs_input: false,
            elapsed_ms: 3,
        }));
        assert!(matches!(exit, ServerMessage::Exit { seq: 7, code: 1, .. }));
    }
}
