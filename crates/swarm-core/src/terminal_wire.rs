use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_COLS: u16 = 120;
pub const DEFAULT_ROWS: u16 = 30;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Viewport {
    pub cols: u16,
    pub rows: u16,
}

impl Viewport {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            cols: cols.max(1),
            rows: rows.max(1),
        }
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

/// Frames a dashboard sends on a terminal channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    Pong,
}

impl ClientFrame {
    pub fn resize(viewport: Viewport) -> Self {
        Self::Resize {
            cols: viewport.cols,
            rows: viewport.rows,
        }
    }

    pub fn to_text(&self) -> String {
        match serde_json::to_string(self) {
            Ok(text) => text,
            // Every variant is plain strings and integers.
            Err(_) => String::from(r#"{"type":"pong"}"#),
        }
    }
}

/// Frames the backend sends on a terminal channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Output {
        #[serde(default)]
        data: String,
    },
    Session {
        #[serde(default)]
        session_id: Option<String>,
    },
    Exit {
        #[serde(default)]
        code: Option<i32>,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Frame(ServerFrame),
    /// Not JSON at all: shown verbatim as terminal output.
    Raw(String),
    /// Valid JSON that matches no known frame.
    Unrecognized(String),
}

pub fn classify_server_text(text: &str) -> ServerMessage {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => return ServerMessage::Raw(text.to_string()),
    };
    match serde_json::from_value::<ServerFrame>(value) {
        Ok(frame) => ServerMessage::Frame(frame),
        Err(err) => ServerMessage::Unrecognized(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_match_wire_shapes() {
        assert_eq!(
            ClientFrame::Input {
                data: "ls -la\r".to_string()
            }
            .to_text(),
            r#"{"type":"input","data":"ls -la\r"}"#
        );
        assert_eq!(
            ClientFrame::resize(Viewport::new(100, 40)).to_text(),
            r#"{"type":"resize","cols":100,"rows":40}"#
        );
        assert_eq!(ClientFrame::Pong.to_text(), r#"{"type":"pong"}"#);
    }

    #[test]
    fn server_frames_are_classified() {
        assert_eq!(
            classify_server_text(r#"{"type":"output","data":"hello\r\n"}"#),
            ServerMessage::Frame(ServerFrame::Output {
                data: "hello\r\n".to_string()
            })
        );
        assert_eq!(
            classify_server_text(r#"{"type":"session","session_id":"abc"}"#),
            ServerMessage::Frame(ServerFrame::Session {
                session_id: Some("abc".to_string())
            })
        );
        assert_eq!(
            classify_server_text(r#"{"type":"exit"}"#),
            ServerMessage::Frame(ServerFrame::Exit { code: None })
        );
        assert_eq!(
            classify_server_text(r#"{"type":"ping"}"#),
            ServerMessage::Frame(ServerFrame::Ping)
        );
    }

    #[test]
    fn non_json_text_passes_through_as_raw_output() {
        assert_eq!(
            classify_server_text("\u{1b}[32mok\u{1b}[0m"),
            ServerMessage::Raw("\u{1b}[32mok\u{1b}[0m".to_string())
        );
        assert!(matches!(
            classify_server_text(r#"{"type":"bell"}"#),
            ServerMessage::Unrecognized(_)
        ));
    }

    #[test]
    fn viewport_never_collapses_to_zero() {
        assert_eq!(Viewport::new(0, 0), Viewport { cols: 1, rows: 1 });
        assert_eq!(Viewport::default(), Viewport::new(120, 30));
    }
}
