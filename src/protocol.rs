//! Inbound and outbound events exchanged with players.
//!
//! Every frame is a JSON object tagged by its `type` field:
//!
//! ```json
//! {"type": "join_queue", "name": "alice"}
//! {"type": "game_result", "result": "win", "message": "...", "attempts": 2, "duration": 41.3}
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::DuelError;
use crate::task_catalog::Task;

/// Name used when a player joins without one.
pub const DEFAULT_PLAYER_NAME: &str = "Player";
const MAX_NAME_LEN: usize = 32;

/// Events sent by a player.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinQueue {
        #[serde(default, alias = "nickname")]
        name: Option<String>,
    },
    CodeUpdate {
        #[serde(default)]
        code: String,
    },
    SubmitSolution {
        #[serde(default)]
        code: String,
    },
    Ping {},
}

const CLIENT_EVENT_KINDS: [&str; 4] = ["join_queue", "code_update", "submit_solution", "ping"];

/// Parses one inbound frame.
///
/// Malformed JSON and unknown `type`s are both [`DuelError::Protocol`]; the caller answers with an
/// `error` event and keeps the connection open.
pub fn parse_client_event(frame: &str) -> Result<ClientEvent, DuelError> {
    let value: serde_json::Value = serde_json::from_str(frame)
        .map_err(|e| DuelError::Protocol(format!("invalid message format ({e})")))?;
    let kind = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| DuelError::Protocol("missing message type".to_string()))?
        .to_owned();
    if !CLIENT_EVENT_KINDS.contains(&kind.as_str()) {
        return Err(DuelError::Protocol(format!("unknown message type '{kind}'")));
    }
    serde_json::from_value(value)
        .map_err(|e| DuelError::Protocol(format!("invalid '{kind}' message ({e})")))
}

/// Trims and caps a display name, falling back to [`DEFAULT_PLAYER_NAME`].
pub fn sanitize_name(name: Option<&str>) -> String {
    let name = name.map(str::trim).unwrap_or_default();
    if name.is_empty() {
        return DEFAULT_PLAYER_NAME.to_string();
    }
    name.chars().take(MAX_NAME_LEN).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GameOutcome {
    Win,
    Lose,
}

/// Events sent to a player.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    QueueJoined {
        message: String,
    },
    GameStarted {
        session_id: String,
        task: Arc<Task>,
        opponent_name: String,
    },
    OpponentCodeUpdate {
        code: String,
    },
    CheckingSolution {
        message: String,
    },
    SolutionIncorrect {
        message: String,
        attempts: u32,
    },
    GameResult {
        result: GameOutcome,
        message: String,
        attempts: u32,
        /// Seconds since the session started.
        duration: f64,
    },
    OpponentDisconnected {
        message: String,
    },
    Error {
        message: String,
    },
    Pong {},
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> ServerEvent {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    /// Wire name of the event, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::QueueJoined { .. } => "queue_joined",
            ServerEvent::GameStarted { .. } => "game_started",
            ServerEvent::OpponentCodeUpdate { .. } => "opponent_code_update",
            ServerEvent::CheckingSolution { .. } => "checking_solution",
            ServerEvent::SolutionIncorrect { .. } => "solution_incorrect",
            ServerEvent::GameResult { .. } => "game_result",
            ServerEvent::OpponentDisconnected { .. } => "opponent_disconnected",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Pong {} => "pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::task_catalog::TestVector;

    #[test]
    fn parses_known_events() {
        assert_eq!(
            parse_client_event(r#"{"type":"join_queue","name":"alice"}"#).unwrap(),
            ClientEvent::JoinQueue {
                name: Some("alice".to_string())
            }
        );
        assert_eq!(
            parse_client_event(r#"{"type":"join_queue","nickname":"bob"}"#).unwrap(),
            ClientEvent::JoinQueue {
                name: Some("bob".to_string())
            }
        );
        assert_eq!(
            parse_client_event(r#"{"type":"code_update"}"#).unwrap(),
            ClientEvent::CodeUpdate {
                code: String::new()
            }
        );
        assert_eq!(
            parse_client_event(r#"{"type":"ping"}"#).unwrap(),
            ClientEvent::Ping {}
        );
    }

    #[test]
    fn unknown_and_malformed_frames_are_protocol_errors() {
        for frame in [
            r#"{"type":"dance"}"#,
            r#"{"name":"x"}"#,
            "not json",
            r#"{"type":"submit_solution","code":42}"#,
        ] {
            assert!(
                matches!(parse_client_event(frame), Err(DuelError::Protocol(_))),
                "{frame}"
            );
        }
    }

    #[test]
    fn a_known_type_with_bad_fields_names_the_type() {
        let Err(DuelError::Protocol(message)) =
            parse_client_event(r#"{"type":"submit_solution","code":5}"#)
        else {
            panic!("expected a protocol error");
        };
        assert!(message.contains("'submit_solution'"), "{message}");
    }

    #[test]
    fn names_are_sanitized() {
        assert_eq!(sanitize_name(None), DEFAULT_PLAYER_NAME);
        assert_eq!(sanitize_name(Some("   ")), DEFAULT_PLAYER_NAME);
        assert_eq!(sanitize_name(Some("  eve ")), "eve");
        assert_eq!(sanitize_name(Some(&"x".repeat(100))).len(), MAX_NAME_LEN);
    }

    #[test]
    fn outbound_events_are_tagged() {
        let result = ServerEvent::GameResult {
            result: GameOutcome::Lose,
            message: "too slow".to_string(),
            attempts: 3,
            duration: 1.5,
        };
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({"type": "game_result", "result": "lose", "message": "too slow", "attempts": 3, "duration": 1.5})
        );
        assert_eq!(
            serde_json::to_value(ServerEvent::Pong {}).unwrap(),
            json!({"type": "pong"})
        );
    }

    #[test]
    fn game_started_exposes_the_vectors() {
        let task = Task::new("Sum", "add", "sum", vec![TestVector::new([2, 3], 5)]).unwrap();
        let event = ServerEvent::GameStarted {
            session_id: "s".to_string(),
            task: Arc::new(task),
            opponent_name: "bob".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["opponent_name"], "bob");
        assert_eq!(value["task"]["function_name"], "sum");
        assert_eq!(
            value["task"]["test_vectors"],
            json!([{"inputs": [2, 3], "expected": 5}])
        );
    }
}
