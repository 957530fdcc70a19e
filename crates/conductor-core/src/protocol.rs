//! Wire protocol.
//!
//! Every frame is a JSON object with a `type` field naming the message; the
//! remaining fields are the payload, in camelCase.
//!
//! Inbound frames are parsed per handler from a raw [`serde_json::Value`] so
//! an unknown `type` can be skipped without failing the connection.

use serde::{Deserialize, Serialize};

use crate::bookmarks::{Bookmark, BookmarkScope, WatchConfigInput};
use crate::process::{ProcessId, ProcessStatus, ProcessView};
use crate::spawn::StreamKind;
use crate::tasks::TaskView;

pub type ClientId = u64;

// ============================================================================
// Inbound payloads
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillRequest {
    pub process_id: String,
    #[serde(default)]
    pub signal: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearRequest {
    #[serde(default)]
    pub process_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchUpdateRequest {
    pub bookmark_id: String,
    pub scope: BookmarkScope,
    #[serde(default)]
    pub project_slug: Option<String>,
    pub watch: WatchConfigInput,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarksGetRequest {
    #[serde(default)]
    pub project_slug: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarksAddRequest {
    pub scope: BookmarkScope,
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub project_slug: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarksRemoveRequest {
    pub scope: BookmarkScope,
    pub id: String,
    #[serde(default)]
    pub project_slug: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSetRequest {
    pub project_slug: String,
}

/// Payload for `session:*` and `task:*` frames; falls back to the
/// connection's current session when omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

// ============================================================================
// Outbound frames
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum Outbound {
    #[serde(rename = "connected")]
    Connected { client_id: ClientId },

    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_type: Option<String>,
    },

    #[serde(rename = "started")]
    Started {
        process_id: ProcessId,
        command: String,
        pid: Option<u32>,
        cwd: String,
        project_slug: String,
    },

    #[serde(rename = "output")]
    Output {
        process_id: ProcessId,
        stream: StreamKind,
        data: String,
        project_slug: String,
    },

    #[serde(rename = "exit")]
    Exit {
        process_id: ProcessId,
        code: Option<i32>,
        signal: Option<String>,
        status: ProcessStatus,
        project_slug: String,
    },

    #[serde(rename = "processes")]
    Processes {
        project_slug: String,
        processes: Vec<ProcessView>,
    },

    #[serde(rename = "watch:tick")]
    WatchTick {
        project_slug: String,
        process: ProcessView,
    },

    #[serde(rename = "watch:state")]
    WatchState { active: Vec<String> },

    #[serde(rename = "bookmarks")]
    Bookmarks {
        global: Vec<Bookmark>,
        project: Vec<Bookmark>,
    },

    #[serde(rename = "session:watching")]
    SessionWatching {
        session_id: String,
        had_other_watchers: bool,
    },

    #[serde(rename = "session:shared")]
    SessionShared {
        session_id: String,
        is_active_elsewhere: bool,
    },

    #[serde(rename = "task")]
    Task { task: TaskView },

    #[serde(rename = "task:cancelled")]
    TaskCancelled { session_id: String, cancelled: bool },

    #[serde(rename = "task:cleared")]
    TaskCleared { session_id: String, cleared: bool },
}

impl Outbound {
    pub fn error(message: impl Into<String>, request_type: Option<&str>) -> Self {
        Outbound::Error {
            message: message.into(),
            request_type: request_type.map(str::to_string),
        }
    }

    /// Encode as a text frame.
    pub fn to_frame(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(frame) => Some(frame),
            Err(e) => {
                log::warn!("Failed to serialize outbound frame: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn encode(msg: &Outbound) -> Value {
        serde_json::from_str(&msg.to_frame().unwrap()).unwrap()
    }

    #[test]
    fn outbound_frames_are_tagged_and_camel_case() {
        let frame = encode(&Outbound::Started {
            process_id: ProcessId::from("p1"),
            command: "date".to_string(),
            pid: Some(99),
            cwd: "/tmp".to_string(),
            project_slug: "web".to_string(),
        });
        assert_eq!(
            frame,
            json!({
                "type": "started",
                "processId": "p1",
                "command": "date",
                "pid": 99,
                "cwd": "/tmp",
                "projectSlug": "web"
            })
        );
    }

    #[test]
    fn namespaced_types_keep_their_colon() {
        let frame = encode(&Outbound::WatchState {
            active: vec!["b1".to_string()],
        });
        assert_eq!(frame, json!({"type": "watch:state", "active": ["b1"]}));

        let frame = encode(&Outbound::SessionShared {
            session_id: "s1".to_string(),
            is_active_elsewhere: true,
        });
        assert_eq!(frame["type"], "session:shared");
        assert_eq!(frame["isActiveElsewhere"], true);
    }

    #[test]
    fn error_omits_missing_request_type() {
        let frame = encode(&Outbound::error("boom", None));
        assert_eq!(frame, json!({"type": "error", "message": "boom"}));

        let frame = encode(&Outbound::error("boom", Some("exec")));
        assert_eq!(frame["requestType"], "exec");
    }

    #[test]
    fn inbound_payloads_accept_camel_case() {
        let req: WatchUpdateRequest = serde_json::from_value(json!({
            "bookmarkId": "b1",
            "scope": "project",
            "projectSlug": "web",
            "watch": {"enabled": true, "interval": 2}
        }))
        .unwrap();
        assert_eq!(req.bookmark_id, "b1");
        assert_eq!(req.scope, BookmarkScope::Project);
        assert_eq!(req.watch.interval, Some(2.0));

        let req: KillRequest =
            serde_json::from_value(json!({"processId": "p1", "signal": "SIGKILL"})).unwrap();
        assert_eq!(req.signal.as_deref(), Some("SIGKILL"));
    }
}
