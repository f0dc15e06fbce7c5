//! Wire types of the daemon's HTTP control plane
//!
//! Every endpoint answers JSON; the `message` field is always present.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::ContentId;

pub const STOP_PATH: &str = "/stop";
pub const ADD_PATH: &str = "/add";
pub const DEL_PATH: &str = "/del";
pub const PLAY_PATH: &str = "/play";
pub const DOWNLOAD_PATH: &str = "/download";
pub const STREAM_PATH: &str = "/stream";
pub const LIST_PATH: &str = "/list";

/// Stream URL of `id` on the daemon at `base_url`
pub fn stream_url(base_url: &str, id: &ContentId) -> String {
    format!("{}{}?f={}", base_url.trim_end_matches('/'), STREAM_PATH, id)
}

/// Generic response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Health check body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub message: String,
    pub pid: u32,
}

/// Result of `/add`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddResponse {
    pub message: String,
    #[serde(default)]
    pub ids: Vec<ContentId>,
}

/// One registered file in `/list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySummary {
    pub id: ContentId,
    pub name: String,
    pub added_at: DateTime<Utc>,
    pub length: u64,
    pub url: String,
}

/// Result of `/list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResponse {
    pub message: String,
    pub entries: Vec<EntrySummary>,
}

/// Query of `/add`
#[derive(Debug, Default, Deserialize)]
pub struct AddParams {
    pub uri: Option<String>,
}

/// Query of `/stop`
#[derive(Debug, Default, Deserialize)]
pub struct StopParams {
    pub restart: Option<String>,
}

impl StopParams {
    pub fn restart_requested(&self) -> bool {
        self.restart.as_deref() == Some("true")
    }
}

/// Query of the id based endpoints; `/del` also accepts `id`
#[derive(Debug, Default, Deserialize)]
pub struct FileParams {
    pub f: Option<String>,
    pub id: Option<String>,
}

impl FileParams {
    pub fn content_id(&self) -> Option<ContentId> {
        self.f
            .as_deref()
            .or(self.id.as_deref())
            .map(ContentId::from_param)
            .filter(|id| !id.as_str().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_url() {
        let id = ContentId::from_param("abc");
        assert_eq!(
            stream_url("http://localhost:8000/", &id),
            "http://localhost:8000/stream?f=abc"
        );
    }

    #[test]
    fn test_add_response_serialization() {
        let resp = AddResponse {
            message: "Torrent added".to_string(),
            ids: vec![ContentId::from_param("abc")],
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"message":"Torrent added","ids":["abc"]}"#);
    }

    #[test]
    fn test_add_response_without_ids() {
        let resp: AddResponse = serde_json::from_str(r#"{"message":"No valid files"}"#).unwrap();
        assert!(resp.ids.is_empty());
    }

    #[test]
    fn test_stop_params() {
        let params = StopParams {
            restart: Some("true".to_string()),
        };
        assert!(params.restart_requested());
        assert!(!StopParams::default().restart_requested());
        assert!(!StopParams {
            restart: Some("".to_string())
        }
        .restart_requested());
    }

    #[test]
    fn test_file_params_prefers_f() {
        let params = FileParams {
            f: Some("one".to_string()),
            id: Some("two".to_string()),
        };
        assert_eq!(params.content_id().unwrap().as_str(), "one");

        let params = FileParams {
            f: None,
            id: Some("two\n".to_string()),
        };
        assert_eq!(params.content_id().unwrap().as_str(), "two");

        let params = FileParams {
            f: Some("  ".to_string()),
            id: None,
        };
        assert!(params.content_id().is_none());
    }
}
