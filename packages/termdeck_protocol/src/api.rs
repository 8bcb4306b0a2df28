//! HTTP control-plane request and response bodies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SessionId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameSessionRequest {
    pub display_name: String,
}

/// A session as seen by its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub display_name: String,
    pub working_dir: String,
    pub created_at: DateTime<Utc>,
}

/// JSON body of every error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_display_name_optional() {
        let req: CreateSessionRequest = serde_json::from_str(r#"{"working_dir":"/tmp"}"#).unwrap();
        assert_eq!(req.working_dir, "/tmp");
        assert!(req.display_name.is_none());
    }

    #[test]
    fn summary_roundtrips_timestamp() {
        let summary = SessionSummary {
            session_id: "id".into(),
            display_name: "Terminal 1".into(),
            working_dir: "/tmp".into(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&summary).unwrap();
        let back: SessionSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(back, summary);
    }
}
