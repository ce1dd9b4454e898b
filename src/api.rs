use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
pub struct CreateLinkPayload {
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRecord {
    pub slug: String,
    pub original_url: String,
    pub short_url: String,
    pub track_count: i64,
    /// Timestamp in RFC 3339 format
    pub created_at: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedLink {
    pub message: String,
    pub data: LinkRecord,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Error {
    pub error: String,
    pub error_id: String,
}
