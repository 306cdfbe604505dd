//! Hosted media service seam
//!
//! When a token issuer is configured and grants a token, media goes through
//! the hosted service instead of the peer mesh. Any failure falls back to the
//! mesh.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::identity::Uid;
use crate::types::MeetingId;

/// Media service errors
#[derive(Debug, thiserror::Error)]
pub enum MediaServiceError {
    /// Required request field missing
    #[error("Missing \"{0}\"")]
    MissingField(&'static str),

    /// Issuer lacks credentials or a server URL
    #[error("Media service misconfigured: {0}")]
    Misconfigured(String),

    /// Issuer could not be reached or refused
    #[error("Media service unavailable: {0}")]
    Unavailable(String),
}

/// Token request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaTokenRequest {
    /// Room name
    pub meeting_id: MeetingId,
    /// Name shown to others
    pub display_name: String,
    /// Identity in the hosted room; defaults to the display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<Uid>,
}

impl MediaTokenRequest {
    /// Check required fields
    pub fn validate(&self) -> Result<(), MediaServiceError> {
        if self.meeting_id.as_str().is_empty() {
            return Err(MediaServiceError::MissingField("meetingId"));
        }
        if self.display_name.trim().is_empty() {
            return Err(MediaServiceError::MissingField("displayName"));
        }
        Ok(())
    }

    /// Identity the grant is issued for
    pub fn identity(&self) -> &str {
        self.participant_id
            .as_ref()
            .map(Uid::as_str)
            .unwrap_or(&self.display_name)
    }
}

/// Granted access to a hosted session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaTokenGrant {
    /// Access token
    pub token: String,
    /// Server to connect to
    pub server_url: String,
}

/// Issues access tokens for the hosted media service
#[async_trait]
pub trait MediaTokenIssuer: Send + Sync {
    /// Issue a token for `request`
    async fn issue(&self, request: &MediaTokenRequest) -> Result<MediaTokenGrant, MediaServiceError>;
}

/// Issuer with a fixed server and opaque random tokens, for local setups
#[derive(Debug, Clone, Default)]
pub struct LocalTokenIssuer {
    server_url: Option<String>,
}

impl LocalTokenIssuer {
    /// Issuer for `server_url`; `None` behaves as misconfigured
    pub fn new(server_url: Option<String>) -> Self {
        Self { server_url }
    }
}

#[async_trait]
impl MediaTokenIssuer for LocalTokenIssuer {
    async fn issue(&self, request: &MediaTokenRequest) -> Result<MediaTokenGrant, MediaServiceError> {
        request.validate()?;
        let server_url = self
            .server_url
            .clone()
            .ok_or_else(|| MediaServiceError::Misconfigured("no server url".to_string()))?;
        Ok(MediaTokenGrant {
            token: format!("{}.{}", request.identity(), uuid::Uuid::new_v4().simple()),
            server_url,
        })
    }
}

/// Media transport chosen for a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaTransport {
    /// Hosted media service
    Hosted(MediaTokenGrant),
    /// Full mesh of peer connections
    Mesh,
}

impl MediaTransport {
    /// Whether the peer mesh carries media
    pub fn is_mesh(&self) -> bool {
        matches!(self, MediaTransport::Mesh)
    }
}

/// Ask `issuer` for a hosted session, falling back to the mesh
#[tracing::instrument(skip(issuer, request), fields(meeting_id = %request.meeting_id))]
pub async fn select_transport(
    issuer: Option<&dyn MediaTokenIssuer>,
    request: &MediaTokenRequest,
) -> MediaTransport {
    let Some(issuer) = issuer else {
        return MediaTransport::Mesh;
    };
    match issuer.issue(request).await {
        Ok(grant) => {
            tracing::info!(server_url = %grant.server_url, "Using hosted media service");
            MediaTransport::Hosted(grant)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Hosted media unavailable, using peer mesh");
            MediaTransport::Mesh
        }
    }
}
