//! Core data types for post records and fetch outcomes.

use serde::{Deserialize, Serialize};

/// Leading characters the origin uses for post shortcodes.
pub const POST_ID_PREFIXES: &[u8] = b"CDB";

/// Upper bound on accepted post id length.
pub const MAX_POST_ID_LEN: usize = 64;

/// One image or video attached to a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    /// Platform type tag, recorded verbatim (`GraphImage`, `GraphVideo`, ...).
    pub type_name: String,
    pub url: String,
}

impl MediaItem {
    pub fn new(type_name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            url: url.into(),
        }
    }

    pub fn is_image(&self) -> bool {
        self.type_name.contains("Image")
    }

    pub fn is_video(&self) -> bool {
        self.type_name.contains("Video")
    }
}

/// Normalized result of extracting one post.
///
/// Media order is display order. A record only counts as resolved when it
/// carries both a username and at least one media item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRecord {
    pub post_id: String,
    pub username: String,
    pub caption: String,
    pub media: Vec<MediaItem>,
}

impl PostRecord {
    /// Create an empty record for the given post.
    pub fn new(post_id: impl Into<String>) -> Self {
        Self {
            post_id: post_id.into(),
            ..Self::default()
        }
    }

    pub fn is_resolved(&self) -> bool {
        !self.username.is_empty() && !self.media.is_empty()
    }

    /// Image media in display order.
    pub fn images(&self) -> impl Iterator<Item = &MediaItem> {
        self.media.iter().filter(|m| m.is_image())
    }

    /// Point every media URL at the given host, keeping path and query.
    pub fn rewrite_media_host(&mut self, host: &str) -> FetchResult<()> {
        for media in &mut self.media {
            let mut parsed = url::Url::parse(&media.url).map_err(|e| {
                FetchError::Parse(format!("media url {:?} for {}: {e}", media.url, self.post_id))
            })?;
            parsed
                .set_host(Some(host))
                .map_err(|e| FetchError::Parse(format!("media host {host:?}: {e}")))?;
            media.url = parsed.into();
        }
        Ok(())
    }
}

/// Check a post id against the origin's shortcode shape.
///
/// The id ends up inside origin URLs and file names, so anything outside
/// `[A-Za-z0-9_-]` is rejected along with unknown prefixes.
pub fn validate_post_id(post_id: &str) -> FetchResult<()> {
    let bytes = post_id.as_bytes();
    let Some(first) = bytes.first() else {
        return Err(FetchError::InvalidPostId("empty post id".to_string()));
    };
    if !POST_ID_PREFIXES.contains(first) {
        return Err(FetchError::InvalidPostId(format!(
            "{post_id:?} does not start with one of C, D, B"
        )));
    }
    if bytes.len() > MAX_POST_ID_LEN {
        return Err(FetchError::InvalidPostId(format!(
            "post id is {} bytes, max {MAX_POST_ID_LEN}",
            bytes.len()
        )));
    }
    if !bytes
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || *b == b'_' || *b == b'-')
    {
        return Err(FetchError::InvalidPostId(format!(
            "{post_id:?} contains unsupported characters"
        )));
    }
    Ok(())
}

/// Coarse classification of a [`FetchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    InvalidPostId,
    NotFound,
    Transport,
    Parse,
    RemoteUnavailable,
    CacheWrite,
    Internal,
}

/// Errors surfaced by the fetch path.
///
/// Cloneable so every caller waiting on a coalesced fetch gets the same value.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Invalid post id: {0}")]
    InvalidPostId(String),

    #[error("Post not found: {0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Cache write failed: {0}")]
    CacheWrite(String),

    #[error("Internal invariant violated: {0}")]
    Internal(String),
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::InvalidPostId(_) => FetchErrorKind::InvalidPostId,
            FetchError::NotFound(_) => FetchErrorKind::NotFound,
            FetchError::Transport(_) => FetchErrorKind::Transport,
            FetchError::Parse(_) => FetchErrorKind::Parse,
            FetchError::RemoteUnavailable(_) => FetchErrorKind::RemoteUnavailable,
            FetchError::CacheWrite(_) => FetchErrorKind::CacheWrite,
            FetchError::Internal(_) => FetchErrorKind::Internal,
        }
    }
}

impl From<tokio::task::JoinError> for FetchError {
    fn from(e: tokio::task::JoinError) -> Self {
        FetchError::Internal(format!("fetch task failed: {e}"))
    }
}

/// Convenience result type.
pub type FetchResult<T> = Result<T, FetchError>;
