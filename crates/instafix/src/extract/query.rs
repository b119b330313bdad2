//! Direct-query strategy: ask the GraphQL endpoint for the post.

use async_trait::async_trait;
use serde_json::Value;

use super::{gql, ExtractError, Extraction, ExtractionContext, ExtractionStrategy};
use crate::types::PostRecord;

/// Appears in the response body when the endpoint wants a session.
const LOGIN_WALL_MARKER: &str = "require_login";

pub struct DirectQuery;

#[async_trait]
impl ExtractionStrategy for DirectQuery {
    fn name(&self) -> &'static str {
        "direct_query"
    }

    async fn attempt(&self, ctx: &ExtractionContext<'_>) -> Result<Extraction, ExtractError> {
        let body = ctx
            .origin
            .query_post(ctx.post_id)
            .await
            .map_err(|e| ExtractError::Transport(e.to_string()))?;
        parse_response(&body, ctx.post_id).map(Extraction::Resolved)
    }
}

pub fn parse_response(body: &str, post_id: &str) -> Result<PostRecord, ExtractError> {
    if body.contains(LOGIN_WALL_MARKER) {
        return Err(ExtractError::NotFound);
    }
    let value: Value = serde_json::from_str(body)
        .map_err(|e| ExtractError::Malformed(format!("query response: {e}")))?;

    match value.get("data").filter(|d| !d.is_null()) {
        Some(data) => gql::parse_post(data, post_id),
        // No data at all; the top-level status tells a block from a miss.
        None => gql::parse_post(&value, post_id),
    }
}
