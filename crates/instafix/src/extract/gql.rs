//! Reader for the origin's GraphQL post shape.
//!
//! All three strategies end here: the embedded script and the direct query
//! deliver this shape natively, and the DOM strategy synthesizes it.

use serde_json::Value;

use super::ExtractError;
use crate::types::{MediaItem, PostRecord};

/// Build a record from a container holding `shortcode_media` or
/// `xdt_shortcode_media`.
pub fn parse_post(container: &Value, post_id: &str) -> Result<PostRecord, ExtractError> {
    let item = present(container, "shortcode_media")
        .or_else(|| present(container, "xdt_shortcode_media"));
    let Some(item) = item else {
        return Err(match container.get("status").and_then(Value::as_str) {
            Some("fail") => ExtractError::Blocked,
            _ => ExtractError::NotFound,
        });
    };

    let nodes: Vec<&Value> = match item.get("edge_sidecar_to_children") {
        Some(sidecar) if !sidecar.is_null() => sidecar
            .get("edges")
            .and_then(Value::as_array)
            .map(|edges| edges.iter().collect())
            .unwrap_or_default(),
        _ => vec![item],
    };

    let media: Vec<MediaItem> = nodes.into_iter().filter_map(media_item).collect();
    if media.is_empty() {
        return Err(ExtractError::NotFound);
    }

    let username = item
        .pointer("/owner/username")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let caption = item
        .pointer("/edge_media_to_caption/edges/0/node/text")
        .and_then(Value::as_str)
        .unwrap_or_default();

    Ok(PostRecord {
        post_id: post_id.to_string(),
        username: username.to_string(),
        caption: caption.trim().to_string(),
        media,
    })
}

fn present<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value.get(key).filter(|v| !v.is_null())
}

/// Sidecar edges wrap each entry in `node`; single media items may too.
fn media_item(entry: &Value) -> Option<MediaItem> {
    let node = present(entry, "node").unwrap_or(entry);
    let url = node
        .get("video_url")
        .and_then(Value::as_str)
        .or_else(|| node.get("display_url").and_then(Value::as_str))
        .filter(|url| !url.is_empty())?;
    let type_name = node
        .get("__typename")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Some(MediaItem::new(type_name, url))
}
