//! DOM strategy: read the rendered embed markup.
//!
//! The markup carries one media element, the author and the caption. We
//! rebuild the GraphQL-shaped document from them so the shared parser does
//! the rest.

use async_trait::async_trait;
use scraper::{ElementRef, Html, Node, Selector};
use serde_json::{json, Value};

use super::{gql, ExtractError, Extraction, ExtractionContext, ExtractionStrategy};

/// Present when the origin refuses to show media in the embed.
pub const BLOCKED_MARKER: &str = "WatchOnInstagram";

/// Caption children that are not part of the caption text.
const CAPTION_NOISE: &[&str] = &["CaptionComments", "CaptionUsername"];

pub struct RenderedDom;

#[async_trait]
impl ExtractionStrategy for RenderedDom {
    fn name(&self) -> &'static str {
        "rendered_dom"
    }

    async fn attempt(&self, ctx: &ExtractionContext<'_>) -> Result<Extraction, ExtractError> {
        let synthesized = synthesize(ctx.document)?;
        let record = gql::parse_post(&synthesized, ctx.post_id)?;
        if ctx.document.contains(BLOCKED_MARKER) {
            return Ok(Extraction::Degraded(record, "embed media blocked"));
        }
        Ok(Extraction::Resolved(record))
    }
}

fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Malformed(format!("selector {css}: {e}")))
}

/// Build a `{"shortcode_media": ...}` document from the embed markup.
///
/// Kept synchronous: `Html` is not `Send` and must not live across an await.
pub fn synthesize(document: &str) -> Result<Value, ExtractError> {
    let html = Html::parse_document(document);

    let image = selector(".EmbeddedMediaImage")?;
    let video = selector(".EmbeddedMediaVideo")?;
    let (type_name, media) = match html.select(&image).next() {
        Some(el) => ("GraphImage", Some(el)),
        None => ("GraphVideo", html.select(&video).next()),
    };
    let media_url = media
        .and_then(|el| el.value().attr("src"))
        .ok_or(ExtractError::NotFound)?;

    let username_sel = selector(".UsernameText")?;
    let username: String = html
        .select(&username_sel)
        .flat_map(|el| el.text())
        .collect();

    let caption_sel = selector(".Caption")?;
    let mut caption = String::new();
    for el in html.select(&caption_sel) {
        caption_text(el, &mut caption);
    }

    Ok(json!({
        "shortcode_media": {
            "owner": {"username": username.trim()},
            "node": {"__typename": type_name, "display_url": media_url},
            "edge_media_to_caption": {"edges": [{"node": {"text": caption}}]}
        }
    }))
}

/// Text content with `<br>` kept as newlines and noise children skipped.
fn caption_text(el: ElementRef<'_>, out: &mut String) {
    for child in el.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(e) if e.name() == "br" => out.push('\n'),
            Node::Element(e) if e.classes().any(|c| CAPTION_NOISE.contains(&c)) => {}
            Node::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    caption_text(child_el, out);
                }
            }
            _ => {}
        }
    }
}
