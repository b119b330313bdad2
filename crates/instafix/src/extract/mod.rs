//! Extraction pipeline: turn an embed document into a [`PostRecord`].
//!
//! Strategies run in a fixed order and the first one producing a resolved
//! record wins:
//!
//! 1. [`EmbeddedScript`]: JSON payload serialized into an inline script.
//! 2. [`RenderedDom`]: the visible embed markup.
//! 3. [`DirectQuery`]: the GraphQL endpoint, only reached when the
//!    document alone was not enough.
//!
//! A strategy can also return a degraded record (the DOM path when the
//! media is blocked). The chain keeps going, and the degraded record is
//! used only if nothing later resolves.

pub mod dom;
pub mod gql;
pub mod query;
pub mod script;

use async_trait::async_trait;
use tracing::{debug, info};

pub use dom::RenderedDom;
pub use query::DirectQuery;
pub use script::EmbeddedScript;

use crate::origin::Origin;
use crate::types::{FetchError, FetchResult, PostRecord};

/// Why a strategy produced nothing usable.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("marker {0:?} not found in document")]
    MarkerMissing(&'static str),

    #[error("no string literal carries the payload")]
    NoPayload,

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("structured query blocked")]
    Blocked,

    #[error("post not found")]
    NotFound,

    #[error("transport error: {0}")]
    Transport(String),
}

/// A strategy's result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Resolved(PostRecord),
    /// Usable as a last resort; the reason is logged.
    Degraded(PostRecord, &'static str),
}

/// Inputs shared by every strategy in one extraction run.
pub struct ExtractionContext<'a> {
    pub post_id: &'a str,
    pub document: &'a str,
    pub origin: &'a dyn Origin,
}

#[async_trait]
pub trait ExtractionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn attempt(&self, ctx: &ExtractionContext<'_>) -> Result<Extraction, ExtractError>;
}

/// Ordered chain of extraction strategies.
pub struct Extractor {
    strategies: Vec<Box<dyn ExtractionStrategy>>,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor {
    /// The standard chain: embedded script, rendered DOM, direct query.
    pub fn new() -> Self {
        Self::with_strategies(vec![
            Box::new(EmbeddedScript),
            Box::new(RenderedDom),
            Box::new(DirectQuery),
        ])
    }

    pub fn with_strategies(strategies: Vec<Box<dyn ExtractionStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Run the chain over an already fetched document.
    ///
    /// Fails with `NotFound` when no strategy resolves the post, or with
    /// `Transport` when the only remaining hope was a network call that failed.
    pub async fn extract(
        &self,
        post_id: &str,
        document: &str,
        origin: &dyn Origin,
    ) -> FetchResult<PostRecord> {
        let ctx = ExtractionContext {
            post_id,
            document,
            origin,
        };
        let mut degraded: Option<PostRecord> = None;
        let mut transport_error: Option<String> = None;

        for strategy in &self.strategies {
            match strategy.attempt(&ctx).await {
                Ok(Extraction::Resolved(record)) if record.is_resolved() => {
                    info!(post_id, strategy = strategy.name(), media = record.media.len(), "post extracted");
                    return Ok(record);
                }
                Ok(Extraction::Resolved(record)) => {
                    debug!(
                        post_id,
                        strategy = strategy.name(),
                        has_username = !record.username.is_empty(),
                        media = record.media.len(),
                        "incomplete record, trying next strategy"
                    );
                }
                Ok(Extraction::Degraded(record, reason)) => {
                    debug!(post_id, strategy = strategy.name(), reason, "degraded record");
                    if degraded.is_none() && record.is_resolved() {
                        degraded = Some(record);
                    }
                }
                Err(ExtractError::Transport(e)) => {
                    debug!(post_id, strategy = strategy.name(), error = %e, "strategy transport failure");
                    transport_error = Some(e);
                }
                Err(e) => {
                    debug!(post_id, strategy = strategy.name(), error = %e, "strategy failed");
                }
            }
        }

        if let Some(record) = degraded {
            info!(post_id, "using degraded record");
            return Ok(record);
        }
        match transport_error {
            Some(e) => Err(FetchError::Transport(e)),
            None => Err(FetchError::NotFound(post_id.to_string())),
        }
    }
}
