//! Grid collages for multi-image posts.

pub mod cache;
pub mod compose;
pub mod compositor;
pub mod layout;

pub use cache::GridCache;
pub use compose::{compose, encode_jpeg, GRID_JPEG_QUALITY};
pub use compositor::{GridCompositor, GridConfig};
pub use layout::{plan, GridLayout, Placement};

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GridError {
    #[error("a grid needs at least two images, got {0}")]
    NotEnoughImages(usize),

    #[error("invalid post id: {0}")]
    InvalidPostId(String),

    #[error("image download failed: {0}")]
    Download(String),

    #[error("image error: {0}")]
    Image(String),

    #[error("grid cache I/O error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<image::ImageError> for GridError {
    fn from(e: image::ImageError) -> Self {
        GridError::Image(e.to_string())
    }
}

impl From<std::io::Error> for GridError {
    fn from(e: std::io::Error) -> Self {
        GridError::Io(e.to_string())
    }
}

impl From<tokio::task::JoinError> for GridError {
    fn from(e: tokio::task::JoinError) -> Self {
        GridError::Internal(format!("grid task failed: {e}"))
    }
}
