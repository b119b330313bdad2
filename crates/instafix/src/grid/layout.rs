//! Row partitioning for grid collages.
//!
//! Images keep their order and are packed into rows of one to three. Each
//! row is scaled so it spans the full canvas width, which fixes its height.
//! The partition minimizes the summed squared distance of row heights from a
//! target, found as a shortest path over break positions: node `i` means
//! "a row starts at image `i`", node `n` is the end, and an edge `i -> j`
//! is the row `i..j`.

use std::ops::Range;

use petgraph::algo::astar;
use petgraph::graph::{DiGraph, NodeIndex};

use super::GridError;

/// Row height the partition aims for, in pixels.
pub const TARGET_ROW_HEIGHT: f64 = 1000.0;

/// Most images a single row may hold.
pub const MAX_ROW_IMAGES: usize = 3;

/// Canvas width as a multiple of the mean source width.
pub const CANVAS_WIDTH_FACTOR: f64 = 1.5;

/// Where one source image lands on the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub index: usize,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridLayout {
    pub canvas_width: u32,
    pub canvas_height: u32,
    /// Image index ranges, one per row, top to bottom.
    pub rows: Vec<Range<usize>>,
    pub placements: Vec<Placement>,
}

/// Plan a collage for images of the given `(width, height)` sizes.
pub fn plan(sizes: &[(u32, u32)]) -> Result<GridLayout, GridError> {
    if sizes.len() < 2 {
        return Err(GridError::NotEnoughImages(sizes.len()));
    }
    if let Some(i) = sizes.iter().position(|&(w, h)| w == 0 || h == 0) {
        return Err(GridError::Image(format!("image {i} has a zero dimension")));
    }

    let mean_width = sizes.iter().map(|&(w, _)| w as f64).sum::<f64>() / sizes.len() as f64;
    let canvas_width = (CANVAS_WIDTH_FACTOR * mean_width).round().max(1.0);
    let aspects: Vec<f64> = sizes.iter().map(|&(w, h)| w as f64 / h as f64).collect();

    let breaks = row_breaks(&aspects, canvas_width)?;
    let rows: Vec<Range<usize>> = breaks.windows(2).map(|w| w[0]..w[1]).collect();

    let canvas_px = canvas_width as u32;
    let mut placements = Vec::with_capacity(sizes.len());
    let mut y = 0u32;
    for row in &rows {
        let height = row_height(&aspects[row.clone()], canvas_width);
        let height_px = (height.round() as u32).max(1);
        let mut x = 0u32;
        for index in row.clone() {
            let width_px = if index + 1 == row.end {
                // Last image absorbs rounding so the row spans the canvas.
                canvas_px.saturating_sub(x).max(1)
            } else {
                ((height * aspects[index]).round() as u32).max(1)
            };
            placements.push(Placement {
                index,
                x,
                y,
                width: width_px,
                height: height_px,
            });
            x = x.saturating_add(width_px);
        }
        y = y.saturating_add(height_px);
    }

    Ok(GridLayout {
        canvas_width: canvas_px,
        canvas_height: y,
        rows,
        placements,
    })
}

fn row_height(aspects: &[f64], canvas_width: f64) -> f64 {
    canvas_width / aspects.iter().sum::<f64>()
}

/// Row break positions, starting at 0 and ending at `aspects.len()`.
pub fn row_breaks(aspects: &[f64], canvas_width: f64) -> Result<Vec<usize>, GridError> {
    let n = aspects.len();
    let mut graph: DiGraph<usize, f64> = DiGraph::with_capacity(n + 1, n * MAX_ROW_IMAGES);
    let nodes: Vec<NodeIndex> = (0..=n).map(|i| graph.add_node(i)).collect();

    for i in 0..n {
        for j in (i + 1)..=(i + MAX_ROW_IMAGES).min(n) {
            let height = row_height(&aspects[i..j], canvas_width);
            let cost = (TARGET_ROW_HEIGHT - height).powi(2);
            graph.add_edge(nodes[i], nodes[j], cost);
        }
    }

    let goal = nodes[n];
    let (_, path) = astar(&graph, nodes[0], |node| node == goal, |e| *e.weight(), |_| 0.0)
        .ok_or_else(|| GridError::Internal("no row partition found".to_string()))?;
    let breaks: Vec<usize> = path.into_iter().map(|node| graph[node]).collect();

    let well_formed = breaks.first() == Some(&0)
        && breaks.last() == Some(&n)
        && breaks
            .windows(2)
            .all(|w| w[0] < w[1] && w[1] - w[0] <= MAX_ROW_IMAGES && w[1] <= n);
    if !well_formed {
        return Err(GridError::Internal(format!(
            "row partition {breaks:?} is out of bounds for {n} images"
        )));
    }
    Ok(breaks)
}
