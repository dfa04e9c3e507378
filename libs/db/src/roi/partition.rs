//! ROI partitioning: tile the ROI with cubical subvolumes.
//!
//! Two passes over the spans, both in storage order:
//!
//! 1. **Layer pass** - stream spans ascending and group them into layers of
//!    `batchsize` block-Z each (the first `extent % batchsize` layers are one
//!    block taller so the Z extent is covered exactly). A layer is flushed
//!    as soon as a span beyond its Z range arrives.
//! 2. **Tiling pass** - within a flushed layer, split the layer's Y extent
//!    into rows and each row's X extent into columns with the same
//!    distribution rule, then count active blocks per column. Columns with
//!    fewer than `batchsize^3 / 10` active blocks merge into the previous
//!    subvolume of the same row; merges never cross row or layer boundaries.

use serde::{Deserialize, Serialize};

use crate::context::DataContext;
use crate::error::Result;
use crate::kv::Store;
use crate::Point3d;

use super::{Data, RleIndex};

/// The partition result served by `GET /partition`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subvolumes {
    #[serde(rename = "NumTotalBlocks")]
    pub num_total_blocks: i32,
    #[serde(rename = "NumActiveBlocks")]
    pub num_active_blocks: i32,
    #[serde(rename = "NumSubvolumes")]
    pub num_subvolumes: i32,
    #[serde(rename = "Subvolumes")]
    pub subvolumes: Vec<Subvolume>,
}

/// One tile of the partition, corners in voxel coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subvolume {
    #[serde(rename = "MinCorner")]
    pub min_corner: Point3d,
    #[serde(rename = "MaxCorner")]
    pub max_corner: Point3d,
    #[serde(rename = "TotalBlocks")]
    pub total_blocks: i32,
    #[serde(rename = "ActiveBlocks")]
    pub active_blocks: i32,
}

/// One batch of Z with its active spans, accumulated during the stream.
struct Layer {
    begin_z: i32,
    end_z: i32,
    spans: Vec<RleIndex>,
}

impl Layer {
    fn new((begin_z, end_z): (i32, i32)) -> Self {
        Self {
            begin_z,
            end_z,
            spans: Vec::new(),
        }
    }
}

pub(super) fn partition(
    data: &Data,
    store: &Store,
    ctx: &DataContext,
    batchsize: i32,
) -> Result<Subvolumes> {
    let props = &data.properties;
    let mut result = Subvolumes::default();

    // Extents at their initial sentinels means nothing was ever posted.
    if props.min_z > props.max_z {
        return Ok(result);
    }

    let z_ranges = ranges(props.min_z, props.max_z, batchsize);
    let mut zi = 0usize;
    let mut layer = Layer::new(z_ranges[0]);
    let mut overflow = false;

    store.process_range(
        ctx,
        &RleIndex::min_index(),
        &RleIndex::max_index(),
        &mut |key, _| {
            if overflow {
                return Ok(());
            }
            let index = RleIndex::from_index_bytes(ctx.index_from_key(key)?)?;
            while index.z > layer.end_z {
                add_subvolumes(data, &layer, &mut result, batchsize);
                zi += 1;
                if zi == z_ranges.len() {
                    // Spans never exceed the recorded MaxZ; extents only grow.
                    tracing::warn!(
                        z = index.z,
                        max_z = props.max_z,
                        "span beyond recorded Z extent, ignoring remainder"
                    );
                    overflow = true;
                    layer.spans.clear();
                    return Ok(());
                }
                layer = Layer::new(z_ranges[zi]);
            }
            layer.spans.push(index);
            Ok(())
        },
    )?;

    if !layer.spans.is_empty() {
        add_subvolumes(data, &layer, &mut result, batchsize);
    }
    result.num_subvolumes = result.subvolumes.len() as i32;
    Ok(result)
}

/// Tile one layer and append its subvolumes.
fn add_subvolumes(data: &Data, layer: &Layer, out: &mut Subvolumes, batchsize: i32) {
    let Some((min_y, max_y)) = y_extent(&layer.spans) else {
        return;
    };
    let merge_threshold = batchsize * batchsize * batchsize / 10;
    let dz = layer.end_z - layer.begin_z + 1;

    for (yb, ye) in ranges(min_y, max_y, batchsize) {
        let row: Vec<&RleIndex> = layer
            .spans
            .iter()
            .filter(|s| s.y >= yb && s.y <= ye)
            .collect();
        let Some((min_x, max_x)) = x_extent(&row) else {
            continue;
        };

        // Merge target within this row's column stream only.
        let mut prev: Option<usize> = None;
        for (xb, xe) in ranges(min_x, max_x, batchsize) {
            let active = active_blocks(&row, xb, xe);
            let total = (xe - xb + 1) * (ye - yb + 1) * dz;
            let min_corner = block_min_voxel(Point3d::new(xb, yb, layer.begin_z), data.block_size());
            let max_corner = block_max_voxel(Point3d::new(xe, ye, layer.end_z), data.block_size());

            match prev {
                Some(at) if active < merge_threshold => {
                    let sub = &mut out.subvolumes[at];
                    sub.max_corner = max_corner;
                    sub.total_blocks += total;
                    sub.active_blocks += active;
                }
                _ => {
                    out.subvolumes.push(Subvolume {
                        min_corner,
                        max_corner,
                        total_blocks: total,
                        active_blocks: active,
                    });
                    prev = Some(out.subvolumes.len() - 1);
                }
            }
            out.num_active_blocks += active;
            out.num_total_blocks += total;
        }
    }
}

/// Split `[lo, hi]` into consecutive ranges of `size`, giving the first
/// `extent % size` ranges one extra so the extent is covered exactly.
fn ranges(lo: i32, hi: i32, size: i32) -> Vec<(i32, i32)> {
    let extent = (hi as i64) - (lo as i64) + 1;
    let mut extra = extent % (size as i64);
    let mut out = Vec::new();
    let mut begin = lo as i64;
    while begin <= hi as i64 {
        let mut end = begin + size as i64 - 1;
        if extra > 0 {
            end += 1;
            extra -= 1;
        }
        let end = end.min(hi as i64);
        out.push((begin as i32, end as i32));
        begin = end + 1;
    }
    out
}

fn y_extent(spans: &[RleIndex]) -> Option<(i32, i32)> {
    let min = spans.iter().map(|s| s.y).min()?;
    let max = spans.iter().map(|s| s.y).max()?;
    Some((min, max))
}

fn x_extent(row: &[&RleIndex]) -> Option<(i32, i32)> {
    let min = row.iter().map(|s| s.x0).min()?;
    let max = row.iter().map(|s| s.x1()).max()?;
    Some((min, max))
}

/// Active blocks of `row` spans clipped to the column `[xb, xe]`.
fn active_blocks(row: &[&RleIndex], xb: i32, xe: i32) -> i32 {
    let mut active = 0;
    for span in row {
        let begin = span.x0.max(xb);
        let end = span.x1().min(xe);
        if begin <= end {
            active += end - begin + 1;
        }
    }
    active
}

fn block_min_voxel(block: Point3d, block_size: Point3d) -> Point3d {
    Point3d([
        block.0[0] * block_size.0[0],
        block.0[1] * block_size.0[1],
        block.0[2] * block_size.0[2],
    ])
}

fn block_max_voxel(block: Point3d, block_size: Point3d) -> Point3d {
    Point3d([
        (block.0[0] + 1) * block_size.0[0] - 1,
        (block.0[1] + 1) * block_size.0[1] - 1,
        (block.0[2] + 1) * block_size.0[2] - 1,
    ])
}
