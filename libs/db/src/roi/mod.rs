//! The `roi` data type: a 3-D region of interest stored as run-length
//! encoded block spans.
//!
//! Membership is tracked per block (a `BlockSize`-aligned tile of voxels).
//! Each stored key encodes one span of contiguous blocks at fixed `(z, y)`:
//!
//! ```text
//! Z (4B) | Y (4B) | X0 (4B) | span length (4B)     all big-endian
//! ```
//!
//! Signed coordinates are written offset-binary (sign bit flipped) so keys
//! sort bytewise in `(z, y, x0)` order, which every read path relies on:
//! `GET /roi` streams spans back in storage order, point queries walk spans
//! and sorted queries in one pass, and the partitioner flushes layers at Z
//! boundaries. Values are empty.

use serde::{Deserialize, Serialize};

use crate::context::DataContext;
use crate::error::{Error, Result};
use crate::kv::Store;
use crate::registry::{
    BaseData, DataInstance, DataRequest, DataResponse, NewDataArgs, TypeInfo, TypeService,
};
use crate::repo::RepoManager;
use crate::Point3d;

mod partition;
pub use partition::{Subvolume, Subvolumes};

#[cfg(test)]
mod tests;

pub const TYPE_NAME: &str = "roi";
pub const TYPE_URL: &str = "voxd/datatype/roi";
pub const TYPE_VERSION: &str = "0.1";

/// Default per-axis block size when the instance config has none.
pub const DEFAULT_BLOCK_SIZE: i32 = 32;

/// Bulk loads commit in groups of this many rows.
const WRITE_BATCH_SIZE: usize = 10_000;

pub const HELP: &str = r#"API for 'roi' data type
=======================

GET  <api URL>/node/<UUID>/<data name>/help

    This help message.

GET  <api URL>/node/<UUID>/<data name>/info

    Returns JSON with instance properties, including BlockSize and the
    Z extents seen so far.

GET  <api URL>/node/<UUID>/<data name>/roi
POST <api URL>/node/<UUID>/<data name>/roi

    Gets or replaces the ROI. The payload is a JSON list of 4-tuples

        [[0, 0, 0, 1], [0, 2, 3, 5], [1, 2, 3, 4]]

    where each tuple is [z, y, x0, x1] in block coordinates: the blocks
    (x0, y, z) through (x1, y, z) are inside the ROI. A POST replaces the
    entire ROI; tuples are canonicalized (sorted, touching runs merged)
    before storage, and a GET returns them in (z, y, x0) order.

POST <api URL>/node/<UUID>/<data name>/ptquery

    Determines whether voxel points lie inside the ROI. The payload is a
    JSON list of [x, y, z] voxel points; the response is a JSON list of
    booleans aligned with the posted points.

        Sent:     [[0, 100, 910], [0, 121, 900]]
        Returned: [false, true]

GET <api URL>/node/<UUID>/<data name>/partition?batchsize=8

    Returns JSON subvolumes that tile the ROI with batchsize^3 blocks per
    subvolume, merging sparsely populated neighbors. The default batchsize
    is 8.
"#;

// ============================================================================
// Properties & Data
// ============================================================================

/// Persisted per-instance settings and extents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Properties {
    #[serde(rename = "BlockSize")]
    pub block_size: Point3d,
    /// Smallest block Z ever posted. Extents only accumulate; they are not
    /// re-derived when the ROI is replaced, so they may overestimate after
    /// repeated overwrites.
    #[serde(rename = "MinZ")]
    pub min_z: i32,
    #[serde(rename = "MaxZ")]
    pub max_z: i32,
}

/// An ROI data instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Data {
    pub base: BaseData,
    pub(crate) properties: Properties,
}

/// Registry entry for this type.
pub fn type_service() -> TypeService {
    TypeService {
        info: TypeInfo {
            name: TYPE_NAME,
            url: TYPE_URL,
            version: TYPE_VERSION,
            requires_batcher: true,
        },
        help: HELP,
        new_data,
    }
}

fn new_data(args: NewDataArgs<'_>) -> Result<DataInstance> {
    Ok(DataInstance::Roi(Data::new(args)?))
}

impl Data {
    pub fn new(args: NewDataArgs<'_>) -> Result<Self> {
        let block_size = match args.config.get_str("BlockSize") {
            Some(s) => {
                let pt: Point3d = s.parse()?;
                if pt.0.iter().any(|&d| d < 1) {
                    return Err(Error::BadConfig(format!(
                        "BlockSize dimensions must be positive, got {}",
                        pt
                    )));
                }
                pt
            }
            None => Point3d([DEFAULT_BLOCK_SIZE; 3]),
        };
        Ok(Self {
            base: BaseData {
                name: args.name.to_string(),
                type_name: TYPE_NAME.to_string(),
                instance_id: args.instance_id,
                created: args.uuid.clone(),
            },
            properties: Properties {
                block_size,
                min_z: i32::MAX,
                max_z: i32::MIN,
            },
        })
    }

    pub fn block_size(&self) -> Point3d {
        self.properties.block_size
    }

    pub fn info_json(&self) -> serde_json::Value {
        serde_json::json!({
            "Base": self.base,
            "Extended": self.properties,
        })
    }

    /// Node-level request dispatch for this instance.
    pub fn handle(
        &self,
        store: &Store,
        manager: &RepoManager,
        ctx: &DataContext,
        req: DataRequest<'_>,
    ) -> Result<DataResponse> {
        match (req.endpoint, req.method) {
            ("help", "GET") => Ok(DataResponse::text(HELP)),
            ("info", "GET") => Ok(DataResponse::json(self.info_json())),
            ("roi", "GET") => {
                let spans = self.get_spans(store, ctx)?;
                Ok(DataResponse::json_bytes(serde_json::to_vec(&spans)?))
            }
            ("roi", "POST") => {
                let count = self.put(store, manager, ctx, req.body)?;
                Ok(DataResponse::json(serde_json::json!({
                    "result": format!("stored {} spans for ROI {:?}", count, self.base.name),
                })))
            }
            ("ptquery", "POST") => {
                Ok(DataResponse::json_bytes(self.point_query(store, ctx, req.body)?))
            }
            ("ptquery", _) => Err(Error::BadRequest(
                "ptquery requires POST with a JSON list of points".into(),
            )),
            ("partition", "GET") => {
                let batchsize = match req.query.get("batchsize") {
                    Some(s) => s.parse::<i32>().map_err(|_| {
                        Error::BadRequest(format!("bad batchsize query value {:?}", s))
                    })?,
                    None => 8,
                };
                if batchsize < 1 {
                    return Err(Error::BadRequest(format!(
                        "batchsize must be positive, got {}",
                        batchsize
                    )));
                }
                let result = self.partition(store, ctx, batchsize)?;
                Ok(DataResponse::json_bytes(serde_json::to_vec(&result)?))
            }
            ("partition", _) => Err(Error::BadRequest("partition only supports GET".into())),
            (endpoint, method) => Err(Error::BadRequest(format!(
                "no {} handler for endpoint {:?} on data type roi",
                method, endpoint
            ))),
        }
    }

    // ========================================================================
    // Storage operations
    // ========================================================================

    /// All spans of this (instance, version), in `(z, y, x0)` order.
    pub fn get_spans(&self, store: &Store, ctx: &DataContext) -> Result<Vec<Span>> {
        let mut spans = Vec::new();
        store.process_range(
            ctx,
            &RleIndex::min_index(),
            &RleIndex::max_index(),
            &mut |key, _| {
                let index = RleIndex::from_index_bytes(ctx.index_from_key(key)?)?;
                spans.push(Span::from_rle(&index));
                Ok(())
            },
        )?;
        Ok(spans)
    }

    /// Replace the ROI with the posted spans. Returns the canonical span
    /// count.
    ///
    /// The write serializes on the per-(instance, version) mutex, deletes
    /// the prior contents, then streams the canonical spans through write
    /// batches. Extents are folded into `MinZ`/`MaxZ` and persisted through
    /// the repo save hook.
    pub fn put(
        &self,
        store: &Store,
        manager: &RepoManager,
        ctx: &DataContext,
        body: &[u8],
    ) -> Result<usize> {
        let posted: Vec<Span> = serde_json::from_slice(body)?;
        for span in &posted {
            if span.2 > span.3 {
                return Err(Error::MalformedJson(format!(
                    "span [{}, {}, {}, {}] has x0 > x1",
                    span.0, span.1, span.2, span.3
                )));
            }
        }
        let spans = canonicalize(posted);

        let mutex = ctx.mutex();
        let _guard = mutex.lock().unwrap_or_else(|e| e.into_inner());

        // Full overwrite: collect and drop the prior rows of this version.
        let mut stale: Vec<[u8; RleIndex::NBYTES]> = Vec::new();
        store.process_range(
            ctx,
            &RleIndex::min_index(),
            &RleIndex::max_index(),
            &mut |key, _| {
                let index = ctx.index_from_key(key)?;
                stale.push(index.try_into().map_err(|_| {
                    Error::MalformedKey(format!("ROI index length {} != {}", index.len(), RleIndex::NBYTES))
                })?);
                Ok(())
            },
        )?;

        let mut batch = store.new_batch(ctx)?;
        let mut pending = 0usize;
        for key in &stale {
            batch.delete(key);
            pending += 1;
            if pending == WRITE_BATCH_SIZE {
                if ctx.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let full = std::mem::replace(&mut batch, store.new_batch(ctx)?);
                full.commit()?;
                pending = 0;
            }
        }
        for span in &spans {
            batch.put(&span.to_rle().index_bytes(), b"");
            pending += 1;
            if pending == WRITE_BATCH_SIZE {
                if ctx.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let full = std::mem::replace(&mut batch, store.new_batch(ctx)?);
                full.commit()?;
                pending = 0;
            }
        }
        batch.commit()?;

        // Fold new extents into the persisted properties.
        let posted_min_z = spans.iter().map(|s| s.0).min();
        let posted_max_z = spans.iter().map(|s| s.0).max();
        manager.update_data(self.base.instance_id, |data| {
            if let DataInstance::Roi(roi) = data {
                if let Some(z) = posted_min_z {
                    roi.properties.min_z = roi.properties.min_z.min(z);
                }
                if let Some(z) = posted_max_z {
                    roi.properties.max_z = roi.properties.max_z.max(z);
                }
            }
        })?;

        tracing::debug!(name = %self.base.name, spans = spans.len(), "stored ROI");
        Ok(spans.len())
    }

    /// Answer, for each posted voxel point, whether its block lies inside
    /// the ROI. Answers align with the posted order.
    pub fn point_query(&self, store: &Store, ctx: &DataContext, body: &[u8]) -> Result<Vec<u8>> {
        let points: Vec<Point3d> = serde_json::from_slice(body)?;
        let blocks: Vec<Point3d> = points
            .iter()
            .map(|p| p.block(self.properties.block_size))
            .collect();

        // Walk queries in storage order so the span cursor never rewinds,
        // but write each answer back to its original slot.
        let mut order: Vec<usize> = (0..blocks.len()).collect();
        order.sort_unstable_by_key(|&i| (blocks[i].z(), blocks[i].y(), blocks[i].x()));

        let spans = self.get_spans(store, ctx)?;
        let mut answers = vec![false; blocks.len()];
        let mut cursor = 0usize;
        for &i in &order {
            let (next, included) = seek_span(blocks[i], &spans, cursor);
            cursor = next;
            answers[i] = included;
        }
        Ok(serde_json::to_vec(&answers)?)
    }

    /// Tile the ROI with cubical subvolumes of `batchsize` blocks per axis,
    /// merging sparsely populated neighbors.
    pub fn partition(
        &self,
        store: &Store,
        ctx: &DataContext,
        batchsize: i32,
    ) -> Result<Subvolumes> {
        partition::partition(self, store, ctx, batchsize)
    }
}

// ============================================================================
// Spans
// ============================================================================

/// One run of ROI blocks, `[z, y, x0, x1]` inclusive, as carried on the
/// wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span(pub i32, pub i32, pub i32, pub i32);

impl Span {
    fn from_rle(index: &RleIndex) -> Self {
        Span(index.z, index.y, index.x0, index.x1())
    }

    fn to_rle(&self) -> RleIndex {
        RleIndex {
            z: self.0,
            y: self.1,
            x0: self.2,
            span: (self.3 - self.2 + 1) as u32,
        }
    }

    /// Whether this span strictly precedes `block` in storage order, i.e.
    /// `(z, y, x1) < (block.z, block.y, block.x)` lexicographically.
    fn precedes(&self, block: Point3d) -> bool {
        (self.0, self.1, self.3) < (block.z(), block.y(), block.x())
    }

    fn includes(&self, block: Point3d) -> bool {
        self.0 == block.z() && self.1 == block.y() && self.2 <= block.x() && block.x() <= self.3
    }
}

/// Sort spans by `(z, y, x0)` and coalesce touching or overlapping runs at
/// equal `(z, y)`.
fn canonicalize(mut spans: Vec<Span>) -> Vec<Span> {
    spans.sort_unstable_by_key(|s| (s.0, s.1, s.2));
    let mut out: Vec<Span> = Vec::with_capacity(spans.len());
    for span in spans {
        if let Some(last) = out.last_mut() {
            if last.0 == span.0 && last.1 == span.1 && (span.2 as i64) <= (last.3 as i64) + 1 {
                last.3 = last.3.max(span.3);
                continue;
            }
        }
        out.push(span);
    }
    out
}

/// Advance `cursor` past spans preceding `block`, then test inclusion.
/// The cursor never moves backwards, so a sorted query list is answered in
/// one forward pass over the spans.
fn seek_span(block: Point3d, spans: &[Span], mut cursor: usize) -> (usize, bool) {
    while cursor < spans.len() {
        let span = &spans[cursor];
        if span.precedes(block) {
            cursor += 1;
            continue;
        }
        return (cursor, span.includes(block));
    }
    (cursor, false)
}

// ============================================================================
// RLE index codec
// ============================================================================

/// Storage index of one span: start block `(x0, y, z)` plus run length
/// along X.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RleIndex {
    pub z: i32,
    pub y: i32,
    pub x0: i32,
    pub span: u32,
}

impl RleIndex {
    pub(crate) const NBYTES: usize = 16;

    pub(crate) fn x1(&self) -> i32 {
        self.x0 + self.span as i32 - 1
    }

    // Offset-binary: flipping the sign bit makes the big-endian bytes of
    // signed coordinates sort in numeric order.
    fn offset(v: i32) -> [u8; 4] {
        ((v as u32) ^ 0x8000_0000).to_be_bytes()
    }

    fn unoffset(b: [u8; 4]) -> i32 {
        (u32::from_be_bytes(b) ^ 0x8000_0000) as i32
    }

    pub(crate) fn index_bytes(&self) -> [u8; Self::NBYTES] {
        let mut bytes = [0u8; Self::NBYTES];
        bytes[0..4].copy_from_slice(&Self::offset(self.z));
        bytes[4..8].copy_from_slice(&Self::offset(self.y));
        bytes[8..12].copy_from_slice(&Self::offset(self.x0));
        bytes[12..16].copy_from_slice(&self.span.to_be_bytes());
        bytes
    }

    pub(crate) fn from_index_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::NBYTES {
            return Err(Error::MalformedKey(format!(
                "ROI RLE index must be {} bytes, got {}",
                Self::NBYTES,
                bytes.len()
            )));
        }
        let field = |at: usize| -> [u8; 4] {
            bytes[at..at + 4].try_into().expect("length checked above")
        };
        Ok(Self {
            z: Self::unoffset(field(0)),
            y: Self::unoffset(field(4)),
            x0: Self::unoffset(field(8)),
            span: u32::from_be_bytes(field(12)),
        })
    }

    /// Smallest possible index: most negative start, zero span.
    pub(crate) fn min_index() -> [u8; Self::NBYTES] {
        [0x00; Self::NBYTES]
    }

    /// Largest possible index: most positive start, maximal span.
    pub(crate) fn max_index() -> [u8; Self::NBYTES] {
        [0xFF; Self::NBYTES]
    }
}
