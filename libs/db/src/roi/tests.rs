use std::collections::HashMap;

use tempfile::TempDir;

use super::*;
use crate::registry::{DataRequest, TypeRegistry};
use crate::repo::{InstanceIdConfig, RepoManager};
use crate::rocks::RocksStore;
use crate::stats::LoadStats;
use crate::{DataConfig, Point3d};

struct Fixture {
    _dir: TempDir,
    store: Store,
    manager: RepoManager,
    data: Data,
    ctx: DataContext,
}

/// One repo with a single `roi` instance named "med".
fn fixture(block_size: &str) -> Fixture {
    let dir = TempDir::new().unwrap();
    let store: Store = RocksStore::open(&dir.path().join("db"), LoadStats::new()).unwrap();
    let manager = RepoManager::open(store.clone(), InstanceIdConfig::default()).unwrap();
    let registry = TypeRegistry::builtin();

    let root = manager.new_repo().unwrap();
    let config = DataConfig::from_json(
        format!(
            r#"{{"typename": "roi", "dataname": "med", "BlockSize": "{}"}}"#,
            block_size
        )
        .as_bytes(),
    )
    .unwrap();
    manager.new_data(&registry, &root, &config, &store).unwrap();

    let resolved = manager.matching_uuid(root.as_str()).unwrap();
    let data = match manager.get_data(resolved.repo, "med").unwrap() {
        DataInstance::Roi(d) => d,
    };
    let ctx = DataContext::new(data.base.instance_id, resolved.version);
    Fixture {
        _dir: dir,
        store,
        manager,
        data,
        ctx,
    }
}

impl Fixture {
    fn put(&self, spans: &str) {
        self.data
            .put(&self.store, &self.manager, &self.ctx, spans.as_bytes())
            .unwrap();
    }

    fn get(&self) -> Vec<Span> {
        self.data.get_spans(&self.store, &self.ctx).unwrap()
    }

    /// Fresh snapshot of the instance, picking up persisted extent updates.
    fn reload(&self) -> Data {
        let resolved = self
            .manager
            .matching_uuid(self.data.base.created.as_str())
            .unwrap();
        match self.manager.get_data(resolved.repo, "med").unwrap() {
            DataInstance::Roi(d) => d,
        }
    }
}

// ============================================================================
// RLE index codec
// ============================================================================

#[test]
fn rle_codec_roundtrip() {
    for index in [
        RleIndex { z: 0, y: 0, x0: 0, span: 1 },
        RleIndex { z: -5, y: 17, x0: -1000, span: 42 },
        RleIndex { z: i32::MAX, y: i32::MIN, x0: 7, span: u32::MAX },
    ] {
        let bytes = index.index_bytes();
        assert_eq!(bytes.len(), RleIndex::NBYTES);
        assert_eq!(RleIndex::from_index_bytes(&bytes).unwrap(), index);
    }
    assert!(RleIndex::from_index_bytes(&[0u8; 15]).is_err());
}

#[test]
fn rle_bytes_sort_in_zyx_order() {
    // Includes negative coordinates, which raw two's-complement big-endian
    // encoding would missort.
    let ordered = [
        RleIndex { z: -2, y: 5, x0: 100, span: 1 },
        RleIndex { z: -1, y: -10, x0: 0, span: 1 },
        RleIndex { z: -1, y: 3, x0: -50, span: 1 },
        RleIndex { z: -1, y: 3, x0: 2, span: 1 },
        RleIndex { z: 0, y: -100, x0: 0, span: 1 },
        RleIndex { z: 3, y: 0, x0: 0, span: 1 },
    ];
    for pair in ordered.windows(2) {
        assert!(
            pair[0].index_bytes() < pair[1].index_bytes(),
            "{:?} should sort before {:?}",
            pair[0],
            pair[1]
        );
    }
    for index in &ordered {
        assert!(index.index_bytes() > RleIndex::min_index());
        assert!(index.index_bytes() < RleIndex::max_index());
    }
}

// ============================================================================
// Canonicalization
// ============================================================================

#[test]
fn canonicalize_sorts_and_merges() {
    let spans = vec![
        Span(1, 2, 3, 4),
        Span(0, 0, 3, 5),
        Span(0, 0, 6, 8),   // touches [3,5]
        Span(0, 0, 0, 1),
        Span(0, 2, 8, 9),
        Span(0, 0, 4, 7),   // overlaps both x runs
    ];
    assert_eq!(
        canonicalize(spans),
        vec![
            Span(0, 0, 0, 1),
            Span(0, 0, 3, 8),
            Span(0, 2, 8, 9),
            Span(1, 2, 3, 4),
        ]
    );
}

#[test]
fn canonicalize_keeps_distinct_rows_apart() {
    let spans = vec![Span(0, 0, 0, 5), Span(0, 1, 6, 7), Span(1, 0, 6, 7)];
    assert_eq!(canonicalize(spans.clone()), spans);
}

// ============================================================================
// Put / Get
// ============================================================================

const SCENARIO_ROI: &str = "[[0,0,0,1],[0,0,3,5],[0,2,8,9],[1,2,3,4]]";

#[test]
fn roundtrip_preserves_canonical_input() {
    let fx = fixture("32,32,32");
    fx.put(SCENARIO_ROI);
    assert_eq!(
        fx.get(),
        vec![Span(0, 0, 0, 1), Span(0, 0, 3, 5), Span(0, 2, 8, 9), Span(1, 2, 3, 4)]
    );
}

#[test]
fn stored_spans_are_strictly_ascending_and_disjoint() {
    let fx = fixture("32,32,32");
    fx.put("[[3,1,0,2],[0,0,8,9],[0,0,0,4],[0,0,5,7],[-1,4,0,0]]");
    let spans = fx.get();
    for pair in spans.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        assert!((a.0, a.1, a.2) < (b.0, b.1, b.2), "{:?} !< {:?}", a, b);
        if (a.0, a.1) == (b.0, b.1) {
            assert!(a.3 + 1 < b.2, "touching spans not merged: {:?} {:?}", a, b);
        }
    }
    // [0,0,0,4] + [0,0,5,7] + [0,0,8,9] coalesce.
    assert_eq!(spans[1], Span(0, 0, 0, 9));
}

#[test]
fn put_is_a_full_overwrite() {
    let fx = fixture("32,32,32");
    fx.put("[[0,0,0,9]]");
    fx.put("[[7,7,7,7]]");
    assert_eq!(fx.get(), vec![Span(7, 7, 7, 7)]);
}

#[test]
fn put_rejects_bad_payloads() {
    let fx = fixture("32,32,32");
    let err = fx
        .data
        .put(&fx.store, &fx.manager, &fx.ctx, b"[[0,0,5,2]]")
        .unwrap_err();
    assert!(matches!(err, Error::MalformedJson(_)));

    let err = fx
        .data
        .put(&fx.store, &fx.manager, &fx.ctx, b"{not json")
        .unwrap_err();
    assert!(matches!(err, Error::MalformedJson(_)));
}

#[test]
fn extents_accumulate_across_puts() {
    let fx = fixture("32,32,32");
    assert!(fx.data.properties.min_z > fx.data.properties.max_z);

    fx.put(SCENARIO_ROI);
    let props = fx.reload().properties;
    assert_eq!((props.min_z, props.max_z), (0, 1));

    // Overwrite with a higher band: MinZ keeps its historical floor.
    fx.put("[[5,0,0,1]]");
    let props = fx.reload().properties;
    assert_eq!((props.min_z, props.max_z), (0, 5));
}

// ============================================================================
// Point query
// ============================================================================

fn brute_force(spans: &[Span], block: Point3d) -> bool {
    spans.iter().any(|s| s.includes(block))
}

#[test]
fn point_query_matches_membership_in_original_order() {
    let fx = fixture("32,32,32");
    fx.put(SCENARIO_ROI);
    let spans = fx.get();

    // Deliberately unsorted: answers must align with the posted order.
    let points = vec![
        [96, 64, 32],  // block (3, 2, 1) -> inside [1,2,3,4]
        [0, 0, 0],     // block (0, 0, 0) -> inside [0,0,0,1]
        [64, 0, 0],    // block (2, 0, 0) -> gap between x runs
        [256, 64, 0],  // block (8, 2, 0) -> inside [0,2,8,9]
        [320, 64, 0],  // block (10, 2, 0) -> outside
        [96, 0, 0],    // block (3, 0, 0) -> inside [0,0,3,5]
        [-1, -1, -1],  // block (-1, -1, -1) -> outside
    ];
    let body = serde_json::to_vec(&points).unwrap();
    let answers: Vec<bool> =
        serde_json::from_slice(&fx.data.point_query(&fx.store, &fx.ctx, &body).unwrap()).unwrap();

    let expected: Vec<bool> = points
        .iter()
        .map(|&[x, y, z]| {
            brute_force(&spans, Point3d::new(x, y, z).block(fx.data.block_size()))
        })
        .collect();
    assert_eq!(answers, expected);
    assert_eq!(answers, vec![true, true, false, true, false, true, false]);
}

#[test]
fn point_query_handles_negative_coordinates() {
    let fx = fixture("32,32,32");
    fx.put("[[-2,-1,-3,-1]]");

    let points = vec![[-96, -32, -64], [-1, -32, -64], [0, -32, -64], [-96, -32, 0]];
    let body = serde_json::to_vec(&points).unwrap();
    let answers: Vec<bool> =
        serde_json::from_slice(&fx.data.point_query(&fx.store, &fx.ctx, &body).unwrap()).unwrap();
    assert_eq!(answers, vec![true, true, false, false]);
}

#[test]
fn point_query_respects_block_size() {
    let fx = fixture("16,16,16");
    fx.put("[[0,0,0,0]]");

    let points = vec![[15, 15, 15], [16, 0, 0], [0, 16, 0], [0, 0, 16]];
    let body = serde_json::to_vec(&points).unwrap();
    let answers: Vec<bool> =
        serde_json::from_slice(&fx.data.point_query(&fx.store, &fx.ctx, &body).unwrap()).unwrap();
    assert_eq!(answers, vec![true, false, false, false]);
}

// ============================================================================
// Partition
// ============================================================================

#[test]
fn partition_counts_active_blocks() {
    let fx = fixture("32,32,32");
    fx.put(SCENARIO_ROI);

    let result = fx.data.partition(&fx.store, &fx.ctx, 2).unwrap();
    // Span lengths: 2 + 3 + 2 + 2.
    assert_eq!(result.num_active_blocks, 9);
    assert_eq!(
        result.subvolumes.iter().map(|s| s.active_blocks).sum::<i32>(),
        9
    );
    assert_eq!(
        result.subvolumes.iter().map(|s| s.total_blocks).sum::<i32>(),
        result.num_total_blocks
    );
    assert_eq!(result.num_subvolumes, result.subvolumes.len() as i32);
}

#[test]
fn partition_contains_every_active_block_once() {
    let fx = fixture("32,32,32");
    fx.put(SCENARIO_ROI);
    let spans = fx.get();
    let bs = fx.data.block_size();

    for batchsize in [1, 2, 3, 8] {
        let result = fx.data.partition(&fx.store, &fx.ctx, batchsize).unwrap();
        for span in &spans {
            for x in span.2..=span.3 {
                let min_voxel = Point3d::new(x * bs.x(), span.1 * bs.y(), span.0 * bs.z());
                let holders = result
                    .subvolumes
                    .iter()
                    .filter(|s| {
                        (0..3).all(|axis| {
                            s.min_corner.0[axis] <= min_voxel.0[axis]
                                && min_voxel.0[axis] <= s.max_corner.0[axis]
                        })
                    })
                    .count();
                assert_eq!(
                    holders, 1,
                    "block ({},{},{}) in {} subvolumes at batchsize {}",
                    x, span.1, span.0, holders, batchsize
                );
            }
        }
    }
}

#[test]
fn partition_of_empty_roi_is_empty() {
    let fx = fixture("32,32,32");
    let result = fx.data.partition(&fx.store, &fx.ctx, 8).unwrap();
    assert_eq!(result.num_total_blocks, 0);
    assert_eq!(result.num_active_blocks, 0);
    assert_eq!(result.num_subvolumes, 0);
    assert!(result.subvolumes.is_empty());
}

#[test]
fn partition_of_single_block_roi() {
    let fx = fixture("32,32,32");
    fx.put("[[4,5,6,6]]");
    let result = fx.data.partition(&fx.store, &fx.ctx, 8).unwrap();
    assert_eq!(result.num_active_blocks, 1);
    assert_eq!(result.num_subvolumes, 1);
    let sub = &result.subvolumes[0];
    assert_eq!(sub.min_corner, Point3d::new(6 * 32, 5 * 32, 4 * 32));
    assert_eq!(sub.max_corner, Point3d::new(7 * 32 - 1, 6 * 32 - 1, 5 * 32 - 1));
}

#[test]
fn partition_merges_sparse_columns_within_a_row() {
    let fx = fixture("32,32,32");
    // One row of 8 blocks; with batchsize 4 each column holds 4 actives,
    // below the merge threshold of 6, so the second column merges into the
    // first.
    fx.put("[[0,0,0,7]]");
    let result = fx.data.partition(&fx.store, &fx.ctx, 4).unwrap();
    assert_eq!(result.num_subvolumes, 1);
    assert_eq!(result.subvolumes[0].active_blocks, 8);
    assert_eq!(result.subvolumes[0].total_blocks, 8);
    assert_eq!(result.subvolumes[0].min_corner, Point3d::new(0, 0, 0));
    assert_eq!(result.subvolumes[0].max_corner, Point3d::new(8 * 32 - 1, 32 - 1, 32 - 1));
}

#[test]
fn partition_spans_multiple_layers() {
    let fx = fixture("32,32,32");
    // Blocks at z 0..4 with batchsize 2: layers are [0,1], [2,3]*, but the
    // first (5 % 2 = 1) layer is widened: [0,2], [3,4].
    fx.put("[[0,0,0,0],[1,0,0,0],[2,0,0,0],[3,0,0,0],[4,0,0,0]]");
    let result = fx.data.partition(&fx.store, &fx.ctx, 2).unwrap();
    assert_eq!(result.num_active_blocks, 5);
    assert_eq!(
        result.subvolumes.iter().map(|s| s.active_blocks).sum::<i32>(),
        5
    );
    // Two layers, one subvolume each.
    assert_eq!(result.num_subvolumes, 2);
    assert_eq!(result.subvolumes[0].min_corner.z(), 0);
    assert_eq!(result.subvolumes[0].max_corner.z(), 3 * 32 - 1);
    assert_eq!(result.subvolumes[1].min_corner.z(), 3 * 32);
    assert_eq!(result.subvolumes[1].max_corner.z(), 5 * 32 - 1);
}

// ============================================================================
// Handler dispatch
// ============================================================================

#[test]
fn handle_dispatches_endpoints() {
    let fx = fixture("32,32,32");
    let no_query = HashMap::new();

    let post = DataRequest {
        method: "POST",
        endpoint: "roi",
        query: &no_query,
        body: SCENARIO_ROI.as_bytes(),
    };
    fx.data
        .handle(&fx.store, &fx.manager, &fx.ctx, post)
        .unwrap();

    let get = DataRequest {
        method: "GET",
        endpoint: "roi",
        query: &no_query,
        body: b"",
    };
    let resp = fx.data.handle(&fx.store, &fx.manager, &fx.ctx, get).unwrap();
    assert_eq!(resp.content_type, "application/json");
    let spans: Vec<Span> = serde_json::from_slice(&resp.body).unwrap();
    assert_eq!(spans.len(), 4);

    // Default batchsize applies when the query string has none.
    let partition = DataRequest {
        method: "GET",
        endpoint: "partition",
        query: &no_query,
        body: b"",
    };
    let resp = fx
        .data
        .handle(&fx.store, &fx.manager, &fx.ctx, partition)
        .unwrap();
    let result: Subvolumes = serde_json::from_slice(&resp.body).unwrap();
    assert_eq!(result.num_active_blocks, 9);

    let bad_verb = DataRequest {
        method: "GET",
        endpoint: "ptquery",
        query: &no_query,
        body: b"",
    };
    assert!(matches!(
        fx.data.handle(&fx.store, &fx.manager, &fx.ctx, bad_verb),
        Err(Error::BadRequest(_))
    ));

    let unknown = DataRequest {
        method: "GET",
        endpoint: "raw",
        query: &no_query,
        body: b"",
    };
    assert!(matches!(
        fx.data.handle(&fx.store, &fx.manager, &fx.ctx, unknown),
        Err(Error::BadRequest(_))
    ));

    let bad_batch = HashMap::from([("batchsize".to_string(), "zero".to_string())]);
    let bad_partition = DataRequest {
        method: "GET",
        endpoint: "partition",
        query: &bad_batch,
        body: b"",
    };
    assert!(matches!(
        fx.data.handle(&fx.store, &fx.manager, &fx.ctx, bad_partition),
        Err(Error::BadRequest(_))
    ));
}

#[test]
fn info_json_reports_extents() {
    let fx = fixture("16,16,16");
    fx.put("[[2,0,0,3]]");
    let data = fx.reload();
    let info = data.info_json();
    assert_eq!(info["Base"]["Name"], "med");
    assert_eq!(info["Base"]["TypeName"], "roi");
    assert_eq!(info["Extended"]["BlockSize"], serde_json::json!([16, 16, 16]));
    assert_eq!(info["Extended"]["MinZ"], 2);
    assert_eq!(info["Extended"]["MaxZ"], 2);
}

#[test]
fn block_size_must_be_three_positive_dimensions() {
    let dir = TempDir::new().unwrap();
    let store: Store = RocksStore::open(&dir.path().join("db"), LoadStats::new()).unwrap();
    let manager = RepoManager::open(store.clone(), InstanceIdConfig::default()).unwrap();
    let registry = TypeRegistry::builtin();
    let root = manager.new_repo().unwrap();

    for bad in ["32,32", "0,32,32", "32,-1,32", "a,b,c"] {
        let config = DataConfig::from_json(
            format!(r#"{{"typename": "roi", "dataname": "bad", "BlockSize": "{}"}}"#, bad)
                .as_bytes(),
        )
        .unwrap();
        assert!(
            manager.new_data(&registry, &root, &config, &store).is_err(),
            "BlockSize {:?} should be rejected",
            bad
        );
    }
}
