use covis_attention::config::{ConnectivityRepair, DescriptorConfig, ExtractionMode, SparseConfig};
use covis_attention::covisibility::{build_batch_masks, embeddings_from_rows, CovisibilityBuilder};
use covis_attention::error::CovisError;
use covis_attention::{
    build_covisibility_mask, Backbone, BackboneFeatures, CovisibilityMask, DescriptorExtractor,
    PatchStatsBackbone,
};
use ndarray::{Array1, Array2, Array3, ArrayView3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Two groups {0,1,2} and {3,4}: similarity 0.9 inside a group, 0.1 across.
fn two_cluster_embeddings() -> Array2<f32> {
    let shared = 0.1f32.sqrt();
    let group = 0.8f32.sqrt();
    let private = 0.1f32.sqrt();
    let mut e = Array2::<f32>::zeros((5, 8));
    for i in 0..5 {
        e[[i, 0]] = shared;
        e[[i, if i < 3 { 1 } else { 2 }]] = group;
        e[[i, 3 + i]] = private;
    }
    e
}

fn random_unit_embeddings(n: usize, dim: usize, rng: &mut StdRng) -> Array2<f32> {
    let mut e = Array2::from_shape_simple_fn((n, dim), || rng.gen_range(-1.0f32..1.0));
    for mut row in e.rows_mut() {
        let norm = row.dot(&row).sqrt().max(1e-6);
        row.mapv_inplace(|v| v / norm);
    }
    e
}

fn assert_invariants(mask: &CovisibilityMask, k: usize) {
    let n = mask.num_views();
    assert!(mask.is_symmetric(), "mask must be symmetric");
    for i in 0..n {
        assert!(mask.get(i, i), "view {} must be self-covisible", i);
        assert!(
            mask.degree(i) >= k.min(n - 1),
            "view {} has degree {} < min({}, {})",
            i,
            mask.degree(i),
            k,
            n - 1
        );
    }
    assert_eq!(mask.connected_components().len(), 1, "mask must be connected");
}

fn small_descriptor_config() -> DescriptorConfig {
    DescriptorConfig {
        backbone_dim: 16,
        patch_size: 14,
        num_clusters: 4,
        cluster_dim: 4,
        token_dim: 8,
        mlp_dim: 16,
        seed: 11,
        mode: ExtractionMode::Strict,
    }
}

fn colour_image(rgb: [f32; 3], height: usize, width: usize) -> Array3<f32> {
    Array3::from_shape_fn((3, height, width), |(c, y, x)| {
        rgb[c] * (0.8 + 0.2 * ((x + y) % 7) as f32 / 7.0)
    })
}

struct OfflineBackbone;

impl Backbone for OfflineBackbone {
    fn embed_dim(&self) -> usize {
        16
    }

    fn patch_size(&self) -> usize {
        14
    }

    fn forward_features(&self, _image: ArrayView3<f32>) -> covis_attention::Result<BackboneFeatures> {
        Err(CovisError::BackboneUnavailable("weights not downloaded".into()))
    }
}

#[test]
fn test_identical_views_are_fully_connected() {
    println!("🧪 Testing identical embeddings...");

    let e = Array2::from_shape_fn((4, 2), |(_, j)| if j == 0 { 0.6 } else { 0.8 });
    let mask = build_covisibility_mask(e.view(), 0.7, 2).unwrap();

    assert_eq!(mask.num_views(), 4);
    assert!(mask.as_array().iter().all(|&on| on), "every pair exceeds the threshold");
    assert_eq!(mask.edge_count(), 16);

    println!("✅ Identical embeddings give an all-ones mask");
}

#[test]
fn test_clusters_are_bridged_only_by_chain() {
    println!("🧪 Testing two dissimilar clusters...");
    init_logger();

    let mask = build_covisibility_mask(two_cluster_embeddings().view(), 0.7, 1).unwrap();

    for (a, b) in [(0, 1), (0, 2), (1, 2), (3, 4)] {
        assert!(mask.get(a, b) && mask.get(b, a), "intra-cluster edge ({}, {})", a, b);
    }
    for a in 0..3 {
        for b in 3..5 {
            let expected = a == 2 && b == 3;
            assert_eq!(mask.get(a, b), expected, "cross edge ({}, {})", a, b);
            assert_eq!(mask.get(b, a), expected, "cross edge ({}, {})", b, a);
        }
    }

    let stats = mask.stats();
    assert_eq!(stats.threshold_edges, 4);
    assert_eq!(stats.knn_edges, 0, "k-NN stays inside the clusters");
    assert_eq!(stats.repair_edges, 1, "only (2, 3) comes from the chain");
    assert_invariants(&mask, 1);

    println!("✅ Cross-cluster connectivity comes from the chain fallback");
}

#[test]
fn test_single_view_mask() {
    let e = Array2::from_elem((1, 3), 1.0 / 3.0f32.sqrt());
    let mask = build_covisibility_mask(e.view(), 0.7, 10).unwrap();
    assert_eq!(mask.num_views(), 1);
    assert!(mask.get(0, 0));
    assert_eq!(mask.edge_count(), 1);
    assert_eq!(mask.degree(0), 0);
}

#[test]
fn test_invariants_hold_on_random_embeddings() {
    println!("🧪 Testing mask invariants on random embeddings...");

    let mut rng = StdRng::seed_from_u64(42);
    for n in 1..=12 {
        for &threshold in &[-0.2f32, 0.0, 0.3, 0.7, 0.95] {
            for k in 0..4 {
                let e = random_unit_embeddings(n, 16, &mut rng);
                for repair in [ConnectivityRepair::Chain, ConnectivityRepair::BridgeComponents] {
                    let mask = CovisibilityBuilder::new(threshold, k)
                        .with_repair(repair)
                        .build(e.view())
                        .unwrap();
                    assert_eq!(mask.num_views(), n);
                    assert_invariants(&mask, k);
                }
            }
        }
    }

    println!("✅ Symmetry, self loops, minimum degree and connectivity hold");
}

#[test]
fn test_raising_threshold_never_adds_edges() {
    let mut rng = StdRng::seed_from_u64(7);
    let e = random_unit_embeddings(10, 8, &mut rng);

    let mut previous = usize::MAX;
    for step in 0..=20 {
        let threshold = -1.0 + step as f32 * 0.1;
        let count = build_covisibility_mask(e.view(), threshold, 2).unwrap().edge_count();
        assert!(count <= previous, "edges grew from {} to {} at {}", previous, count, threshold);
        previous = count;
    }
}

#[test]
fn test_bridge_repair_picks_best_cross_pair() {
    let mask = CovisibilityBuilder::new(0.7, 1)
        .with_repair(ConnectivityRepair::BridgeComponents)
        .build(two_cluster_embeddings().view())
        .unwrap();

    // every cross pair ties at 0.1, so the first in index order wins
    assert!(mask.get(0, 3));
    assert!(!mask.get(2, 3));
    assert_eq!(mask.stats().repair_edges, 1);
    assert_eq!(mask.connected_components().len(), 1);
}

#[test]
fn test_shape_errors_are_fatal() {
    let ragged = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0]];
    match embeddings_from_rows(&ragged) {
        Err(CovisError::DimensionMismatch { index, expected, actual }) => {
            assert_eq!((index, expected, actual), (2, 2, 1));
        }
        other => panic!("expected dimension mismatch, got {:?}", other),
    }

    assert!(matches!(embeddings_from_rows(&[]), Err(CovisError::EmptyBatch)));

    let empty = Array2::<f32>::zeros((0, 4));
    assert!(matches!(
        build_covisibility_mask(empty.view(), 0.7, 2),
        Err(CovisError::EmptyBatch)
    ));

    assert!(matches!(
        build_batch_masks(&[], &SparseConfig::default()),
        Err(CovisError::EmptyBatch)
    ));
}

#[test]
fn test_batch_masks_follow_scene_sizes() {
    let mut rng = StdRng::seed_from_u64(3);
    let scenes = vec![
        random_unit_embeddings(3, 8, &mut rng),
        random_unit_embeddings(6, 8, &mut rng),
    ];
    let masks = build_batch_masks(&scenes, &SparseConfig::new(0.5, 2)).unwrap();
    assert_eq!(masks.len(), 2);
    assert_eq!(masks[0].num_views(), 3);
    assert_eq!(masks[1].num_views(), 6);
}

#[test]
fn test_descriptors_are_unit_norm() {
    println!("🧪 Testing descriptor normalization...");

    let extractor = DescriptorExtractor::simulated(small_descriptor_config()).unwrap();
    assert_eq!(extractor.output_dim(), 4 * 4 + 8);

    let images = vec![
        colour_image([0.9, 0.1, 0.1], 28, 28),
        colour_image([0.1, 0.9, 0.1], 30, 45),
        colour_image([0.1, 0.1, 0.9], 14, 70),
    ];
    let batch = extractor.extract_batch(&images).unwrap();
    assert_eq!(batch.num_views(), 3);
    assert_eq!(batch.dim(), extractor.output_dim());

    for row in batch.embeddings().rows() {
        let norm = row.dot(&row).sqrt();
        assert!((norm - 1.0).abs() < 1e-5, "norm was {}", norm);
    }

    println!("✅ All descriptors have unit length");
}

#[test]
fn test_identical_images_share_descriptors() {
    let backbone: Arc<dyn Backbone> = Arc::new(PatchStatsBackbone::new(16, 14, 5));
    let extractor = DescriptorExtractor::new(small_descriptor_config(), Some(backbone)).unwrap();

    let image = colour_image([0.4, 0.5, 0.6], 42, 56);
    let a = extractor.extract(image.view()).unwrap();
    let b = extractor.extract(image.view()).unwrap();
    assert_eq!(a, b);
    let similarity: f32 = a.dot(&b);
    assert!((similarity - 1.0).abs() < 1e-5);
}

#[test]
fn test_strict_mode_requires_backbone() {
    let result = DescriptorExtractor::new(small_descriptor_config(), None);
    assert!(matches!(result, Err(CovisError::BackboneUnavailable(_))));

    let offline: Arc<dyn Backbone> = Arc::new(OfflineBackbone);
    let strict = DescriptorExtractor::new(small_descriptor_config(), Some(offline)).unwrap();
    let images = vec![colour_image([0.5, 0.5, 0.5], 28, 28)];
    assert!(matches!(
        strict.extract_batch(&images),
        Err(CovisError::BackboneUnavailable(_))
    ));
}

#[test]
fn test_permissive_mode_degrades_with_warning() {
    println!("🧪 Testing degraded descriptor extraction...");
    init_logger();

    let config = small_descriptor_config().with_mode(ExtractionMode::Permissive);
    let offline: Arc<dyn Backbone> = Arc::new(OfflineBackbone);
    let extractor = DescriptorExtractor::new(config, Some(offline)).unwrap();
    let images = vec![
        colour_image([0.9, 0.2, 0.2], 28, 28),
        colour_image([0.2, 0.9, 0.2], 28, 28),
    ];
    let batch = extractor.extract_batch(&images).unwrap();

    assert!(batch.is_degraded());
    assert_eq!(batch.warnings().len(), 2);
    let mask = build_covisibility_mask(batch.embeddings(), 0.7, 1).unwrap();
    assert_invariants(&mask, 1);

    println!("✅ Simulated features still produce a valid mask");
}

#[test]
fn test_extractor_rejects_bad_input() {
    let extractor = DescriptorExtractor::simulated(small_descriptor_config()).unwrap();
    assert!(matches!(extractor.extract_batch(&[]), Err(CovisError::EmptyBatch)));

    let gray = Array3::<f32>::zeros((1, 28, 28));
    assert!(matches!(
        extractor.extract(gray.view()),
        Err(CovisError::InvalidImage(_))
    ));

    let mismatched: Arc<dyn Backbone> = Arc::new(PatchStatsBackbone::new(32, 14, 0));
    assert!(matches!(
        DescriptorExtractor::new(small_descriptor_config(), Some(mismatched)),
        Err(CovisError::InvalidConfig(_))
    ));
}

#[test]
fn test_stacked_tensor_matches_list_input() {
    let extractor = DescriptorExtractor::simulated(small_descriptor_config()).unwrap();
    let images = vec![
        colour_image([0.3, 0.6, 0.9], 28, 42),
        colour_image([0.9, 0.6, 0.3], 28, 42),
    ];
    let views: Vec<_> = images.iter().map(|img| img.view()).collect();
    let stacked = ndarray::stack(ndarray::Axis(0), &views).unwrap();

    let from_list = extractor.extract_batch(&images).unwrap();
    let from_tensor = extractor.extract_tensor(stacked.view()).unwrap();
    assert_eq!(from_list.embeddings(), from_tensor.embeddings());

    let row: Array1<f32> = from_list.embeddings().row(0).to_owned();
    assert_eq!(row.len(), extractor.output_dim());
}
