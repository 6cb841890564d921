//! End-to-end growth, prediction and serialization scenarios.

use std::sync::Arc;

use approx::assert_abs_diff_eq;

use std::io::Cursor;

use canopy_dataset::MemoryCopy;
use canopy_engine::{Engine, EngineConfig, Pruning};
use canopy_tree::{read_tree, write_tree, MemoryNodeStore, Tree};
use canopy_types::{Cancel, Feature, MapSample, Sample};

fn marital_features() -> Vec<Arc<Feature>> {
    vec![
        Feature::discrete("marital", ["married", "single"]),
        Feature::discrete("prediction", ["yes", "no"]),
    ]
}

fn marital_samples() -> Vec<Arc<dyn Sample>> {
    [("married", "no"), ("married", "no"), ("single", "yes")]
        .iter()
        .map(|(m, p)| {
            Arc::new(MapSample::new().with("marital", *m).with("prediction", *p))
                as Arc<dyn Sample>
        })
        .collect()
}

fn engine(label: &str, pruning: Pruning, concurrency: usize) -> Engine {
    Engine::new(EngineConfig {
        label_feature: label.to_string(),
        pruning,
        concurrency,
        shuffle_seed: Some(7),
        ..EngineConfig::default()
    })
    .unwrap()
}

async fn grow_marital_tree(ctx: &Cancel) -> Tree {
    let engine = engine("prediction", Pruning::FixedMinimumGain(0.0), 1);
    engine
        .grow(ctx, &marital_features(), MemoryCopy::new(marital_samples()))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_discrete_root_split() {
    let ctx = Cancel::new();
    let tree = grow_marital_tree(&ctx).await;

    let root = tree.store.get(&ctx, &tree.root_id).await.unwrap().unwrap();
    assert_eq!(root.subtree_feature.as_ref().map(|f| f.name()), Some("marital"));
    assert_eq!(root.subtree_ids.len(), 3);

    let married = tree
        .predict(&ctx, &MapSample::new().with("marital", "married"))
        .await
        .unwrap();
    assert_eq!(married.probability_of("no"), 1.0);
    assert_eq!(married.weight(), 2);

    let single = tree
        .predict(&ctx, &MapSample::new().with("marital", "single"))
        .await
        .unwrap();
    assert_eq!(single.probability_of("yes"), 1.0);
    assert_eq!(single.weight(), 1);
}

#[tokio::test]
async fn test_continuous_split_at_midpoint() {
    let ctx = Cancel::new();
    let features = vec![
        Feature::continuous("age"),
        Feature::discrete("buys", ["yes", "no"]),
    ];
    let samples: Vec<Arc<dyn Sample>> = [(20.0, "no"), (30.0, "no"), (40.0, "yes"), (50.0, "yes")]
        .iter()
        .map(|(age, buys)| {
            Arc::new(MapSample::new().with("age", *age).with("buys", *buys)) as Arc<dyn Sample>
        })
        .collect();

    let engine = engine("buys", Pruning::FixedMinimumGain(0.0), 1);
    let tree = engine
        .grow(&ctx, &features, MemoryCopy::new(samples))
        .await
        .unwrap();

    let root = tree.store.get(&ctx, &tree.root_id).await.unwrap().unwrap();
    assert_eq!(root.subtree_feature.as_ref().map(|f| f.name()), Some("age"));

    // Branch intervals tile the line around the midpoint threshold.
    let mut intervals = Vec::new();
    for id in &root.subtree_ids {
        let child = tree.store.get(&ctx, id).await.unwrap().unwrap();
        if let Some(interval) = child.criterion.as_ref().and_then(|c| c.interval()) {
            intervals.push(interval);
        }
    }
    assert_eq!(
        intervals,
        vec![(f64::NEG_INFINITY, 35.0), (35.0, f64::INFINITY)]
    );

    let below = tree
        .predict(&ctx, &MapSample::new().with("age", 30.0))
        .await
        .unwrap();
    assert_eq!(below.probability_of("no"), 1.0);
    assert_eq!(below.weight(), 2);

    let above = tree
        .predict(&ctx, &MapSample::new().with("age", 35.0))
        .await
        .unwrap();
    assert_eq!(above.probability_of("yes"), 1.0);
    assert_eq!(above.weight(), 2);
}

#[tokio::test]
async fn test_uninformative_feature_leaves_root_unsplit() {
    let ctx = Cancel::new();
    let features = vec![
        Feature::discrete("noise", ["x"]),
        Feature::discrete("prediction", ["yes", "no"]),
    ];
    let samples: Vec<Arc<dyn Sample>> = [("x", "no"), ("x", "no"), ("x", "yes")]
        .iter()
        .map(|(n, p)| {
            Arc::new(MapSample::new().with("noise", *n).with("prediction", *p))
                as Arc<dyn Sample>
        })
        .collect();

    let engine = engine("prediction", Pruning::FixedMinimumGain(0.0), 1);
    let tree = engine
        .grow(&ctx, &features, MemoryCopy::new(samples))
        .await
        .unwrap();

    let root = tree.store.get(&ctx, &tree.root_id).await.unwrap().unwrap();
    assert!(root.is_leaf());
    let prediction = root.prediction.unwrap();
    assert_abs_diff_eq!(prediction.probability_of("no"), 2.0 / 3.0, epsilon = 1e-12);
    assert_abs_diff_eq!(prediction.probability_of("yes"), 1.0 / 3.0, epsilon = 1e-12);
    assert_eq!(prediction.weight(), 3);
}

#[tokio::test]
async fn test_json_round_trip_preserves_predictions() {
    let ctx = Cancel::new();
    let tree = grow_marital_tree(&ctx).await;

    let mut encoded = Cursor::new(Vec::new());
    write_tree(&ctx, &tree, &mut encoded).await.unwrap();

    let envelope: serde_json::Value = serde_json::from_slice(encoded.get_ref()).unwrap();
    assert_eq!(envelope["rootID"], serde_json::json!(tree.root_id));
    assert_eq!(envelope["label"], serde_json::json!("prediction"));
    assert_eq!(envelope["nodes"].as_array().unwrap().len(), 4);

    // Persist and reload through a file, the way an operator would.
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), encoded.get_ref()).unwrap();
    let bytes = std::fs::read(file.path()).unwrap();

    let reloaded = read_tree(
        &ctx,
        MemoryNodeStore::new(),
        &marital_features(),
        &mut bytes.as_slice(),
    )
    .await
    .unwrap();
    assert_eq!(reloaded.root_id, tree.root_id);

    for sample in [
        MapSample::new().with("marital", "married"),
        MapSample::new().with("marital", "married"),
        MapSample::new().with("marital", "single"),
    ] {
        let before = tree.predict(&ctx, &sample).await.unwrap();
        let after = reloaded.predict(&ctx, &sample).await.unwrap();
        assert_eq!(before, after);
    }
}

#[tokio::test]
async fn test_out_of_catalog_value_takes_fallback_branch() {
    let ctx = Cancel::new();
    let tree = grow_marital_tree(&ctx).await;

    let divorced = tree
        .predict(&ctx, &MapSample::new().with("marital", "divorced"))
        .await
        .unwrap();
    assert_abs_diff_eq!(divorced.probability_of("no"), 2.0 / 3.0, epsilon = 1e-12);
    assert_abs_diff_eq!(divorced.probability_of("yes"), 1.0 / 3.0, epsilon = 1e-12);
    assert_eq!(divorced.weight(), 3);
}

#[tokio::test]
async fn test_empty_training_set_yields_unpredictable_samples() {
    let ctx = Cancel::new();
    let engine = engine("prediction", Pruning::FixedMinimumGain(0.0), 1);
    let tree = engine
        .grow(&ctx, &marital_features(), MemoryCopy::new(Vec::new()))
        .await
        .unwrap();

    let eval: Vec<Arc<dyn Sample>> = vec![Arc::new(
        MapSample::new().with("marital", "married").with("prediction", "no"),
    )];
    let eval_set = MemoryCopy::new(eval);
    let (success_rate, unpredictable) = tree.test(&ctx, eval_set.as_ref()).await.unwrap();
    assert_eq!(success_rate, 0.0);
    assert_eq!(unpredictable, 1);
}

#[tokio::test]
async fn test_evaluation_counts_matches() {
    let ctx = Cancel::new();
    let tree = grow_marital_tree(&ctx).await;

    let eval: Vec<Arc<dyn Sample>> = vec![
        Arc::new(MapSample::new().with("marital", "married").with("prediction", "no")),
        Arc::new(MapSample::new().with("marital", "single").with("prediction", "yes")),
        Arc::new(MapSample::new().with("marital", "single").with("prediction", "no")),
    ];
    let eval_set = MemoryCopy::new(eval);
    let (success_rate, unpredictable) = tree.test(&ctx, eval_set.as_ref()).await.unwrap();
    assert_abs_diff_eq!(success_rate, 2.0 / 3.0, epsilon = 1e-12);
    assert_eq!(unpredictable, 0);
}
