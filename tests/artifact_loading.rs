use rainfall::artifact::{self, PersistedArtifact};
use rainfall::config::AppConfig;
use rainfall::estimator::{DecisionTree, ForestModel, LogisticModel, PersistedEstimator, TreeNode};
use rainfall::service::RainLabel;
use rainfall::{FeatureSchema, FeatureValues, PredictionService};

fn rain_forest() -> ForestModel {
    // humidity >= 80 means rain
    ForestModel {
        n_features: 2,
        trees: vec![DecisionTree {
            nodes: vec![
                TreeNode::Split {
                    feature: 1,
                    threshold: 80.0,
                    left: 1,
                    right: 2,
                },
                TreeNode::Leaf {
                    distribution: vec![0.7, 0.3],
                },
                TreeNode::Leaf {
                    distribution: vec![0.1, 0.9],
                },
            ],
        }],
        feature_importances: Some(vec![0.2, 0.8]),
    }
}

fn config_for(path: &std::path::Path) -> AppConfig {
    AppConfig {
        model_path: path.to_string_lossy().into_owned(),
        ..AppConfig::default()
    }
}

#[test]
fn bundled_schema_drives_prediction() {
    let tmp = tempfile::tempdir().expect("tmpdir");
    let path = tmp.path().join("models").join("rainfall_model.bin");
    let bundle = PersistedArtifact::bundle(
        PersistedEstimator::Forest(rain_forest()),
        vec!["pressure".into(), "humidity".into()],
    );
    artifact::save(&path, &bundle).expect("save");

    let service = PredictionService::from_config(&config_for(&path));
    assert!(service.is_ready());
    assert_eq!(service.schema().names(), ["pressure", "humidity"]);

    let features: FeatureValues = [("humidity", 85.0), ("pressure", 1002.0)].into_iter().collect();
    let result = service.predict(&features).expect("predict");
    assert_eq!(result.label, RainLabel::Rain);
    assert_eq!(result.probability, Some([0.1, 0.9]));
    assert!((result.confidence.unwrap() - 90.0).abs() < 1e-9);
    let importance = result.feature_importance.expect("importance");
    assert_eq!(importance.get_index(0), Some((&"pressure".to_string(), &0.2)));
}

#[test]
fn hand_written_json_artifact_loads() {
    let tmp = tempfile::tempdir().expect("tmpdir");
    let path = tmp.path().join("model.json");
    std::fs::write(
        &path,
        r#"{"model": {"logistic": {"params": [-4.0, 0.05]}}, "feature_names": ["humidity"]}"#,
    )
    .expect("write");

    let service = PredictionService::from_config(&config_for(&path));
    let info = service.model_info();
    assert_eq!(info.model_type, Some("logistic"));
    assert_eq!(info.feature_names, vec!["humidity".to_string()]);
    assert!(info.capabilities.probabilistic);
    assert!(!info.capabilities.explainable);
}

#[test]
fn raw_artifact_uses_configured_default_schema() {
    let tmp = tempfile::tempdir().expect("tmpdir");
    let path = tmp.path().join("raw.bin");
    let mut params = vec![0.0];
    params.extend(std::iter::repeat(0.01).take(10));
    artifact::save(
        &path,
        &PersistedArtifact::Raw(PersistedEstimator::Logistic(LogisticModel::new(params))),
    )
    .expect("save");

    let mut cfg = config_for(&path);
    cfg.default_schema = rainfall::features::DefaultSchema::Daily;
    let service = PredictionService::from_config(&cfg);
    assert!(service.is_ready());
    assert_eq!(service.schema(), &FeatureSchema::daily());
}

#[test]
fn raw_artifact_with_wrong_arity_degrades_to_demo() {
    let tmp = tempfile::tempdir().expect("tmpdir");
    let path = tmp.path().join("raw.bin");
    artifact::save(
        &path,
        &PersistedArtifact::Raw(PersistedEstimator::Logistic(LogisticModel::new(vec![0.0, 1.0]))),
    )
    .expect("save");

    let service = PredictionService::from_config(&config_for(&path));
    assert!(!service.is_ready());
    let reason = service.model_info().unavailable_reason.unwrap();
    assert!(reason.contains("expects 1 features"), "{reason}");
}

#[test]
fn unrecognized_artifact_runs_every_request_in_demo_mode() {
    let tmp = tempfile::tempdir().expect("tmpdir");
    let path = tmp.path().join("model.json");
    std::fs::write(&path, r#"{"weights": [0.1, 0.2], "bias": 0.0}"#).expect("write");

    let service = PredictionService::from_config(&config_for(&path));
    assert!(!service.is_ready());
    for (humidity, cloud_cover, precipitation_3hr, label) in [
        (65.0, 45.0, 0.0, RainLabel::NoRain),
        (90.0, 90.0, 5.0, RainLabel::Rain),
        (0.0, 0.0, 0.0, RainLabel::NoRain),
    ] {
        let features: FeatureValues = [
            ("humidity", humidity),
            ("cloud_cover", cloud_cover),
            ("precipitation_3hr", precipitation_3hr),
        ]
        .into_iter()
        .collect();
        let result = service.predict(&features).expect("demo predict");
        assert!(result.demo_mode);
        assert_eq!(result.label, label);
    }
}

#[test]
fn forest_with_invalid_leaf_degrades_to_demo() {
    let tmp = tempfile::tempdir().expect("tmpdir");
    let path = tmp.path().join("model.bin");
    let mut forest = rain_forest();
    forest.trees[0].nodes[1] = TreeNode::Leaf {
        distribution: vec![0.7, 0.7],
    };
    let bundle = PersistedArtifact::bundle(
        PersistedEstimator::Forest(forest),
        vec!["pressure".into(), "humidity".into()],
    );
    artifact::save(&path, &bundle).expect("save");

    let service = PredictionService::from_config(&config_for(&path));
    assert!(!service.is_ready());
    let reason = service.model_info().unavailable_reason.unwrap();
    assert!(reason.contains("leaf 1"), "{reason}");

    let features: FeatureValues = [("humidity", 85.0), ("pressure", 1002.0)].into_iter().collect();
    let result = service.predict(&features).expect("demo predict");
    assert!(result.demo_mode);
}

#[test]
fn daily_demo_mode_reads_the_daily_cloud_column() {
    let tmp = tempfile::tempdir().expect("tmpdir");
    let mut cfg = config_for(&tmp.path().join("missing.bin"));
    cfg.default_schema = rainfall::features::DefaultSchema::Daily;
    cfg.demo.threshold = 50.0;
    let service = PredictionService::from_config(&cfg);
    assert!(!service.is_ready());
    assert_eq!(service.schema(), &FeatureSchema::daily());

    let features: FeatureValues = [("humidity", 90.0), ("cloud", 90.0)].into_iter().collect();
    let result = service.predict(&features).expect("demo predict");
    assert!(result.demo_mode);
    assert_eq!(result.label, RainLabel::Rain);
    assert!((result.confidence.unwrap() - 54.0).abs() < 1e-9);
}

#[test]
fn corrupt_and_missing_artifacts_degrade_to_demo() {
    let tmp = tempfile::tempdir().expect("tmpdir");
    let corrupt = tmp.path().join("model.bin");
    std::fs::write(&corrupt, b"\x80\x04\x95pickle").expect("write");

    for path in [corrupt, tmp.path().join("missing.bin")] {
        let service = PredictionService::from_config(&config_for(&path));
        assert!(!service.is_ready());
        assert_eq!(service.schema().len(), 12);
        let result = service.predict(&FeatureValues::new()).expect("demo predict");
        assert!(result.demo_mode);
    }
}

#[test]
fn shipped_sample_artifact_loads() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("models/rainfall_model.json");
    let model = artifact::load(&path, &FeatureSchema::daily()).expect("sample artifact");
    assert_eq!(model.feature_names(), &FeatureSchema::meteorological());
}
