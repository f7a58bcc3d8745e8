//! Config loading tests

use std::io::Write;

use candle_animatediff::{
    AttentionError, AttentionKind, CrossAttentionConfig, ReferenceFrames, Result,
    SpatialTransformer, SpatialTransformerConfig, load_config,
};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tempfile::NamedTempFile;

fn write_json(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_spatial_config() -> Result<()> {
    let file = write_json(
        r#"{
            "in_channels": 32,
            "n_heads": 2,
            "d_head": 16,
            "depth": 2,
            "context_dim": null,
            "use_linear": true,
            "attention": "cross_frame",
            "cross_frame": { "chunk_size": 1, "reference_frames": "previous" }
        }"#,
    );
    let config: SpatialTransformerConfig = load_config(file.path())?;

    assert_eq!(config.in_channels, 32);
    assert_eq!(config.inner_dim(), 32);
    assert_eq!(config.depth, 2);
    assert_eq!(config.context_dim, None);
    assert!(config.use_linear);
    assert!(config.gated_ff);
    assert_eq!(config.attention, AttentionKind::CrossFrame);
    assert_eq!(config.cross_frame.chunk_size, 1);
    assert_eq!(config.cross_frame.reference_frames, ReferenceFrames::Previous);

    // the loaded config builds a working layer
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = SpatialTransformer::new(vb, &config)?;
    let x = Tensor::randn(0f32, 1.0, (3, 32, 2, 2), &device)?;
    assert_eq!(model.forward(&x, None)?.dims(), x.dims());
    Ok(())
}

#[test]
fn test_load_attention_config_defaults() -> Result<()> {
    let file = write_json(r#"{ "query_dim": 64, "heads": 4, "dim_head": 16 }"#);
    let config: CrossAttentionConfig = load_config(file.path())?;

    assert_eq!(config.inner_dim(), 64);
    assert_eq!(config.kv_dim(), 64);
    assert_eq!(config.dropout, 0.0);
    assert!(!config.enable_flash_attention);
    Ok(())
}

#[test]
fn test_missing_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.json");
    let err = load_config::<SpatialTransformerConfig>(&path).unwrap_err();
    assert!(matches!(err, AttentionError::ConfigRead { .. }));
}

#[test]
fn test_malformed_config_file() {
    let file = write_json(r#"{ "in_channels": "wide" }"#);
    let err = load_config::<SpatialTransformerConfig>(file.path()).unwrap_err();
    assert!(matches!(err, AttentionError::ConfigParse { .. }));
    assert!(!err.is_shape_error());
}

#[test]
fn test_config_round_trips_through_json() {
    let config = SpatialTransformerConfig {
        cross_frame: candle_animatediff::CrossFrameConfig {
            chunk_size: 3,
            reference_frames: ReferenceFrames::Explicit(vec![0, 0, 1, 2]),
        },
        ..Default::default()
    };
    let json = serde_json::to_string(&config).unwrap();
    let back: SpatialTransformerConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, config);
}
