//! Filtered saves and restores only touch the selected paths


use anyhow::Result;
use checkpoint::{RestoreOptions, SaveOptions};
use ckpt_core::CustomMetadata;
use common::*;
use param_tree::{Mesh, ParamPath, PathFilter};
use serde_json::json;
use tempfile::tempdir;

fn lora_paths() -> Vec<ParamPath> {
    vec![
        ParamPath::parse("decoder.layers.0.attention.lora_a"),
        ParamPath::parse("decoder.layers.0.attention.lora_b"),
    ]
}

#[tokio::test]
async fn test_lora_save_and_restore_changes_only_adapters() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let manager = open_manager(dir.path()).await?;
    let mesh = Mesh::new([("x", 2)])?;

    let trained = full_model(&mesh, [Some("x"), None], 3.0)?;
    assert!(manager.save_with(20, &trained, SaveOptions::lora_only()).await?);
    assert_eq!(manager.record(20).await?.paths_written, lora_paths().into_iter().collect());

    let before = full_model(&mesh, [None, Some("x")], -1.0)?;
    let mut template = before.clone();
    manager
        .maybe_restore_with(&mut template, RestoreOptions::lora_only())
        .await?;

    assert_eq!(changed_paths(&before, &template), lora_paths());
    for path in lora_paths() {
        assert!(template.get(&path).unwrap().same_values(trained.get(&path).unwrap())?);
    }
    Ok(())
}

#[tokio::test]
async fn test_filtered_restore_of_full_checkpoint() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let manager = open_manager(dir.path()).await?;
    let mesh = Mesh::new([("x", 4)])?;

    manager.save(1, &full_model(&mesh, [None, Some("x")], 0.0)?).await?;

    // Everything except the adapters
    let before = full_model(&Mesh::single_device(), [None, None], 9.0)?;
    let mut template = before.clone();
    let options = RestoreOptions::new().filter(PathFilter::lora().not());
    manager.maybe_restore_with(&mut template, options).await?;

    let changed = changed_paths(&before, &template);
    assert_eq!(changed.len(), MODEL.len() - 2 + 1);
    assert!(lora_paths().iter().all(|p| !changed.contains(p)));
    assert!(changed.contains(&ParamPath::parse(COUNTER)));
    Ok(())
}

#[tokio::test]
async fn test_template_missing_paths_are_skipped() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let manager = open_manager(dir.path()).await?;
    let mesh = Mesh::single_device();

    manager.save(2, &full_model(&mesh, [None, None], 0.0)?).await?;

    let mut template = full_model(&mesh, [None, None], 5.0)?;
    let embedding = ParamPath::parse("decoder.embedding");
    template.remove(&embedding);
    let before = template.clone();

    manager.maybe_restore(&mut template).await?;
    assert!(!template.contains(&embedding));
    assert_eq!(changed_paths(&before, &template).len(), before.len());
    Ok(())
}

#[tokio::test]
async fn test_metadata_round_trips_regardless_of_filters() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let manager = open_manager(dir.path()).await?;
    let mesh = Mesh::single_device();

    let mut metadata = CustomMetadata::new();
    metadata.insert("epoch".to_string(), json!(12));
    metadata.insert("loss".to_string(), json!(0.03125));
    metadata.insert("schedule".to_string(), json!({"warmup": [0, 100], "decay": "cosine"}));
    metadata.insert("note".to_string(), json!("réglage fin ✓"));
    metadata.insert("empty".to_string(), json!(null));

    let save = SaveOptions::lora_only().custom_metadata(metadata.clone());
    manager.save_with(30, &full_model(&mesh, [None, None], 0.0)?, save).await?;

    for options in [
        RestoreOptions::new(),
        RestoreOptions::lora_only(),
        RestoreOptions::new().filter(PathFilter::contains_key("nothing")),
    ] {
        let mut template = full_model(&mesh, [None, None], 1.0)?;
        let (step, restored) = manager.maybe_restore_with(&mut template, options).await?;
        assert_eq!(step, 30);
        assert_eq!(restored, metadata);
        assert_eq!(serde_json::to_string(&restored)?, serde_json::to_string(&metadata)?);
    }
    Ok(())
}
