//! Older format generations, cold starts and disabled managers


use anyhow::Result;
use bytes::Bytes;
use checkpoint::{CheckpointManager, SaveOptions};
use ckpt_core::{CheckpointConfig, CustomMetadata, Error, FormatGeneration};
use common::*;
use param_tree::{DType, Mesh, ParamPath, ParameterTree, PathKey, ShardingSpec, Tensor};
use serde_json::json;
use std::path::Path;
use storage::{LocalStorage, StorageBackend};
use tempfile::tempdir;

/// Checkpoint root holding step 30 as written by a generation 1 writer
const GEN1_FIXTURE: &str = "fixtures/gen1";

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

fn experts_bias() -> ParamPath {
    ParamPath::new(vec![PathKey::from("experts"), PathKey::from("0"), PathKey::from("bias")])
}

/// Zeroed template for the fixture's tensors, with the kernel sharded by rows
fn gen1_template() -> Result<ParameterTree> {
    let mesh = Mesh::new([("x", 2)])?;
    let mut tree = ParameterTree::new();
    tree.insert(
        "encoder.layers.0.kernel",
        Tensor::from_f32(vec![2, 3], ShardingSpec::from_axes(mesh, &[Some("x"), None])?, &[0.0; 6])?,
    );
    tree.insert(experts_bias(), Tensor::from_f32(vec![2], ShardingSpec::single_device(1), &[0.0; 2])?);
    tree.insert(
        "opt_state.count",
        Tensor::from_global(DType::I32, vec![], ShardingSpec::single_device(0), Bytes::from(vec![0u8; 4]))?,
    );
    Ok(tree)
}

#[tokio::test]
async fn test_checked_in_single_blob_restores() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    copy_dir(&Path::new(env!("CARGO_MANIFEST_DIR")).join(GEN1_FIXTURE), dir.path())?;

    let manager = open_manager(dir.path()).await?;
    assert_eq!(manager.latest_step().await?, Some(30));

    let mut template = gen1_template()?;
    let (step, metadata) = manager.maybe_restore(&mut template).await?;
    assert_eq!(step, 30);
    assert_eq!(metadata["epoch"], json!(3));
    assert_eq!(metadata["tag"], json!("frozen"));

    let kernel = template.get(&"encoder.layers.0.kernel".into()).expect("kernel");
    assert_eq!(kernel.shards().len(), 2);
    assert_eq!(kernel.to_f32_vec()?, vec![0.0, 0.5, 1.0, 1.5, 2.0, 2.5]);
    let bias = template.get(&experts_bias()).expect("bias");
    assert_eq!(bias.to_f32_vec()?, vec![1.5, -2.0]);
    let count = template.get(&"opt_state.count".into()).expect("count");
    assert_eq!(count.gather()?, Bytes::copy_from_slice(&30i32.to_le_bytes()));

    let record = manager.record(30).await?;
    assert_eq!(record.format_generation, FormatGeneration::SingleBlob);
    assert_eq!(record.created_at.to_rfc3339(), "2024-03-01T08:30:00+00:00");
    assert!(record.paths_written.contains(&experts_bias()));
    assert_eq!(record.paths_written.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_single_blob_checkpoint_restores_through_current_api() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let mesh = Mesh::new([("x", 2)])?;

    let legacy = CheckpointManager::new(CheckpointConfig::new(dir.path()).format_generation(FormatGeneration::SingleBlob)).await?;
    let options = SaveOptions::new().metadata("loss", 0.5).metadata("tag", "v1");
    assert!(legacy.save_with(42, &full_model(&mesh, [Some("x"), None], 0.0)?, options).await?);
    legacy.close();

    assert!(dir.path().join("42/checkpoint").exists());
    assert!(!dir.path().join("42/index").exists());

    let manager = open_manager(dir.path()).await?;
    assert_eq!(manager.latest_step().await?, Some(42));

    let target = Mesh::new([("x", 4)])?;
    let mut template = full_model(&target, [None, Some("x")], -2.0)?;
    let (step, metadata) = manager.maybe_restore(&mut template).await?;

    assert_eq!(step, 42);
    assert_eq!(metadata["loss"], json!(0.5));
    assert_eq!(metadata["tag"], json!("v1"));
    assert_eq!(template, full_model(&target, [None, Some("x")], 0.0)?);
    assert_eq!(manager.record(42).await?.format_generation, FormatGeneration::SingleBlob);
    Ok(())
}

#[tokio::test]
async fn test_generations_coexist_in_one_root() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let mesh = Mesh::single_device();

    let legacy = CheckpointManager::new(CheckpointConfig::new(dir.path()).format_generation(FormatGeneration::SingleBlob)).await?;
    legacy.save(1, &full_model(&mesh, [None, None], 1.0)?).await?;
    legacy.close();

    let manager = open_manager(dir.path()).await?;
    manager.save(2, &full_model(&mesh, [None, None], 2.0)?).await?;
    assert_eq!(manager.all_steps().await?, vec![1, 2]);

    for step in [1, 2] {
        let mut template = full_model(&mesh, [None, None], 0.0)?;
        let options = checkpoint::RestoreOptions::new().step(step);
        manager.maybe_restore_with(&mut template, options).await?;
        assert_eq!(template, full_model(&mesh, [None, None], step as f32)?);
    }
    Ok(())
}

#[tokio::test]
async fn test_newer_generation_is_rejected() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let storage = LocalStorage::new(dir.path());
    storage
        .write("8/index", Bytes::from_static(br#"{"format_generation": 7, "step": 8, "tensors": []}"#))
        .await?;

    let manager = open_manager(dir.path()).await?;
    let mut template = full_model(&Mesh::single_device(), [None, None], 0.0)?;
    let result = manager.maybe_restore(&mut template).await;
    assert!(matches!(result, Err(Error::UnsupportedGeneration { found: 7, .. })));
    Ok(())
}

#[tokio::test]
async fn test_missing_artifact_is_reported() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let manager = open_manager(dir.path()).await?;
    let mesh = Mesh::new([("x", 2)])?;
    manager.save(5, &full_model(&mesh, [Some("x"), None], 0.0)?).await?;

    LocalStorage::new(dir.path()).delete("5/shards/00000-00001.bin").await?;

    let before = full_model(&mesh, [Some("x"), None], 3.0)?;
    let mut template = before.clone();
    let result = manager.maybe_restore(&mut template).await;
    assert!(matches!(result, Err(Error::MissingArtifact { .. })));
    assert_eq!(template, before);
    Ok(())
}

#[tokio::test]
async fn test_cold_start_leaves_template_untouched() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let manager = open_manager(&dir.path().join("fresh")).await?;

    let before = full_model(&Mesh::new([("x", 2)])?, [Some("x"), None], 4.0)?;
    let mut template = before.clone();
    let (step, metadata) = manager.maybe_restore(&mut template).await?;

    assert_eq!((step, metadata), (0, CustomMetadata::new()));
    assert_eq!(template, before);
    assert_eq!(manager.latest_step().await?, None);
    Ok(())
}

#[tokio::test]
async fn test_disabled_manager_creates_nothing() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let manager = CheckpointManager::new(CheckpointConfig::disabled()).await?;

    let tree = full_model(&Mesh::single_device(), [None, None], 0.0)?;
    assert!(!manager.save(1, &tree).await?);
    assert_eq!(manager.latest_step().await?, None);
    assert!(manager.all_steps().await?.is_empty());
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);

    let mut template = tree.clone();
    assert_eq!(manager.maybe_restore(&mut template).await?.0, 0);
    assert_eq!(template, tree);
    Ok(())
}
