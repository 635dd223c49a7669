//! Saved values survive any change of mesh and sharding


use anyhow::Result;
use ckpt_core::InProcessGroup;
use common::*;
use param_tree::{Mesh, ParamPath};
use std::sync::Arc;
use std::time::Duration;
use storage::{LocalStorage, StorageBackend};
use tempfile::tempdir;

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_round_trip_across_shardings() -> Result<()> {
    init_tracing();

    let cases: Vec<(Mesh, [Option<&str>; 2], Mesh, [Option<&str>; 2])> = vec![
        (Mesh::single_device(), [None, None], Mesh::new([("x", 4)])?, [Some("x"), None]),
        (Mesh::new([("x", 4)])?, [Some("x"), None], Mesh::single_device(), [None, None]),
        (Mesh::new([("x", 3)])?, [None, Some("x")], Mesh::new([("x", 2)])?, [Some("x"), None]),
        (
            Mesh::new([("data", 2), ("model", 2)])?,
            [Some("data"), Some("model")],
            Mesh::new([("data", 2), ("model", 2)])?,
            [Some("model"), Some("data")],
        ),
        (Mesh::new([("a", 2), ("b", 3)])?, [Some("b"), None], Mesh::new([("a", 5)])?, [None, Some("a")]),
    ];

    for (step, (saved_mesh, saved_dims, target_mesh, target_dims)) in cases.into_iter().enumerate() {
        let dir = tempdir()?;
        let manager = open_manager(dir.path()).await?;

        let saved = full_model(&saved_mesh, saved_dims, 0.0)?;
        assert!(manager.save(step as u64 + 1, &saved).await?);

        let mut template = full_model(&target_mesh, target_dims, -50.0)?;
        let (restored_step, _) = manager.maybe_restore(&mut template).await?;
        assert_eq!(restored_step, step as u64 + 1);

        // Same logical values, laid out the way the template asked
        assert_eq!(template, full_model(&target_mesh, target_dims, 0.0)?);
        for (path, tensor) in &template {
            assert!(tensor.same_values(saved.get(path).unwrap())?, "{} changed", path);
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_group_save_writes_each_slot_once() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let mesh = Mesh::new([("data", 2), ("model", 2)])?;
    let dims = [Some("data"), None];

    let handles: Vec<_> = InProcessGroup::new(2)
        .into_iter()
        .enumerate()
        .map(|(process, member)| {
            let root = dir.path().to_path_buf();
            let mesh = mesh.clone();
            tokio::spawn(async move {
                let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(&root));
                let manager = member_manager(&root, member, storage, TIMEOUT).await?;
                let tree = model_tree(&mesh, dims, &mesh.devices_for_process(process, 2), 0.0)?;
                anyhow::Ok(manager.save(3, &tree).await?)
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.await??);
    }

    // Five weights with two data slots each, plus the counter
    let storage = LocalStorage::new(dir.path());
    let artifacts = storage.list("3/shards/").await?;
    assert_eq!(artifacts.len(), MODEL.len() * 2 + 1);
    assert!(storage.exists("3/index").await?);

    // A single process restores the whole model
    let manager = open_manager(dir.path()).await?;
    let mut template = full_model(&Mesh::single_device(), [None, None], 7.0)?;
    manager.maybe_restore(&mut template).await?;
    assert_eq!(template, full_model(&Mesh::single_device(), [None, None], 0.0)?);
    Ok(())
}

#[tokio::test]
async fn test_group_restore_of_single_process_save() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;

    let saver = open_manager(dir.path()).await?;
    saver.save(11, &full_model(&Mesh::new([("x", 3)])?, [None, Some("x")], 0.0)?).await?;
    saver.close();

    let target = Mesh::new([("x", 4)])?;
    let dims = [Some("x"), None];
    let handles: Vec<_> = InProcessGroup::new(2)
        .into_iter()
        .enumerate()
        .map(|(process, member)| {
            let root = dir.path().to_path_buf();
            let target = target.clone();
            tokio::spawn(async move {
                let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(&root));
                let manager = member_manager(&root, member, storage, TIMEOUT).await?;
                let devices = target.devices_for_process(process, 2);
                let mut template = model_tree(&target, dims, &devices, 1.0)?;
                let (step, _) = manager.maybe_restore(&mut template).await?;
                anyhow::Ok((step, template, model_tree(&target, dims, &devices, 0.0)?))
            })
        })
        .collect();

    for handle in handles {
        let (step, restored, expected) = handle.await??;
        assert_eq!(step, 11);
        assert_eq!(restored, expected);
        let kernel = restored.get(&ParamPath::parse("decoder.layers.0.mlp.kernel")).unwrap();
        assert_eq!(kernel.shards().len(), 2);
    }
    Ok(())
}
