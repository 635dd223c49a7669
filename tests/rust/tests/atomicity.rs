//! A save is committed by every process or by none


use anyhow::Result;
use checkpoint::CheckpointManager;
use ckpt_core::{CheckpointConfig, Error, InProcessGroup};
use common::*;
use param_tree::Mesh;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use storage::{LocalStorage, StorageBackend};
use tempfile::tempdir;

/// Outcome of one process: the save result and the steps it then sees
type Outcome = (std::result::Result<bool, Error>, Option<u64>);

/// Save `step` from two processes; `faulty` selects the storage of each process
async fn group_save(
    root: &Path,
    step: u64,
    timeout: Duration,
    faulty: impl Fn(usize) -> Option<(&'static str, Fault)>,
) -> Result<Vec<Outcome>> {
    let mesh = Mesh::new([("x", 4)])?;
    let handles: Vec<_> = InProcessGroup::new(2)
        .into_iter()
        .enumerate()
        .map(|(process, member)| {
            let root = root.to_path_buf();
            let mesh = mesh.clone();
            let storage: Arc<dyn StorageBackend> = match faulty(process) {
                Some((pattern, fault)) => Arc::new(FaultyStorage::new(&root, pattern, fault)),
                None => Arc::new(LocalStorage::new(&root)),
            };
            tokio::spawn(async move {
                let manager = member_manager(&root, member, storage, timeout).await?;
                let tree = model_tree(&mesh, [Some("x"), None], &mesh.devices_for_process(process, 2), 0.0)?;
                let result = manager.save(step, &tree).await;
                anyhow::Ok((result, manager.latest_step().await?))
            })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await??);
    }
    Ok(outcomes)
}

#[tokio::test]
async fn test_failed_shard_write_commits_nothing() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;

    let outcomes = group_save(dir.path(), 7, Duration::from_secs(10), |process| {
        (process == 1).then_some(("shards/", Fault::Fail))
    })
    .await?;

    assert!(matches!(outcomes[0].0, Err(Error::PartialWrite { step: 7, .. })));
    assert!(matches!(outcomes[1].0, Err(Error::Storage { .. })));
    for (_, latest) in &outcomes {
        assert_eq!(*latest, None);
    }

    // The leader discarded the staging directory
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_failed_index_write_commits_nothing() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;

    let outcomes = group_save(dir.path(), 4, Duration::from_secs(10), |process| {
        (process == 0).then_some(("/index", Fault::Fail))
    })
    .await?;

    assert!(matches!(outcomes[0].0, Err(Error::Storage { .. })));
    assert!(matches!(outcomes[1].0, Err(Error::PartialWrite { step: 4, .. })));
    assert!(outcomes.iter().all(|(_, latest)| latest.is_none()));

    // Reopening clears whatever the slower writer left behind
    let manager = open_manager(dir.path()).await?;
    assert!(manager.all_steps().await?.is_empty());
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_stalled_writer_times_out_everywhere() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;

    let outcomes = group_save(dir.path(), 9, Duration::from_millis(200), |process| {
        (process == 1).then_some(("shards/", Fault::Stall(Duration::from_millis(600))))
    })
    .await?;

    for (result, latest) in &outcomes {
        assert!(matches!(result, Err(Error::PartialWrite { step: 9, .. })));
        assert_eq!(*latest, None);
    }
    Ok(())
}

#[tokio::test]
async fn test_retry_after_failure_commits() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;

    group_save(dir.path(), 7, Duration::from_secs(10), |process| {
        (process == 1).then_some(("shards/", Fault::Fail))
    })
    .await?;

    let outcomes = group_save(dir.path(), 7, Duration::from_secs(10), |_| None).await?;
    for (result, latest) in &outcomes {
        assert!(matches!(result, Ok(true)));
        assert_eq!(*latest, Some(7));
    }

    let manager = open_manager(dir.path()).await?;
    let mesh = Mesh::new([("x", 4)])?;
    let mut template = full_model(&mesh, [None, None], 1.0)?;
    manager.maybe_restore(&mut template).await?;
    assert_eq!(template, full_model(&mesh, [None, None], 0.0)?);
    Ok(())
}

#[tokio::test]
async fn test_resaving_committed_step_is_rejected() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let manager = open_manager(dir.path()).await?;
    let mesh = Mesh::single_device();

    manager.save(3, &full_model(&mesh, [None, None], 1.0)?).await?;
    let result = manager.save(3, &full_model(&mesh, [None, None], 2.0)?).await;
    assert!(matches!(result, Err(Error::StepAlreadyExists { step: 3 })));

    let mut template = full_model(&mesh, [None, None], 0.0)?;
    manager.maybe_restore(&mut template).await?;
    assert_eq!(template, full_model(&mesh, [None, None], 1.0)?);
    Ok(())
}

#[tokio::test]
async fn test_pruning_never_touches_kept_steps() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let manager = CheckpointManager::new(CheckpointConfig::new(dir.path()).max_to_keep(2)).await?;
    let mesh = Mesh::new([("x", 2)])?;

    for step in 1..=5u64 {
        manager.save(step * 10, &full_model(&mesh, [Some("x"), None], step as f32)?).await?;
    }
    assert_eq!(manager.all_steps().await?, vec![40, 50]);

    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir.path())? {
        names.push(entry?.file_name().to_string_lossy().to_string());
    }
    names.sort();
    assert_eq!(names, vec!["40", "50"]);

    let mut template = full_model(&mesh, [Some("x"), None], 0.0)?;
    let options = checkpoint::RestoreOptions::new().step(40);
    manager.maybe_restore_with(&mut template, options).await?;
    assert_eq!(template, full_model(&mesh, [Some("x"), None], 4.0)?);
    Ok(())
}

#[tokio::test]
async fn test_failed_listing_on_one_process_spares_later_saves() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let mesh = Mesh::new([("x", 4)])?;

    let handles: Vec<_> = InProcessGroup::new(2)
        .into_iter()
        .enumerate()
        .map(|(process, member)| {
            let root = dir.path().to_path_buf();
            let mesh = mesh.clone();
            let storage: Arc<dyn StorageBackend> = if process == 1 {
                Arc::new(FaultyStorage::failing_listings(&root, 1))
            } else {
                Arc::new(LocalStorage::new(&root))
            };
            tokio::spawn(async move {
                let manager = member_manager(&root, member, storage, Duration::from_secs(10)).await?;
                let tree = model_tree(&mesh, [Some("x"), None], &mesh.devices_for_process(process, 2), 0.0)?;
                let mut results = Vec::new();
                for step in 1..=4 {
                    results.push(manager.save(step, &tree).await);
                }
                anyhow::Ok((results, manager.latest_step().await?))
            })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await??);
    }

    assert!(matches!(outcomes[0].0[0], Err(Error::PartialWrite { step: 1, .. })));
    assert!(matches!(outcomes[1].0[0], Err(Error::Storage { .. })));
    for (results, latest) in &outcomes {
        assert!(results[1..].iter().all(|r| matches!(r, Ok(true))));
        assert_eq!(*latest, Some(4));
    }

    let manager = open_manager(dir.path()).await?;
    assert_eq!(manager.all_steps().await?, vec![2, 3, 4]);
    Ok(())
}

#[tokio::test]
async fn test_diverging_trees_commit_nothing() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let mesh = Mesh::new([("x", 4)])?;

    let handles: Vec<_> = InProcessGroup::new(2)
        .into_iter()
        .enumerate()
        .map(|(process, member)| {
            let root = dir.path().to_path_buf();
            let mesh = mesh.clone();
            tokio::spawn(async move {
                let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(&root));
                let manager = member_manager(&root, member, storage, Duration::from_secs(10)).await?;
                let mut tree = model_tree(&mesh, [Some("x"), None], &mesh.devices_for_process(process, 2), 0.0)?;
                if process == 1 {
                    tree.remove(&"decoder.embedding".into());
                }
                let result = manager.save(6, &tree).await;
                anyhow::Ok((result, manager.latest_step().await?))
            })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await??);
    }

    assert!(matches!(outcomes[0].0, Err(Error::PartialWrite { step: 6, .. })));
    assert!(matches!(
        outcomes[1].0,
        Err(Error::PathMismatch { ref path }) if path == "decoder.embedding"
    ));
    assert!(outcomes.iter().all(|(_, latest)| latest.is_none()));
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}
