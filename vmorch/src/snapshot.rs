use std::sync::Arc;

use tracing::info;

use crate::engine::{EngineFeatures, NativeEngine};
use crate::errors::{ConfigError, Error, Result};
use crate::model::command::SnapshotRef;

/// Validated pass-through to the engine's snapshot entry points. Snapshot
/// existence lives in the engine only.
pub struct SnapshotManager {
    engine: Arc<dyn NativeEngine>,
    features: EngineFeatures,
}

impl SnapshotManager {
    pub fn new(engine: Arc<dyn NativeEngine>, features: EngineFeatures) -> Self {
        Self { engine, features }
    }

    pub async fn create(&self, snapshot: &SnapshotRef) -> Result<()> {
        self.check("create_snapshot", snapshot)?;
        let created = self
            .engine
            .create_snapshot(&snapshot.vm_name, &snapshot.snapshot_name)
            .await?;
        expect_true(created, "create", snapshot)?;
        info!(
            "Created snapshot {} of VM {}",
            snapshot.snapshot_name, snapshot.vm_name
        );
        Ok(())
    }

    pub async fn restore(&self, snapshot: &SnapshotRef) -> Result<()> {
        self.check("restore_snapshot", snapshot)?;
        let restored = self
            .engine
            .restore_snapshot(&snapshot.vm_name, &snapshot.snapshot_name)
            .await?;
        expect_true(restored, "restore", snapshot)?;
        info!(
            "Restored VM {} to snapshot {}",
            snapshot.vm_name, snapshot.snapshot_name
        );
        Ok(())
    }

    pub async fn delete(&self, snapshot: &SnapshotRef) -> Result<()> {
        self.check("delete_snapshot", snapshot)?;
        let deleted = self
            .engine
            .delete_snapshot(&snapshot.vm_name, &snapshot.snapshot_name)
            .await?;
        expect_true(deleted, "delete", snapshot)?;
        info!(
            "Deleted snapshot {} of VM {}",
            snapshot.snapshot_name, snapshot.vm_name
        );
        Ok(())
    }

    pub async fn list(&self, vm_name: &str) -> Result<Vec<String>> {
        if !self.features.snapshots {
            return Err(Error::Unsupported("list_snapshots".into()));
        }
        if vm_name.trim().is_empty() {
            return Err(ConfigError::MissingField("vmName").into());
        }
        Ok(self.engine.list_snapshots(vm_name).await?)
    }

    fn check(&self, operation: &'static str, snapshot: &SnapshotRef) -> Result<()> {
        if !self.features.snapshots {
            return Err(Error::Unsupported(operation.into()));
        }
        if snapshot.vm_name.trim().is_empty() {
            return Err(ConfigError::MissingField("vmName").into());
        }
        if snapshot.snapshot_name.trim().is_empty() {
            return Err(ConfigError::MissingField("snapshotName").into());
        }
        Ok(())
    }
}

fn expect_true(ok: bool, verb: &str, snapshot: &SnapshotRef) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(Error::NativeCall(format!(
            "failed to {} snapshot {} of VM {}",
            verb, snapshot.snapshot_name, snapshot.vm_name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEngine;

    fn reference(vm: &str, snapshot: &str) -> SnapshotRef {
        SnapshotRef {
            vm_name: vm.into(),
            snapshot_name: snapshot.into(),
        }
    }

    fn manager(engine: &Arc<MockEngine>) -> SnapshotManager {
        SnapshotManager::new(engine.clone(), engine.features())
    }

    #[tokio::test]
    async fn create_list_restore_delete() {
        let engine = Arc::new(MockEngine::new());
        let snapshots = manager(&engine);

        snapshots.create(&reference("vm1", "clean")).await.unwrap();
        assert_eq!(snapshots.list("vm1").await.unwrap(), vec!["clean"]);
        snapshots.restore(&reference("vm1", "clean")).await.unwrap();
        snapshots.delete(&reference("vm1", "clean")).await.unwrap();
        assert!(snapshots.list("vm1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_names_fail_before_the_engine_is_called() {
        let engine = Arc::new(MockEngine::new());
        let snapshots = manager(&engine);

        let err = snapshots.create(&reference("vm1", "")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::MissingField("snapshotName"))
        ));
        let err = snapshots.restore(&reference(" ", "s")).await.unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::MissingField("vmName"))));
        assert_eq!(engine.calls("create_snapshot"), 0);
        assert_eq!(engine.calls("restore_snapshot"), 0);
    }

    #[tokio::test]
    async fn missing_capability_is_unsupported() {
        let engine = Arc::new(MockEngine::new().with_features(EngineFeatures {
            snapshots: false,
            ..EngineFeatures::all()
        }));
        let snapshots = manager(&engine);

        let err = snapshots.create(&reference("vm1", "s")).await.unwrap_err();
        assert!(matches!(err, Error::Unsupported(ref op) if op == "create_snapshot"));
        let err = snapshots.list("vm1").await.unwrap_err();
        assert!(matches!(err, Error::Unsupported(ref op) if op == "list_snapshots"));
    }

    #[tokio::test]
    async fn engine_refusal_becomes_native_call_error() {
        let engine = Arc::new(MockEngine::new());
        engine.refuse_snapshots(true);
        let snapshots = manager(&engine);

        let err = snapshots.create(&reference("vm1", "s")).await.unwrap_err();
        assert!(matches!(err, Error::NativeCall(_)));

        let err = snapshots.restore(&reference("vm1", "ghost")).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to restore snapshot ghost of VM vm1"
        );
    }
}
