use std::sync::Arc;

use anyhow::{anyhow, Result};
use data_model::ProtectedInstance;
use tempfile::TempDir;

use crate::{
    requests::{RequestPayload, StateMachineUpdateRequest, UpdateOutcome, UpsertInstanceRequest},
    SafetyNetState,
};

pub struct TestStateStore {
    pub state: Arc<SafetyNetState>,
    // Held so the database directory outlives the store.
    _temp_dir: TempDir,
}

impl TestStateStore {
    pub async fn new() -> Result<TestStateStore> {
        let temp_dir = tempfile::tempdir()?;
        let state = SafetyNetState::new(temp_dir.path().join("state")).await?;
        Ok(TestStateStore {
            state,
            _temp_dir: temp_dir,
        })
    }

    /// Register a primary and return the stored row.
    pub async fn register(&self, instance: ProtectedInstance) -> Result<ProtectedInstance> {
        register(&self.state, instance).await
    }
}

pub async fn register(state: &SafetyNetState, instance: ProtectedInstance) -> Result<ProtectedInstance> {
    let outcome = state
        .write(StateMachineUpdateRequest::new(RequestPayload::UpsertInstance(
            UpsertInstanceRequest { instance },
        )))
        .await?;
    match outcome {
        UpdateOutcome::Upserted(instance) => Ok(instance),
        other => Err(anyhow!("unexpected upsert outcome: {:?}", other)),
    }
}
