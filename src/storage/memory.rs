//! In-process store for tests and throwaway runs.

use super::{IncidentStore, StoreError};
use crate::action::ActionName;
use crate::gate::{ApprovalStore, ApprovalToken};
use crate::incident::{Incident, IncidentId, IncidentUpdate};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryStore {
    incidents: RwLock<HashMap<IncidentId, Incident>>,
    approvals: RwLock<Vec<ApprovalToken>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.incidents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.incidents.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl IncidentStore for MemoryStore {
    async fn put_incident(&self, incident: &Incident) -> Result<IncidentId, StoreError> {
        self.incidents
            .write()
            .await
            .insert(incident.id, incident.clone());
        Ok(incident.id)
    }

    async fn update_incident(
        &self,
        id: IncidentId,
        update: &IncidentUpdate,
    ) -> Result<(), StoreError> {
        let mut incidents = self.incidents.write().await;
        let incident = incidents.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        update.apply_to(incident);
        Ok(())
    }

    async fn get_incident(&self, id: IncidentId) -> Result<Option<Incident>, StoreError> {
        Ok(self.incidents.read().await.get(&id).cloned())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Incident>, StoreError> {
        let mut all: Vec<Incident> = self.incidents.read().await.values().cloned().collect();
        all.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        all.truncate(limit);
        Ok(all)
    }
}

#[async_trait::async_trait]
impl ApprovalStore for MemoryStore {
    async fn grant(&self, token: ApprovalToken) -> Result<(), StoreError> {
        self.approvals.write().await.push(token);
        Ok(())
    }

    async fn lookup(
        &self,
        action: ActionName,
        now: DateTime<Utc>,
    ) -> Result<Option<ApprovalToken>, StoreError> {
        Ok(self
            .approvals
            .read()
            .await
            .iter()
            .rev()
            .find(|t| t.action == action && t.is_valid_at(now))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::LogLine;
    use crate::incident::PipelineState;

    #[tokio::test]
    async fn test_update_applies_partial_fields() {
        let store = MemoryStore::new();
        let i = Incident::detected(&LogLine::new("ERROR x"));
        store.put_incident(&i).await.unwrap();

        store
            .update_incident(i.id, &IncidentUpdate::state(PipelineState::Summarizing))
            .await
            .unwrap();
        let back = store.get_incident(i.id).await.unwrap().unwrap();
        assert_eq!(back.state, PipelineState::Summarizing);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .update_incident(uuid::Uuid::new_v4(), &IncidentUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_latest_valid_grant_wins() {
        let store = MemoryStore::new();
        store
            .grant(ApprovalToken::new(ActionName::Escalate, "first", None))
            .await
            .unwrap();
        store
            .grant(ApprovalToken::new(ActionName::Escalate, "second", None))
            .await
            .unwrap();
        let t = store.lookup(ActionName::Escalate, Utc::now()).await.unwrap().unwrap();
        assert_eq!(t.approved_by, "second");
        assert!(store
            .lookup(ActionName::RestartApache, Utc::now())
            .await
            .unwrap()
            .is_none());
    }
}
