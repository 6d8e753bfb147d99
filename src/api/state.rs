use crate::gate::ApprovalStore;
use crate::storage::IncidentStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn IncidentStore>,
    pub approvals: Arc<dyn ApprovalStore>,
}

impl AppState {
    /// Both roles served by one backing store.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: IncidentStore + ApprovalStore + 'static,
    {
        Self {
            store: store.clone(),
            approvals: store,
        }
    }
}
