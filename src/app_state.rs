use std::collections::BTreeSet;
use std::sync::Arc;

use crate::db::{ProgressStore, RecordStore};
use crate::models::stage::Stage;
use crate::services::{
    bus::MessageBus, dispatcher::JobDispatcher, replay::Replayer, sync::SyncPropagator,
    tracker::TriggerIssuer,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<dyn MessageBus>,
    pub progress: Arc<dyn ProgressStore>,
    pub records: Arc<dyn RecordStore>,
    pub dispatcher: Arc<JobDispatcher>,
    pub triggers: TriggerIssuer,
    pub sync: SyncPropagator,
    pub replayer: Arc<Replayer>,
}

impl AppState {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        progress: Arc<dyn ProgressStore>,
        records: Arc<dyn RecordStore>,
        stages: BTreeSet<Stage>,
    ) -> Self {
        Self {
            dispatcher: Arc::new(JobDispatcher::new(bus.clone(), progress.clone(), stages)),
            triggers: TriggerIssuer::new(bus.clone(), progress.clone()),
            sync: SyncPropagator::new(bus.clone()),
            replayer: Arc::new(Replayer::new(bus.clone())),
            bus,
            progress,
            records,
        }
    }
}
