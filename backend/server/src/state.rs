use std::sync::Arc;

use super::{
    config::Config,
    database::init_store,
    engagement::{Persistence, ToggleCoordinator},
    error::ServerError,
    identity::{IdentityGate, init_gate},
};

pub struct State {
    pub config: Config,
    pub coordinator: ToggleCoordinator,
    pub gate: Arc<dyn IdentityGate>,
}

impl State {
    pub async fn new(config: Config) -> Result<Arc<Self>, ServerError> {
        let store = init_store(&config).await?;
        let gate = init_gate(&config).await?;

        Ok(Self::from_parts(config, store, gate))
    }

    pub fn from_parts(
        config: Config,
        store: Arc<dyn Persistence>,
        gate: Arc<dyn IdentityGate>,
    ) -> Arc<Self> {
        let coordinator = ToggleCoordinator::new(store).with_read_audit(config.audit_reads);

        Arc::new(Self {
            config,
            coordinator,
            gate,
        })
    }
}
