//! The four long-running services (§4.4-§4.7). Seeder is a one-shot binary
//! and has no cycle of its own; see `src/bin/seeder.rs`.

pub mod finder;
pub mod monitor;
pub mod synchronizer;
pub mod validator;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::model::Network;

/// Per-network concurrency semaphores (§5), shared by Validator, Monitor,
/// and Synchronizer.
#[derive(Clone)]
pub struct NetworkSemaphores {
    semaphores: HashMap<&'static str, Arc<Semaphore>>,
}

impl NetworkSemaphores {
    pub fn new(cfg: &crate::config::NetworkConcurrency) -> Self {
        let mut semaphores = HashMap::new();
        semaphores.insert("clearnet", Arc::new(Semaphore::new(cfg.clearnet.max(1))));
        semaphores.insert("tor", Arc::new(Semaphore::new(cfg.tor.max(1))));
        semaphores.insert("i2p", Arc::new(Semaphore::new(cfg.i2p.max(1))));
        semaphores.insert("loki", Arc::new(Semaphore::new(cfg.loki.max(1))));
        Self { semaphores }
    }

    pub fn for_network(&self, network: Network) -> Arc<Semaphore> {
        self.semaphores
            .get(network.as_str())
            .cloned()
            .expect("every Network variant has a semaphore")
    }
}
