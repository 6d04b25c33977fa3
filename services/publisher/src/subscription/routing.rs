//! Signal-to-client routing table
//!
//! The table is rebuilt from scratch and swapped in whole, so `route` never sees
//! a partially recalculated map. Rebuilds are serialized by an async mutex.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gateway_codec::Measurement;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::Subscription;

#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: RwLock<Arc<HashMap<Uuid, HashSet<Uuid>>>>,
    recalculation: Mutex<()>,
    recalculations: AtomicU64,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds routes from every active subscription.
    pub async fn recalculate<I>(&self, subscriptions: I)
    where
        I: IntoIterator<Item = Arc<Subscription>>,
    {
        let _guard = self.recalculation.lock().await;

        let mut routes: HashMap<Uuid, HashSet<Uuid>> = HashMap::new();
        let mut clients = 0usize;
        for subscription in subscriptions {
            if !subscription.is_running() {
                continue;
            }
            clients += 1;
            for signal_id in subscription.signal_ids() {
                routes.entry(signal_id).or_default().insert(subscription.client_id());
            }
        }

        debug!(signals = routes.len(), clients, "Routing tables recalculated");
        *self.routes.write() = Arc::new(routes);
        self.recalculations.fetch_add(1, Ordering::Relaxed);
    }

    /// Groups `measurements` by destination client.
    pub fn route(&self, measurements: &[Measurement]) -> HashMap<Uuid, Vec<Measurement>> {
        let routes = self.routes.read().clone();
        let mut batches: HashMap<Uuid, Vec<Measurement>> = HashMap::new();
        for measurement in measurements {
            if let Some(clients) = routes.get(&measurement.signal_id) {
                for client_id in clients {
                    batches.entry(*client_id).or_default().push(*measurement);
                }
            }
        }
        batches
    }

    pub fn clients_for(&self, signal_id: &Uuid) -> HashSet<Uuid> {
        self.routes.read().get(signal_id).cloned().unwrap_or_default()
    }

    pub fn signal_count(&self) -> usize {
        self.routes.read().len()
    }

    pub fn recalculations(&self) -> u64 {
        self.recalculations.load(Ordering::Relaxed)
    }
}
