//! The per-NIP module pipeline. Every EVENT submission runs through the
//! registered modules' policies in order, gets routed to a store method,
//! and finally triggers post-store side effects.

use async_trait::async_trait;

use crate::config::RelayConfig;
use crate::error::StoreError;
use crate::event::Event;
use crate::nips::nip11::InfoDocument;
use crate::store::{EventStore, StoreOutcome};

/// Policy decision. `Shadow` acknowledges the event with OK=true but
/// neither stores nor broadcasts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(String),
    Shadow(String),
}

/// How an admitted event reaches the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreRoute {
    Regular,
    Replaceable,
    Addressable { d_tag: String },
    Ephemeral,
}

/// What a policy may see of the submitting connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionSnapshot {
    pub conn_id: String,
    pub remote_addr: String,
    pub auth_pubkey: Option<String>,
}

/// A pure admission predicate.
pub type Policy = fn(&Event, &ConnectionSnapshot, &RelayConfig) -> Verdict;

/// A named bundle of behavior for one or more NIPs.
#[async_trait]
pub trait NipModule: Send + Sync {
    fn name(&self) -> &'static str;

    /// NIP numbers this module contributes to `supported_nips`.
    fn nips(&self) -> &'static [u16];

    fn policies(&self) -> &'static [Policy] {
        &[]
    }

    /// Pre-store hook: claim the event and choose its store route. At
    /// most one module claims any given kind.
    fn route(&self, _event: &Event) -> Option<StoreRoute> {
        None
    }

    /// Post-store hook for side effects (runs only after a real store).
    async fn post_store(&self, _event: &Event, _store: &EventStore) -> Result<(), StoreError> {
        Ok(())
    }

    /// NIP-11 contribution.
    fn info(&self, _doc: &mut InfoDocument, _cfg: &RelayConfig) {}
}

pub struct ModuleRegistry {
    modules: Vec<Box<dyn NipModule>>,
}

impl ModuleRegistry {
    pub fn new(modules: Vec<Box<dyn NipModule>>) -> Self {
        Self { modules }
    }

    /// The built-in module set, in pipeline order.
    pub fn builtin() -> Self {
        Self::new(crate::nips::builtin_modules())
    }

    pub fn supported_nips(&self) -> Vec<u16> {
        let mut nips: Vec<u16> = self.modules.iter().flat_map(|m| m.nips()).copied().collect();
        nips.sort_unstable();
        nips.dedup();
        nips
    }

    /// First non-Accept verdict wins, in registration order.
    pub fn check_policies(
        &self,
        event: &Event,
        snapshot: &ConnectionSnapshot,
        cfg: &RelayConfig,
    ) -> Verdict {
        for module in &self.modules {
            for policy in module.policies() {
                match policy(event, snapshot, cfg) {
                    Verdict::Accept => continue,
                    other => return other,
                }
            }
        }
        Verdict::Accept
    }

    pub fn route(&self, event: &Event) -> StoreRoute {
        self.modules
            .iter()
            .find_map(|m| m.route(event))
            .unwrap_or(StoreRoute::Regular)
    }

    pub async fn post_store(&self, event: &Event, store: &EventStore) -> Result<(), StoreError> {
        for module in &self.modules {
            module.post_store(event, store).await?;
        }
        Ok(())
    }

    pub fn apply_info(&self, doc: &mut InfoDocument, cfg: &RelayConfig) {
        for module in &self.modules {
            module.info(doc, cfg);
        }
        doc.supported_nips = self.supported_nips();
    }
}

/// Result of pushing one EVENT through the pipeline.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub accepted: bool,
    pub message: String,
    /// Present when the event should fan out to live subscriptions.
    pub broadcast: Option<Event>,
}

impl IngestOutcome {
    fn rejected(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message: message.into(),
            broadcast: None,
        }
    }

    fn accepted(message: impl Into<String>, broadcast: Option<Event>) -> Self {
        Self {
            accepted: true,
            message: message.into(),
            broadcast,
        }
    }
}

/// §4.5 pipeline: policies, tombstone check, route, store, post-store.
/// The caller sends the OK frame and performs the broadcast.
pub async fn ingest_event(
    event: Event,
    snapshot: &ConnectionSnapshot,
    cfg: &RelayConfig,
    store: &EventStore,
    registry: &ModuleRegistry,
) -> IngestOutcome {
    match registry.check_policies(&event, snapshot, cfg) {
        Verdict::Accept => {}
        Verdict::Reject(reason) => return IngestOutcome::rejected(reason),
        Verdict::Shadow(reason) => {
            tracing::debug!(id = %event.id, %reason, "shadowed event");
            return IngestOutcome::accepted("", None);
        }
    }

    match store.is_deleted(&event.id).await {
        Ok(true) => {
            return IngestOutcome::rejected("deleted: event was deleted by its author")
        }
        Ok(false) => {}
        Err(e) => {
            tracing::error!(error = %e, "tombstone lookup failed");
            return IngestOutcome::rejected(format!("error: {e}"));
        }
    }

    let route = registry.route(&event);
    if route == StoreRoute::Ephemeral {
        return IngestOutcome::accepted("", Some(event));
    }

    let outcome = match store_with_retry(store, &event, &route).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(id = %event.id, error = %e, "store failed");
            return IngestOutcome::rejected(format!("error: {e}"));
        }
    };

    match outcome {
        StoreOutcome::Duplicate => {
            IngestOutcome::accepted("duplicate: already have this event", None)
        }
        StoreOutcome::Older => {
            IngestOutcome::rejected("duplicate: have a newer event for this key")
        }
        StoreOutcome::Stored { replaced } => {
            if let Some(old) = replaced {
                tracing::debug!(new = %event.id, %old, "replaced event");
            }
            if let Err(e) = registry.post_store(&event, store).await {
                tracing::error!(id = %event.id, error = %e, "post-store hook failed");
            }
            IngestOutcome::accepted("", Some(event))
        }
    }
}

/// One local retry on backend failure, per the storage error policy.
async fn store_with_retry(
    store: &EventStore,
    event: &Event,
    route: &StoreRoute,
) -> Result<StoreOutcome, StoreError> {
    let attempt = || async {
        match route {
            StoreRoute::Regular => store.store_regular(event).await,
            StoreRoute::Replaceable => store.store_replaceable(event).await,
            StoreRoute::Addressable { d_tag } => store.store_addressable(event, d_tag).await,
            StoreRoute::Ephemeral => Ok(StoreOutcome::Stored { replaced: None }),
        }
    };
    match attempt().await {
        Ok(outcome) => Ok(outcome),
        Err(first) => {
            tracing::warn!(error = %first, "store attempt failed, retrying once");
            attempt().await
        }
    }
}
