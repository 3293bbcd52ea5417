//! Registry of instrumented services and their instances.
//!
//! Entries are owned by the registry. Callers get cloned snapshots and change
//! entries only through [`ServiceRegistry::update`], which applies the change
//! under the write lock and skips services that were deleted meanwhile.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::topology::{InstanceSpec, ServiceSpec};

/// Health of one instance within the current run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InstanceHealth {
    #[default]
    Healthy,
    /// Failed once; skipped until the next run starts.
    Errored(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub spec: InstanceSpec,
    pub health: InstanceHealth,
}

impl Instance {
    pub fn is_errored(&self) -> bool {
        matches!(self.health, InstanceHealth::Errored(_))
    }

    pub fn error(&self) -> Option<&str> {
        match &self.health {
            InstanceHealth::Errored(msg) => Some(msg),
            InstanceHealth::Healthy => None,
        }
    }
}

/// Snapshot of a registered service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: String,
    pub image: String,
    /// Archive files discovered in the service's application directory.
    pub archives: Vec<PathBuf>,
    pub instances: Vec<Instance>,
    /// Why the last artifact discovery failed. Cleared by the next
    /// successful discovery; a service with this set is not extracted.
    pub discovery_error: Option<String>,
    /// Service-level error text of the current run.
    pub error: String,
    pub deleted: bool,
}

impl ServiceRecord {
    fn from_spec(spec: ServiceSpec) -> Self {
        Self {
            name: spec.name,
            image: spec.image,
            archives: Vec::new(),
            instances: spec
                .instances
                .into_iter()
                .map(|spec| Instance {
                    spec,
                    health: InstanceHealth::Healthy,
                })
                .collect(),
            discovery_error: None,
            error: String::new(),
            deleted: false,
        }
    }

    pub fn has_error(&self) -> bool {
        self.discovery_error.is_some() || !self.error.is_empty()
    }

    /// Whether the service's archives can be extracted for a run.
    pub fn is_usable(&self) -> bool {
        self.discovery_error.is_none() && !self.archives.is_empty()
    }

    /// Append a line to the service error text.
    pub fn push_error(&mut self, msg: &str) {
        self.error.push_str(msg);
        if !msg.ends_with('\n') {
            self.error.push('\n');
        }
    }

    /// Mark the named instance as errored.
    pub fn fail_instance(&mut self, instance: &str, msg: String) {
        if let Some(inst) = self.instances.iter_mut().find(|i| i.spec.name == instance) {
            inst.health = InstanceHealth::Errored(msg);
        }
    }
}

/// What `observe` did with an inventory update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First sighting; artifacts must be discovered.
    Registered,
    /// Known service whose image changed; artifacts must be rediscovered.
    ImageChanged,
    /// Known service, only its instances changed.
    InstancesReplaced,
    /// A deleted service came back before it was purged.
    Revived,
}

impl Observation {
    pub fn needs_discovery(&self) -> bool {
        !matches!(self, Observation::InstancesReplaced)
    }
}

struct ServiceSlot {
    record: ServiceRecord,
    load_lock: Arc<Mutex<()>>,
    cancel: CancellationToken,
    purge: Option<JoinHandle<()>>,
}

impl ServiceSlot {
    fn new(record: ServiceRecord) -> Self {
        Self {
            record,
            load_lock: Arc::new(Mutex::new(())),
            cancel: CancellationToken::new(),
            purge: None,
        }
    }
}

/// Concurrency-safe service registry.
#[derive(Default)]
pub struct ServiceRegistry {
    slots: RwLock<HashMap<String, ServiceSlot>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an inventory update.
    ///
    /// The instance list is replaced wholesale; instances that keep their
    /// name keep their health so an errored instance stays skipped.
    pub async fn observe(&self, spec: ServiceSpec) -> Observation {
        let mut slots = self.slots.write().await;
        let Some(slot) = slots.get_mut(&spec.name) else {
            info!(service = %spec.name, image = %spec.image, instances = spec.instances.len(), "registering service");
            let name = spec.name.clone();
            slots.insert(name, ServiceSlot::new(ServiceRecord::from_spec(spec)));
            return Observation::Registered;
        };

        let previous: HashMap<String, InstanceHealth> = slot
            .record
            .instances
            .drain(..)
            .map(|i| (i.spec.name, i.health))
            .collect();
        slot.record.instances = spec
            .instances
            .into_iter()
            .map(|spec| {
                let health = previous.get(&spec.name).cloned().unwrap_or_default();
                Instance { spec, health }
            })
            .collect();

        if slot.record.deleted {
            info!(service = %spec.name, "service reappeared before purge");
            if let Some(purge) = slot.purge.take() {
                purge.abort();
            }
            slot.record.deleted = false;
            slot.record.image = spec.image;
            slot.cancel = CancellationToken::new();
            return Observation::Revived;
        }

        if slot.record.image != spec.image {
            info!(service = %spec.name, old = %slot.record.image, new = %spec.image, "service image changed");
            slot.record.image = spec.image;
            return Observation::ImageChanged;
        }
        Observation::InstancesReplaced
    }

    /// Soft-delete a service: flag it, fire its cancellation scope and purge
    /// it after `grace` unless it reappears first.
    pub async fn remove(self: &Arc<Self>, name: &str, grace: Duration) -> bool {
        let mut slots = self.slots.write().await;
        let Some(slot) = slots.get_mut(name) else {
            return false;
        };
        if slot.record.deleted {
            return true;
        }
        info!(service = name, grace_secs = grace.as_secs(), "service removed, purge scheduled");
        slot.record.deleted = true;
        slot.cancel.cancel();

        let registry = Arc::clone(self);
        let purge_name = name.to_string();
        slot.purge = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.purge(&purge_name).await;
        }));
        true
    }

    async fn purge(&self, name: &str) {
        let mut slots = self.slots.write().await;
        if slots.get(name).is_some_and(|s| s.record.deleted) {
            slots.remove(name);
            debug!(service = name, "service purged");
        }
    }

    pub async fn get(&self, name: &str) -> Option<ServiceRecord> {
        self.slots.read().await.get(name).map(|s| s.record.clone())
    }

    /// Snapshots of every service, deleted ones included, sorted by name.
    pub async fn list(&self) -> Vec<ServiceRecord> {
        let mut all: Vec<ServiceRecord> = self
            .slots
            .read()
            .await
            .values()
            .map(|s| s.record.clone())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Snapshots of services that are not deleted, sorted by name.
    pub async fn live(&self) -> Vec<ServiceRecord> {
        let mut live = self.list().await;
        live.retain(|s| !s.deleted);
        live
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    /// Atomically modify a live service. Returns `false` if the service is
    /// gone or deleted, in which case `f` is not called.
    pub async fn update<F>(&self, name: &str, f: F) -> bool
    where
        F: FnOnce(&mut ServiceRecord),
    {
        let mut slots = self.slots.write().await;
        match slots.get_mut(name) {
            Some(slot) if !slot.record.deleted => {
                f(&mut slot.record);
                true
            }
            _ => false,
        }
    }

    /// The discovery lock and lifecycle token of a service.
    pub async fn lifecycle(&self, name: &str) -> Option<(Arc<Mutex<()>>, CancellationToken)> {
        self.slots
            .read()
            .await
            .get(name)
            .map(|s| (Arc::clone(&s.load_lock), s.cancel.clone()))
    }

    /// Forget the errors of the previous run: service error text and every
    /// instance's sticky error. Discovery errors are kept. Called when a new
    /// run starts.
    pub async fn reset_run_errors(&self) {
        let mut slots = self.slots.write().await;
        for slot in slots.values_mut() {
            slot.record.error.clear();
            for inst in &mut slot.record.instances {
                inst.health = InstanceHealth::Healthy;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, image: &str, pods: &[&str]) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            image: image.to_string(),
            instances: pods
                .iter()
                .enumerate()
                .map(|(i, p)| InstanceSpec {
                    address: format!("10.0.0.{}", i + 1),
                    name: p.to_string(),
                    container: name.to_string(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_observe_transitions() {
        let reg = ServiceRegistry::new();
        assert_eq!(reg.observe(spec("a", "img:1", &["a-0"])).await, Observation::Registered);
        assert_eq!(
            reg.observe(spec("a", "img:1", &["a-0", "a-1"])).await,
            Observation::InstancesReplaced
        );
        assert_eq!(reg.get("a").await.unwrap().instances.len(), 2);
        assert_eq!(reg.observe(spec("a", "img:2", &["a-1"])).await, Observation::ImageChanged);

        let rec = reg.get("a").await.unwrap();
        assert_eq!(rec.image, "img:2");
        assert_eq!(rec.instances.len(), 1);
        assert_eq!(rec.instances[0].spec.name, "a-1");
    }

    #[tokio::test]
    async fn test_replacement_keeps_sticky_errors_by_name() {
        let reg = ServiceRegistry::new();
        reg.observe(spec("a", "img", &["a-0", "a-1"])).await;
        assert!(reg.update("a", |r| r.fail_instance("a-1", "dial failed".into())).await);

        reg.observe(spec("a", "img", &["a-1", "a-2"])).await;

        let rec = reg.get("a").await.unwrap();
        let errored: Vec<_> = rec.instances.iter().filter(|i| i.is_errored()).collect();
        assert_eq!(errored.len(), 1);
        assert_eq!(errored[0].spec.name, "a-1");
        assert_eq!(errored[0].error(), Some("dial failed"));

        reg.reset_run_errors().await;
        assert!(reg.get("a").await.unwrap().instances.iter().all(|i| !i.is_errored()));
    }

    #[tokio::test]
    async fn test_new_run_clears_run_errors_but_not_discovery_errors() {
        let reg = ServiceRegistry::new();
        reg.observe(spec("a", "img", &["a-0"])).await;
        reg.observe(spec("b", "img", &["b-0"])).await;
        reg.update("a", |r| {
            r.archives = vec![PathBuf::from("/cache/a.jar")];
            r.push_error("merge pod exec error: disk full");
            r.fail_instance("a-0", "dial failed".into());
        })
        .await;
        reg.update("b", |r| r.discovery_error = Some("load svc b jar error".into()))
            .await;

        reg.reset_run_errors().await;

        let a = reg.get("a").await.unwrap();
        assert!(!a.has_error());
        assert!(a.is_usable());
        assert!(!a.instances[0].is_errored());
        let b = reg.get("b").await.unwrap();
        assert!(b.has_error());
        assert!(!b.is_usable());
    }

    #[tokio::test]
    async fn test_remove_cancels_and_purges_after_grace() {
        let reg = Arc::new(ServiceRegistry::new());
        reg.observe(spec("a", "img", &["a-0"])).await;
        let (_, token) = reg.lifecycle("a").await.unwrap();

        assert!(reg.remove("a", Duration::from_millis(20)).await);
        assert!(token.is_cancelled());
        assert!(reg.get("a").await.unwrap().deleted);
        assert!(reg.live().await.is_empty());
        assert!(!reg.update("a", |r| r.push_error("late")).await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(reg.get("a").await.is_none());
    }

    #[tokio::test]
    async fn test_revive_cancels_purge() {
        let reg = Arc::new(ServiceRegistry::new());
        reg.observe(spec("a", "img", &["a-0"])).await;
        reg.remove("a", Duration::from_millis(30)).await;

        assert_eq!(reg.observe(spec("a", "img", &["a-0"])).await, Observation::Revived);
        let (_, token) = reg.lifecycle("a").await.unwrap();
        assert!(!token.is_cancelled());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let rec = reg.get("a").await.unwrap();
        assert!(!rec.deleted);
    }

    #[tokio::test]
    async fn test_remove_unknown_is_noop() {
        let reg = Arc::new(ServiceRegistry::new());
        assert!(!reg.remove("ghost", Duration::from_secs(1)).await);
        assert!(reg.is_empty().await);
    }
}
