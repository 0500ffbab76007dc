//! In-memory component bookkeeping.
//!
//! The registry is a cache of the remote service description. It is owned by
//! the service actor, mutated only there, and rebuilt from a fresh status read
//! whenever ground truth is needed. Other tasks see it through
//! [`RegistrySnapshot`]s published by the actor.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;
use yarnpool_id::ComponentName;

use crate::client::{ResourceSpec, ServiceStatus};
use crate::error::FactoryError;

/// One READY container instance as listed by the resource manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceRef {
    /// Remote container id (`container_e01_…`).
    pub container_id: String,
    /// `{component}-{ordinal}`.
    pub instance_name: String,
    pub ordinal: u32,
    pub log_url: Option<String>,
}

/// Local state for one component.
#[derive(Debug, Clone)]
pub struct ComponentEntry {
    /// Artifact id the component was created with.
    pub image: String,
    /// Fixed when the component is first created.
    pub resources: ResourceSpec,
    pub desired: u32,
    /// READY containers at the last reconcile.
    pub running: u32,
    /// READY instances at the last reconcile, ordered by ordinal.
    pub instances: Vec<InstanceRef>,
    /// Whether the resource manager knows this component.
    pub materialized: bool,
    /// Container ids currently owned by a live handle.
    bound: BTreeSet<String>,
}

impl ComponentEntry {
    fn new(image: String, resources: ResourceSpec) -> Self {
        Self {
            image,
            resources,
            desired: 0,
            running: 0,
            instances: Vec::new(),
            materialized: false,
            bound: BTreeSet::new(),
        }
    }

    pub fn bound_count(&self) -> usize {
        self.bound.len()
    }

    fn is_bound(&self, instance: &InstanceRef) -> bool {
        self.bound.contains(&instance.container_id)
    }
}

/// Components of the factory's service, keyed by name.
#[derive(Debug)]
pub struct ComponentRegistry {
    components: BTreeMap<ComponentName, ComponentEntry>,
    updated_at: DateTime<Utc>,
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self {
            components: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn get(&self, name: &ComponentName) -> Option<&ComponentEntry> {
        self.components.get(name)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Returns the entry for `name`, creating it with a desired count of zero
    /// if this is the first request for the image.
    pub fn resolve_or_create(
        &mut self,
        name: &ComponentName,
        image: &str,
        resources: ResourceSpec,
    ) -> Result<&ComponentEntry, FactoryError> {
        if let Some(existing) = self.components.get(name) {
            if existing.image != image {
                return Err(FactoryError::InvariantViolation(format!(
                    "component {name} already hosts {}, not {image}",
                    existing.image
                )));
            }
        } else {
            self.components
                .insert(name.clone(), ComponentEntry::new(image.to_string(), resources));
            self.updated_at = Utc::now();
        }

        self.components
            .get(name)
            .ok_or_else(|| FactoryError::InvariantViolation(format!("component {name} vanished")))
    }

    pub fn current_desired(&self, name: &ComponentName) -> Option<u32> {
        self.components.get(name).map(|c| c.desired)
    }

    /// Applies `delta` to the desired count. Going below zero is rejected and
    /// leaves the count unchanged.
    pub fn bump_desired(&mut self, name: &ComponentName, delta: i64) -> Result<u32, FactoryError> {
        let entry = self.components.get_mut(name).ok_or_else(|| {
            FactoryError::InvariantViolation(format!("unknown component {name}"))
        })?;

        let next = i64::from(entry.desired) + delta;
        let next = u32::try_from(next).map_err(|_| {
            FactoryError::InvariantViolation(format!(
                "desired count of {name} would become {next}"
            ))
        })?;

        entry.desired = next;
        self.updated_at = Utc::now();
        Ok(next)
    }

    pub fn mark_materialized(&mut self, name: &ComponentName) {
        if let Some(entry) = self.components.get_mut(name) {
            entry.materialized = true;
        }
    }

    /// Rebuilds every entry from a fresh status read.
    ///
    /// Components the resource manager no longer lists are dropped. Bindings
    /// to containers that disappeared are moved to the lowest-ordinal unbound
    /// survivors: scale-down always removes the highest ordinal, whichever
    /// handle asked for it, so the number of bound instances is what counts.
    pub fn reconcile(&mut self, status: &ServiceStatus, fallback: &ResourceSpec) {
        let mut next = BTreeMap::new();

        for remote in &status.components {
            let name = match ComponentName::new(remote.name.as_str()) {
                Ok(name) => name,
                Err(e) => {
                    warn!(component = %remote.name, error = %e, "Ignoring foreign component");
                    continue;
                }
            };

            let mut entry = self.components.remove(&name).unwrap_or_else(|| {
                ComponentEntry::new(
                    remote.artifact.as_ref().map(|a| a.id.clone()).unwrap_or_default(),
                    remote.resource.clone().unwrap_or_else(|| fallback.clone()),
                )
            });

            let mut instances: Vec<InstanceRef> = remote
                .ready_containers()
                .filter_map(|c| {
                    Some(InstanceRef {
                        container_id: c.id.clone(),
                        instance_name: c.component_instance_name.clone(),
                        ordinal: c.ordinal()?,
                        log_url: c.log_url.clone(),
                    })
                })
                .collect();
            instances.sort_by_key(|i| i.ordinal);

            let previously_bound = entry.bound.len();
            entry
                .bound
                .retain(|id| instances.iter().any(|i| &i.container_id == id));
            let mut lost = previously_bound - entry.bound.len();
            for instance in &instances {
                if lost == 0 {
                    break;
                }
                if entry.bound.insert(instance.container_id.clone()) {
                    lost -= 1;
                }
            }

            entry.desired = remote.number_of_containers;
            entry.running = instances.len() as u32;
            entry.instances = instances;
            entry.materialized = true;
            next.insert(name, entry);
        }

        self.components = next;
        self.updated_at = Utc::now();
    }

    /// Binds the highest-ordinal unbound instance of `name`.
    pub fn claim_newest_instance(&mut self, name: &ComponentName) -> Option<InstanceRef> {
        let entry = self.components.get_mut(name)?;
        let instance = entry
            .instances
            .iter()
            .rev()
            .find(|i| !entry.is_bound(i))?
            .clone();
        entry.bound.insert(instance.container_id.clone());
        self.updated_at = Utc::now();
        Some(instance)
    }

    /// Binds every unbound instance across all components.
    pub fn claim_unbound(&mut self) -> Vec<(ComponentName, InstanceRef)> {
        let mut claimed = Vec::new();
        for (name, entry) in &mut self.components {
            let free: Vec<InstanceRef> = entry
                .instances
                .iter()
                .filter(|i| !entry.bound.contains(&i.container_id))
                .cloned()
                .collect();
            for instance in free {
                entry.bound.insert(instance.container_id.clone());
                claimed.push((name.clone(), instance));
            }
        }
        if !claimed.is_empty() {
            self.updated_at = Utc::now();
        }
        claimed
    }

    /// Drops the binding for `container_id`. If that binding already moved
    /// during a reconcile, the highest-ordinal binding is dropped instead.
    pub fn release(&mut self, name: &ComponentName, container_id: &str) -> bool {
        let Some(entry) = self.components.get_mut(name) else {
            return false;
        };

        let released = entry.bound.remove(container_id) || {
            let newest = entry
                .instances
                .iter()
                .rev()
                .find(|i| entry.bound.contains(&i.container_id))
                .map(|i| i.container_id.clone());
            newest.is_some_and(|id| entry.bound.remove(&id))
        };

        if released {
            self.updated_at = Utc::now();
        }
        released
    }

    pub fn clear(&mut self) {
        self.components.clear();
        self.updated_at = Utc::now();
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            components: self
                .components
                .iter()
                .map(|(name, entry)| ComponentSnapshot {
                    name: name.clone(),
                    image: entry.image.clone(),
                    desired: entry.desired,
                    running: entry.running,
                    bound: entry.bound_count() as u32,
                    instances: entry
                        .instances
                        .iter()
                        .map(|i| i.instance_name.clone())
                        .collect(),
                })
                .collect(),
            updated_at: self.updated_at,
        }
    }
}

/// Read-only view of the registry.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub components: Vec<ComponentSnapshot>,
    pub updated_at: DateTime<Utc>,
}

impl Default for RegistrySnapshot {
    fn default() -> Self {
        ComponentRegistry::new().snapshot()
    }
}

impl RegistrySnapshot {
    pub fn component(&self, name: &str) -> Option<&ComponentSnapshot> {
        self.components.iter().find(|c| c.name.as_str() == name)
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentSnapshot {
    pub name: ComponentName,
    pub image: String,
    pub desired: u32,
    pub running: u32,
    /// Instances owned by live handles.
    pub bound: u32,
    pub instances: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ComponentStatus, ContainerState, ContainerStatus, ServiceState};
    use proptest::prelude::*;

    fn web() -> ComponentName {
        ComponentName::new("web").unwrap()
    }

    fn resources() -> ResourceSpec {
        ResourceSpec::new(1, 256)
    }

    fn status_with(ordinals: &[u32]) -> ServiceStatus {
        ServiceStatus {
            name: "svc".to_string(),
            state: ServiceState::Stable,
            components: vec![ComponentStatus {
                name: "web".to_string(),
                number_of_containers: ordinals.len() as u32,
                artifact: None,
                resource: None,
                containers: ordinals
                    .iter()
                    .map(|n| ContainerStatus {
                        id: format!("container_{n:06}"),
                        component_instance_name: format!("web-{n}"),
                        state: ContainerState::Ready,
                        hostname: None,
                        ip: None,
                        log_url: None,
                    })
                    .collect(),
            }],
        }
    }

    #[test]
    fn test_resolve_reuses_entry() {
        let mut registry = ComponentRegistry::new();
        registry.resolve_or_create(&web(), "img:1", resources()).unwrap();
        registry.bump_desired(&web(), 1).unwrap();

        let entry = registry
            .resolve_or_create(&web(), "img:1", ResourceSpec::new(4, 4096))
            .unwrap();
        assert_eq!(entry.desired, 1);
        assert_eq!(entry.resources, resources());
        assert_eq!(registry.len(), 1);

        let err = registry
            .resolve_or_create(&web(), "img:2", resources())
            .unwrap_err();
        assert!(matches!(err, FactoryError::InvariantViolation(_)));
    }

    #[test]
    fn test_bump_below_zero_rejected() {
        let mut registry = ComponentRegistry::new();
        registry.resolve_or_create(&web(), "img:1", resources()).unwrap();

        assert!(registry.bump_desired(&web(), -1).is_err());
        assert_eq!(registry.current_desired(&web()), Some(0));

        let unknown = ComponentName::new("api").unwrap();
        assert!(registry.bump_desired(&unknown, 1).is_err());
    }

    #[test]
    fn test_running_matches_claimable_instances() {
        let mut status = status_with(&[0, 1]);
        let component = &mut status.components[0];
        component.number_of_containers = 3;
        component.containers.push(ContainerStatus {
            id: "container_odd".to_string(),
            component_instance_name: "web-primary".to_string(),
            state: ContainerState::Ready,
            hostname: None,
            ip: None,
            log_url: None,
        });

        let mut registry = ComponentRegistry::new();
        registry.reconcile(&status, &resources());

        let entry = registry.get(&web()).unwrap();
        assert_eq!(entry.running, 2);
        assert_eq!(entry.running, status.components[0].running_count());
        assert_eq!(entry.instances.len(), 2);
    }

    #[test]
    fn test_claims_newest_unbound() {
        let mut registry = ComponentRegistry::new();
        registry.reconcile(&status_with(&[0, 1, 2]), &resources());

        assert_eq!(registry.claim_newest_instance(&web()).unwrap().ordinal, 2);
        assert_eq!(registry.claim_newest_instance(&web()).unwrap().ordinal, 1);
        assert_eq!(registry.claim_unbound().len(), 1);
        assert!(registry.claim_newest_instance(&web()).is_none());
    }

    #[test]
    fn test_reconcile_moves_lost_binding() {
        let mut registry = ComponentRegistry::new();
        registry.reconcile(&status_with(&[0, 1]), &resources());
        let newest = registry.claim_newest_instance(&web()).unwrap();
        let oldest = registry.claim_newest_instance(&web()).unwrap();
        assert_eq!((newest.ordinal, oldest.ordinal), (1, 0));

        // Destroying the handle on ordinal 0 makes the cluster drop ordinal 1.
        assert!(registry.release(&web(), &oldest.container_id));
        registry.reconcile(&status_with(&[0]), &resources());

        let entry = registry.get(&web()).unwrap();
        assert_eq!(entry.bound_count(), 1);
        assert_eq!(entry.desired, 1);

        // The remaining handle still points at ordinal 1; releasing it frees
        // whatever binding replaced it.
        assert!(registry.release(&web(), &newest.container_id));
        assert_eq!(registry.get(&web()).unwrap().bound_count(), 0);
    }

    #[test]
    fn test_reconcile_drops_missing_components() {
        let mut registry = ComponentRegistry::new();
        let api = ComponentName::new("api").unwrap();
        registry.resolve_or_create(&api, "img:api", resources()).unwrap();
        registry.reconcile(&status_with(&[0]), &resources());

        assert!(registry.get(&api).is_none());
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.components.len(), 1);
        assert_eq!(snapshot.component("web").unwrap().instances, vec!["web-0"]);
        assert_eq!(
            registry.get(&web()).unwrap().resources,
            resources(),
            "fallback resources apply when the remote omits them"
        );
    }

    #[derive(Debug, Clone)]
    enum Op {
        Create,
        Destroy,
    }

    proptest! {
        #[test]
        fn prop_desired_tracks_creates_minus_destroys(
            ops in prop::collection::vec(prop_oneof![Just(Op::Create), Just(Op::Destroy)], 0..64)
        ) {
            let mut registry = ComponentRegistry::new();
            registry.resolve_or_create(&web(), "img:1", resources()).unwrap();
            let mut expected: i64 = 0;

            for op in ops {
                match op {
                    Op::Create => {
                        registry.bump_desired(&web(), 1).unwrap();
                        expected += 1;
                    }
                    Op::Destroy if expected == 0 => {
                        prop_assert!(registry.bump_desired(&web(), -1).is_err());
                    }
                    Op::Destroy => {
                        registry.bump_desired(&web(), -1).unwrap();
                        expected -= 1;
                    }
                }
                prop_assert_eq!(i64::from(registry.current_desired(&web()).unwrap()), expected);
            }
        }
    }
}
