//! In-memory model of the resource manager's services.
//!
//! Mutations are accepted immediately but only become visible after the
//! configured convergence delay, the way a real cluster schedules and
//! launches containers asynchronously. Convergence is applied lazily
//! whenever the model is touched.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operations that can be targeted by failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOperation {
    CreateService,
    GetService,
    FlexComponent,
    DeleteService,
}

/// Canned response returned instead of the real one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedResponse {
    /// Reply with this HTTP status and a diagnostics body.
    Status(u16),
    /// Reply 200 with a body that is not valid JSON.
    Garbage,
}

/// A request as seen by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    /// Value of the `user.name` query parameter.
    pub user: Option<String>,
    /// Value of the `Authorization` header.
    pub authorization: Option<String>,
}

impl RecordedRequest {
    /// True for POST/PUT/DELETE.
    pub fn is_mutation(&self) -> bool {
        self.method != "GET"
    }
}

/// Wire form of a service (request and response).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceDoc {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default)]
    pub components: Vec<ComponentDoc>,
}

/// Wire form of a component (request and response).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_of_containers: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<ContainerDoc>,
}

/// Wire form of a container instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerDoc {
    pub id: String,
    pub component_instance_name: String,
    pub state: String,
    pub hostname: String,
    pub log_url: String,
}

/// Observed state of one component, for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentView {
    pub desired: u32,
    pub running: u32,
    pub instance_names: Vec<String>,
    pub image: Option<String>,
}

#[derive(Debug)]
pub(crate) struct MockContainer {
    pub id: String,
    pub ordinal: u32,
}

#[derive(Debug)]
pub(crate) struct MockComponent {
    pub artifact: Option<Value>,
    pub resource: Option<Value>,
    pub launch_command: Option<String>,
    pub desired: u32,
    pub pending_since: Option<Instant>,
    pub containers: Vec<MockContainer>,
}

impl MockComponent {
    fn new(doc: &ComponentDoc, now: Instant) -> Self {
        let desired = doc.number_of_containers.unwrap_or(0);
        Self {
            artifact: doc.artifact.clone(),
            resource: doc.resource.clone(),
            launch_command: doc.launch_command.clone(),
            desired,
            pending_since: (desired > 0).then_some(now),
            containers: Vec::new(),
        }
    }

    fn image(&self) -> Option<String> {
        self.artifact
            .as_ref()
            .and_then(|a| a.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[derive(Debug)]
pub(crate) struct MockService {
    pub version: Option<String>,
    pub queue: Option<String>,
    pub pending_since: Option<Instant>,
    pub failed: bool,
    pub components: BTreeMap<String, MockComponent>,
}

#[derive(Debug)]
pub(crate) struct MockState {
    pub addr: String,
    pub convergence_delay: Duration,
    pub services: BTreeMap<String, MockService>,
    pub requests: Vec<RecordedRequest>,
    pub injected: VecDeque<(MockOperation, InjectedResponse)>,
    pub overlapping_mutations: u32,
    next_container_seq: u64,
}

impl MockState {
    pub fn new(addr: String, convergence_delay: Duration) -> Self {
        Self {
            addr,
            convergence_delay,
            services: BTreeMap::new(),
            requests: Vec::new(),
            injected: VecDeque::new(),
            overlapping_mutations: 0,
            next_container_seq: 1,
        }
    }

    /// Pops the first injected response queued for `op`.
    pub fn take_injected(&mut self, op: MockOperation) -> Option<InjectedResponse> {
        let idx = self.injected.iter().position(|(o, _)| *o == op)?;
        self.injected.remove(idx).map(|(_, r)| r)
    }

    /// Applies every pending change whose delay has elapsed.
    pub fn settle(&mut self) {
        let now = Instant::now();
        let delay = self.convergence_delay;
        let mut seq = self.next_container_seq;

        for service in self.services.values_mut() {
            if service
                .pending_since
                .is_some_and(|t| now.duration_since(t) >= delay)
            {
                service.pending_since = None;
            }
            if service.pending_since.is_some() {
                continue;
            }

            for component in service.components.values_mut() {
                let Some(since) = component.pending_since else {
                    continue;
                };
                if now.duration_since(since) < delay {
                    continue;
                }
                resize(component, &mut seq);
                component.pending_since = None;
            }
        }

        self.next_container_seq = seq;
    }

    /// True if any service or component still has a change in flight.
    pub fn has_pending_changes(&self) -> bool {
        self.services.values().any(|s| {
            s.pending_since.is_some() || s.components.values().any(|c| c.pending_since.is_some())
        })
    }

    /// Counts a mutation that arrived while another one was still converging.
    pub fn note_mutation(&mut self) {
        self.settle();
        if self.has_pending_changes() {
            self.overlapping_mutations += 1;
        }
    }

    pub fn create_service(&mut self, doc: &ServiceDoc) -> bool {
        if self.services.contains_key(&doc.name) {
            return false;
        }

        let now = Instant::now();
        let components = doc
            .components
            .iter()
            .filter_map(|c| Some((c.name.clone()?, MockComponent::new(c, now))))
            .collect();

        self.services.insert(
            doc.name.clone(),
            MockService {
                version: doc.version.clone(),
                queue: doc.queue.clone(),
                pending_since: Some(now),
                failed: false,
                components,
            },
        );
        true
    }

    /// Seeds a fully converged service, as if it survived a restart.
    pub fn seed_service(&mut self, name: &str, components: &[(&str, &str, u32)]) {
        let mut seq = self.next_container_seq;
        let components = components
            .iter()
            .map(|(component, image, count)| {
                let mut c = MockComponent {
                    artifact: Some(serde_json::json!({ "id": image, "type": "DOCKER" })),
                    resource: Some(serde_json::json!({ "cpus": 1, "memory": "256" })),
                    launch_command: None,
                    desired: *count,
                    pending_since: None,
                    containers: Vec::new(),
                };
                resize(&mut c, &mut seq);
                (component.to_string(), c)
            })
            .collect();
        self.next_container_seq = seq;

        self.services.insert(
            name.to_string(),
            MockService {
                version: Some("1.0.0".to_string()),
                queue: Some("default".to_string()),
                pending_since: None,
                failed: false,
                components,
            },
        );
    }

    pub fn render_service(&self, name: &str) -> Option<ServiceDoc> {
        let service = self.services.get(name)?;

        let components = service
            .components
            .iter()
            .map(|(component_name, c)| ComponentDoc {
                name: Some(component_name.clone()),
                state: Some(
                    if c.pending_since.is_some() { "FLEXING" } else { "STABLE" }.to_string(),
                ),
                number_of_containers: Some(c.desired),
                artifact: c.artifact.clone(),
                resource: c.resource.clone(),
                launch_command: c.launch_command.clone(),
                containers: c
                    .containers
                    .iter()
                    .map(|ctr| {
                        let instance = format!("{component_name}-{}", ctr.ordinal);
                        ContainerDoc {
                            id: ctr.id.clone(),
                            hostname: format!("{instance}.{name}.mock"),
                            log_url: format!("http://{}/logs/{name}/{}", self.addr, ctr.id),
                            component_instance_name: instance,
                            state: "READY".to_string(),
                        }
                    })
                    .collect(),
            })
            .collect();

        let state = if service.failed {
            "FAILED"
        } else if service.pending_since.is_some() {
            "ACCEPTED"
        } else if service.components.values().any(|c| c.pending_since.is_some()) {
            "FLEX"
        } else {
            "STABLE"
        };

        Some(ServiceDoc {
            name: name.to_string(),
            version: service.version.clone(),
            queue: service.queue.clone(),
            state: Some(state.to_string()),
            components,
        })
    }

    pub fn component_view(&self, service: &str, component: &str) -> Option<ComponentView> {
        let c = self.services.get(service)?.components.get(component)?;
        let mut instance_names: Vec<_> = c
            .containers
            .iter()
            .map(|ctr| format!("{component}-{}", ctr.ordinal))
            .collect();
        instance_names.sort();

        Some(ComponentView {
            desired: c.desired,
            running: c.containers.len() as u32,
            instance_names,
            image: c.image(),
        })
    }
}

/// Grows or shrinks a component's containers to its desired count.
///
/// Scale-down removes the highest ordinals; scale-up fills the lowest free
/// ordinals, matching how the resource manager numbers instances.
fn resize(component: &mut MockComponent, seq: &mut u64) {
    let desired = component.desired as usize;

    component.containers.sort_by_key(|c| c.ordinal);
    component.containers.truncate(desired);

    let mut used: BTreeSet<u32> = component.containers.iter().map(|c| c.ordinal).collect();
    let mut ordinal = 0;
    while component.containers.len() < desired {
        while used.contains(&ordinal) {
            ordinal += 1;
        }
        used.insert(ordinal);
        component.containers.push(MockContainer {
            id: format!("container_e01_1700000000000_0001_01_{:06}", *seq),
            ordinal,
        });
        *seq += 1;
    }
    component.containers.sort_by_key(|c| c.ordinal);
}
