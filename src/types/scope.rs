use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::snapshot::Snapshot;

/// Subset of the snapshot selected by resource IDs/types (SPEC_FULL.md GLOSSARY).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scope {
    pub resource_ids: HashSet<String>,
    pub resource_types: HashSet<String>,
}

impl Scope {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resource_ids.is_empty() && self.resource_types.is_empty()
    }

    #[must_use]
    pub fn for_resource(resource_id: impl Into<String>) -> Self {
        let mut resource_ids = HashSet::new();
        resource_ids.insert(resource_id.into());
        Self {
            resource_ids,
            resource_types: HashSet::new(),
        }
    }

    /// Expand `resource_types` by the equivalence classes named in
    /// SPEC_FULL.md §4.4: vm/qemu, lxc/container, docker/docker_host/docker_container,
    /// k8s/kubernetes/kubernetes_cluster, pbs/pbs_datastore/pbs_job,
    /// host/host_raid/host_sensor.
    #[must_use]
    pub fn expanded_types(&self) -> HashSet<String> {
        const CLASSES: &[&[&str]] = &[
            &["vm", "qemu"],
            &["lxc", "container"],
            &["docker", "docker_host", "docker_container"],
            &["k8s", "kubernetes", "kubernetes_cluster"],
            &["pbs", "pbs_datastore", "pbs_job"],
            &["host", "host_raid", "host_sensor"],
        ];
        let mut out = self.resource_types.clone();
        for class in CLASSES {
            if class.iter().any(|t| self.resource_types.contains(*t)) {
                out.extend(class.iter().map(|s| (*s).to_string()));
            }
        }
        out
    }

    /// Whether `resource_id`/`resource_type` fall within this scope. An empty
    /// scope matches everything.
    #[must_use]
    pub fn matches(&self, resource_id: &str, resource_type: &str) -> bool {
        if self.is_empty() {
            return true;
        }
        self.resource_ids.contains(resource_id) || self.expanded_types().contains(resource_type)
    }

    /// Filter a full snapshot down to the resources named by this scope.
    /// An empty scope returns the snapshot unchanged (shallow clone).
    #[must_use]
    pub fn filter_snapshot(&self, snapshot: &Snapshot) -> Snapshot {
        if self.is_empty() {
            return snapshot.clone();
        }
        let types = self.expanded_types();
        let keep = |id: &str, kind: &str| self.resource_ids.contains(id) || types.contains(kind);

        Snapshot {
            nodes: snapshot
                .nodes
                .iter()
                .filter(|n| keep(&n.id, "node"))
                .cloned()
                .collect(),
            guests: snapshot
                .guests
                .iter()
                .filter(|g| {
                    let kind_tag = match g.kind {
                        super::snapshot::GuestKind::Vm => "vm",
                        super::snapshot::GuestKind::Container => "lxc",
                        super::snapshot::GuestKind::DockerContainer => "docker_container",
                        super::snapshot::GuestKind::KubernetesPod => "kubernetes",
                    };
                    keep(&g.id, kind_tag)
                })
                .cloned()
                .collect(),
            storage_pools: snapshot
                .storage_pools
                .iter()
                .filter(|s| keep(&s.id, "storage"))
                .cloned()
                .collect(),
            physical_disks: snapshot
                .physical_disks
                .iter()
                .filter(|d| keep(&d.id, "host"))
                .cloned()
                .collect(),
            active_alerts: snapshot
                .active_alerts
                .iter()
                .filter(|a| keep(&a.resource_id, &a.resource_type))
                .cloned()
                .collect(),
            connection_health: snapshot
                .connection_health
                .iter()
                .filter(|c| self.resource_ids.is_empty() || self.resource_ids.contains(&c.resource_id))
                .cloned()
                .collect(),
            predictions: snapshot
                .predictions
                .iter()
                .filter(|p| keep(&p.resource_id, &p.resource_type))
                .cloned()
                .collect(),
            guest_reachability: snapshot.guest_reachability.clone(),
        }
    }
}
