//! Test utilities for unit testing reconcilers
//!
//! This module provides helpers for creating test data and setting up test scenarios.

use crate::index::ReverseIndex;
use crate::metrics::Metrics;
use crate::reconciler::Reconciler;
use crds::*;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use metal_store::{MockMetalStore, MockWorkloadClient};
use std::collections::BTreeMap;
use std::time::Duration;

/// Helper to create a test Server. Accepted servers start clean and unclaimed.
pub fn create_test_server(name: &str, accepted: bool) -> Server {
    Server {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: ServerSpec {
            accepted,
            ..Default::default()
        },
        status: Some(ServerStatus {
            ready: true,
            in_use: false,
            is_clean: true,
        }),
    }
}

/// Set CPU information on a test server
pub fn with_cpu(mut server: Server, manufacturer: &str, version: &str) -> Server {
    server.spec.cpu = Some(CPUInformation {
        manufacturer: manufacturer.to_string(),
        version: version.to_string(),
    });
    server
}

/// Set labels on a test server
pub fn with_labels(mut server: Server, labels: &[(&str, &str)]) -> Server {
    server.metadata.labels = Some(
        labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    );
    server
}

/// Override the reported status of a test server
pub fn with_status(mut server: Server, in_use: bool, is_clean: bool) -> Server {
    server.status = Some(ServerStatus {
        ready: true,
        in_use,
        is_clean,
    });
    server
}

/// Helper to create a test ServerClass whose status lists `available` servers
pub fn create_test_server_class(name: &str, spec: ServerClassSpec, available: &[&str]) -> ServerClass {
    let mut class = ServerClass::new(name, spec);
    class.status = Some(ServerClassStatus {
        servers_available: available.iter().map(|s| s.to_string()).collect(),
        servers_in_use: Vec::new(),
    });
    class
}

/// Helper to create a test MetalMachine owned by a Machine of the same name
pub fn create_test_metal_machine(namespace: &str, name: &str, class: Option<&str>) -> MetalMachine {
    MetalMachine {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![OwnerReference {
                api_version: "cluster.x-k8s.io/v1beta1".to_string(),
                kind: "Machine".to_string(),
                name: name.to_string(),
                uid: format!("machine-{name}"),
                ..Default::default()
            }]),
            ..Default::default()
        },
        spec: MetalMachineSpec {
            server_class_ref: class.map(ResourceReference::new),
            ..Default::default()
        },
        status: None,
    }
}

/// Helper to create a test ServerBinding claiming `server` for `namespace/machine`
pub fn create_test_binding(server: &str, namespace: &str, machine: &str) -> ServerBinding {
    ServerBinding {
        metadata: ObjectMeta {
            name: Some(server.to_string()),
            ..Default::default()
        },
        spec: ServerBindingSpec {
            metal_machine_ref: ResourceReference {
                namespace: Some(namespace.to_string()),
                ..ResourceReference::new(machine)
            },
            server_class_ref: None,
            addresses: Vec::new(),
            hostname: None,
        },
        status: None,
    }
}

/// Add the owner Machine and a ready Cluster for a test MetalMachine
pub fn add_ready_owner(store: &MockMetalStore, machine: &MetalMachine, cluster: &str) {
    let namespace = machine.metadata.namespace.clone().unwrap_or_default();
    let owner_name = machine
        .metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.first())
        .map(|r| r.name.clone())
        .unwrap_or_default();

    store.add_machine(Machine {
        metadata: ObjectMeta {
            name: Some(owner_name),
            namespace: Some(namespace.clone()),
            labels: Some(BTreeMap::from([(CLUSTER_NAME_LABEL.to_string(), cluster.to_string())])),
            ..Default::default()
        },
        spec: MachineSpec {
            cluster_name: cluster.to_string(),
            bootstrap: Bootstrap {
                data_secret_name: Some(format!("{cluster}-bootstrap")),
            },
        },
    });
    store.add_cluster(Cluster {
        metadata: ObjectMeta {
            name: Some(cluster.to_string()),
            namespace: Some(namespace),
            ..Default::default()
        },
        spec: ClusterSpec { paused: false },
        status: Some(ClusterStatus {
            infrastructure_ready: true,
        }),
    });
}

/// Create a reconciler backed by the given mocks
pub fn create_test_reconciler(store: MockMetalStore, workload: MockWorkloadClient) -> Reconciler {
    Reconciler::new(
        store,
        workload,
        ReverseIndex::new(),
        Metrics::new().unwrap(),
        Duration::from_secs(20),
    )
}
