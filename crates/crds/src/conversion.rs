//! Translation between claim representations
//!
//! Older deployments recorded a claim only as `MetalMachine.spec.serverRef` (with the
//! server marked in use). The current representation is a `ServerBinding` named after
//! the server. Everything that turns a machine's server reference into a binding goes
//! through here.

use crate::metal_machine::MetalMachine;
use crate::references::ResourceReference;
use crate::server_binding::{ServerBinding, ServerBindingSpec};
use kube::api::ObjectMeta;

/// A claim as recorded by a MetalMachine's direct server reference.
#[derive(Debug, Clone)]
pub struct LegacyAssignment<'a> {
    /// Machine holding the reference
    pub machine: &'a MetalMachine,
    /// Referenced server identity
    pub server_name: &'a str,
}

impl<'a> LegacyAssignment<'a> {
    /// Read the legacy claim off a machine, if it carries a server reference
    pub fn from_machine(machine: &'a MetalMachine) -> Option<Self> {
        machine.spec.server_ref.as_ref().map(|server_ref| Self {
            machine,
            server_name: server_ref.name.as_str(),
        })
    }
}

/// Build the binding equivalent to a legacy claim.
///
/// The binding takes the server's name, the machine's labels, a full reference to
/// the machine and, when present, the machine's class reference.
pub fn binding_from_legacy_assignment(assignment: &LegacyAssignment<'_>) -> ServerBinding {
    new_binding(
        assignment.machine,
        assignment.server_name,
        assignment.machine.spec.server_class_ref.clone(),
    )
}

/// Build a binding claiming `server_name` for `machine`.
pub fn new_binding(
    machine: &MetalMachine,
    server_name: &str,
    server_class_ref: Option<ResourceReference>,
) -> ServerBinding {
    ServerBinding {
        metadata: ObjectMeta {
            name: Some(server_name.to_string()),
            labels: machine.metadata.labels.clone(),
            ..Default::default()
        },
        spec: ServerBindingSpec {
            metal_machine_ref: ResourceReference::to_object(machine),
            server_class_ref,
            addresses: Vec::new(),
            hostname: None,
        },
        status: None,
    }
}
