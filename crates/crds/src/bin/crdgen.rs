//! Prints the CRD manifests owned by this project as a multi-document YAML stream.

use crds::{MetalMachine, Server, ServerBinding, ServerClass};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crds = [
        Server::crd(),
        ServerClass::crd(),
        ServerBinding::crd(),
        MetalMachine::crd(),
    ];
    for crd in crds {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
