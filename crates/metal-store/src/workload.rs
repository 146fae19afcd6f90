//! Workload cluster access
//!
//! Provider IDs are stamped onto the workload cluster's Node objects. The workload
//! cluster is reached with the kubeconfig Cluster API stores in the management
//! cluster as `<cluster>-kubeconfig` (key `value`).

use crate::error::StoreError;
use crds::{ObjectKey, SERVER_UUID_LABEL};
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::api::{ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config, ResourceExt};
use serde_json::json;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Operations against a workload cluster
#[async_trait::async_trait]
pub trait WorkloadClusterClient: Send + Sync {
    /// Set `spec.providerID` on the single node labelled with `server_uuid`.
    ///
    /// Zero or several matching nodes is an error.
    async fn set_node_provider_id(
        &self,
        cluster: &ObjectKey,
        server_uuid: &str,
        provider_id: &str,
    ) -> Result<(), StoreError>;
}

/// Workload cluster client built from Cluster API kubeconfig secrets.
pub struct KubeWorkloadClient {
    management: Client,
    clients: RwLock<HashMap<ObjectKey, Client>>,
}

impl std::fmt::Debug for KubeWorkloadClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeWorkloadClient").finish_non_exhaustive()
    }
}

impl KubeWorkloadClient {
    /// Create a client that reads kubeconfig secrets through `management`
    pub fn new(management: Client) -> Self {
        Self {
            management,
            clients: RwLock::new(HashMap::new()),
        }
    }

    async fn client_for(&self, cluster: &ObjectKey) -> Result<Client, StoreError> {
        if let Some(client) = self.clients.read().await.get(cluster) {
            return Ok(client.clone());
        }

        let secret_name = format!("{}-kubeconfig", cluster.name);
        let secrets: Api<Secret> = Api::namespaced(self.management.clone(), &cluster.namespace);
        let secret = secrets
            .get(&secret_name)
            .await
            .map_err(|e| StoreError::from_kube(e, format!("Secret {}/{}", cluster.namespace, secret_name)))?;

        let raw = secret
            .data
            .as_ref()
            .and_then(|data| data.get("value"))
            .ok_or_else(|| StoreError::Kubeconfig(format!("secret {secret_name} has no 'value' key")))?;
        let yaml = std::str::from_utf8(&raw.0)
            .map_err(|e| StoreError::Kubeconfig(format!("secret {secret_name} is not UTF-8: {e}")))?;
        let kubeconfig = Kubeconfig::from_yaml(yaml)
            .map_err(|e| StoreError::Kubeconfig(format!("secret {secret_name}: {e}")))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| StoreError::Kubeconfig(format!("secret {secret_name}: {e}")))?;
        let client = Client::try_from(config).map_err(StoreError::Kube)?;

        debug!("Connected to workload cluster {}", cluster);
        self.clients.write().await.insert(cluster.clone(), client.clone());
        Ok(client)
    }
}

#[async_trait::async_trait]
impl WorkloadClusterClient for KubeWorkloadClient {
    async fn set_node_provider_id(
        &self,
        cluster: &ObjectKey,
        server_uuid: &str,
        provider_id: &str,
    ) -> Result<(), StoreError> {
        let client = self.client_for(cluster).await?;
        let nodes: Api<Node> = Api::all(client);

        let selector = format!("{SERVER_UUID_LABEL}={server_uuid}");
        let matching = match nodes.list(&ListParams::default().labels(&selector)).await {
            Ok(list) => list.items,
            Err(e) => {
                // Stale credentials are re-read on the next attempt
                self.clients.write().await.remove(cluster);
                return Err(StoreError::Kube(e));
            }
        };

        let node = match matching.as_slice() {
            [node] => node,
            [] => {
                return Err(StoreError::InvalidRequest(format!(
                    "no matching nodes found for {selector}"
                )));
            }
            _ => {
                return Err(StoreError::InvalidRequest(format!(
                    "multiple nodes found for {selector}"
                )));
            }
        };

        let current = node.spec.as_ref().and_then(|spec| spec.provider_id.as_deref());
        if current == Some(provider_id) {
            return Ok(());
        }

        let name = node.name_any();
        let patch = json!({ "spec": { "providerID": provider_id } });
        nodes
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(e, format!("Node {name}")))?;
        info!("Set providerID {} on node {} in cluster {}", provider_id, name, cluster);
        Ok(())
    }
}
