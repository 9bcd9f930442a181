//! Node label writes through the Kubernetes API

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node as K8sNode;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use nodegrant_core::traits::NodeLabeler;
use nodegrant_core::Error;
use serde_json::json;
use tracing::debug;

/// Writes labels onto nodes with a merge patch
#[derive(Clone)]
pub struct KubeLabeler {
    api: Api<K8sNode>,
}

impl KubeLabeler {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl NodeLabeler for KubeLabeler {
    async fn set_label(&self, node: &str, key: &str, value: &str) -> Result<(), Error> {
        debug!("Labelling node {} with {}={}", node, key, value);
        let patch = json!({ "metadata": { "labels": { key: value } } });

        match self
            .api
            .patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                Err(Error::not_found(format!("node {}", node)))
            }
            Err(e) => Err(Error::membership(format!(
                "failed to label node {}: {}",
                node, e
            ))),
        }
    }
}
