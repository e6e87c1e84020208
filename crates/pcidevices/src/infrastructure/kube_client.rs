use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Api;
use kube::Client;
use kube::Config;
use kube::Resource;
use kube::ResourceExt;
use tracing::warn;

use crate::error::DeviceError;

pub async fn init_kube_client(kubeconfig: Option<PathBuf>) -> Result<Client, Report<DeviceError>> {
    let client = match kubeconfig {
        Some(kubeconfig_path) => {
            let kubeconfig = Kubeconfig::read_from(&kubeconfig_path).change_context(
                DeviceError::Kubernetes {
                    message: format!(
                        "failed to read kubeconfig file: {}",
                        kubeconfig_path.display()
                    ),
                },
            )?;

            let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .change_context(DeviceError::Kubernetes {
                    message: format!(
                        "failed to create config from kubeconfig: {}",
                        kubeconfig_path.display()
                    ),
                })?;

            Client::try_from(config).change_context(DeviceError::Kubernetes {
                message: "failed to create client from custom kubeconfig".to_string(),
            })?
        }
        // In-cluster config or ~/.kube/config
        None => Client::try_default()
            .await
            .change_context(DeviceError::Kubernetes {
                message: "failed to create Kubernetes client".to_string(),
            })?,
    };
    Ok(client)
}

/// Owner reference pointing at this node's Node object. Records carrying it
/// are garbage collected together with the node.
pub async fn node_owner_reference(client: Client, node_name: &str) -> Option<OwnerReference> {
    let nodes: Api<Node> = Api::all(client);
    match nodes.get_opt(node_name).await {
        Ok(Some(node)) => Some(OwnerReference {
            api_version: Node::api_version(&()).to_string(),
            kind: Node::kind(&()).to_string(),
            name: node.name_any(),
            uid: node.uid().unwrap_or_default(),
            ..Default::default()
        }),
        Ok(None) => {
            warn!(node_name, "node object not found, records will not be owned");
            None
        }
        Err(e) => {
            warn!(node_name, "failed to look up node object: {e}");
            None
        }
    }
}
