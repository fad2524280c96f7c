//! Kubernetes client wrapper
//!
//! Context selection and the namespace operations a run needs.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, DeleteParams, PostParams},
    config::KubeConfigOptions,
    Client, Config,
};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Label marking namespaces created by the driver
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "interop-driver";

/// Kubernetes client wrapper
#[derive(Clone)]
pub struct K8sClient {
    client: Client,
    context: Option<String>,
}

impl K8sClient {
    /// Connect using the kubeconfig, optionally with a specific context
    pub async fn new(context: Option<&str>) -> Result<Self> {
        let client = match context {
            Some(ctx) => {
                let options = KubeConfigOptions {
                    context: Some(ctx.to_string()),
                    ..Default::default()
                };
                let config = Config::from_kubeconfig(&options)
                    .await
                    .with_context(|| format!("Failed to load kubeconfig context {ctx}"))?;
                Client::try_from(config).context("Failed to create Kubernetes client from config")?
            }
            None => Client::try_default()
                .await
                .context("Failed to create Kubernetes client")?,
        };

        Ok(Self {
            client,
            context: context.map(String::from),
        })
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Create a namespace; returns false if it already existed
    pub async fn create_namespace(&self, name: &str) -> Result<bool> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let namespace = namespace_object(name);

        match namespaces.create(&PostParams::default(), &namespace).await {
            Ok(_) => {
                info!("Created namespace {}", name);
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!("Namespace {} already exists", name);
                Ok(false)
            }
            Err(e) => Err(e).with_context(|| format!("Failed to create namespace {name}")),
        }
    }

    /// Delete a namespace; a missing namespace is not an error
    pub async fn delete_namespace(&self, name: &str) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());

        match namespaces.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!("Deleting namespace {}", name);
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!("Namespace {} already gone", name);
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to delete namespace {name}")),
        }
    }
}

fn namespace_object(name: &str) -> Namespace {
    let labels = BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string())]);
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_object_is_labelled() {
        let ns = namespace_object("alice-server-r1");
        assert_eq!(ns.metadata.name.as_deref(), Some("alice-server-r1"));
        let labels = ns.metadata.labels.unwrap();
        assert_eq!(labels.get(MANAGED_BY_LABEL).map(String::as_str), Some(MANAGED_BY));
    }
}
