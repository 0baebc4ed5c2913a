use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use log::{debug, error, info};
use prometheus::IntGauge;
use thiserror::Error;
use tokio::time::interval;

use metrics_multi_tenancy_lib::{self as gateway_lib, ConfigError};

use crate::admission::registry::AdmissionRegistry;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("failed to list GatewayTenant resources: {0}")]
    Kube(#[from] kube::Error),
}

// Where the admitted tenant list comes from.
pub enum TenantSource {
    // `admission_control.tenants` of the gateway configuration file
    File(PathBuf),
    // GatewayTenant resources in a namespace
    Kubernetes { client: Client, namespace: String },
}

impl TenantSource {

    // Namespace to look for GatewayTenant resources in.
    pub fn namespace() -> String {
        std::env::var("OPEN_METRICS_GATEWAY_NAMESPACE").unwrap_or("default".into())
    }

    pub async fn fetch(&self) -> Result<Vec<String>, SourceError> {
        match self {
            TenantSource::File(path) => {
                let config = gateway_lib::load_gateway_config(path)?;
                Ok(config.admission_control.tenants)
            }
            TenantSource::Kubernetes { client, namespace } => {
                let ids = gateway_lib::get_tenant_ids(client.clone(), namespace).await?;
                let mut tenants: Vec<String> = ids.into_iter().collect();
                tenants.sort();
                Ok(tenants)
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            TenantSource::File(path) => format!("file {}", path.display()),
            TenantSource::Kubernetes { namespace, .. } => format!("kubernetes namespace {}", namespace),
        }
    }
}

// Fetch the list once and apply it. Failures keep the current list.
pub async fn refresh(source: &TenantSource, registry: &AdmissionRegistry, admitted: &IntGauge) -> bool {
    match source.fetch().await {
        Ok(tenants) => {
            let summary = registry.reload(tenants).await;
            if !summary.added.is_empty() || !summary.removed.is_empty() {
                info!(
                    "admission list from {}: {} added, {} removed",
                    source.describe(),
                    summary.added.len(),
                    summary.removed.len()
                );
            }
            admitted.set(registry.len() as i64);
            true
        }
        Err(e) => {
            error!("Failed to acquire tenants from {}, will retry later: {}", source.describe(), e);
            false
        }
    }
}

// Reload worker: poll the tenant source forever.
pub async fn worker(
    source: TenantSource,
    registry: Arc<AdmissionRegistry>,
    admitted: IntGauge,
    poll_ms: u64,
) {
    if !registry.is_enabled() || poll_ms == 0 {
        debug!("admission reload worker not started");
        return;
    }
    info!("reloading admission list from {} every {}ms", source.describe(), poll_ms);

    let mut ticker = interval(Duration::from_millis(poll_ms));
    loop {
        ticker.tick().await;
        refresh(&source, &registry, &admitted).await;
    }
}
