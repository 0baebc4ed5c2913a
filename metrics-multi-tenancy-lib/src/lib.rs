use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use kube::{Api, Client, CustomResource, api::ListParams};
use log::{debug, info};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;


// Failures while loading gateway configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}


// Gateway configuration file, produced by the reconciliation layer.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
pub struct GatewayConfig {
    // Write targets every ingestion request is replicated to
    #[serde(default)]
    pub remote_write: Vec<RemoteWriteConfig>,
    // Tenants allowed to use the gateway
    #[serde(default)]
    pub admission_control: AdmissionControlConfig,
}

// A single write target.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
pub struct RemoteWriteConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub url: String,
    // Static headers sent with every forwarded request
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_config: Option<TlsConfig>,
}

// TLS material used to reach a write target.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug, Default)]
pub struct TlsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug, Default)]
pub struct AdmissionControlConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tenants: Vec<String>,
}


impl RemoteWriteConfig {
    // Name used in logs and error messages.
    pub fn display_name(&self) -> &str {
        match &self.name {
            Some(name) if !name.is_empty() => name.as_str(),
            _ => self.url.as_str(),
        }
    }
}

impl GatewayConfig {

    // Check values a YAML schema can not express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for rw in &self.remote_write {
            if !(rw.url.starts_with("http://") || rw.url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!(
                    "remote write target {} must use an http or https url",
                    rw.display_name()
                )));
            }
            if let Some(tls) = &rw.tls_config {
                if tls.cert_file.is_some() != tls.key_file.is_some() {
                    return Err(ConfigError::Invalid(format!(
                        "remote write target {} needs both cert_file and key_file",
                        rw.display_name()
                    )));
                }
            }
        }
        if self.admission_control.tenants.iter().any(|t| t.trim().is_empty()) {
            return Err(ConfigError::Invalid(String::from("admission tenant names can not be empty")));
        }
        Ok(())
    }
}

// Parse and validate configuration from a YAML document.
pub fn parse_gateway_config(yaml: &str) -> Result<GatewayConfig, ConfigError> {
    // An empty document means "nothing configured"
    if yaml.trim().is_empty() {
        return Ok(GatewayConfig::default());
    }
    let config: GatewayConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}

// Load configuration from a file.
pub fn load_gateway_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let yaml = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("loaded {} bytes of configuration from {}", yaml.len(), path.display());
    parse_gateway_config(&yaml)
}


// A GatewayTenant CRD. Lists tenants admitted to the gateway.
#[derive(CustomResource, Deserialize, Serialize, Clone, PartialEq, Eq, Debug, JsonSchema)]
#[kube(group = "open-metrics.vgs.io", version = "v1", kind = "GatewayTenant", namespaced)]
pub struct GatewayTenantSpec {
    // Tenant identifiers, the values sent with the tenant header
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tenants: Vec<String>,
    // A description, optional
    pub description: Option<String>,
}


// Extract tenants set from resources
pub fn discover_tenant_ids(resources: Vec<GatewayTenant>) -> HashSet<String> {
    let mut tenant_ids = HashSet::new();
    for resource in resources.into_iter() {
        for tenant_id in resource.spec.tenants {
            tenant_ids.insert(tenant_id);
        }
    };
    return tenant_ids;
}

// List every GatewayTenant in a namespace, following continue tokens,
// and return the union of admitted tenant IDs.
pub async fn get_tenant_ids(k8s_client: Client, namespace: &str) -> Result<HashSet<String>, kube::Error> {
    let api: Api<GatewayTenant> = Api::namespaced(k8s_client, namespace);

    let mut resources: Vec<GatewayTenant> = Vec::new();
    let mut continue_token: Option<String> = None;

    loop {
        let lp = match &continue_token {
            Some(token) => ListParams::default().continue_token(token),
            None => ListParams::default(),
        };
        let page = api.list(&lp).await?;
        resources.extend(page.items.into_iter());

        match page.metadata.continue_ {
            Some(token) if !token.is_empty() => {
                debug!("continue token: {}", token);
                continue_token = Some(token);
            }
            _ => break,
        }
    }

    info!("found {} gateway tenant resources in {}", resources.len(), namespace);
    Ok(discover_tenant_ids(resources))
}
