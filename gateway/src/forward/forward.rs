use std::convert::TryFrom;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Certificate, Client, Identity, Url};
use thiserror::Error;
use tokio::task::JoinSet;
use warp::http::StatusCode;

use metrics_multi_tenancy_lib::{RemoteWriteConfig, TlsConfig};

use crate::metrics::metrics::GatewayStatistics;

// remote write content headers, copied from the caller or defaulted
const CONTENT_HEADERS: [(&str, &str); 3] = [
    ("content-type", "application/x-protobuf"),
    ("content-encoding", "snappy"),
    ("x-prometheus-remote-write-version", "0.1.0"),
];

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("invalid remote write url {url}: {source}")]
    InvalidUrl { url: String, source: url::ParseError },

    #[error("failed to read TLS file {path}: {source}")]
    TlsFile { path: String, source: std::io::Error },

    #[error("invalid header {name} for remote write {target}")]
    InvalidHeader { target: String, name: String },

    #[error("failed to build client for remote write {target}: {source}")]
    Client { target: String, source: reqwest::Error },
}

// Outcome of one write. `code` is the target's status, 502 when it could not
// be reached and 500 when the write task never finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardResult {
    pub code: u16,
    pub error: Option<String>,
}

impl ForwardResult {
    fn ok(code: u16) -> ForwardResult {
        ForwardResult { code, error: None }
    }

    fn failed(code: u16, error: String) -> ForwardResult {
        ForwardResult { code, error: Some(error) }
    }
}

// One remote write destination.
pub struct WriteTarget {
    name: String,
    endpoint: Url,
    client: Client,
    headers: HeaderMap,
}

fn read_pem(path: &str) -> Result<Vec<u8>, ForwardError> {
    std::fs::read(path).map_err(|source| ForwardError::TlsFile { path: path.to_string(), source })
}

fn build_client(target: &str, tls: Option<&TlsConfig>) -> Result<Client, ForwardError> {
    let client_error = |source| ForwardError::Client { target: target.to_string(), source };

    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static("OM_mt_G"));

    let mut builder = reqwest::ClientBuilder::new()
        .default_headers(headers)
        .http1_title_case_headers();

    if let Some(tls) = tls {
        if let Some(ca_file) = &tls.ca_file {
            let ca = Certificate::from_pem(&read_pem(ca_file)?).map_err(client_error)?;
            builder = builder.add_root_certificate(ca);
        }
        if let (Some(cert_file), Some(key_file)) = (&tls.cert_file, &tls.key_file) {
            // rustls wants certificate chain and key in one PEM buffer
            let mut pem = read_pem(cert_file)?;
            pem.push(b'\n');
            pem.extend(read_pem(key_file)?);
            builder = builder.identity(Identity::from_pem(&pem).map_err(client_error)?);
        }
        builder = builder.danger_accept_invalid_certs(tls.insecure_skip_verify);
    }

    builder.build().map_err(client_error)
}

impl WriteTarget {

    pub fn from_config(config: &RemoteWriteConfig) -> Result<WriteTarget, ForwardError> {
        let name = config.display_name().to_string();
        let endpoint = Url::parse(&config.url)
            .map_err(|source| ForwardError::InvalidUrl { url: config.url.clone(), source })?;

        let mut headers = HeaderMap::new();
        for (key, value) in config.headers.iter() {
            let invalid = || ForwardError::InvalidHeader { target: name.clone(), name: key.clone() };
            let key = HeaderName::try_from(key.as_str()).map_err(|_| invalid())?;
            let value = HeaderValue::from_str(value).map_err(|_| invalid())?;
            headers.insert(key, value);
        }

        let client = build_client(&name, config.tls_config.as_ref())?;
        Ok(WriteTarget { name, endpoint, client, headers })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, body: Bytes, headers: HeaderMap) -> ForwardResult {
        let request = self
            .client
            .post(self.endpoint.clone())
            .headers(headers)
            .headers(self.headers.clone())
            .body(body);

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return ForwardResult::ok(status.as_u16());
                }
                let text = response.text().await.unwrap_or_default();
                ForwardResult::failed(
                    status.as_u16(),
                    format!("remote write {} returned {}: {}", self.name, status, text.trim()),
                )
            }
            Err(e) => ForwardResult::failed(
                StatusCode::BAD_GATEWAY.as_u16(),
                format!("remote write {} failed: {}", self.name, e),
            ),
        }
    }
}

// Duplicates writes to every configured target.
pub struct RemoteWriteHandler {
    targets: Vec<Arc<WriteTarget>>,
    tenant_header: HeaderName,
    stats: GatewayStatistics,
}

impl RemoteWriteHandler {

    // None when there is nothing to write to.
    pub fn new(
        configs: &[RemoteWriteConfig],
        tenant_header: HeaderName,
        stats: GatewayStatistics,
    ) -> Result<Option<RemoteWriteHandler>, ForwardError> {
        if configs.is_empty() {
            return Ok(None);
        }
        let targets = configs
            .iter()
            .map(|config| WriteTarget::from_config(config).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(RemoteWriteHandler { targets, tenant_header, stats }))
    }

    pub fn targets(&self) -> &[Arc<WriteTarget>] {
        &self.targets
    }

    fn outbound_headers(&self, inbound: &HeaderMap, tenant: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, default) in CONTENT_HEADERS.iter() {
            let value = inbound
                .get(*name)
                .cloned()
                .unwrap_or_else(|| HeaderValue::from_static(*default));
            headers.insert(HeaderName::from_static(*name), value);
        }
        if let Some(tenant) = tenant {
            match HeaderValue::from_str(tenant) {
                Ok(value) => {
                    headers.insert(self.tenant_header.clone(), value);
                }
                Err(_) => warn!("tenant {:?} is not a valid header value, not stamped", tenant),
            }
        }
        headers
    }

    // Send `body` to every target exactly once. Results are in target order.
    // Dropping the returned future aborts writes still in flight.
    pub async fn forward(&self, body: Bytes, inbound: &HeaderMap, tenant: Option<&str>) -> Vec<ForwardResult> {
        let in_ms = Instant::now();
        let headers = self.outbound_headers(inbound, tenant);

        let mut writes = JoinSet::new();
        for (idx, target) in self.targets.iter().enumerate() {
            let target = target.clone();
            let body = body.clone();
            let headers = headers.clone();
            writes.spawn(async move { (idx, target.send(body, headers).await) });
        }

        let mut slots: Vec<Option<ForwardResult>> = vec![None; self.targets.len()];
        while let Some(joined) = writes.join_next().await {
            match joined {
                Ok((idx, result)) => slots[idx] = Some(result),
                Err(e) => warn!("remote write task failed: {}", e),
            }
        }

        let results: Vec<ForwardResult> = slots
            .into_iter()
            .zip(self.targets.iter())
            .map(|(slot, target)| {
                slot.unwrap_or_else(|| {
                    ForwardResult::failed(500, format!("remote write {} did not complete", target.name))
                })
            })
            .collect();

        for (result, target) in results.iter().zip(self.targets.iter()) {
            if let Some(error) = &result.error {
                debug!("{}", error);
                self.stats.forward_failures.with_label_values(&[target.name()]).inc();
            }
        }
        self.stats.fanout_ms.observe(in_ms.elapsed().as_millis() as f64);

        results
    }
}

// Highest status code wins, the first error seen at that code is kept.
// Nothing to report is a 204.
pub fn reduce_results(results: &[ForwardResult]) -> (StatusCode, Option<String>) {
    let mut code = 0u16;
    let mut error: Option<String> = None;

    for result in results {
        if result.code > code {
            code = result.code;
            error = result.error.clone();
        } else if result.code == code && error.is_none() {
            error = result.error.clone();
        }
    }

    if code == 0 {
        return (StatusCode::NO_CONTENT, None);
    }
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, error)
}
