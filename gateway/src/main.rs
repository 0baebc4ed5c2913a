use std::convert::{Infallible, TryFrom};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use argh::FromArgs;
use log::{error, info, warn};
use prometheus::Registry;
use reqwest::Url;
use thiserror::Error;
use warp::http::header::{HeaderMap, HeaderName, CONTENT_LENGTH};
use warp::http::{Method, StatusCode};
use warp::log as http_log;
use warp::path::FullPath;
use warp::Filter;

use metrics_multi_tenancy_lib::{self as gateway_lib, ConfigError, GatewayConfig};

mod admission;
mod auth;
mod enforce;
mod forward;
mod handler;
mod metrics;
mod proxy;
mod router;

use admission::registry::AdmissionRegistry;
use admission::worker::{refresh, worker, TenantSource};
use auth::resolver::TenantResolver;
use forward::forward::{ForwardError, RemoteWriteHandler};
use handler::handler::{read_body, Gateway, GatewayOptions, RequestContext};
use metrics::metrics::{encode_metrics, GatewayStatistics};
use proxy::proxy::{ProxyError, ReverseProxy};

#[derive(FromArgs)]
/// Open Metrics multi tenancy Gateway
struct OpenMetricsGatewayArgs {
    /// port for serving http (default 19093)
    #[argh(option, default = "default_port()")]
    port: u16,

    /// interface for serving http (default 127.0.0.1)
    #[argh(option, default = "String::from(\"127.0.0.1\")")]
    interface: String,

    /// max content length allowed to be posted
    #[argh(option, default = "default_content_length_limit()")]
    content_length_limit: u64,

    /// header carrying the tenant id to write targets (default X-Scope-OrgID)
    #[argh(option, default = "String::from(\"X-Scope-OrgID\")")]
    tenant_header: String,

    /// label enforced on tenant queries (default tenant_id)
    #[argh(option, default = "String::from(\"tenant_id\")")]
    tenant_label: String,

    /// header with the client certificate subject set by the TLS terminator (optional)
    #[argh(option)]
    tenant_subject_header: Option<String>,

    /// upstream url of the query engine
    #[argh(option)]
    query_upstream_url: Option<String>,

    /// upstream url serving rules and alerts (default query upstream)
    #[argh(option)]
    rules_upstream_url: Option<String>,

    /// upstream url serving the UI (default query upstream)
    #[argh(option)]
    ui_upstream_url: Option<String>,

    /// YAML file with remote write targets and admitted tenants
    #[argh(option)]
    config_file: Option<String>,

    /// only admit tenants from the admission list
    #[argh(switch)]
    enable_tenants_admission: bool,

    /// re-read the admission list from the config file (0 disables)
    #[argh(option, default = "default_reload_interval()")]
    admission_reload_interval_seconds: u32,

    /// read the admission list from GatewayTenant resources (0 disables)
    #[argh(option, default = "0")]
    kubernetes_poll_interval_seconds: u32,

    /// drop the /{tenant} path prefix before proxying
    #[argh(switch)]
    strip_tenant_prefix: bool,

    /// certificate for serving https
    #[argh(option)]
    tls_cert_file: Option<String>,

    /// key for serving https
    #[argh(option)]
    tls_key_file: Option<String>,

    /// CA to require and verify client certificates against
    #[argh(option)]
    tls_client_ca_file: Option<String>,
}

// port
fn default_port() -> u16 {
    19093
}

// config reload interval
fn default_reload_interval() -> u32 {
    60
}

// content length limit
fn default_content_length_limit() -> u64 {
    100 * 1024 * 1024
}

#[derive(Debug, Error)]
enum StartupError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Forward(#[from] ForwardError),

    #[error("{0}")]
    Proxy(#[from] ProxyError),

    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("kubernetes client: {0}")]
    Kube(#[from] kube::Error),

    #[error("invalid {flag} {value}: {reason}")]
    InvalidFlag { flag: &'static str, value: String, reason: String },

    #[error("{flag} can not be used with {other}: {reason}")]
    ConflictingFlags { flag: &'static str, other: &'static str, reason: &'static str },
}

// The subject header is only trustworthy behind a TLS terminator which sets
// it. When the gateway serves TLS itself nothing strips a client supplied
// header, and warp does not expose the verified peer certificate.
fn check_tls_flags(
    cert: Option<&str>,
    key: Option<&str>,
    client_ca: Option<&str>,
    subject_header: Option<&str>,
) -> Result<(), StartupError> {
    match (cert, key) {
        (Some(_), None) => Err(StartupError::ConflictingFlags {
            flag: "--tls-cert-file",
            other: "a missing --tls-key-file",
            reason: "both are needed to serve https",
        }),
        (None, Some(_)) => Err(StartupError::ConflictingFlags {
            flag: "--tls-key-file",
            other: "a missing --tls-cert-file",
            reason: "both are needed to serve https",
        }),
        (None, None) if client_ca.is_some() => Err(StartupError::ConflictingFlags {
            flag: "--tls-client-ca-file",
            other: "plain http",
            reason: "client certificates are only verified when serving https",
        }),
        (Some(_), Some(_)) if subject_header.is_some() => Err(StartupError::ConflictingFlags {
            flag: "--tenant-subject-header",
            other: "--tls-cert-file",
            reason: "clients could set the header themselves, terminate TLS in front of the gateway instead",
        }),
        _ => Ok(()),
    }
}

fn header_name(flag: &'static str, value: &str) -> Result<HeaderName, StartupError> {
    HeaderName::try_from(value).map_err(|e| StartupError::InvalidFlag {
        flag,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn upstream(flag: &'static str, value: Option<&String>) -> Result<Option<ReverseProxy>, StartupError> {
    match value {
        None => Ok(None),
        Some(value) => {
            let url = Url::parse(value).map_err(|e| StartupError::InvalidFlag {
                flag,
                value: value.to_string(),
                reason: e.to_string(),
            })?;
            Ok(Some(ReverseProxy::new(url)?))
        }
    }
}

fn with_gateway(gateway: Arc<Gateway>) -> impl Filter<Extract = (Arc<Gateway>,), Error = Infallible> + Clone {
    warp::any().map(move || gateway.clone())
}

fn with_registry(r: Registry) -> impl Filter<Extract = (Registry,), Error = Infallible> + Clone {
    warp::any().map(move || r.clone())
}

// Tenant list source for the reload worker, if any.
async fn tenant_source(args: &OpenMetricsGatewayArgs) -> Result<Option<(TenantSource, u64)>, StartupError> {
    if !args.enable_tenants_admission {
        return Ok(None);
    }
    if args.kubernetes_poll_interval_seconds > 0 {
        let client = kube::Client::try_default().await?;
        let source = TenantSource::Kubernetes { client, namespace: TenantSource::namespace() };
        return Ok(Some((source, args.kubernetes_poll_interval_seconds as u64 * 1000)));
    }
    match &args.config_file {
        Some(path) if args.admission_reload_interval_seconds > 0 => Ok(Some((
            TenantSource::File(PathBuf::from(path)),
            args.admission_reload_interval_seconds as u64 * 1000,
        ))),
        _ => Ok(None),
    }
}

async fn build_gateway(
    args: &OpenMetricsGatewayArgs,
    stats: GatewayStatistics,
) -> Result<(Gateway, Arc<AdmissionRegistry>), StartupError> {
    check_tls_flags(
        args.tls_cert_file.as_deref(),
        args.tls_key_file.as_deref(),
        args.tls_client_ca_file.as_deref(),
        args.tenant_subject_header.as_deref(),
    )?;

    let config = match &args.config_file {
        Some(path) => gateway_lib::load_gateway_config(&PathBuf::from(path))?,
        None => GatewayConfig::default(),
    };

    let tenant_header = header_name("--tenant-header", &args.tenant_header)?;
    let subject_header = match &args.tenant_subject_header {
        Some(value) => Some(header_name("--tenant-subject-header", value)?),
        None => None,
    };

    let admission = Arc::new(AdmissionRegistry::new(args.enable_tenants_admission));
    if admission.is_enabled() {
        admission.reload(config.admission_control.tenants.clone()).await;
        stats.admitted_tenants.set(admission.len() as i64);
    }

    let remote_write = RemoteWriteHandler::new(&config.remote_write, tenant_header.clone(), stats.clone())?;
    match &remote_write {
        Some(handler) => info!("forwarding remote writes to {} targets", handler.targets().len()),
        None => warn!("no remote write targets configured, tenant writes answer 406"),
    }

    let options = GatewayOptions {
        tenant_header,
        tenant_label: args.tenant_label.clone(),
        strip_tenant_prefix: args.strip_tenant_prefix,
    };

    let resolver = TenantResolver::new(subject_header);
    if resolver.requires_subject() {
        info!("tenants must be authenticated by client certificate subject");
    }

    let gateway = Gateway::new(options, resolver, admission.clone(), stats)
        .with_remote_write(remote_write)
        .with_query_upstream(upstream("--query-upstream-url", args.query_upstream_url.as_ref())?)
        .with_rules_upstream(upstream("--rules-upstream-url", args.rules_upstream_url.as_ref())?)
        .with_ui_upstream(upstream("--ui-upstream-url", args.ui_upstream_url.as_ref())?);

    Ok((gateway, admission))
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let http_log_wrapper = http_log("Open-Metrics-multi-tenancy-Gateway");

    let args: OpenMetricsGatewayArgs = argh::from_env();

    let r = Registry::new();
    let stats = match GatewayStatistics::register(&r) {
        Ok(stats) => stats,
        Err(e) => {
            error!("{}", StartupError::from(e));
            exit(1);
        }
    };

    let (gateway, admission) = match build_gateway(&args, stats.clone()).await {
        Ok(built) => built,
        Err(e) => {
            error!("Failed to start gateway: {}", e);
            exit(1);
        }
    };

    match tenant_source(&args).await {
        Ok(Some((source, poll_ms))) => {
            refresh(&source, &admission, &stats.admitted_tenants).await;
            tokio::task::spawn(worker(source, admission.clone(), stats.admitted_tenants.clone(), poll_ms));
        }
        Ok(None) => {}
        Err(e) => {
            error!("Failed to start admission reload: {}", e);
            exit(1);
        }
    }

    let limit = args.content_length_limit;
    let gateway = Arc::new(gateway);

    // everything that is not an operational route goes through the pipeline
    let pipeline = warp::any()
        .and(warp::method())
        .and(warp::path::full())
        .and(warp::query::raw().or(warp::any().map(String::new)).unify())
        .and(warp::header::headers_cloned())
        .and(warp::addr::remote())
        .and(warp::body::stream())
        .and(with_gateway(gateway))
        .and_then(
            move |method: Method,
                  path: FullPath,
                  query: String,
                  headers: HeaderMap,
                  remote_addr,
                  body,
                  gateway: Arc<Gateway>| async move {
                let declared = headers
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                let body = match read_body(body, declared, limit).await {
                    Ok(body) => body,
                    Err(e) => return Ok::<_, Infallible>(e.into_response()),
                };
                let raw_query = if query.is_empty() { None } else { Some(query) };
                let ctx = RequestContext::new(method, path.as_str().to_string(), raw_query, headers, body, remote_addr);
                Ok::<_, Infallible>(gateway.handle(ctx).await)
            },
        );

    let health = warp::path("-")
        .and(warp::path("healthy").or(warp::path("ready")).unify())
        .and(warp::path::end())
        .and(warp::get())
        .map(|| "Up\n");

    let metrics = warp::path!("metrics")
        .and(warp::get())
        .and(with_registry(r))
        .map(|_r: Registry| match encode_metrics(&_r) {
            Ok(text) => warp::reply::with_status(text, StatusCode::OK),
            Err(e) => {
                error!("Failed to encode metrics: {}", e);
                warp::reply::with_status(String::new(), StatusCode::INTERNAL_SERVER_ERROR)
            }
        });

    let routes = metrics.or(health).or(pipeline).with(http_log_wrapper);

    let listen_addr = args.interface.parse::<IpAddr>();

    let exit_code = match listen_addr {
        Ok(ip) => {
            let server = warp::serve(routes);
            match (&args.tls_cert_file, &args.tls_key_file) {
                (Some(cert), Some(key)) => {
                    let mut tls = server.tls().cert_path(cert).key_path(key);
                    if let Some(ca) = &args.tls_client_ca_file {
                        tls = tls.client_auth_required_path(ca);
                    }
                    info!("serving https on {}:{}", ip, args.port);
                    tls.run((ip, args.port)).await;
                }
                _ => {
                    info!("serving http on {}:{}", ip, args.port);
                    server.run((ip, args.port)).await;
                }
            }
            0
        }
        Err(e) => {
            error!("Invalid IP address: {}, err={}", args.interface, e);
            2
        }
    };

    exit(exit_code);
}
