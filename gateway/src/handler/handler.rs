use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use hyper::Body;
use log::{debug, warn};
use thiserror::Error;
use warp::http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use warp::http::{Method, Response, StatusCode};

use crate::admission::registry::AdmissionRegistry;
use crate::auth::resolver::{RequestInfo, TenantResolver};
use crate::enforce::enforce::{EnforceError, Enforced, LabelEnforcer, QUERY_PARAM};
use crate::forward::forward::{reduce_results, RemoteWriteHandler};
use crate::metrics::metrics::GatewayStatistics;
use crate::proxy::proxy::ReverseProxy;
use crate::router::router::{self, EnforcementStyle, Route, RouteTable};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

#[derive(Debug, Error)]
pub enum GatewayError {
    // unresolved tenants look like unknown paths
    #[error("404 page not found")]
    Unauthenticated,

    #[error("404 page not found")]
    NotFound,

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("tenant {0} is not allowed to use the gateway")]
    Forbidden(String),

    #[error("no upstream is configured for this endpoint")]
    NoUpstreamConfigured,

    #[error(transparent)]
    Enforce(#[from] EnforceError),

    #[error("failed to read request body: {0}")]
    BodyRead(String),

    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(u64),

    #[error("{0}")]
    Upstream(String),
}

impl GatewayError {

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthenticated | GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::NoUpstreamConfigured => StatusCode::NOT_ACCEPTABLE,
            GatewayError::Enforce(EnforceError::QueryParse(_))
            | GatewayError::Enforce(EnforceError::IllegalLabelMatcher(_)) => StatusCode::BAD_REQUEST,
            GatewayError::Enforce(EnforceError::EnforceLabel(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::BodyRead(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    // label value for the rejection counter
    pub fn reason(&self) -> &'static str {
        match self {
            GatewayError::Unauthenticated => "unauthenticated",
            GatewayError::NotFound => "not_found",
            GatewayError::MethodNotAllowed => "method_not_allowed",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::NoUpstreamConfigured => "no_upstream",
            GatewayError::Enforce(EnforceError::QueryParse(_)) => "query_parse",
            GatewayError::Enforce(EnforceError::IllegalLabelMatcher(_)) => "illegal_label_matcher",
            GatewayError::Enforce(EnforceError::EnforceLabel(_)) => "enforce_label",
            GatewayError::BodyRead(_) => "body_read",
            GatewayError::PayloadTooLarge(_) => "payload_too_large",
            GatewayError::Upstream(_) => "upstream",
        }
    }

    pub fn into_response(self) -> Response<Body> {
        text_response(self.status(), self.to_string())
    }
}

fn text_response(status: StatusCode, text: String) -> Response<Body> {
    let mut response = Response::new(Body::from(text));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

// Everything the pipeline knows about one request. Stages take it by value
// and hand it on.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub raw_query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote_addr: Option<SocketAddr>,
    pub info: Option<RequestInfo>,
}

impl RequestContext {

    pub fn new(
        method: Method,
        path: String,
        raw_query: Option<String>,
        headers: HeaderMap,
        body: Bytes,
        remote_addr: Option<SocketAddr>,
    ) -> RequestContext {
        RequestContext { method, path, raw_query, headers, body, remote_addr, info: None }
    }

    // Body and Content-Length always change together.
    pub fn replace_body(&mut self, body: Bytes) {
        self.headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        self.body = body;
    }

    fn tenant_id(&self) -> Result<&str, GatewayError> {
        self.info
            .as_ref()
            .map(|info| info.tenant_id.as_str())
            .ok_or(GatewayError::Unauthenticated)
    }

    fn has_form_body(&self) -> bool {
        self.method == Method::POST
            && self
                .headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(';').next())
                .map(|v| v.trim().eq_ignore_ascii_case(FORM_CONTENT_TYPE))
                .unwrap_or(false)
    }

    fn form_body(&self) -> Result<&str, GatewayError> {
        std::str::from_utf8(&self.body)
            .map_err(|_| EnforceError::QueryParse(String::from("form body is not valid UTF-8")).into())
    }
}

// Collect a request body, refusing anything over `limit` bytes.
pub async fn read_body<S, B, E>(stream: S, declared: Option<u64>, limit: u64) -> Result<Bytes, GatewayError>
where
    S: Stream<Item = Result<B, E>>,
    B: Buf,
    E: Display,
{
    if declared.map(|len| len > limit).unwrap_or(false) {
        return Err(GatewayError::PayloadTooLarge(limit));
    }

    futures::pin_mut!(stream);
    let mut body = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| GatewayError::BodyRead(e.to_string()))?;
        if (body.len() + chunk.remaining()) as u64 > limit {
            return Err(GatewayError::PayloadTooLarge(limit));
        }
        body.put(chunk);
    }
    Ok(body.freeze())
}

pub struct GatewayOptions {
    // header carrying the tenant to write targets
    pub tenant_header: HeaderName,
    // label enforced on tenant queries
    pub tenant_label: String,
    pub strip_tenant_prefix: bool,
}

// The request pipeline: route, resolve tenant, admit, check upstream,
// enforce, forward.
pub struct Gateway {
    options: GatewayOptions,
    resolver: TenantResolver,
    admission: Arc<AdmissionRegistry>,
    stats: GatewayStatistics,
    remote_write: Option<RemoteWriteHandler>,
    query_proxy: Option<ReverseProxy>,
    rules_proxy: Option<ReverseProxy>,
    ui_proxy: Option<ReverseProxy>,
}

fn route_label(route: &Route) -> &'static str {
    match route {
        Route::GlobalWrite => "global_write",
        Route::GlobalQuery => "global_query",
        Route::Ui { .. } => "ui",
        Route::TenantQuery { .. } => "tenant_query",
        Route::TenantWrite { .. } => "tenant_write",
        Route::MethodNotAllowed => "method_not_allowed",
        Route::NotFound => "not_found",
    }
}

impl Gateway {

    pub fn new(
        options: GatewayOptions,
        resolver: TenantResolver,
        admission: Arc<AdmissionRegistry>,
        stats: GatewayStatistics,
    ) -> Gateway {
        Gateway {
            options,
            resolver,
            admission,
            stats,
            remote_write: None,
            query_proxy: None,
            rules_proxy: None,
            ui_proxy: None,
        }
    }

    pub fn with_remote_write(mut self, handler: Option<RemoteWriteHandler>) -> Gateway {
        self.remote_write = handler;
        self
    }

    pub fn with_query_upstream(mut self, proxy: Option<ReverseProxy>) -> Gateway {
        self.query_proxy = proxy;
        self
    }

    pub fn with_rules_upstream(mut self, proxy: Option<ReverseProxy>) -> Gateway {
        self.rules_proxy = proxy;
        self
    }

    // UI assets, the query upstream serves them when unset
    pub fn with_ui_upstream(mut self, proxy: Option<ReverseProxy>) -> Gateway {
        self.ui_proxy = proxy;
        self
    }

    pub fn route_table(&self) -> RouteTable {
        RouteTable {
            remote_write: self.remote_write.is_some(),
            query: self.query_proxy.is_some(),
        }
    }

    pub async fn handle(&self, ctx: RequestContext) -> Response<Body> {
        let path = ctx.path.clone();
        let route = router::classify(&ctx.method, &path, &self.route_table());
        let label = route_label(&route);
        self.stats.requests.with_label_values(&[label]).inc();

        let result = match route {
            Route::GlobalWrite => self.global_write(ctx).await,
            Route::GlobalQuery => self.proxy_to(self.query_proxy.as_ref(), ctx).await,
            Route::Ui { path } => self.ui(path, ctx).await,
            Route::TenantQuery { tenant, style } => self.tenant_query(tenant, style, ctx).await,
            Route::TenantWrite { tenant } => self.tenant_write(tenant, ctx).await,
            Route::MethodNotAllowed => Err(GatewayError::MethodNotAllowed),
            Route::NotFound => Err(GatewayError::NotFound),
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                debug!("{} {} rejected: {}", label, path, e);
                self.stats.rejections.with_label_values(&[e.reason()]).inc();
                e.into_response()
            }
        }
    }

    fn authenticate(&self, tenant: &str, mut ctx: RequestContext) -> Result<RequestContext, GatewayError> {
        let info = self
            .resolver
            .resolve(tenant, &ctx.headers)
            .ok_or(GatewayError::Unauthenticated)?;
        if let Some(subject) = &info.subject {
            debug!("tenant {} authenticated by {}", info.tenant_id, subject);
        }
        ctx.info = Some(info);
        Ok(ctx)
    }

    fn admit(&self, ctx: RequestContext) -> Result<RequestContext, GatewayError> {
        let tenant_id = ctx.tenant_id()?;
        if !self.admission.is_admitted(tenant_id) {
            return Err(GatewayError::Forbidden(tenant_id.to_string()));
        }
        if self.admission.is_enabled() {
            self.stats.tenant_requests.with_label_values(&[tenant_id]).inc();
        }
        Ok(ctx)
    }

    fn query_upstream(&self, path: &str) -> Result<&ReverseProxy, GatewayError> {
        let proxy = if router::is_rules_path(path) {
            self.rules_proxy.as_ref().or_else(|| self.query_proxy.as_ref())
        } else {
            self.query_proxy.as_ref()
        };
        proxy.ok_or(GatewayError::NoUpstreamConfigured)
    }

    fn enforce(&self, style: EnforcementStyle, mut ctx: RequestContext) -> Result<RequestContext, GatewayError> {
        let enforcer = LabelEnforcer::new(&self.options.tenant_label, ctx.tenant_id()?)?;
        let apply = |raw: &str| -> Result<Enforced, EnforceError> {
            match style {
                EnforcementStyle::Expression => enforcer.enforce_query_values(raw),
                EnforcementStyle::Matchers => enforcer.enforce_matcher_values(raw),
            }
        };

        let query = apply(ctx.raw_query.as_deref().unwrap_or(""))?;
        let mut enforced = query.changed;
        if query.changed {
            ctx.raw_query = Some(query.params);
        }

        if ctx.has_form_body() {
            let form = apply(ctx.form_body()?)?;
            if form.changed {
                enforced = true;
                ctx.replace_body(Bytes::from(form.params));
            }
        }

        if !enforced {
            return Err(EnforceError::QueryParse(format!("missing {} parameter", QUERY_PARAM)).into());
        }
        Ok(ctx)
    }

    fn strip_prefix(&self, mut ctx: RequestContext) -> RequestContext {
        if self.options.strip_tenant_prefix {
            ctx.path = router::strip_tenant_prefix(&ctx.path).to_string();
        }
        ctx
    }

    async fn proxy_to(&self, proxy: Option<&ReverseProxy>, ctx: RequestContext) -> Result<Response<Body>, GatewayError> {
        let proxy = proxy.ok_or(GatewayError::NoUpstreamConfigured)?;
        proxy
            .forward(
                ctx.method,
                &ctx.path,
                ctx.raw_query.as_deref(),
                &ctx.headers,
                ctx.body,
                ctx.remote_addr,
            )
            .await
            .map_err(|e| {
                warn!("upstream {} failed: {}", proxy.target(), e);
                GatewayError::Upstream(e.to_string())
            })
    }

    async fn tenant_query(
        &self,
        tenant: &str,
        style: EnforcementStyle,
        ctx: RequestContext,
    ) -> Result<Response<Body>, GatewayError> {
        let ctx = self.authenticate(tenant, ctx)?;
        let ctx = self.admit(ctx)?;
        let proxy = self.query_upstream(&ctx.path)?;
        let ctx = self.enforce(style, ctx)?;
        let ctx = self.strip_prefix(ctx);
        self.proxy_to(Some(proxy), ctx).await
    }

    async fn tenant_write(&self, tenant: &str, ctx: RequestContext) -> Result<Response<Body>, GatewayError> {
        let ctx = self.authenticate(tenant, ctx)?;
        let ctx = self.admit(ctx)?;
        let handler = self.remote_write.as_ref().ok_or(GatewayError::NoUpstreamConfigured)?;

        let tenant_id = ctx.tenant_id()?;
        let results = handler.forward(ctx.body.clone(), &ctx.headers, Some(tenant_id)).await;
        let (status, error) = reduce_results(&results);
        Ok(text_response(status, error.unwrap_or_default()))
    }

    async fn global_write(&self, ctx: RequestContext) -> Result<Response<Body>, GatewayError> {
        let handler = self.remote_write.as_ref().ok_or(GatewayError::NotFound)?;
        let tenant = ctx
            .headers
            .get(&self.options.tenant_header)
            .and_then(|v| v.to_str().ok());

        let results = handler.forward(ctx.body.clone(), &ctx.headers, tenant).await;
        let (status, error) = reduce_results(&results);
        Ok(text_response(status, error.unwrap_or_default()))
    }

    async fn ui(&self, path: &str, mut ctx: RequestContext) -> Result<Response<Body>, GatewayError> {
        ctx.path = path.to_string();
        let proxy = if path.contains(router::API_GLOBAL_PREFIX) {
            self.query_proxy.as_ref()
        } else {
            self.ui_proxy.as_ref().or_else(|| self.query_proxy.as_ref())
        };
        self.proxy_to(proxy, ctx).await
    }
}
