use std::net::SocketAddr;

use bytes::Bytes;
use hyper::Body;
use log::debug;
use reqwest::redirect::Policy;
use reqwest::{Client, Url};
use thiserror::Error;
use warp::http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST};
use warp::http::{Method, Response};

// Headers that only make sense for a single connection.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid upstream response: {0}")]
    Response(#[from] warp::http::Error),
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

// Header names listed in `Connection`, dropped along with it.
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

fn request_headers(inbound: &HeaderMap, remote_addr: Option<SocketAddr>) -> HeaderMap {
    let dropped = connection_tokens(inbound);
    let mut headers = HeaderMap::new();
    for (name, value) in inbound.iter() {
        if is_hop_by_hop(name) || name == HOST || name == CONTENT_LENGTH || dropped.iter().any(|d| d == name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Some(addr) = remote_addr {
        let client = addr.ip().to_string();
        let forwarded = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{}, {}", prior, client),
            None => client,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }
    headers
}

// Streams requests to a single upstream.
pub struct ReverseProxy {
    target: Url,
    client: Client,
}

impl ReverseProxy {

    pub fn new(target: Url) -> Result<ReverseProxy, ProxyError> {
        let client = reqwest::ClientBuilder::new()
            .redirect(Policy::none())
            .build()?;
        Ok(ReverseProxy { target, client })
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    // Target base path joined with the request path, request query kept.
    fn target_url(&self, path: &str, raw_query: Option<&str>) -> Url {
        let mut url = self.target.clone();
        let base = self.target.path().trim_end_matches('/');
        let joined = if path.is_empty() || path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        };
        url.set_path(&joined);
        url.set_query(raw_query.filter(|q| !q.is_empty()));
        url
    }

    pub async fn forward(
        &self,
        method: Method,
        path: &str,
        raw_query: Option<&str>,
        headers: &HeaderMap,
        body: Bytes,
        remote_addr: Option<SocketAddr>,
    ) -> Result<Response<Body>, ProxyError> {
        let url = self.target_url(path, raw_query);
        debug!("proxying {} {}", method, url);

        let upstream = self
            .client
            .request(method, url)
            .headers(request_headers(headers, remote_addr))
            .body(body)
            .send()
            .await?;

        let dropped = connection_tokens(upstream.headers());
        let mut response = Response::builder().status(upstream.status());
        for (name, value) in upstream.headers().iter() {
            if is_hop_by_hop(name) || dropped.iter().any(|d| d == name.as_str()) {
                continue;
            }
            response = response.header(name, value);
        }
        Ok(response.body(Body::wrap_stream(upstream.bytes_stream()))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{mock, Matcher};
    use serial_test::serial;

    fn proxy(path: &str) -> ReverseProxy {
        ReverseProxy::new(Url::parse(&format!("{}{}", mockito::server_url(), path)).unwrap()).unwrap()
    }

    #[test]
    fn joins_base_path() {
        let p = ReverseProxy::new(Url::parse("http://thanos:9090/prefix/").unwrap()).unwrap();
        assert_eq!(
            p.target_url("/api/v1/query", Some("query=up")).as_str(),
            "http://thanos:9090/prefix/api/v1/query?query=up"
        );
        assert_eq!(p.target_url("graph", None).as_str(), "http://thanos:9090/prefix/graph");

        let p = ReverseProxy::new(Url::parse("http://thanos:9090").unwrap()).unwrap();
        assert_eq!(p.target_url("/api/v1/labels", Some("")).as_str(), "http://thanos:9090/api/v1/labels");
        assert_eq!(p.target_url("", None).as_str(), "http://thanos:9090/");
    }

    #[test]
    fn filters_request_headers() {
        let mut inbound = HeaderMap::new();
        inbound.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-private"));
        inbound.insert("x-private", HeaderValue::from_static("secret"));
        inbound.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        inbound.insert(HOST, HeaderValue::from_static("gateway"));
        inbound.insert(CONTENT_LENGTH, HeaderValue::from_static("12"));
        inbound.insert("accept", HeaderValue::from_static("application/json"));
        inbound.insert(X_FORWARDED_FOR, HeaderValue::from_static("192.168.0.1"));

        let headers = request_headers(&inbound, Some("10.0.0.1:4321".parse().unwrap()));
        assert_eq!(headers.len(), 2);
        assert_eq!(headers["accept"], "application/json");
        assert_eq!(headers[X_FORWARDED_FOR], "192.168.0.1, 10.0.0.1");
    }

    #[tokio::test]
    #[serial]
    async fn proxies_request_and_streams_response() {
        let m = mock("GET", "/prefix/acme/api/v1/query")
            .match_query(Matcher::UrlEncoded("query".into(), "up".into()))
            .match_header("x-forwarded-for", "10.0.0.1")
            .match_header("accept", "application/json")
            .with_status(200)
            .with_header("x-upstream", "thanos")
            .with_body(r#"{"status":"success"}"#)
            .expect(1)
            .create();

        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("application/json"));
        let response = proxy("/prefix")
            .forward(
                Method::GET,
                "/acme/api/v1/query",
                Some("query=up"),
                &headers,
                Bytes::new(),
                Some("10.0.0.1:4321".parse().unwrap()),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["x-upstream"], "thanos");
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(body, Bytes::from(r#"{"status":"success"}"#));
        m.assert();
    }

    #[tokio::test]
    #[serial]
    async fn does_not_follow_redirects() {
        let m = mock("GET", "/graph")
            .with_status(302)
            .with_header("location", "/elsewhere")
            .expect(1)
            .create();

        let response = proxy("")
            .forward(Method::GET, "/graph", None, &HeaderMap::new(), Bytes::new(), None)
            .await
            .unwrap();
        assert_eq!(response.status(), 302);
        assert_eq!(response.headers()["location"], "/elsewhere");
        m.assert();
    }

    #[tokio::test]
    async fn unreachable_upstream_is_transport_error() {
        let p = ReverseProxy::new(Url::parse("http://127.0.0.1:1").unwrap()).unwrap();
        let result = p
            .forward(Method::GET, "/api/v1/query", None, &HeaderMap::new(), Bytes::new(), None)
            .await;
        assert!(matches!(result, Err(ProxyError::Transport(_))));
    }
}
