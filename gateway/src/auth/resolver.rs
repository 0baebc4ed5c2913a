use log::debug;
use warp::http::header::{HeaderMap, HeaderName};

// Identity resolved for a tenant-scoped request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub tenant_id: String,
    // client certificate subject the identity was taken from
    pub subject: Option<String>,
}

// Resolves the tenant of a request from its `/{tenant}` path segment.
//
// With a subject header configured, the request must also carry the client
// certificate subject forwarded by the TLS terminator, and its CN must name
// the same tenant.
#[derive(Debug, Clone, Default)]
pub struct TenantResolver {
    subject_header: Option<HeaderName>,
}

// A tenant has to fit in a header value and a path segment.
fn is_valid_tenant_id(tenant_id: &str) -> bool {
    !tenant_id.is_empty()
        && tenant_id.len() <= 256
        && tenant_id.bytes().all(|b| b.is_ascii_graphic() && b != b'/')
}

// CN attribute of an RFC 2253 (`CN=acme,O=org`) or OpenSSL
// (`/O=org/CN=acme`) formatted subject.
pub fn subject_common_name(subject: &str) -> Option<&str> {
    let separator = if subject.starts_with('/') { '/' } else { ',' };
    subject
        .split(separator)
        .map(str::trim)
        .find_map(|attr| {
            let mut kv = attr.splitn(2, '=');
            match (kv.next(), kv.next()) {
                (Some(key), Some(value)) if key.trim().eq_ignore_ascii_case("CN") => Some(value.trim()),
                _ => None,
            }
        })
        .filter(|cn| !cn.is_empty())
}

impl TenantResolver {

    pub fn new(subject_header: Option<HeaderName>) -> TenantResolver {
        TenantResolver { subject_header }
    }

    pub fn requires_subject(&self) -> bool {
        self.subject_header.is_some()
    }

    // None means unauthenticated.
    pub fn resolve(&self, path_tenant: &str, headers: &HeaderMap) -> Option<RequestInfo> {
        if !is_valid_tenant_id(path_tenant) {
            debug!("rejecting malformed tenant path segment");
            return None;
        }

        let header = match &self.subject_header {
            None => {
                return Some(RequestInfo { tenant_id: path_tenant.to_string(), subject: None });
            }
            Some(header) => header,
        };

        let subject = headers.get(header).and_then(|v| v.to_str().ok())?;
        match subject_common_name(subject) {
            Some(cn) if cn == path_tenant => Some(RequestInfo {
                tenant_id: path_tenant.to_string(),
                subject: Some(subject.to_string()),
            }),
            _ => {
                debug!("certificate subject does not authenticate tenant {}", path_tenant);
                None
            }
        }
    }
}
