use warp::http::Method;

pub const API_GLOBAL_PREFIX: &str = "/api/v1";
pub const API_UI_PREFIX: &str = "/-/ui";

const EP_QUERY: &str = "/query";
const EP_QUERY_RANGE: &str = "/query_range";
const EP_SERIES: &str = "/series";
const EP_LABELS: &str = "/labels";
const EP_LABEL: &str = "/label/";
const EP_VALUES: &str = "/values";
const EP_RECEIVE: &str = "/receive";
const EP_RULES: &str = "/rules";
const EP_ALERTS: &str = "/alerts";

// How a tenant query gets scoped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementStyle {
    // full expression in `query`
    Expression,
    // series selectors in `match[]`
    Matchers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route<'a> {
    GlobalWrite,
    GlobalQuery,
    // path with the UI prefix removed
    Ui { path: &'a str },
    TenantQuery { tenant: &'a str, style: EnforcementStyle },
    TenantWrite { tenant: &'a str },
    MethodNotAllowed,
    NotFound,
}

// Which global routes exist. A global route without an upstream is not
// registered at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteTable {
    pub remote_write: bool,
    pub query: bool,
}

// `prefix` itself or anything below it, segment-wise.
fn under(path: &str, prefix: &str) -> bool {
    path == prefix || (path.starts_with(prefix) && path[prefix.len()..].starts_with('/'))
}

// `.` and `..`, percent-encoded or not. Upstream URL handling would resolve
// them and could leave the tenant scope.
fn is_dot_segment(segment: &str) -> bool {
    let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
    decoded == "." || decoded == ".."
}

// `/label/<name>/values` with a single non-empty name segment.
fn is_label_values(endpoint: &str) -> bool {
    endpoint
        .strip_prefix(EP_LABEL)
        .and_then(|rest| rest.strip_suffix(EP_VALUES))
        .map_or(false, |name| !name.is_empty() && !name.contains('/'))
}

fn only_if<'a>(allowed: bool, route: Route<'a>) -> Route<'a> {
    if allowed {
        route
    } else {
        Route::MethodNotAllowed
    }
}

fn classify_tenant<'a>(method: &Method, path: &'a str) -> Route<'a> {
    let rest = match path.strip_prefix('/') {
        Some(rest) => rest,
        None => return Route::NotFound,
    };
    let (tenant, endpoint) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => return Route::NotFound,
    };
    let endpoint = match endpoint.strip_prefix(API_GLOBAL_PREFIX) {
        Some(endpoint) => endpoint,
        None => return Route::NotFound,
    };

    let read = method == Method::GET || method == Method::POST;
    match endpoint {
        EP_QUERY | EP_QUERY_RANGE => {
            only_if(read, Route::TenantQuery { tenant, style: EnforcementStyle::Expression })
        }
        EP_SERIES | EP_LABELS => only_if(read, Route::TenantQuery { tenant, style: EnforcementStyle::Matchers }),
        EP_RULES => only_if(method == Method::GET, Route::TenantQuery { tenant, style: EnforcementStyle::Matchers }),
        EP_RECEIVE => only_if(method == Method::POST, Route::TenantWrite { tenant }),
        ep if is_label_values(ep) => {
            only_if(read, Route::TenantQuery { tenant, style: EnforcementStyle::Matchers })
        }
        _ => Route::NotFound,
    }
}

// Map method and path to a route, global routes first.
pub fn classify<'a>(method: &Method, path: &'a str, table: &RouteTable) -> Route<'a> {
    if path.split('/').any(is_dot_segment) {
        return Route::NotFound;
    }
    if table.remote_write && path == "/api/v1/receive" {
        return Route::GlobalWrite;
    }
    if table.query && under(path, API_GLOBAL_PREFIX) {
        return Route::GlobalQuery;
    }
    if table.query && under(path, API_UI_PREFIX) {
        return Route::Ui { path: &path[API_UI_PREFIX.len()..] };
    }
    classify_tenant(method, path)
}

// Rule and alert endpoints, served by the rules upstream when there is one.
pub fn is_rules_path(path: &str) -> bool {
    path.ends_with(EP_RULES) || path.ends_with(EP_ALERTS)
}

// `/acme/api/v1/query` -> `/api/v1/query`
pub fn strip_tenant_prefix(path: &str) -> &str {
    match path.get(1..).and_then(|rest| rest.find('/')) {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::EnforcementStyle::*;

    const ALL: RouteTable = RouteTable { remote_write: true, query: true };
    const NONE: RouteTable = RouteTable { remote_write: false, query: false };

    #[test]
    fn tenant_query_routes() {
        for (method, path, style) in &[
            (Method::GET, "/acme/api/v1/query", Expression),
            (Method::POST, "/acme/api/v1/query", Expression),
            (Method::GET, "/acme/api/v1/query_range", Expression),
            (Method::POST, "/acme/api/v1/query_range", Expression),
            (Method::GET, "/acme/api/v1/series", Matchers),
            (Method::POST, "/acme/api/v1/series", Matchers),
            (Method::GET, "/acme/api/v1/labels", Matchers),
            (Method::GET, "/acme/api/v1/label/job/values", Matchers),
            (Method::GET, "/acme/api/v1/rules", Matchers),
        ] {
            assert_eq!(
                classify(method, path, &NONE),
                Route::TenantQuery { tenant: "acme", style: *style },
                "{} {}",
                method,
                path
            );
        }
    }

    #[test]
    fn tenant_write_route() {
        assert_eq!(
            classify(&Method::POST, "/acme/api/v1/receive", &ALL),
            Route::TenantWrite { tenant: "acme" }
        );
        assert_eq!(classify(&Method::GET, "/acme/api/v1/receive", &ALL), Route::MethodNotAllowed);
    }

    #[test]
    fn wrong_methods() {
        assert_eq!(classify(&Method::DELETE, "/acme/api/v1/query", &NONE), Route::MethodNotAllowed);
        assert_eq!(classify(&Method::POST, "/acme/api/v1/rules", &NONE), Route::MethodNotAllowed);
    }

    #[test]
    fn unknown_paths() {
        for path in &["/", "/acme", "/acme/api/v2/query", "/acme/api/v1/alerts", "/acme/api/v1/label/", "/acme/api/v1/query/x", "metrics"] {
            assert_eq!(classify(&Method::GET, path, &ALL), Route::NotFound, "{}", path);
        }
    }

    #[test]
    fn label_values_needs_a_single_name() {
        for path in &[
            "/acme/api/v1/label//values",
            "/acme/api/v1/label/job",
            "/acme/api/v1/label/job/values/x",
            "/acme/api/v1/label/a/b/values",
            "/acme/api/v1/label/x/../../query",
        ] {
            assert_eq!(classify(&Method::GET, path, &NONE), Route::NotFound, "{}", path);
        }
    }

    #[test]
    fn dot_segments_are_not_routed() {
        for path in &[
            "/acme/api/v1/label/x/../../query",
            "/acme/api/v1/label/x/%2e%2e/%2E%2E/query",
            "/acme/api/v1/label/x/.%2e/values",
            "/acme/./api/v1/query",
            "/../api/v1/query",
            "/api/v1/../v1/query",
            "/-/ui/../api/v1/receive",
        ] {
            assert_eq!(classify(&Method::GET, path, &ALL), Route::NotFound, "{}", path);
        }
        assert_eq!(
            classify(&Method::GET, "/acme/api/v1/label/..job/values", &NONE),
            Route::TenantQuery { tenant: "acme", style: Matchers }
        );
    }

    #[test]
    fn empty_tenant_segment_still_routes() {
        assert_eq!(
            classify(&Method::GET, "//api/v1/query", &NONE),
            Route::TenantQuery { tenant: "", style: Expression }
        );
    }

    #[test]
    fn global_routes_when_configured() {
        assert_eq!(classify(&Method::POST, "/api/v1/receive", &ALL), Route::GlobalWrite);
        assert_eq!(classify(&Method::PUT, "/api/v1/receive", &ALL), Route::GlobalWrite);
        assert_eq!(classify(&Method::GET, "/api/v1/query", &ALL), Route::GlobalQuery);
        assert_eq!(classify(&Method::GET, "/api/v1", &ALL), Route::GlobalQuery);
        assert_eq!(classify(&Method::GET, "/api/v1status", &ALL), Route::NotFound);
        assert_eq!(
            classify(&Method::POST, "/api/v1/receive", &RouteTable { remote_write: false, query: true }),
            Route::GlobalQuery
        );
    }

    #[test]
    fn global_routes_absent_without_upstream() {
        assert_eq!(classify(&Method::POST, "/api/v1/receive", &NONE), Route::NotFound);
        assert_eq!(classify(&Method::GET, "/api/v1/query", &NONE), Route::NotFound);
        assert_eq!(classify(&Method::GET, "/-/ui/graph", &NONE), Route::NotFound);
    }

    #[test]
    fn ui_routes() {
        assert_eq!(classify(&Method::GET, "/-/ui/graph", &ALL), Route::Ui { path: "/graph" });
        assert_eq!(classify(&Method::GET, "/-/ui", &ALL), Route::Ui { path: "" });
        assert_eq!(
            classify(&Method::GET, "/-/ui/api/v1/query", &ALL),
            Route::Ui { path: "/api/v1/query" }
        );
    }

    #[test]
    fn rules_paths() {
        assert!(is_rules_path("/acme/api/v1/rules"));
        assert!(is_rules_path("/api/v1/alerts"));
        assert!(!is_rules_path("/acme/api/v1/series"));
    }

    #[test]
    fn strips_first_segment() {
        assert_eq!(strip_tenant_prefix("/acme/api/v1/query"), "/api/v1/query");
        assert_eq!(strip_tenant_prefix("/acme"), "/acme");
        assert_eq!(strip_tenant_prefix("/"), "/");
    }
}
