use log::{debug, warn};
use thiserror::Error;
use url::form_urlencoded;

use crate::enforce::selector::{self, TenantMatcher};

// parameter carrying a full query expression
pub const QUERY_PARAM: &str = "query";
// repeated parameter carrying series selectors
pub const MATCHERS_PARAM: &str = "match[]";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnforceError {
    #[error("{0}")]
    QueryParse(String),

    #[error("{0}")]
    IllegalLabelMatcher(String),

    #[error("{0}")]
    EnforceLabel(String),
}

// Rewritten parameters, `changed` tells whether anything had to be enforced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enforced {
    pub params: String,
    pub changed: bool,
}

// Scopes query parameters to one tenant.
#[derive(Debug, Clone)]
pub struct LabelEnforcer {
    matcher: TenantMatcher,
}

fn parse_pairs(raw: &str) -> Vec<(String, String)> {
    form_urlencoded::parse(raw.as_bytes()).into_owned().collect()
}

fn encode_pairs(pairs: &[(String, String)]) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs.iter())
        .finish()
}

impl LabelEnforcer {

    pub fn new(label_name: &str, tenant_id: &str) -> Result<LabelEnforcer, EnforceError> {
        match TenantMatcher::new(label_name, tenant_id) {
            Some(matcher) => Ok(LabelEnforcer { matcher }),
            None => Err(EnforceError::IllegalLabelMatcher(format!(
                "illegal label matcher {}={:?}",
                label_name, tenant_id
            ))),
        }
    }

    pub fn tenant_id(&self) -> &str {
        self.matcher.value()
    }

    // Scope a whole expression, every selector gets the tenant matcher.
    pub fn enforce_expression(&self, expr: &str) -> Result<String, EnforceError> {
        let enforced = selector::inject_expression(expr, &self.matcher)
            .map_err(|e| EnforceError::QueryParse(format!("error parsing query string {:?}: {}", expr, e)))?;

        match selector::verify_enforced(&enforced, &self.matcher) {
            Ok(true) => Ok(enforced),
            Ok(false) | Err(_) => {
                warn!("enforced query {:?} is not scoped to {}", enforced, self.matcher.label());
                Err(EnforceError::EnforceLabel(format!(
                    "failed to enforce label {} on query",
                    self.matcher.label()
                )))
            }
        }
    }

    // Scope a `match[]` value, which must be a single series selector.
    pub fn enforce_series_selector(&self, input: &str) -> Result<String, EnforceError> {
        selector::inject_series_selector(input, &self.matcher)
            .map_err(|e| EnforceError::QueryParse(format!("error parsing {} {:?}: {}", MATCHERS_PARAM, input, e)))
    }

    // Expression style: rewrite every non-empty `query` parameter.
    // Parameters are returned untouched when no query is present.
    pub fn enforce_query_values(&self, raw: &str) -> Result<Enforced, EnforceError> {
        let mut pairs = parse_pairs(raw);
        let mut changed = false;

        for (name, value) in pairs.iter_mut() {
            if name == QUERY_PARAM && !value.is_empty() {
                *value = self.enforce_expression(value)?;
                changed = true;
            }
        }

        if !changed {
            return Ok(Enforced { params: raw.to_string(), changed: false });
        }
        debug!("enforced query parameters for tenant {}", self.tenant_id());
        Ok(Enforced { params: encode_pairs(&pairs), changed: true })
    }

    // Matcher-list style: rewrite every `match[]`, add one when there is none.
    pub fn enforce_matcher_values(&self, raw: &str) -> Result<Enforced, EnforceError> {
        let mut pairs = parse_pairs(raw);
        let mut found = false;

        for (name, value) in pairs.iter_mut() {
            if name == MATCHERS_PARAM {
                *value = self.enforce_series_selector(value)?;
                found = true;
            }
        }

        if !found {
            pairs.push((MATCHERS_PARAM.to_string(), self.matcher.to_selector()));
        }
        Ok(Enforced { params: encode_pairs(&pairs), changed: true })
    }
}
