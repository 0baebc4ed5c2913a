// Locates series selectors inside a query expression and injects the
// tenant label matcher into each of them.
//
// Only the parts of the grammar that decide what is a selector are
// understood: strings, comments, range/subquery brackets, grouping label
// lists, function and aggregation calls, keywords and numbers. Everything
// between selectors is copied through as written, the upstream engine
// remains the authority on the rest of the expression.

use std::fmt;

// vector matching keywords, never metric names
const MATCHING_KEYWORDS: &[&str] = &["on", "ignoring", "group_left", "group_right", "bool"];

// binary operators spelled as words, metric names when an operand is expected
const WORD_OPERATORS: &[&str] = &["and", "or", "unless", "atan2"];

const AGGREGATIONS: &[&str] = &[
    "sum", "avg", "count", "min", "max", "group", "stddev", "stdvar", "topk", "bottomk",
    "count_values", "quantile", "limitk", "limit_ratio",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanError {
    pub pos: usize,
    pub msg: String,
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error at char {}: {}", self.pos + 1, self.msg)
    }
}

impl std::error::Error for ScanError {}

fn scan_error<T>(pos: usize, msg: impl Into<String>) -> Result<T, ScanError> {
    Err(ScanError { pos, msg: msg.into() })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Ident,
    Number,
    Str,
    LBrace,
    RBrace,
    LParen,
    RParen,
    Range,
    Comma,
    MatchOp,
    Operator,
    At,
}

#[derive(Debug, Clone, Copy)]
struct Token {
    kind: TokenKind,
    start: usize,
    end: usize,
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b':'
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b':'
}

fn tokenize(src: &str) -> Result<Vec<Token>, ScanError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos];
        let start = pos;

        let kind = match c {
            b' ' | b'\t' | b'\n' | b'\r' => {
                pos += 1;
                continue;
            }
            b'#' => {
                while pos < bytes.len() && bytes[pos] != b'\n' {
                    pos += 1;
                }
                continue;
            }
            b'"' | b'\'' => {
                pos += 1;
                loop {
                    match bytes.get(pos) {
                        None | Some(b'\n') => return scan_error(start, "unterminated quoted string"),
                        Some(b'\\') => pos += 2,
                        Some(&b) if b == c => {
                            pos += 1;
                            break;
                        }
                        Some(_) => pos += 1,
                    }
                }
                TokenKind::Str
            }
            b'`' => match src[pos + 1..].find('`') {
                Some(offset) => {
                    pos += offset + 2;
                    TokenKind::Str
                }
                None => return scan_error(start, "unterminated raw string"),
            },
            b'[' => match src[pos..].find(']') {
                Some(offset) => {
                    pos += offset + 1;
                    TokenKind::Range
                }
                None => return scan_error(start, "unclosed left bracket"),
            },
            b'{' | b'}' | b'(' | b')' | b',' | b'@' => {
                pos += 1;
                match c {
                    b'{' => TokenKind::LBrace,
                    b'}' => TokenKind::RBrace,
                    b'(' => TokenKind::LParen,
                    b')' => TokenKind::RParen,
                    b',' => TokenKind::Comma,
                    _ => TokenKind::At,
                }
            }
            b'=' => match bytes.get(pos + 1) {
                Some(b'~') => {
                    pos += 2;
                    TokenKind::MatchOp
                }
                Some(b'=') => {
                    pos += 2;
                    TokenKind::Operator
                }
                _ => {
                    pos += 1;
                    TokenKind::MatchOp
                }
            },
            b'!' => match bytes.get(pos + 1) {
                Some(b'=') | Some(b'~') => {
                    pos += 2;
                    TokenKind::MatchOp
                }
                _ => return scan_error(start, "unexpected character after '!'"),
            },
            b'<' | b'>' => {
                pos += if bytes.get(pos + 1) == Some(&b'=') { 2 } else { 1 };
                TokenKind::Operator
            }
            b'+' | b'-' | b'*' | b'/' | b'%' | b'^' => {
                pos += 1;
                TokenKind::Operator
            }
            b'0'..=b'9' | b'.' => {
                if c == b'.' && !bytes.get(pos + 1).map_or(false, u8::is_ascii_digit) {
                    return scan_error(start, "unexpected character '.'");
                }
                let hex = src[pos..].starts_with("0x") || src[pos..].starts_with("0X");
                pos += 1;
                while pos < bytes.len() {
                    let b = bytes[pos];
                    let exponent_sign = (b == b'+' || b == b'-')
                        && !hex
                        && matches!(bytes[pos - 1], b'e' | b'E')
                        && bytes.get(pos + 1).map_or(false, u8::is_ascii_digit);
                    if b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || exponent_sign {
                        pos += 1;
                    } else {
                        break;
                    }
                }
                TokenKind::Number
            }
            b if is_ident_start(b) => {
                while pos < bytes.len() && is_ident_char(bytes[pos]) {
                    pos += 1;
                }
                TokenKind::Ident
            }
            _ => {
                let ch = src[pos..].chars().next().unwrap_or('?');
                return scan_error(start, format!("unexpected character {:?}", ch));
            }
        };

        tokens.push(Token { kind, start, end: pos });
    }

    Ok(tokens)
}

// Decode a quoted string literal.
fn unquote(literal: &str) -> String {
    if literal.starts_with('`') {
        return literal[1..literal.len() - 1].to_string();
    }
    let inner = &literal[1..literal.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

pub fn is_valid_label_name(name: &str) -> bool {
    let mut bytes = name.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphabetic() || b == b'_' => bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_'),
        _ => false,
    }
}

// One item between selector braces.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Matcher {
    // decoded label name, None for a quoted metric name
    label: Option<String>,
    op: String,
    // source text, re-emitted untouched
    text: String,
}

#[derive(Debug, Clone)]
struct Selector {
    start: usize,
    end: usize,
    metric: Option<String>,
    // alternatives joined with `or`
    groups: Vec<Vec<Matcher>>,
}

impl Selector {
    fn render(&self) -> String {
        let groups: Vec<String> = self
            .groups
            .iter()
            .map(|group| group.iter().map(|m| m.text.as_str()).collect::<Vec<_>>().join(","))
            .collect();
        format!("{}{{{}}}", self.metric.as_deref().unwrap_or(""), groups.join(" or "))
    }
}

fn text<'a>(src: &'a str, token: &Token) -> &'a str {
    &src[token.start..token.end]
}

fn kind_at(tokens: &[Token], idx: usize) -> Option<TokenKind> {
    tokens.get(idx).map(|t| t.kind)
}

// Skip `( label, "label", ... )`, return index past the closing paren.
fn skip_label_list(src: &str, tokens: &[Token], open: usize) -> Result<usize, ScanError> {
    let mut i = open + 1;
    loop {
        match tokens.get(i) {
            None => return scan_error(src.len(), "unclosed grouping label list"),
            Some(t) if t.kind == TokenKind::RParen => return Ok(i + 1),
            Some(t) if matches!(t.kind, TokenKind::Ident | TokenKind::Str | TokenKind::Comma) => i += 1,
            Some(t) => return scan_error(t.start, format!("unexpected {:?} in grouping labels", text(src, t))),
        }
    }
}

// Parse `{ ... }` starting at the brace, return groups and the closing index.
fn parse_matchers(src: &str, tokens: &[Token], open: usize) -> Result<(Vec<Vec<Matcher>>, usize), ScanError> {
    let mut groups: Vec<Vec<Matcher>> = vec![Vec::new()];
    let mut i = open + 1;

    loop {
        let token = match tokens.get(i) {
            Some(t) => *t,
            None => return scan_error(tokens[open].start, "unclosed left brace"),
        };
        let current_empty = groups.last().map_or(true, Vec::is_empty);

        match token.kind {
            TokenKind::RBrace => {
                if groups.len() > 1 && current_empty {
                    return scan_error(token.start, "empty alternative after 'or'");
                }
                return Ok((groups, i));
            }
            TokenKind::Ident
                if text(src, &token).eq_ignore_ascii_case("or")
                    && !current_empty
                    && kind_at(tokens, i + 1) != Some(TokenKind::MatchOp) =>
            {
                groups.push(Vec::new());
                i += 1;
                continue;
            }
            TokenKind::Ident | TokenKind::Str => {
                let name = text(src, &token);
                let matcher = if kind_at(tokens, i + 1) == Some(TokenKind::MatchOp) {
                    let op = text(src, &tokens[i + 1]);
                    let value = match tokens.get(i + 2) {
                        Some(v) if v.kind == TokenKind::Str => text(src, v),
                        Some(v) => return scan_error(v.start, format!("unexpected {:?} in label matching, expected string", text(src, v))),
                        None => return scan_error(src.len(), "unexpected end of input in label matching"),
                    };
                    let label = if token.kind == TokenKind::Str { unquote(name) } else { name.to_string() };
                    i += 3;
                    Matcher {
                        label: Some(label),
                        op: op.to_string(),
                        text: format!("{}{}{}", name, op, value),
                    }
                } else if token.kind == TokenKind::Str {
                    i += 1;
                    Matcher { label: None, op: String::new(), text: name.to_string() }
                } else {
                    return scan_error(token.start, format!("unexpected identifier {:?} in label matching", name));
                };
                if let Some(group) = groups.last_mut() {
                    group.push(matcher);
                }

                match tokens.get(i) {
                    Some(t) if t.kind == TokenKind::Comma => i += 1,
                    Some(t) if t.kind == TokenKind::RBrace => {}
                    Some(t) if t.kind == TokenKind::Ident && text(src, t).eq_ignore_ascii_case("or") => {}
                    Some(t) => return scan_error(t.start, format!("unexpected {:?} in label matching, expected \",\" or \"}}\"", text(src, t))),
                    None => return scan_error(tokens[open].start, "unclosed left brace"),
                }
            }
            _ => return scan_error(token.start, format!("unexpected {:?} in label matching", text(src, &token))),
        }
    }
}

fn is_grouping(src: &str, token: Option<&Token>) -> bool {
    token.map_or(false, |t| {
        t.kind == TokenKind::Ident && matches!(text(src, t).to_ascii_lowercase().as_str(), "by" | "without")
    })
}

fn push_selector(src: &str, tokens: &[Token], i: usize, selectors: &mut Vec<Selector>) -> Result<usize, ScanError> {
    let token = tokens[i];
    let metric = Some(text(src, &token).to_string());
    if kind_at(tokens, i + 1) == Some(TokenKind::LBrace) {
        let (groups, close) = parse_matchers(src, tokens, i + 1)?;
        selectors.push(Selector { start: token.start, end: tokens[close].end, metric, groups });
        Ok(close + 1)
    } else {
        selectors.push(Selector { start: token.start, end: token.end, metric, groups: vec![Vec::new()] });
        Ok(i + 1)
    }
}

// Keywords are only keywords where the grammar allows them. Where an operand
// is expected, `offset`, `by`, `and` and friends are plain metric names.
fn locate_selectors(src: &str, tokens: &[Token]) -> Result<Vec<Selector>, ScanError> {
    if tokens.is_empty() {
        return scan_error(0, "no expression found in input");
    }

    let mut selectors = Vec::new();
    let mut depth: i32 = 0;
    let mut i = 0;
    // true once the previous tokens form a complete operand
    let mut after_operand = false;

    while i < tokens.len() {
        let token = tokens[i];
        match token.kind {
            TokenKind::Ident => {
                let lower = text(src, &token).to_ascii_lowercase();
                let next = kind_at(tokens, i + 1);

                if MATCHING_KEYWORDS.contains(&lower.as_str()) {
                    i = if next == Some(TokenKind::LParen) { skip_label_list(src, tokens, i + 1)? } else { i + 1 };
                    continue;
                }

                if after_operand {
                    match lower.as_str() {
                        "by" | "without" => {
                            i = if next == Some(TokenKind::LParen) { skip_label_list(src, tokens, i + 1)? } else { i + 1 };
                        }
                        "offset" => {
                            after_operand = false;
                            i += 1;
                        }
                        op if WORD_OPERATORS.contains(&op) => {
                            after_operand = false;
                            i += 1;
                        }
                        _ => i = push_selector(src, tokens, i, &mut selectors)?,
                    }
                    continue;
                }

                if AGGREGATIONS.contains(&lower.as_str()) && is_grouping(src, tokens.get(i + 1)) {
                    // `sum by (job) (...)`, the body follows the label list
                    i = if kind_at(tokens, i + 2) == Some(TokenKind::LParen) {
                        skip_label_list(src, tokens, i + 2)?
                    } else {
                        i + 2
                    };
                } else if next == Some(TokenKind::LParen) {
                    i += 1;
                } else if lower == "inf" || lower == "nan" {
                    after_operand = true;
                    i += 1;
                } else {
                    i = push_selector(src, tokens, i, &mut selectors)?;
                    after_operand = true;
                }
            }
            TokenKind::LBrace => {
                let (groups, close) = parse_matchers(src, tokens, i)?;
                if groups.iter().all(Vec::is_empty) {
                    return scan_error(token.start, "vector selector must contain at least one non-empty matcher");
                }
                selectors.push(Selector { start: token.start, end: tokens[close].end, metric: None, groups });
                after_operand = true;
                i = close + 1;
            }
            TokenKind::RBrace => return scan_error(token.start, "unexpected right brace"),
            TokenKind::LParen => {
                depth += 1;
                after_operand = false;
                i += 1;
            }
            TokenKind::RParen => {
                depth -= 1;
                if depth < 0 {
                    return scan_error(token.start, "unexpected right parenthesis ')'");
                }
                after_operand = true;
                i += 1;
            }
            TokenKind::Number | TokenKind::Str | TokenKind::Range => {
                after_operand = true;
                i += 1;
            }
            _ => {
                after_operand = false;
                i += 1;
            }
        }
    }

    if depth != 0 {
        return scan_error(src.len(), "unclosed left parenthesis");
    }
    Ok(selectors)
}

// The enforced `label="value"` equality matcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantMatcher {
    label: String,
    value: String,
}

impl TenantMatcher {
    // None when the label name or value can not form a valid matcher.
    pub fn new(label: &str, value: &str) -> Option<TenantMatcher> {
        if !is_valid_label_name(label) || value.is_empty() {
            return None;
        }
        Some(TenantMatcher { label: label.to_string(), value: value.to_string() })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    // `{label="value"}`, a selector made of the enforced matcher alone.
    pub fn to_selector(&self) -> String {
        format!("{{{}}}", self.to_matcher().text)
    }

    fn to_matcher(&self) -> Matcher {
        Matcher {
            label: Some(self.label.clone()),
            op: String::from("="),
            text: format!("{}={}", self.label, quote(&self.value)),
        }
    }

    // Replace the first matcher on our label in place, drop the others,
    // append when absent. Matchers on other labels are left alone.
    fn inject(&self, selector: &mut Selector) {
        for group in selector.groups.iter_mut() {
            let mut replaced = false;
            let mut out = Vec::with_capacity(group.len() + 1);
            for matcher in group.drain(..) {
                if matcher.label.as_deref() == Some(self.label.as_str()) {
                    if !replaced {
                        out.push(self.to_matcher());
                        replaced = true;
                    }
                } else {
                    out.push(matcher);
                }
            }
            if !replaced {
                out.push(self.to_matcher());
            }
            *group = out;
        }
    }

    fn is_enforced_on(&self, selector: &Selector) -> bool {
        selector.groups.iter().all(|group| {
            let ours: Vec<&Matcher> = group
                .iter()
                .filter(|m| m.label.as_deref() == Some(self.label.as_str()))
                .collect();
            ours.len() == 1 && ours[0].op == "=" && ours[0].text == self.to_matcher().text
        })
    }
}

fn rewrite(src: &str, selectors: &mut [Selector], matcher: &TenantMatcher) -> String {
    let mut out = String::with_capacity(src.len() + selectors.len() * 16);
    let mut last = 0;
    for selector in selectors.iter_mut() {
        matcher.inject(selector);
        out.push_str(&src[last..selector.start]);
        out.push_str(&selector.render());
        last = selector.end;
    }
    out.push_str(&src[last..]);
    out
}

// Inject the matcher into every selector of a query expression.
pub fn inject_expression(expr: &str, matcher: &TenantMatcher) -> Result<String, ScanError> {
    let tokens = tokenize(expr)?;
    let mut selectors = locate_selectors(expr, &tokens)?;
    Ok(rewrite(expr, &mut selectors, matcher))
}

// Inject the matcher into an input which must be exactly one series selector.
pub fn inject_series_selector(input: &str, matcher: &TenantMatcher) -> Result<String, ScanError> {
    let tokens = tokenize(input)?;
    let mut selectors = locate_selectors(input, &tokens)?;
    let whole = selectors.len() == 1
        && selectors[0].start == tokens[0].start
        && selectors[0].end == tokens[tokens.len() - 1].end;
    if !whole {
        return scan_error(0, format!("{:?} is not a single series selector", input));
    }
    matcher.inject(&mut selectors[0]);
    Ok(selectors[0].render())
}

// Check every selector of an expression carries exactly the enforced matcher.
pub fn verify_enforced(expr: &str, matcher: &TenantMatcher) -> Result<bool, ScanError> {
    let tokens = tokenize(expr)?;
    let selectors = locate_selectors(expr, &tokens)?;
    Ok(selectors.iter().all(|s| matcher.is_enforced_on(s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acme() -> TenantMatcher {
        TenantMatcher::new("tenant_id", "acme").unwrap()
    }

    fn enforce(expr: &str) -> String {
        inject_expression(expr, &acme()).unwrap()
    }

    #[test]
    fn bare_metric_name() {
        assert_eq!(enforce("up"), r#"up{tenant_id="acme"}"#);
    }

    #[test]
    fn appends_to_existing_matchers() {
        assert_eq!(
            enforce(r#"http_requests_total{job = "api", code=~"5.."}"#),
            r#"http_requests_total{job="api",code=~"5..",tenant_id="acme"}"#
        );
    }

    #[test]
    fn overrides_foreign_tenant_in_place() {
        assert_eq!(
            enforce(r#"up{tenant_id="globex",job="api"}"#),
            r#"up{tenant_id="acme",job="api"}"#
        );
        assert_eq!(
            enforce(r#"up{tenant_id=~".+",job="api",tenant_id!="acme"}"#),
            r#"up{tenant_id="acme",job="api"}"#
        );
    }

    #[test]
    fn functions_aggregations_and_ranges() {
        assert_eq!(
            enforce(r#"sum by (job) (rate(http_requests_total{job="api"}[5m] offset 1h))"#),
            r#"sum by (job) (rate(http_requests_total{job="api",tenant_id="acme"}[5m] offset 1h))"#
        );
        assert_eq!(
            enforce("sum(rate(errors[5m])) without (instance) / sum(rate(requests[5m:1m]))"),
            r#"sum(rate(errors{tenant_id="acme"}[5m])) without (instance) / sum(rate(requests{tenant_id="acme"}[5m:1m]))"#
        );
        assert_eq!(
            enforce(r#"topk(5, histogram_quantile(0.9, rate(latency_bucket[1m])))"#),
            r#"topk(5, histogram_quantile(0.9, rate(latency_bucket{tenant_id="acme"}[1m])))"#
        );
    }

    #[test]
    fn vector_matching_label_lists_are_not_selectors() {
        assert_eq!(
            enforce("a * on(instance) group_left(version) b > bool 1e-3"),
            r#"a{tenant_id="acme"} * on(instance) group_left(version) b{tenant_id="acme"} > bool 1e-3"#
        );
        assert_eq!(
            enforce("a and ignoring (job) b or c unless d"),
            r#"a{tenant_id="acme"} and ignoring (job) b{tenant_id="acme"} or c{tenant_id="acme"} unless d{tenant_id="acme"}"#
        );
    }

    #[test]
    fn keywords_in_operand_position_are_metric_names() {
        for name in &["offset", "by", "without", "and", "or", "unless"] {
            let out = enforce(name);
            assert_eq!(out, format!(r#"{}{{tenant_id="acme"}}"#, name));
            assert!(verify_enforced(&out, &acme()).unwrap(), "input {}", name);
            assert!(!verify_enforced(name, &acme()).unwrap(), "input {}", name);
        }
        assert_eq!(enforce("rate(offset[5m])"), r#"rate(offset{tenant_id="acme"}[5m])"#);
        assert_eq!(
            enforce(r#"by{job="x"} / without"#),
            r#"by{job="x",tenant_id="acme"} / without{tenant_id="acme"}"#
        );
        assert_eq!(enforce("and or unless"), r#"and{tenant_id="acme"} or unless{tenant_id="acme"}"#);
        assert_eq!(enforce("sum(by) by (job)"), r#"sum(by{tenant_id="acme"}) by (job)"#);
    }

    #[test]
    fn keywords_after_an_operand_keep_their_meaning() {
        assert_eq!(enforce("up offset 5m"), r#"up{tenant_id="acme"} offset 5m"#);
        assert_eq!(enforce("up offset -5m"), r#"up{tenant_id="acme"} offset -5m"#);
        assert_eq!(enforce("sum by (job) (up)"), r#"sum by (job) (up{tenant_id="acme"})"#);
        assert_eq!(enforce("sum(rate(x[5m])) by (job)"), r#"sum(rate(x{tenant_id="acme"}[5m])) by (job)"#);
        assert_eq!(enforce("a and b"), r#"a{tenant_id="acme"} and b{tenant_id="acme"}"#);
        assert_eq!(enforce("a or on(job) b"), r#"a{tenant_id="acme"} or on(job) b{tenant_id="acme"}"#);
    }

    #[test]
    fn strings_and_comments_are_opaque() {
        assert_eq!(
            enforce(r#"label_replace(up, "dst", "{x}", "src", "(.*)") # up{tenant_id="x"}"#),
            r#"label_replace(up{tenant_id="acme"}, "dst", "{x}", "src", "(.*)") # up{tenant_id="x"}"#
        );
        assert_eq!(enforce(r#"{__name__=~"job:.*", path="a}b"}"#), r#"{__name__=~"job:.*",path="a}b",tenant_id="acme"}"#);
    }

    #[test]
    fn numbers_and_at_modifier() {
        assert_eq!(enforce("1 + 2"), "1 + 2");
        assert_eq!(enforce("Inf"), "Inf");
        assert_eq!(enforce("up @ start()"), r#"up{tenant_id="acme"} @ start()"#);
        assert_eq!(enforce("up @ 1609746000"), r#"up{tenant_id="acme"} @ 1609746000"#);
    }

    #[test]
    fn quoted_metric_names_and_or_alternatives() {
        assert_eq!(enforce(r#"{"http.requests", "tenant_id"="x"}"#), r#"{"http.requests",tenant_id="acme"}"#);
        assert_eq!(
            enforce(r#"up{job="a" or job="b"}"#),
            r#"up{job="a",tenant_id="acme" or job="b",tenant_id="acme"}"#
        );
        assert_eq!(enforce(r#"up{or="x"}"#), r#"up{or="x",tenant_id="acme"}"#);
    }

    #[test]
    fn injection_is_idempotent() {
        for expr in &[
            "up",
            r#"sum by (job) (rate(http_requests_total{job="api",tenant_id="evil"}[5m]))"#,
            r#"a * on(instance) group_left(version) {__name__="b", tenant_id!~"acme"}"#,
            r#"up{job="a" or job="b"}"#,
        ] {
            let once = enforce(expr);
            assert_eq!(enforce(&once), once, "input {}", expr);
            assert!(verify_enforced(&once, &acme()).unwrap());
        }
    }

    #[test]
    fn other_matchers_survive_untouched() {
        let out = enforce(r#"up{job=~"api|web", env!="dev", tenant_id="globex"}"#);
        assert!(out.contains(r#"job=~"api|web""#));
        assert!(out.contains(r#"env!="dev""#));
        assert!(!out.contains("globex"));
    }

    #[test]
    fn parse_errors() {
        for bad in &["", "sum(up", "up)", r#"up{job="x""#, r#"up{job=x}"#, "{}", r#"up{job="x}"#, "up{job==\"x\"}", "up ! 1", "rate(up[5m)"] {
            assert!(inject_expression(bad, &acme()).is_err(), "expected error for {:?}", bad);
        }
        let err = inject_expression("up{", &acme()).unwrap_err();
        assert!(err.to_string().starts_with("parse error at char 3"));
    }

    #[test]
    fn series_selector_only() {
        assert_eq!(inject_series_selector("up", &acme()).unwrap(), r#"up{tenant_id="acme"}"#);
        assert_eq!(
            inject_series_selector(r#"{job="api"}"#, &acme()).unwrap(),
            r#"{job="api",tenant_id="acme"}"#
        );
        assert!(inject_series_selector("rate(up[5m])", &acme()).is_err());
        assert!(inject_series_selector("up or down", &acme()).is_err());
        assert!(inject_series_selector("", &acme()).is_err());
    }

    #[test]
    fn tenant_value_is_quoted() {
        let matcher = TenantMatcher::new("tenant_id", r#"we"ird\"#).unwrap();
        assert_eq!(inject_expression("up", &matcher).unwrap(), r#"up{tenant_id="we\"ird\\"}"#);
    }

    #[test]
    fn rejects_illegal_tenant_matchers() {
        assert!(TenantMatcher::new("tenant-id", "acme").is_none());
        assert!(TenantMatcher::new("1tenant", "acme").is_none());
        assert!(TenantMatcher::new("tenant_id", "").is_none());
    }
}
