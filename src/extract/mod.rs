//! Extractor Engine (C6): applies regex/XPath/CSS/JSON-path rules to
//! response bodies.
//!
//! Rule dispatch on the `body_rule` prefix:
//! - `re:` — regex, one capture/match per result string.
//! - `xpath:` — evaluated against the body parsed as HTML via `sxd_document`
//!   + `sxd_xpath`; results are trimmed text content.
//! - `bs4:` — a CSS selector evaluated against HTML5 via the `scraper`
//!   crate; `bs4:` is kept as the rule-body prefix name for compatibility
//!   with existing rule configs even though nothing here is BeautifulSoup.
//! - `json:` — comma-separated JMESPath expressions evaluated against the
//!   body parsed as JSON, via the `jmespath` crate.
//!
//! Errors in any extractor (malformed regex, non-HTML for xpath, invalid
//! JSON) are swallowed and logged at warn level — they never fail the flow.

use log::warn;
use regex::Regex;

use crate::config::ExtractRule;
use crate::eligibility::matches_rule;

/// One `(url_rule, body_rule, template)` rule paired with its match against
/// a specific flow, plus the rendered notification body.
#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub title: String,
    pub body: String,
}

/// Runs every configured rule whose `url_rule` matches `normalized_url`
/// against `response_body`, rendering a notification for each rule that
/// yields a non-empty result list. Returns an empty vec when `rules` is
/// empty — extraction is a no-op until the caller configures rules.
pub fn run(rules: &[ExtractRule], normalized_url: &str, response_body: &[u8], content_type: Option<&str>) -> Vec<ExtractionResult> {
    if rules.is_empty() {
        return Vec::new();
    }

    let mut results = Vec::new();
    for rule in rules {
        if !matches_rule(&rule.url_rule, normalized_url) {
            continue;
        }

        let data = match extract_body(&rule.body_rule, response_body, content_type) {
            Ok(data) => data,
            Err(e) => {
                warn!("extraction rule '{}' failed: {e}", rule.body_rule);
                continue;
            }
        };

        if data.is_empty() {
            continue;
        }

        let rendered = crate::template::eval(&rule.template, &data);
        results.push(ExtractionResult {
            title: format!("Extraction match: {}", rule.url_rule),
            body: rendered,
        });
    }
    results
}

fn extract_body(body_rule: &str, body: &[u8], content_type: Option<&str>) -> Result<Vec<String>, String> {
    if let Some(pattern) = body_rule.strip_prefix("re:") {
        return extract_regex(pattern, body);
    }
    if let Some(selector) = body_rule.strip_prefix("bs4:") {
        return extract_css(selector, body);
    }
    if let Some(expr) = body_rule.strip_prefix("xpath:") {
        return extract_xpath(expr, body);
    }
    if let Some(paths) = body_rule.strip_prefix("json:") {
        return extract_json(paths, body);
    }
    let _ = content_type;
    Err(format!("unrecognized body rule prefix in '{body_rule}'"))
}

fn extract_regex(pattern: &str, body: &[u8]) -> Result<Vec<String>, String> {
    let re = Regex::new(pattern).map_err(|e| format!("invalid regex '{pattern}': {e}"))?;
    let text = String::from_utf8_lossy(body);
    let mut out = Vec::new();
    for caps in re.captures_iter(&text) {
        if caps.len() > 1 {
            for i in 1..caps.len() {
                if let Some(m) = caps.get(i) {
                    out.push(m.as_str().to_string());
                }
            }
        } else if let Some(m) = caps.get(0) {
            out.push(m.as_str().to_string());
        }
    }
    Ok(out)
}

fn extract_css(selector_str: &str, body: &[u8]) -> Result<Vec<String>, String> {
    use scraper::{Html, Selector};

    let text = String::from_utf8_lossy(body);
    let document = Html::parse_document(&text);
    let selector = Selector::parse(selector_str).map_err(|e| format!("invalid css selector '{selector_str}': {e:?}"))?;

    let mut out = Vec::new();
    for el in document.select(&selector) {
        let text: String = el.text().collect::<Vec<_>>().join("").trim().to_string();
        if !text.is_empty() {
            out.push(text);
        }
    }
    Ok(out)
}

fn extract_xpath(expr_str: &str, body: &[u8]) -> Result<Vec<String>, String> {
    use sxd_document::parser as xml_parser;
    use sxd_xpath::{Context, Factory, Value as XPathValue};

    let text = String::from_utf8_lossy(body);
    let package = xml_parser::parse(&text).map_err(|e| format!("body is not valid XML/XHTML for xpath: {e:?}"))?;
    let document = package.as_document();

    let factory = Factory::new();
    let xpath = factory
        .build(expr_str)
        .map_err(|e| format!("invalid xpath '{expr_str}': {e:?}"))?
        .ok_or_else(|| "empty xpath expression".to_string())?;
    let context = Context::new();

    let value = xpath
        .evaluate(&context, document.root())
        .map_err(|e| format!("xpath evaluation failed: {e:?}"))?;

    let mut out = Vec::new();
    match value {
        XPathValue::Nodeset(nodes) => {
            for node in nodes.document_order() {
                let trimmed = node.string_value().trim().to_string();
                if !trimmed.is_empty() {
                    out.push(trimmed);
                }
            }
        }
        XPathValue::String(s) => {
            let trimmed = s.trim().to_string();
            if !trimmed.is_empty() {
                out.push(trimmed);
            }
        }
        XPathValue::Number(n) => out.push(n.to_string()),
        XPathValue::Boolean(b) => out.push(b.to_string()),
    }
    Ok(out)
}

fn extract_json(paths: &str, body: &[u8]) -> Result<Vec<String>, String> {
    let text = String::from_utf8_lossy(body);
    let parsed = jmespath::Variable::from_json(&text).map_err(|e| format!("body is not valid JSON for json: rule: {e}"))?;
    let data = std::rc::Rc::new(parsed);

    // One entry per query, `""` substituted for a null/missing result, so
    // the output stays positionally aligned with `paths` for multi-query
    // rules feeding `zip_join`-style templates.
    let mut out = Vec::new();
    for path in paths.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let expr = jmespath::compile(path).map_err(|e| format!("invalid jmespath '{path}': {e}"))?;
        let result = expr.search(&data).map_err(|e| format!("jmespath search failed for '{path}': {e}"))?;
        out.push(if result.is_null() { String::new() } else { stringify_jmespath(&result) });
    }
    Ok(out)
}

fn stringify_jmespath(var: &jmespath::Variable) -> String {
    match var.as_string() {
        Some(s) => s.clone(),
        None => var.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(url_rule: &str, body_rule: &str, template: &str) -> ExtractRule {
        ExtractRule {
            url_rule: url_rule.to_string(),
            body_rule: body_rule.to_string(),
            template: template.to_string(),
        }
    }

    #[test]
    fn empty_rule_list_is_a_no_op() {
        let out = run(&[], "http://example.com/login", b"{}", None);
        assert!(out.is_empty());
    }

    #[test]
    fn json_paths_joined_with_separator() {
        let rules = vec![rule(
            "api.example.com/login",
            "json:token,expires_in",
            "result = join(' | ', data)",
        )];
        let body = br#"{"token":"abc","expires_in":3600}"#;
        let out = run(&rules, "https://api.example.com/login", body, Some("application/json"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].body, "abc | 3600");
    }

    #[test]
    fn missing_json_path_substitutes_empty_string_and_stays_aligned() {
        let rules = vec![rule(
            "api.example.com/login",
            "json:token,missing_field",
            "result = join(' | ', data)",
        )];
        let body = br#"{"token":"abc"}"#;
        let out = run(&rules, "https://api.example.com/login", body, Some("application/json"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].body, "abc | ");
    }

    #[test]
    fn all_null_json_paths_still_trigger_extraction() {
        let rules = vec![rule(
            "api.example.com/login",
            "json:missing_one,missing_two",
            "result = join(',', data)",
        )];
        let body = br#"{}"#;
        let out = run(&rules, "https://api.example.com/login", body, Some("application/json"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].body, ",");
    }

    #[test]
    fn url_rule_not_matching_skips_rule() {
        let rules = vec![rule("api.other.com", "json:token", "result = join(',', data)")];
        let body = br#"{"token":"abc"}"#;
        let out = run(&rules, "https://api.example.com/login", body, None);
        assert!(out.is_empty());
    }

    #[test]
    fn regex_extraction_collects_capture_groups() {
        let rules = vec![rule("example.com", "re:id=(\\d+)", "result = join(',', data)")];
        let body = b"id=42 and id=7";
        let out = run(&rules, "https://example.com/x", body, None);
        assert_eq!(out[0].body, "42,7");
    }

    #[test]
    fn css_selector_extracts_text() {
        let rules = vec![rule("example.com", "bs4:h1", "result = join(',', data)")];
        let body = b"<html><body><h1>Hello</h1></body></html>";
        let out = run(&rules, "https://example.com/x", body, Some("text/html"));
        assert_eq!(out[0].body, "Hello");
    }

    #[test]
    fn malformed_regex_is_swallowed_not_propagated() {
        let rules = vec![rule("example.com", "re:(unterminated", "result = join(',', data)")];
        let out = run(&rules, "https://example.com/x", b"whatever", None);
        assert!(out.is_empty());
    }

    #[test]
    fn invalid_json_is_swallowed_not_propagated() {
        let rules = vec![rule("example.com", "json:token", "result = join(',', data)")];
        let out = run(&rules, "https://example.com/x", b"not json", None);
        assert!(out.is_empty());
    }
}
