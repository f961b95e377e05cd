//! Eligibility Policy (C5): decides whether a response is cache-admissible,
//! using fixed resource-suffix, content-type, and directive tables.

use once_cell::sync::Lazy;
use regex::Regex;

/// Lowercased path-suffix matches.
pub const RESOURCE_SUFFIXES: &[&str] = &[
    "js", "mjs", "wasm", "css", "png", "jpg", "jpeg", "gif", "webp", "avif", "svg", "ico", "bmp",
    "tiff", "woff", "woff2", "ttf", "otf", "eot", "json", "xml", "jsonp", "map", "mp3", "mp4",
    "wav", "ogg", "oga", "ogv", "webm", "aac", "flac", "mov", "zip", "rar", "7z", "gz", "tar",
];

/// Case-insensitive `Content-Type` prefix matches.
pub const RESOURCE_CONTENT_TYPE_PREFIXES: &[&str] = &[
    "application/javascript",
    "application/x-javascript",
    "text/javascript",
    "application/wasm",
    "text/css",
    "image/png",
    "image/jpeg",
    "image/gif",
    "image/webp",
    "image/avif",
    "image/svg+xml",
    "image/x-icon",
    "image/vnd.microsoft.icon",
    "font/woff",
    "application/font-woff",
    "font/woff2",
    "font/ttf",
    "font/otf",
    "application/vnd.ms-fontobject",
    "audio/mpeg",
    "audio/mp4",
    "video/mp4",
    "audio/wav",
    "audio/ogg",
    "video/ogg",
    "application/ogg",
    "video/webm",
    "audio/webm",
    "audio/aac",
    "audio/flac",
    "video/quicktime",
    "application/vnd.yt-ump",
    "application/pdf",
];

/// Tokens in request `Cache-Control`/`Pragma` or response `Cache-Control`
/// that veto admission.
pub const FORBIDDEN_DIRECTIVES: &[&str] = &["no-store", "private"];

static CACHE_CONTROL_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r",").unwrap());

/// Everything the eligibility check needs, already lowercased where
/// case-insensitive comparison is required at the call site.
pub struct EligibilityInput<'a> {
    pub request_method: &'a str,
    pub response_status: u16,
    pub response_has_set_cookie: bool,
    pub response_vary: Option<&'a str>,
    pub request_cache_control: Option<&'a str>,
    pub request_pragma: Option<&'a str>,
    pub response_cache_control: Option<&'a str>,
    pub canonical_path: &'a str,
    pub response_content_type: Option<&'a str>,
    pub normalized_url: &'a str,
    pub ignore_rules: &'a [String],
}

fn contains_forbidden_directive(header: Option<&str>) -> bool {
    let Some(value) = header else { return false };
    CACHE_CONTROL_SPLIT
        .split(value)
        .map(|tok| tok.trim().to_ascii_lowercase())
        .any(|tok| FORBIDDEN_DIRECTIVES.contains(&tok.as_str()))
}

fn vary_contains_cookie(vary: Option<&str>) -> bool {
    let Some(value) = vary else { return false };
    value
        .split(',')
        .map(|tok| tok.trim().to_ascii_lowercase())
        .any(|tok| tok == "cookie")
}

fn matches_resource_suffix(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    RESOURCE_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
}

fn matches_resource_content_type(content_type: Option<&str>) -> bool {
    let Some(ct) = content_type else { return false };
    let lower = ct.to_ascii_lowercase();
    RESOURCE_CONTENT_TYPE_PREFIXES
        .iter()
        .any(|prefix| lower.starts_with(prefix))
}

/// Plain substring match, or regex when prefixed with `re:`.
pub fn matches_rule(rule: &str, haystack: &str) -> bool {
    match rule.strip_prefix("re:") {
        Some(pattern) => Regex::new(pattern).map(|re| re.is_match(haystack)).unwrap_or(false),
        None => haystack.contains(rule),
    }
}

fn matches_ignore_rules(url: &str, rules: &[String]) -> bool {
    rules.iter().any(|rule| matches_rule(rule, url))
}

/// Decides cache admissibility for a completed response.
pub fn is_admissible(input: &EligibilityInput<'_>) -> bool {
    if input.request_method != "GET" {
        return false;
    }
    if !(200..300).contains(&input.response_status) {
        return false;
    }
    if input.response_has_set_cookie {
        return false;
    }
    if vary_contains_cookie(input.response_vary) {
        return false;
    }
    if contains_forbidden_directive(input.request_cache_control)
        || contains_forbidden_directive(input.request_pragma)
        || contains_forbidden_directive(input.response_cache_control)
    {
        return false;
    }
    if !(matches_resource_suffix(input.canonical_path)
        || matches_resource_content_type(input.response_content_type))
    {
        return false;
    }
    if matches_ignore_rules(input.normalized_url, input.ignore_rules) {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_input() -> EligibilityInput<'static> {
        EligibilityInput {
            request_method: "GET",
            response_status: 200,
            response_has_set_cookie: false,
            response_vary: None,
            request_cache_control: None,
            request_pragma: None,
            response_cache_control: None,
            canonical_path: "/a.js",
            response_content_type: None,
            normalized_url: "http://example.com/a.js",
            ignore_rules: &[],
        }
    }

    #[test]
    fn eligible_by_suffix() {
        assert!(is_admissible(&base_input()));
    }

    #[test]
    fn eligible_by_content_type() {
        let mut input = base_input();
        input.canonical_path = "/api/data";
        input.response_content_type = Some("image/png; charset=binary");
        assert!(is_admissible(&input));
    }

    #[test]
    fn ineligible_without_suffix_or_content_type() {
        let mut input = base_input();
        input.canonical_path = "/api/data";
        input.response_content_type = None;
        assert!(!is_admissible(&input));
    }

    #[test]
    fn non_get_is_never_admitted() {
        let mut input = base_input();
        input.request_method = "POST";
        assert!(!is_admissible(&input));
    }

    #[test]
    fn status_outside_2xx_rejected() {
        let mut input = base_input();
        input.response_status = 304;
        assert!(!is_admissible(&input));
    }

    #[test]
    fn set_cookie_vetoes_admission() {
        let mut input = base_input();
        input.response_has_set_cookie = true;
        assert!(!is_admissible(&input));
    }

    #[test]
    fn vary_cookie_case_insensitive_vetoes() {
        let mut input = base_input();
        input.response_vary = Some("Accept-Encoding, Cookie");
        assert!(!is_admissible(&input));
    }

    #[test]
    fn no_store_in_response_cache_control_vetoes() {
        let mut input = base_input();
        input.response_cache_control = Some("max-age=0, no-store");
        assert!(!is_admissible(&input));
    }

    #[test]
    fn private_in_request_pragma_vetoes() {
        let mut input = base_input();
        input.request_pragma = Some("private");
        assert!(!is_admissible(&input));
    }

    #[test]
    fn ignore_rule_plain_substring_vetoes() {
        let mut input = base_input();
        input.ignore_rules = std::slice::from_ref(&"example.com/a.js");
        assert!(!is_admissible(&input));
    }

    #[test]
    fn ignore_rule_regex_vetoes() {
        let mut input = base_input();
        let rules = vec!["re:\\.js$".to_string()];
        input.ignore_rules = &rules;
        assert!(!is_admissible(&input));
    }

    #[test]
    fn client_no_store_does_not_veto_a_cache_hit_path() {
        // Eligibility governs *admission*, not serving; a cached entry is
        // always served regardless of request Cache-Control. This is
        // enforced in the pipeline, not here — this test documents that
        // `is_admissible` is only ever consulted on the write path.
        let mut input = base_input();
        input.request_cache_control = Some("no-cache");
        assert!(is_admissible(&input));
    }
}
