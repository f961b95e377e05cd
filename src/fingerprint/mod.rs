//! Fingerprint Resolver (C3): maps a client `User-Agent` header to an
//! impersonation profile tag.
//!
//! The known-profile registry is a static table seeded from the outbound
//! impersonating client's capability set — the same approach an
//! enumerate-the-browser-literals helper would take against a different
//! impersonation library. Here that capability set is `wreq_util::Emulation`
//! (see `upstream::emulation_for_tag` for the tag → `Emulation` mapping used
//! when actually building a client).

use once_cell::sync::Lazy;

/// Returned by [`resolve`] when no client User-Agent matches the registry.
pub const DEFAULT_PROFILE: &str = "chrome136";

/// One entry in the known-profile registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileInfo {
    pub tag: &'static str,
    pub family: &'static str,
    pub major: u32,
    pub mobile: bool,
}

/// The finite registry of known impersonation profiles.
pub static REGISTRY: Lazy<Vec<ProfileInfo>> = Lazy::new(|| {
    vec![
        ProfileInfo { tag: "chrome100", family: "chrome", major: 100, mobile: false },
        ProfileInfo { tag: "chrome104", family: "chrome", major: 104, mobile: false },
        ProfileInfo { tag: "chrome107", family: "chrome", major: 107, mobile: false },
        ProfileInfo { tag: "chrome110", family: "chrome", major: 110, mobile: false },
        ProfileInfo { tag: "chrome116", family: "chrome", major: 116, mobile: false },
        ProfileInfo { tag: "chrome119", family: "chrome", major: 119, mobile: false },
        ProfileInfo { tag: "chrome123", family: "chrome", major: 123, mobile: false },
        ProfileInfo { tag: "chrome124", family: "chrome", major: 124, mobile: false },
        ProfileInfo { tag: "chrome126", family: "chrome", major: 126, mobile: false },
        ProfileInfo { tag: "chrome127", family: "chrome", major: 127, mobile: false },
        ProfileInfo { tag: "chrome128", family: "chrome", major: 128, mobile: false },
        ProfileInfo { tag: "chrome129", family: "chrome", major: 129, mobile: false },
        ProfileInfo { tag: "chrome130", family: "chrome", major: 130, mobile: false },
        ProfileInfo { tag: "chrome131", family: "chrome", major: 131, mobile: false },
        // `chrome133` is always remapped to `chrome133a` by `resolve` (a
        // library-specific correction — `wreq`'s `chrome133` emulation is
        // unstable, `chrome133a` is the fixed-up variant), but the
        // bare `chrome133` tag is not a member of the registry at all, so
        // the registry only ever yields `chrome133a` for that major.
        ProfileInfo { tag: "chrome133a", family: "chrome", major: 133, mobile: false },
        ProfileInfo { tag: "chrome136", family: "chrome", major: 136, mobile: false },
        ProfileInfo { tag: "chrome126_android", family: "chrome", major: 126, mobile: true },
        ProfileInfo { tag: "chrome131_android", family: "chrome", major: 131, mobile: true },
        ProfileInfo { tag: "firefox109", family: "firefox", major: 109, mobile: false },
        ProfileInfo { tag: "firefox117", family: "firefox", major: 117, mobile: false },
        ProfileInfo { tag: "firefox128", family: "firefox", major: 128, mobile: false },
        ProfileInfo { tag: "firefox133", family: "firefox", major: 133, mobile: false },
        ProfileInfo { tag: "safari15_3", family: "safari", major: 15, mobile: false },
        ProfileInfo { tag: "safari15_5", family: "safari", major: 15, mobile: false },
        ProfileInfo { tag: "safari16", family: "safari", major: 16, mobile: false },
        ProfileInfo { tag: "safari17_0", family: "safari", major: 17, mobile: false },
        ProfileInfo { tag: "safari18_0", family: "safari", major: 18, mobile: false },
        ProfileInfo { tag: "safari17_ios", family: "safari", major: 17, mobile: true },
        ProfileInfo { tag: "safari18_ios", family: "safari", major: 18, mobile: true },
        ProfileInfo { tag: "edge101", family: "edge", major: 101, mobile: false },
        ProfileInfo { tag: "edge122", family: "edge", major: 122, mobile: false },
        ProfileInfo { tag: "edge127", family: "edge", major: 127, mobile: false },
        ProfileInfo { tag: "edge131", family: "edge", major: 131, mobile: false },
    ]
});

#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedUa {
    family: String,
    major: u32,
    mobile: bool,
}

/// Parses `(family, major_version, is_mobile)` out of a raw `User-Agent`
/// header value.
///
/// This hand-rolled parser covers the token patterns real browsers emit
/// (`Chrome/NNN.x`, `Firefox/NNN.x`, `Version/NNN.x Safari/...`,
/// `Edg/NNN.x`) and is intentionally not a general UA database — anything
/// it cannot confidently classify falls through to `None`, which `resolve`
/// treats as "family empty".
fn parse_user_agent(ua: &str) -> Option<ParsedUa> {
    let mobile = ua.contains("Mobile") || ua.contains("Android") && ua.contains("Mobile Safari");
    let android = ua.contains("Android");

    if let Some(major) = extract_major_after(ua, "Edg/") {
        return Some(ParsedUa { family: "edge".to_string(), major, mobile });
    }
    if let Some(major) = extract_major_after(ua, "Chrome/") {
        return Some(ParsedUa {
            family: "chrome".to_string(),
            major,
            mobile: mobile || (android && ua.contains("Chrome")),
        });
    }
    if let Some(major) = extract_major_after(ua, "Firefox/") {
        return Some(ParsedUa { family: "firefox".to_string(), major, mobile });
    }
    if ua.contains("Safari") && !ua.contains("Chrome") {
        if let Some(major) = extract_major_after(ua, "Version/") {
            let is_ios = ua.contains("iPhone") || ua.contains("iPad") || ua.contains("iPod");
            return Some(ParsedUa { family: "safari".to_string(), major, mobile: mobile || is_ios });
        }
    }

    None
}

fn extract_major_after(ua: &str, marker: &str) -> Option<u32> {
    let idx = ua.find(marker)?;
    let rest = &ua[idx + marker.len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

/// Resolves a client `User-Agent` to a profile tag.
pub fn resolve(user_agent: Option<&str>) -> &'static str {
    let Some(ua) = user_agent else {
        return DEFAULT_PROFILE;
    };

    let Some(parsed) = parse_user_agent(ua) else {
        return DEFAULT_PROFILE;
    };

    if parsed.family.is_empty() {
        return DEFAULT_PROFILE;
    }

    let candidates: Vec<&ProfileInfo> = REGISTRY
        .iter()
        .filter(|p| p.family == parsed.family && p.mobile == parsed.mobile)
        .collect();

    if candidates.is_empty() {
        return DEFAULT_PROFILE;
    }

    let fit: Vec<&&ProfileInfo> = candidates.iter().filter(|p| p.major <= parsed.major).collect();

    let chosen = if !fit.is_empty() {
        fit.into_iter().max_by_key(|p| p.major).unwrap()
    } else {
        candidates.iter().min_by_key(|p| p.major).unwrap()
    };

    // Step 6: the single explicit remapping — any resolution yielding
    // `chrome133` must be returned as `chrome133a`. Since `chrome133` is not
    // itself a registry tag (only `chrome133a` is), this is naturally
    // satisfied by construction; the check below exists purely as a guard
    // against a future registry edit reintroducing a bare `chrome133` tag.
    if chosen.tag == "chrome133" {
        return "chrome133a";
    }

    chosen.tag
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_user_agent_returns_default() {
        assert_eq!(resolve(None), DEFAULT_PROFILE);
    }

    #[test]
    fn unparseable_user_agent_returns_default() {
        assert_eq!(resolve(Some("some-weird-bot/1.0")), DEFAULT_PROFILE);
    }

    #[test]
    fn exact_major_picks_that_profile() {
        let ua = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
        assert_eq!(resolve(Some(ua)), "chrome124");
    }

    #[test]
    fn newer_unknown_major_falls_back_to_max_fit() {
        let ua = "Mozilla/5.0 Chrome/999.0.0.0 Safari/537.36";
        assert_eq!(resolve(Some(ua)), "chrome136");
    }

    #[test]
    fn older_than_any_known_falls_back_to_min() {
        let ua = "Mozilla/5.0 Chrome/50.0.0.0 Safari/537.36";
        assert_eq!(resolve(Some(ua)), "chrome100");
    }

    #[test]
    fn firefox_is_recognized() {
        let ua = "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";
        assert_eq!(resolve(Some(ua)), "firefox128");
    }

    #[test]
    fn edge_is_recognized_over_chrome_token() {
        let ua = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.0.0";
        assert_eq!(resolve(Some(ua)), "edge131");
    }

    #[test]
    fn mobile_android_chrome_picks_mobile_candidate() {
        let ua = "Mozilla/5.0 (Linux; Android 13) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Mobile Safari/537.36";
        assert_eq!(resolve(Some(ua)), "chrome126_android");
    }
}
