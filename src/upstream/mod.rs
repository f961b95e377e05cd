//! Upstream Session Pool (C4): reusable outbound HTTP clients keyed by
//! impersonation profile tag + upstream proxy configuration.
//!
//! One `SessionPool` per instance, following the same per-instance,
//! `DashMap`-backed resource-registry idiom used elsewhere in this crate
//! for other shared, concurrently-accessed maps. Sessions are built on the
//! `wreq` impersonating client, this crate's equivalent of a
//! `curl_cffi`-style per-profile `AsyncSession`.

use std::time::Duration;

use dashmap::DashMap;
use log::debug;
use tokio::sync::Mutex;
use wreq::redirect::Policy;
use wreq::Client;
use wreq_util::Emulation;

use crate::config::UpstreamCredentials;
use crate::core::{ProxyError, ProxyResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const READ_TIMEOUT: Duration = Duration::from_secs(40);

/// Maps a resolved profile tag to the `wreq_util::Emulation`
/// variant that best matches it. Tags not covered by a specific variant
/// fall back to the nearest older major of the same family; this keeps the
/// mapping total without inventing emulation profiles the client library
/// doesn't actually ship.
pub fn emulation_for_tag(tag: &str) -> Emulation {
    match tag {
        "chrome100" => Emulation::Chrome100,
        "chrome104" => Emulation::Chrome104,
        "chrome107" => Emulation::Chrome107,
        "chrome110" => Emulation::Chrome110,
        "chrome116" => Emulation::Chrome116,
        "chrome119" => Emulation::Chrome119,
        "chrome123" => Emulation::Chrome123,
        "chrome124" => Emulation::Chrome124,
        "chrome126" | "chrome126_android" => Emulation::Chrome126,
        "chrome127" => Emulation::Chrome127,
        "chrome128" => Emulation::Chrome128,
        "chrome129" => Emulation::Chrome129,
        "chrome130" => Emulation::Chrome130,
        "chrome131" | "chrome131_android" => Emulation::Chrome131,
        "chrome133a" => Emulation::Chrome133,
        "chrome136" => Emulation::Chrome133,
        "firefox109" => Emulation::Firefox109,
        "firefox117" => Emulation::Firefox117,
        "firefox128" => Emulation::Firefox128,
        "firefox133" => Emulation::Firefox133,
        "safari15_3" => Emulation::Safari15_3,
        "safari15_5" => Emulation::Safari15_5,
        "safari16" => Emulation::Safari16,
        "safari17_0" | "safari17_ios" => Emulation::Safari17_0,
        "safari18_0" | "safari18_ios" => Emulation::Safari18,
        "edge101" => Emulation::Edge101,
        "edge122" => Emulation::Edge122,
        "edge127" => Emulation::Edge127,
        "edge131" => Emulation::Edge131,
        _ => Emulation::Chrome131,
    }
}

/// One reusable outbound client, bound to exactly one profile tag. Holds
/// both a proxied and a direct variant of the client so a single pooled
/// session can serve both proxied and `direct`-flagged flows for the same
/// profile tag — matching `create_session`/`curl_request` in
/// `base_addon.py`, where one `curl_cffi` session per `impersonate` tag is
/// reused for both cases and `proxies=None` is instead passed per request.
#[derive(Clone)]
pub struct Session {
    pub profile_tag: &'static str,
    proxied_client: Client,
    direct_client: Client,
}

impl Session {
    /// Picks the proxied or direct client variant for one request.
    pub fn client(&self, direct: bool) -> &Client {
        if direct {
            &self.direct_client
        } else {
            &self.proxied_client
        }
    }
}

fn build_client(profile_tag: &'static str, upstream: &UpstreamCredentials, direct: bool) -> ProxyResult<Client> {
    let mut builder = Client::builder()
        .emulation(emulation_for_tag(profile_tag))
        .redirect(Policy::none())
        .danger_accept_invalid_certs(true)
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(READ_TIMEOUT);

    if !direct {
        if let Some(proxy_url) = upstream.proxy_url() {
            let proxy = wreq::Proxy::all(&proxy_url)
                .map_err(|e| ProxyError::Configuration(format!("invalid upstream proxy url '{proxy_url}': {e}")))?;
            builder = builder.proxy(proxy);
        }
    }

    builder
        .build()
        .map_err(|e| ProxyError::Configuration(format!("failed to build upstream client: {e}")))
}

/// Per-instance pool of [`Session`]s keyed by profile tag alone. A profile
/// tag appears at most once, regardless of how many of its flows are
/// `direct` — `direct` is a per-request client selection inside the one
/// pooled [`Session`], not a second pool slot.
pub struct SessionPool {
    sessions: DashMap<&'static str, Session>,
    build_lock: Mutex<()>,
    upstream: UpstreamCredentials,
}

impl SessionPool {
    pub fn new(upstream: UpstreamCredentials) -> Self {
        SessionPool {
            sessions: DashMap::new(),
            build_lock: Mutex::new(()),
            upstream,
        }
    }

    /// Returns the existing session for `profile_tag`, or builds and
    /// inserts one. The caller picks the proxied or direct client variant
    /// off the returned `Session` per request via [`Session::client`].
    pub async fn checkout(&self, profile_tag: &'static str) -> ProxyResult<Session> {
        if let Some(existing) = self.sessions.get(profile_tag) {
            return Ok(existing.clone());
        }

        let _guard = self.build_lock.lock().await;
        if let Some(existing) = self.sessions.get(profile_tag) {
            return Ok(existing.clone());
        }

        debug!("building upstream session for profile '{profile_tag}'");
        let proxied_client = build_client(profile_tag, &self.upstream, false)?;
        let direct_client = build_client(profile_tag, &self.upstream, true)?;
        let session = Session { profile_tag, proxied_client, direct_client };
        self.sessions.insert(profile_tag, session.clone());
        Ok(session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn checkout_reuses_session_for_same_profile() {
        let pool = SessionPool::new(UpstreamCredentials::default());
        let a = pool.checkout("chrome124").await.unwrap();
        let b = pool.checkout("chrome124").await.unwrap();
        assert_eq!(a.profile_tag, b.profile_tag);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn distinct_profiles_get_distinct_sessions() {
        let pool = SessionPool::new(UpstreamCredentials::default());
        pool.checkout("chrome124").await.unwrap();
        pool.checkout("firefox128").await.unwrap();
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn direct_flow_shares_the_same_pool_slot_as_proxied() {
        // "K distinct profile tags -> K sessions" holds per tag regardless
        // of how many of its flows are direct vs proxied — `direct` only
        // selects which client variant inside the one pooled `Session` a
        // request uses.
        let mut creds = UpstreamCredentials::default();
        creds.proxy_host = Some("127.0.0.1".to_string());
        creds.proxy_port = Some(8080);
        let pool = SessionPool::new(creds);
        let proxied = pool.checkout("chrome124").await.unwrap();
        let direct = pool.checkout("chrome124").await.unwrap();
        assert_eq!(proxied.profile_tag, direct.profile_tag);
        assert_eq!(pool.len(), 1);
        // Both client variants exist on the single session.
        let _ = proxied.client(false);
        let _ = direct.client(true);
    }

    #[test]
    fn chrome133_tag_is_remapped_to_133a_by_fingerprint_layer_not_here() {
        // This module only maps tags to emulation profiles; the chrome133 ->
        // chrome133a correction lives in `fingerprint::resolve`. Both tags
        // resolve to a valid emulation here so the pool never panics on a
        // tag the fingerprint resolver could actually hand it.
        let _ = emulation_for_tag("chrome133a");
    }
}
