//! In-memory cookie jar.
//!
//! A [`CookieStore`] is shared between fetchers through an `Arc`. It is never a
//! process-wide global: a [`FetchService`](crate::FetchService) creates one
//! default store, and each [`FetchHistory`](crate::FetchHistory) owns its own.
//! Expired cookies are pruned lazily, whenever cookies are set or queried.

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use reqwest::Url;
use reqwest::header::{HeaderMap, SET_COOKIE};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// Lowercase, without a leading dot.
    pub domain: String,
    pub path: String,
    /// `None` for session cookies.
    pub expires: Option<DateTime<Utc>>,
    pub secure: bool,
    /// Set when the cookie had no `Domain` attribute; only the exact host matches.
    pub host_only: bool,
}

impl Cookie {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        domain: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        let domain: String = domain.into();
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.trim_start_matches('.').to_ascii_lowercase(),
            path: path.into(),
            expires: None,
            secure: false,
            host_only: false,
        }
    }

    pub fn with_expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Parse a `Set-Cookie` header received in response to `request_url`.
    ///
    /// Returns `None` for syntactically invalid cookies and for cookies whose
    /// `Domain` attribute does not cover the request host.
    pub fn parse(header: &str, request_url: &Url) -> Option<Self> {
        Self::parse_at(header, request_url, Utc::now())
    }

    fn parse_at(header: &str, request_url: &Url, now: DateTime<Utc>) -> Option<Self> {
        let host = request_url.host_str()?.to_ascii_lowercase();
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = Cookie {
            name: name.to_string(),
            value: value.trim().trim_matches('"').to_string(),
            domain: host.clone(),
            path: default_path(request_url),
            expires: None,
            secure: false,
            host_only: true,
        };
        let mut max_age: Option<i64> = None;

        for attr in parts {
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attr.trim(), ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" if !val.is_empty() => {
                    let domain = val.trim_start_matches('.').to_ascii_lowercase();
                    // single-label domains like `com` would cover a whole TLD
                    let too_broad = !domain.contains('.') && domain != host;
                    if too_broad || !domain_matches(&host, &domain) {
                        debug!(cookie = name, %domain, %host, "Rejecting cookie for foreign domain");
                        return None;
                    }
                    cookie.domain = domain;
                    cookie.host_only = false;
                }
                "path" if val.starts_with('/') => cookie.path = val.to_string(),
                "expires" => cookie.expires = parse_cookie_date(val),
                "max-age" => max_age = val.parse().ok(),
                "secure" => cookie.secure = true,
                _ => {}
            }
        }

        // Max-Age wins over Expires
        if let Some(seconds) = max_age {
            cookie.expires = Some(if seconds <= 0 {
                DateTime::<Utc>::MIN_UTC
            } else {
                TimeDelta::try_seconds(seconds)
                    .and_then(|age| now.checked_add_signed(age))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
            });
        }

        Some(cookie)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    fn same_identity(&self, other: &Cookie) -> bool {
        self.name == other.name && self.domain == other.domain && self.path == other.path
    }

    fn matches_url(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let domain_ok = if self.host_only {
            host == self.domain
        } else {
            domain_matches(&host, &self.domain)
        };
        domain_ok && path_matches(url.path(), &self.path) && (!self.secure || url.scheme() == "https")
    }
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/') || request_path[cookie_path.len()..].starts_with('/'))
}

fn default_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Accepts RFC 1123, RFC 850 and asctime dates, with or without dashes.
fn parse_cookie_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.with_timezone(&Utc));
    }

    let without_weekday = value.split_once(',').map_or(value, |(_, rest)| rest);
    let normalized = without_weekday
        .replace('-', " ")
        .trim()
        .trim_end_matches("GMT")
        .trim_end_matches("UTC")
        .trim()
        .to_string();

    // two-digit years first; %Y would happily read "37" as year 37
    ["%d %b %y %H:%M:%S", "%d %b %Y %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&normalized, fmt).ok())
        .or_else(|| NaiveDateTime::parse_from_str(value.trim(), "%a %b %e %H:%M:%S %Y").ok())
        .map(|naive| naive.and_utc())
}

/// Thread-safe cookie jar.
#[derive(Debug, Default)]
pub struct CookieStore {
    cookies: Mutex<Vec<Cookie>>,
}

impl CookieStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Cookie>> {
        self.cookies.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Merge cookies into the store, replacing same name/domain/path entries.
    ///
    /// A cookie that is already expired deletes its stored counterpart.
    pub fn set_cookies(&self, new_cookies: impl IntoIterator<Item = Cookie>) {
        self.set_cookies_at(new_cookies, Utc::now());
    }

    fn set_cookies_at(&self, new_cookies: impl IntoIterator<Item = Cookie>, now: DateTime<Utc>) {
        let mut cookies = self.lock();
        for cookie in new_cookies {
            cookies.retain(|existing| !existing.same_identity(&cookie));
            if !cookie.is_expired_at(now) {
                cookies.push(cookie);
            }
        }
        prune_expired(&mut cookies, now);
    }

    /// Parse and store every `Set-Cookie` header of a response to `url`.
    pub fn set_cookies_from_headers(&self, headers: &HeaderMap, url: &Url) {
        let now = Utc::now();
        let parsed: Vec<Cookie> = headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| Cookie::parse_at(v, url, now))
            .collect();
        if !parsed.is_empty() {
            debug!(url = %url, count = parsed.len(), "Storing cookies");
            self.set_cookies_at(parsed, now);
        }
    }

    /// Cookies applicable to `url`, longest path first.
    pub fn cookies_for_url(&self, url: &Url) -> Vec<Cookie> {
        self.cookies_for_url_at(url, Utc::now())
    }

    fn cookies_for_url_at(&self, url: &Url, now: DateTime<Utc>) -> Vec<Cookie> {
        let mut cookies = self.lock();
        prune_expired(&mut cookies, now);
        let mut matching: Vec<Cookie> = cookies
            .iter()
            .filter(|c| c.matches_url(url))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        matching
    }

    /// `Cookie` request header value for `url`, if any cookie applies.
    pub fn cookie_header_for_url(&self, url: &Url) -> Option<String> {
        let cookies = self.cookies_for_url(url);
        if cookies.is_empty() {
            return None;
        }
        Some(
            cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn remove_all(&self) {
        self.lock().clear();
    }

    /// Remove every cookie for which `predicate` returns true. Returns how many were removed.
    pub fn remove_matching(&self, predicate: impl Fn(&Cookie) -> bool) -> usize {
        let mut cookies = self.lock();
        let before = cookies.len();
        cookies.retain(|c| !predicate(c));
        before - cookies.len()
    }

    pub fn remove_cookie(&self, name: &str, domain: &str, path: &str) -> bool {
        let domain = domain.trim_start_matches('.').to_ascii_lowercase();
        self.remove_matching(|c| c.name == name && c.domain == domain && c.path == path) > 0
    }

    /// Snapshot of all stored cookies, including not-yet-pruned expired ones.
    pub fn all_cookies(&self) -> Vec<Cookie> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn prune_expired(cookies: &mut Vec<Cookie>, now: DateTime<Utc>) {
    cookies.retain(|c| !c.is_expired_at(now));
}
