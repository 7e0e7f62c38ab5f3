//! Cross-fetch memory for conditional GET and cookie continuity.

use bytes::Bytes;
use reqwest::header::{HeaderMap, LAST_MODIFIED};
use reqwest::{StatusCode, Url};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::cookies::CookieStore;
use crate::units::ByteSize;

pub const DEFAULT_MEMORY_CAPACITY: ByteSize = ByteSize::mib(15);

#[derive(Debug)]
struct CachedBody {
    body: Bytes,
    last_used: u64,
}

#[derive(Debug, Default)]
struct HistoryState {
    should_cache_dated_data: bool,
    memory_capacity: u64,
    /// Normalized URL to raw `Last-Modified` value.
    dated: HashMap<String, String>,
    cache: HashMap<String, CachedBody>,
    cached_bytes: u64,
    clock: u64,
}

impl HistoryState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove_cached(&mut self, key: &str) {
        if let Some(old) = self.cache.remove(key) {
            self.cached_bytes -= old.body.len() as u64;
        }
    }

    fn evict_to_capacity(&mut self) {
        while self.cached_bytes > self.memory_capacity {
            let Some(oldest) = self
                .cache
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            debug!(url = %oldest, "Evicting cached body");
            self.remove_cached(&oldest);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryStats {
    pub dated_entries: usize,
    pub cached_entries: usize,
    pub cached_bytes: u64,
}

/// Last-modified timestamps, optional cached bodies, and a cookie store,
/// shared by every fetcher it is attached to.
#[derive(Debug)]
pub struct FetchHistory {
    state: Mutex<HistoryState>,
    cookies: Arc<CookieStore>,
}

impl Default for FetchHistory {
    fn default() -> Self {
        Self::new(false, DEFAULT_MEMORY_CAPACITY)
    }
}

impl FetchHistory {
    pub fn new(should_cache_dated_data: bool, memory_capacity: ByteSize) -> Self {
        Self::with_cookie_store(
            should_cache_dated_data,
            memory_capacity,
            Arc::new(CookieStore::new()),
        )
    }

    pub fn with_cookie_store(
        should_cache_dated_data: bool,
        memory_capacity: ByteSize,
        cookies: Arc<CookieStore>,
    ) -> Self {
        Self {
            state: Mutex::new(HistoryState {
                should_cache_dated_data,
                memory_capacity: memory_capacity.as_u64(),
                ..HistoryState::default()
            }),
            cookies,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HistoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// History key for `url`: the URL without its fragment.
    pub fn normalize_url(url: &Url) -> String {
        let mut url = url.clone();
        url.set_fragment(None);
        url.into()
    }

    pub fn cookie_store(&self) -> &Arc<CookieStore> {
        &self.cookies
    }

    pub fn should_cache_dated_data(&self) -> bool {
        self.lock().should_cache_dated_data
    }

    /// Turning caching off drops every cached body; timestamps are kept.
    pub fn set_should_cache_dated_data(&self, enabled: bool) {
        let mut state = self.lock();
        state.should_cache_dated_data = enabled;
        if !enabled {
            state.cache.clear();
            state.cached_bytes = 0;
        }
    }

    pub fn memory_capacity(&self) -> ByteSize {
        ByteSize(self.lock().memory_capacity)
    }

    pub fn set_memory_capacity(&self, capacity: ByteSize) {
        let mut state = self.lock();
        state.memory_capacity = capacity.as_u64();
        state.evict_to_capacity();
    }

    /// Remember a completed response.
    ///
    /// Only 2xx responses are considered. With `Last-Modified` the timestamp is
    /// stored, and the body too when caching is on. Without it, any stale entry
    /// for the URL is dropped.
    pub fn record_response(
        &self,
        url: &Url,
        status: StatusCode,
        headers: &HeaderMap,
        body: Option<&Bytes>,
    ) {
        if !status.is_success() {
            return;
        }
        let key = Self::normalize_url(url);
        let last_modified = headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut state = self.lock();
        let Some(last_modified) = last_modified else {
            if state.dated.remove(&key).is_some() {
                debug!(url = %key, "Dropping stale history entry");
            }
            state.remove_cached(&key);
            return;
        };

        debug!(url = %key, %last_modified, "Recording last-modified");
        state.dated.insert(key.clone(), last_modified);
        state.remove_cached(&key);

        if let (true, Some(body)) = (state.should_cache_dated_data, body) {
            let len = body.len() as u64;
            if len <= state.memory_capacity {
                let last_used = state.tick();
                state.cache.insert(
                    key,
                    CachedBody {
                        body: body.clone(),
                        last_used,
                    },
                );
                state.cached_bytes += len;
                state.evict_to_capacity();
            }
        }
    }

    pub fn last_modified_for(&self, url: &Url) -> Option<String> {
        self.lock().dated.get(&Self::normalize_url(url)).cloned()
    }

    /// Cached body for `url`, marking it as recently used.
    pub fn cached_body_for(&self, url: &Url) -> Option<Bytes> {
        let key = Self::normalize_url(url);
        let mut state = self.lock();
        let tick = state.tick();
        let entry = state.cache.get_mut(&key)?;
        entry.last_used = tick;
        Some(entry.body.clone())
    }

    /// Value for `If-Modified-Since`, if one should be sent.
    ///
    /// With caching on, a URL whose body was evicted gets no conditional header:
    /// a 304 could not be satisfied.
    pub fn conditional_header_for(&self, url: &Url) -> Option<String> {
        let key = Self::normalize_url(url);
        let state = self.lock();
        let last_modified = state.dated.get(&key)?;
        if state.should_cache_dated_data && !state.cache.contains_key(&key) {
            return None;
        }
        Some(last_modified.clone())
    }

    /// Forget every timestamp and cached body. Cookies are untouched.
    pub fn clear_dated_data_history(&self) {
        let mut state = self.lock();
        state.dated.clear();
        state.cache.clear();
        state.cached_bytes = 0;
    }

    pub fn stats(&self) -> HistoryStats {
        let state = self.lock();
        HistoryStats {
            dated_entries: state.dated.len(),
            cached_entries: state.cache.len(),
            cached_bytes: state.cached_bytes,
        }
    }
}
