//! Multi-proxy selection with failure memory.
//!
//! An [`EndpointSelector`] walks the proxy candidates for one connection
//! attempt. Each call to [`EndpointSelector::read_next`] means the previous
//! candidate did not work, so it is reported to the shared
//! [`FailedEndpointCache`] before the walk continues. Candidates in their
//! failure cooldown are skipped; if none is usable, the one closest to the end
//! of its cooldown is renewed and tried anyway.
//!
//! Candidates come either from a pre-parsed list or from a raw configuration
//! string that is tokenized only as far as needed:
//!
//! ```text
//! http=proxy-a:8080;https=proxy-b:8443 proxy-c:3128
//! ```
//!
//! Delimiters are `;`, space, CR, LF and tab. A `http=` or `http://` prefix
//! limits a candidate to plain-text targets, `https=` or `https://` to secure
//! targets; unprefixed candidates serve both. The proxy itself is always
//! addressed as `http://<authority>`.
//!
//! A selector is single-pass and single-owner: once exhausted it stays
//! exhausted, and it must not be shared between tasks.

use std::sync::Arc;

use tracing::{debug, trace, warn};
use url::Url;

use crate::config::ProxyConfig;
use crate::endpoint::{BypassList, Endpoint};
use crate::error::{Error, Result};
use crate::failed_cache::FailedEndpointCache;

const DELIMITERS: &[char] = &[';', ' ', '\r', '\n', '\t'];

/// Where an [`EndpointSelector`] is in its walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorState {
    /// `read_next` has not been called.
    NotStarted,
    /// A candidate has been handed out.
    Iterating,
    /// No candidate is left.
    Exhausted,
}

/// A candidate chosen by [`EndpointSelector::read_next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selected {
    /// The proxy to try.
    pub endpoint: Endpoint,
    /// No further candidates follow this one.
    pub is_last: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applies {
    Insecure,
    Secure,
    Both,
}

impl Applies {
    fn matches(self, secure: bool) -> bool {
        match self {
            Applies::Both => true,
            Applies::Secure => secure,
            Applies::Insecure => !secure,
        }
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

/// Pulls the next candidate applying to `secure` out of `text`, starting at `*pos`.
fn next_config_candidate(text: &str, pos: &mut usize, secure: bool) -> Option<Endpoint> {
    loop {
        let rest = &text[*pos..];
        let part = rest.trim_start_matches(DELIMITERS);
        if part.is_empty() {
            *pos = text.len();
            return None;
        }

        let mut part = part;
        let mut applies = Applies::Both;
        if let Some(r) = strip_prefix_ignore_case(part, "http=") {
            applies = Applies::Insecure;
            part = r;
        } else if let Some(r) = strip_prefix_ignore_case(part, "https=") {
            applies = Applies::Secure;
            part = r;
        }
        if let Some(r) = strip_prefix_ignore_case(part, "http://") {
            applies = Applies::Insecure;
            part = r;
        } else if let Some(r) = strip_prefix_ignore_case(part, "https://") {
            applies = Applies::Secure;
            part = r;
        }

        let end = part.find(DELIMITERS).unwrap_or(part.len());
        let authority = &part[..end];
        *pos = text.len() - part.len() + end;

        if !applies.matches(secure) || authority.is_empty() {
            continue;
        }
        match Endpoint::parse(&format!("http://{authority}")) {
            Ok(endpoint) => return Some(endpoint),
            Err(e) => warn!(candidate = authority, error = %e, "skipping unparseable proxy"),
        }
    }
}

enum Candidates {
    List { items: Arc<[Endpoint]>, next: usize },
    Config { text: Arc<str>, pos: usize, secure: bool },
}

impl Candidates {
    fn next_raw(&mut self) -> Option<Endpoint> {
        match self {
            Candidates::List { items, next } => {
                let item = items.get(*next)?.clone();
                *next += 1;
                Some(item)
            }
            Candidates::Config { text, pos, secure } => next_config_candidate(text, pos, *secure),
        }
    }
}

/// Walks the proxy candidates of one connection attempt.
pub struct EndpointSelector {
    candidates: Candidates,
    lookahead: Option<Endpoint>,
    cache: Arc<FailedEndpointCache>,
    last_selected: Option<Endpoint>,
    handed_out: bool,
    state: SelectorState,
}

impl EndpointSelector {
    /// Selector over an already-parsed candidate list.
    pub fn from_list(items: impl Into<Arc<[Endpoint]>>, cache: Arc<FailedEndpointCache>) -> Self {
        Self::with_candidates(
            Candidates::List {
                items: items.into(),
                next: 0,
            },
            cache,
        )
    }

    /// Selector over a raw proxy configuration string, for secure or plain-text targets.
    pub fn from_config(
        text: impl Into<Arc<str>>,
        secure: bool,
        cache: Arc<FailedEndpointCache>,
    ) -> Self {
        Self::with_candidates(
            Candidates::Config {
                text: text.into(),
                pos: 0,
                secure,
            },
            cache,
        )
    }

    fn with_candidates(candidates: Candidates, cache: Arc<FailedEndpointCache>) -> Self {
        Self {
            candidates,
            lookahead: None,
            cache,
            last_selected: None,
            handed_out: false,
            state: SelectorState::NotStarted,
        }
    }

    /// Current phase of the walk.
    pub fn state(&self) -> SelectorState {
        self.state
    }

    /// The candidate most recently returned, if the walk is still on it.
    pub fn current(&self) -> Option<&Endpoint> {
        self.last_selected.as_ref()
    }

    /// Advances to the next usable candidate.
    ///
    /// The previously returned candidate, if any, is first recorded as failed.
    /// Falling back to a failed candidate only happens while nothing has been
    /// handed out in this pass. Returns `None` once no candidate is left; after
    /// that the selector never yields again.
    pub fn read_next(&mut self) -> Option<Selected> {
        if let Some(previous) = self.last_selected.take() {
            self.cache.mark_failed(&previous);
        }
        if self.state == SelectorState::Exhausted {
            return None;
        }
        self.state = SelectorState::Iterating;

        let mut fallback: Option<(Endpoint, u64)> = None;
        while let Some(candidate) = self.pull() {
            match self.cache.renew_ticks(&candidate) {
                None => {
                    let is_last = self.peek_is_last();
                    trace!(endpoint = %candidate, is_last, "selected proxy");
                    self.last_selected = Some(candidate.clone());
                    self.handed_out = true;
                    return Some(Selected {
                        endpoint: candidate,
                        is_last,
                    });
                }
                Some(renew_at) => {
                    trace!(endpoint = %candidate, renew_at, "skipping failed proxy");
                    if fallback.as_ref().map_or(true, |(_, best)| renew_at < *best) {
                        fallback = Some((candidate, renew_at));
                    }
                }
            }
        }

        self.state = SelectorState::Exhausted;
        if self.handed_out {
            return None;
        }

        let (candidate, renew_at) = fallback?;
        if !self.cache.try_renew(&candidate, renew_at) {
            debug!(endpoint = %candidate, "fallback proxy renewal lost a race");
            return None;
        }
        debug!(endpoint = %candidate, renew_at, "all proxies failed, renewing the earliest");
        self.last_selected = Some(candidate.clone());
        self.handed_out = true;
        Some(Selected {
            endpoint: candidate,
            is_last: true,
        })
    }

    /// Like [`read_next`](Self::read_next) but reports exhaustion as an error.
    pub fn next_or_err(&mut self) -> Result<Selected> {
        self.read_next().ok_or(Error::NoCandidate)
    }

    fn pull(&mut self) -> Option<Endpoint> {
        self.lookahead
            .take()
            .or_else(|| self.candidates.next_raw())
    }

    fn peek_is_last(&mut self) -> bool {
        if self.lookahead.is_none() {
            self.lookahead = self.candidates.next_raw();
        }
        self.lookahead.is_none()
    }
}

impl Iterator for EndpointSelector {
    type Item = Selected;

    fn next(&mut self) -> Option<Selected> {
        self.read_next()
    }
}

/// Resolves which proxies to try for a target, from an owned [`ProxyConfig`].
#[derive(Debug, Clone)]
pub struct ProxyResolver {
    list: Option<Arc<[Endpoint]>>,
    text: Option<Arc<str>>,
    bypass: BypassList,
    cache: Arc<FailedEndpointCache>,
}

impl ProxyResolver {
    /// Builds a resolver. Entries of `proxy_list` are parsed eagerly; the
    /// `proxies` string is kept raw and tokenized per selector.
    pub fn new(config: &ProxyConfig, cache: Arc<FailedEndpointCache>) -> Result<Self> {
        let list: Option<Arc<[Endpoint]>> = if config.proxy_list.is_empty() {
            None
        } else {
            let parsed = config
                .proxy_list
                .iter()
                .map(|uri| Endpoint::parse(uri))
                .collect::<Result<Vec<_>>>()?;
            Some(Arc::from(parsed))
        };
        let text = match (&list, config.proxies.as_deref()) {
            (None, Some(p)) if !p.trim().is_empty() => Some(Arc::from(p)),
            _ => None,
        };

        Ok(Self {
            list,
            text,
            bypass: BypassList::parse(&config.bypass),
            cache,
        })
    }

    /// A fresh selector for one connection attempt to `target`, or `None`
    /// when the target should be reached directly.
    pub fn select_for(&self, target: &Url) -> Option<EndpointSelector> {
        let host = target.host_str()?;
        if self.bypass.matches(host) {
            trace!(host, "target bypasses proxies");
            return None;
        }

        let secure = target.scheme().eq_ignore_ascii_case("https");
        match (&self.list, &self.text) {
            (Some(list), _) => Some(EndpointSelector::from_list(
                Arc::clone(list),
                Arc::clone(&self.cache),
            )),
            (None, Some(text)) => Some(EndpointSelector::from_config(
                Arc::clone(text),
                secure,
                Arc::clone(&self.cache),
            )),
            (None, None) => None,
        }
    }

    /// The failed-endpoint cache shared by every selector.
    pub fn cache(&self) -> &Arc<FailedEndpointCache> {
        &self.cache
    }
}
