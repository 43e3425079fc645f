//! Redirect following.
//!
//! [`RedirectCoordinator`] sends a request through an initial [`Sender`] and,
//! while the response asks for a redirect, rewrites the request for the next
//! hop and resends it through a retry sender. Stopping is never an error: the
//! last response received is handed back unchanged.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName};
use http::{Method, StatusCode};
use tracing::{debug, trace};
use url::Url;

use crate::cancel::CancelToken;
use crate::config::RedirectPolicy;
use crate::error::{Error, Result};

/// A request as it travels through a redirect chain.
#[derive(Debug, Clone)]
pub struct HopRequest {
    /// Method of the next send.
    pub method: Method,
    /// Target of the next send.
    pub url: Url,
    /// Headers sent with every hop; `Authorization` is removed on redirect.
    pub headers: HeaderMap,
    /// Body, dropped when a redirect rewrites the method to GET.
    pub body: Option<Bytes>,
    redirected: bool,
    hops: u32,
}

impl HopRequest {
    /// A bodiless request with no headers.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            redirected: false,
            hops: 0,
        }
    }

    /// Attaches a body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Adds a header, replacing any earlier value.
    pub fn with_header(mut self, name: HeaderName, value: http::HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// True once at least one redirect has been followed.
    pub fn was_redirected(&self) -> bool {
        self.redirected
    }

    /// Redirects followed so far.
    pub fn redirect_count(&self) -> u32 {
        self.hops
    }

    fn drop_body(&mut self) {
        self.body = None;
        // Headers describing the body go with it.
        for name in [
            header::TRANSFER_ENCODING,
            header::CONTENT_LENGTH,
            header::CONTENT_TYPE,
        ] {
            self.headers.remove(name);
        }
    }
}

/// What the coordinator needs to know about a response.
pub trait RedirectResponse {
    /// Response status code.
    fn status(&self) -> StatusCode;
    /// Raw `Location` header, if present and valid UTF-8.
    fn location(&self) -> Option<&str>;
}

impl<B> RedirectResponse for http::Response<B> {
    fn status(&self) -> StatusCode {
        http::Response::status(self)
    }

    fn location(&self) -> Option<&str> {
        self.headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
    }
}

/// Transmits one request and returns its response.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Response type handed back to the coordinator.
    type Response: RedirectResponse + Send;

    /// Sends one hop. Implementations should honour `cancel`.
    async fn send(&self, request: &HopRequest, cancel: &CancelToken) -> Result<Self::Response>;
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MULTIPLE_CHOICES
            | StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

fn is_http_scheme(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

/// Method and body treatment for the next hop.
fn rewrites_to_get(status: StatusCode, method: &Method) -> bool {
    match status {
        StatusCode::MULTIPLE_CHOICES | StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => {
            *method == Method::POST
        }
        StatusCode::SEE_OTHER => *method != Method::GET && *method != Method::HEAD,
        _ => false,
    }
}

/// Follows redirects for a request according to a [`RedirectPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RedirectCoordinator {
    policy: RedirectPolicy,
}

impl RedirectCoordinator {
    /// Creates a coordinator enforcing `policy`.
    pub fn new(policy: RedirectPolicy) -> Self {
        Self { policy }
    }

    /// The policy in force.
    pub fn policy(&self) -> &RedirectPolicy {
        &self.policy
    }

    /// Sends `request` via `initial`, following redirects via `retry`.
    ///
    /// `request` is left in the state of the last hop sent. Errors only come
    /// from the senders or from `cancel` firing between hops.
    pub async fn send<A, B>(
        &self,
        request: &mut HopRequest,
        initial: &A,
        retry: &B,
        cancel: &CancelToken,
    ) -> Result<A::Response>
    where
        A: Sender,
        B: Sender<Response = A::Response>,
    {
        let mut response = initial.send(request, cancel).await?;

        while let Some(hop) = self.next_hop(request, &response) {
            // Cancellation leaves the request as it was last sent.
            if let Some(reason) = cancel.reason() {
                return Err(Error::Cancelled(reason));
            }
            hop.apply(request);
            response = retry.send(request, cancel).await?;
        }

        Ok(response)
    }

    /// Works out the hop `response` asks for, or `None` when the redirect is
    /// not to be followed. `request` is not touched.
    fn next_hop<R: RedirectResponse>(&self, request: &HopRequest, response: &R) -> Option<NextHop> {
        if !self.policy.enabled {
            return None;
        }
        let status = response.status();
        if !is_redirect(status) {
            return None;
        }
        let Some(location) = response.location() else {
            trace!(%status, "redirect without location");
            return None;
        };

        let mut target = match request.url.join(location) {
            Ok(target) if is_http_scheme(&target) => target,
            Ok(target) => {
                debug!(%target, "redirect to unsupported scheme not followed");
                return None;
            }
            Err(e) => {
                debug!(location, error = %e, "unparseable redirect location");
                return None;
            }
        };
        if target.fragment().is_none() {
            target.set_fragment(request.url.fragment());
        }

        if request.url.scheme() == "https" && target.scheme() != "https" {
            debug!(from = %request.url, to = %target, "refusing https to http redirect");
            return None;
        }

        let hops = request.hops + 1;
        if hops > self.policy.max_hops {
            debug!(hops, max = self.policy.max_hops, "redirect limit reached");
            return None;
        }

        Some(NextHop {
            status,
            target,
            hops,
        })
    }
}

/// A redirect that will be followed.
struct NextHop {
    status: StatusCode,
    target: Url,
    hops: u32,
}

impl NextHop {
    fn apply(self, request: &mut HopRequest) {
        request.headers.remove(header::AUTHORIZATION);
        if rewrites_to_get(self.status, &request.method) {
            trace!(status = %self.status, from = %request.method, "rewriting redirected request to GET");
            request.method = Method::GET;
            request.drop_body();
        }

        debug!(status = %self.status, from = %request.url, to = %self.target, hops = self.hops, "following redirect");
        request.url = self.target;
        request.hops = self.hops;
        request.redirected = true;
    }
}
