#![warn(missing_docs)]

//! hopwire: routing and flow-control core of an HTTP client stack.
//!
//! Credit-based flow control with cancellable waiters, multi-proxy selection
//! backed by a failed-endpoint cache, redirect following, and the varint
//! frame-envelope codec of the binary control plane.

pub mod cancel;
pub mod clock;
pub mod config;
pub mod credit;
pub mod endpoint;
pub mod error;
pub mod failed_cache;
pub mod frame;
pub mod redirect;
pub mod selector;
pub mod varint;

pub use cancel::{cancel_pair, CancelHandle, CancelReason, CancelToken};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{CreditConfig, FailedEndpointConfig, HopwireConfig, ProxyConfig, RedirectPolicy};
pub use credit::{CreditPool, CreditStats};
pub use endpoint::{BypassList, Endpoint, EndpointKey, Scheme};
pub use error::{Error, Result};
pub use failed_cache::{FailedCacheStats, FailedEndpointCache};
pub use frame::{FrameEnvelope, FrameType};
pub use redirect::{HopRequest, RedirectCoordinator, RedirectResponse, Sender};
pub use selector::{EndpointSelector, ProxyResolver, Selected, SelectorState};
