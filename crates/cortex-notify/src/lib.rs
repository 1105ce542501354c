//! `cortex-notify` — notification decisions and web-push delivery.
//!
//! The decision function maps (silent?, viewing?, connected?, critical?)
//! onto a channel set; delivery fans toasts out over the client bus and
//! hands push to the VAPID-backed push service.

pub mod decision;
pub mod error;
pub mod push;
pub mod types;

pub use decision::{should_notify, NotificationDecision};
pub use error::{NotifyError, Result};
pub use push::PushService;
pub use types::{ClientSession, PushSubscription};
