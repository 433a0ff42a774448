//! ferryd is the delivery core of a composable mail server: a
//! policy-driven per-message dispatcher, a crash-safe retry queue and
//! the contracts (checks, delivery targets) that tie them together.
//!
//! An inbound protocol engine drives one message through
//! [`dispatch::Dispatcher::start`], then `add_rcpt`/`body`/`commit` on
//! the returned delivery. The dispatcher resolves the configured policy
//! blocks for sender and recipients, runs their check groups in order,
//! and fans the message out to the delivery targets those blocks name.
//! [`queue::Queue`] is itself such a target: it persists the message
//! and retries a downstream target with per-recipient bookkeeping.

pub mod authres;
pub mod cancel;
pub mod check;
pub mod dispatch;
pub mod queue;
pub mod registry;
pub mod stateless;
pub mod target;

pub use cancel::CancelToken;
pub use target::{Delivery, DeliveryTarget, PartialError, TargetError};
