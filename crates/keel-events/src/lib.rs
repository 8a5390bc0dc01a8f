//! ---
//! keel_section: "02-events-notifications"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Notification bus and topic catalogue."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
//! Notification fan-out for kernel lifecycle, health and failover events.
#![warn(missing_docs)]

pub mod bus;
pub mod topics;

pub use bus::{BusStats, Handler, Notification, NotificationBus, SubscriptionId};
