//! CDN box director
//!
//! Authoritative DNS for a CDN zone that steers every query to the best box of
//! a fleet: healthy, under its bandwidth target and close to the client.
//! Directors share box state with each other through signed gossip carried on
//! the DNS port.

pub mod bandwidth;
pub mod box_state;
pub mod config;
pub mod director;
pub mod dns;
pub mod geo;
pub mod gossip;
pub mod identity;
pub mod lock_utils;
pub mod penal_bucket;
pub mod probe;
pub mod selector;
