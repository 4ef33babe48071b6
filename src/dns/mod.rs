//! CDN Director DNS
//!
//! Authoritative answers for the CDN zone. Every query for an application
//! alias is routed to one box of the fleet; the zone apex answers with a
//! location-ordered nameserver list. Gossip between directors shares the DNS
//! port as TXT control messages.
//!
//! ## Architecture
//!
//! ```text
//! Client → UDP/TCP → dns_server → wire::decode ─┬─ Query   → Dispatcher → selector::choose → A/AAAA/CNAME
//!                                               │                       → ns_list::build  → NS / SOA
//!                                               └─ Control → gossip::handle_control → BoxStateModel
//! ```
//!
//! ## Components
//!
//! - `dns_types`: record types, response codes and resource records
//! - `wire`: packet decoder (EDNS client subnet, control messages) and compressed encoder
//! - `ns_list`: geo-ordered nameserver list
//! - `dispatcher`: per-query answer construction and the `dns` log event
//! - `dns_server`: UDP/TCP listeners and gossip sends

pub mod dns_types;
pub mod wire;
pub mod ns_list;
pub mod dispatcher;
pub mod dns_server;

pub use dns_types::*;
pub use wire::*;
pub use dispatcher::*;
pub use dns_server::*;
