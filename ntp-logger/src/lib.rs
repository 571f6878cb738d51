//! Passive NTP traffic logger.
//!
//! A capture source feeds UDP datagrams to a pool of workers. Each worker
//! checks that the payload is NTP, filters the client against a list of IP
//! prefixes, appends matching packets to a date-rotated output file and can
//! optionally answer the client with a synthesized server reply.

pub mod capture;
pub mod ntp;
pub mod output;
pub mod packet;
pub mod pipeline;
pub mod prefix;
pub mod responder;

pub use packet::CapturedDatagram;
