//! Local stand-in for a retired smart-bulb cloud.
//!
//! The bridge answers the HTTP handshake bulb firmware performs at boot
//! (registration, broker discovery, session checks), tracks every device it
//! hears from, and drives bulbs directly over the vendor's local UDP
//! control protocol, including the factory-mode setup handshake that joins
//! a bulb to WiFi and redirects it here in the first place.

pub mod cli;
pub mod config;
pub mod handlers;
pub mod provisioning;
pub mod registry;
pub mod request_log;
pub mod udp;
