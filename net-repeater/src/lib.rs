//! `net-repeater`: a DNS-driven per-host network repeater.
//!
//! Answers A/AAAA queries for arbitrary hostnames with a freshly allocated
//! local IP, then transparently forwards TCP/TLS traffic sent to that IP
//! to the real upstream host. See `SPEC_FULL.md` for the full component
//! breakdown; each module here corresponds to one component (`C1`-`C11`).

pub mod config;
pub mod dns;
pub mod downstream;
pub mod forward;
pub mod iface;
pub mod ipgen;
pub mod listener;
pub mod manager;
pub mod service;
pub mod static_repeat;
pub mod tls_config;
