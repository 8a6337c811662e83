//! callscope: an operator console for a running media relay.
//!
//! The relay (the "engine") terminates RTP for voice calls and exposes a
//! bencoded UDP control channel. callscope sits next to it and gives
//! operators a small HTTP API to list calls, inspect per-call state and
//! engine statistics, and listen in on the audio of any active call from a
//! browser, live, via WebRTC.
//!
//! # Modules
//!
//! - [`config`]: environment-driven runtime configuration
//! - [`engine`]: bencode codec and the UDP control client
//! - [`server`]: HTTP surface, the audio-spy bridge, process metrics

pub mod config;
pub mod engine;
pub mod server;

pub use config::Config;
