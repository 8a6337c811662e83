//! Control-channel integration with the media engine.
//!
//! The engine exposes a bencoded request/response protocol over UDP. This
//! module owns the wire codec ([`bencode`]) and the client ([`UdpClient`])
//! that the HTTP surface and the spy service talk through.

pub mod bencode;
mod client;

pub use bencode::{Dict, Value};
pub use client::{Client, EngineError, SubscribeReply, UdpClient};
