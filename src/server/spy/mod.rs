//! Real-time audio spying.
//!
//! A two-sided media bridge per observed call:
//!
//! ```text
//! engine ==RTP==> backend peer connections (one per leg)
//!                     |            |
//!                 forwarding   forwarding
//!                     |            |
//!                     v            v
//!            spectator tracks (audio_from / audio_to)
//!                     |
//!                     v
//!            browser peer connections (one per spectator)
//! ```
//!
//! The backend side subscribes to both legs of the call over the engine's
//! control channel and receives each leg as one PCMU audio track. Every
//! spectator shares those two subscriptions; their packets are copied to
//! each spectator's outbound tracks without buffering or reordering.

mod rtc;
mod service;
mod session;
mod source;

pub use service::{SpyError, SpyOffer, SpyService};
