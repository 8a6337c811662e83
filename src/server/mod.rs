//! Operator-facing server: HTTP surface, audio spy, and process metrics.
//!
//! ```text
//! browser --HTTP--> /spy/{call_id} ----> SpyService ----> engine (bencode/UDP)
//!    ^                                       |
//!    |                                       v
//!    +=====WebRTC (PCMU x2)====== per-call Source <==WebRTC== engine RTP
//! ```

pub mod http;
pub mod metrics;
pub mod spy;

pub use http::{create_router, AppState};
pub use metrics::{MetricsSnapshot, MonitorMetrics};
pub use spy::{SpyError, SpyOffer, SpyService};
