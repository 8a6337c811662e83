//! Per-spectator state: one browser peer connection, two outbound tracks.

use std::sync::Arc;

use uuid::Uuid;
use webrtc::api::media_engine::MIME_TYPE_PCMU;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use super::source::Leg;

/// Stream id shared by both outbound tracks of a session.
const STREAM_ID: &str = "callscope";

/// One browser listening in on a call. Both legs arrive as separate mu-law
/// audio tracks so the operator UI can pan or mute them independently.
pub struct Session {
    pub id: Uuid,
    pub(crate) pc: Arc<RTCPeerConnection>,
    track_from: Arc<TrackLocalStaticRTP>,
    track_to: Arc<TrackLocalStaticRTP>,
}

impl Session {
    pub(crate) fn new(
        pc: Arc<RTCPeerConnection>,
        track_from: Arc<TrackLocalStaticRTP>,
        track_to: Arc<TrackLocalStaticRTP>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            pc,
            track_from,
            track_to,
        }
    }

    pub(crate) fn track(&self, leg: Leg) -> &Arc<TrackLocalStaticRTP> {
        match leg {
            Leg::From => &self.track_from,
            Leg::To => &self.track_to,
        }
    }
}

/// Outbound spectator track for one leg. The engine transcodes every
/// subscription to PCMU, so declaring PCMU here keeps the forwarding path a
/// pure passthrough.
pub(crate) fn outbound_track(leg: Leg) -> Arc<TrackLocalStaticRTP> {
    let id = match leg {
        Leg::From => "audio_from",
        Leg::To => "audio_to",
    };
    Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_PCMU.to_owned(),
            ..Default::default()
        },
        id.to_owned(),
        STREAM_ID.to_owned(),
    ))
}
