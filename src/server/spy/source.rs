//! Per-call backend state: both engine subscriptions and the spectator set.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

use super::session::Session;

/// Which side of the monitored call a piece of state belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    From,
    To,
}

impl Leg {
    pub(crate) fn label(self) -> &'static str {
        match self {
            Leg::From => "from",
            Leg::To => "to",
        }
    }
}

/// One established engine subscription: the peer connection receiving the
/// leg's audio and the tag the engine issued for tearing it down again.
pub(crate) struct BackendLeg {
    pub pc: Arc<RTCPeerConnection>,
    pub subscription_tag: String,
}

/// Backend state for one call under observation.
///
/// A source owns both engine subscriptions and the set of spectator
/// sessions currently attached to the call. The cancellation token stops
/// both forwarding loops; it trips once, on teardown.
pub struct Source {
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: String,
    leg_from: OnceLock<BackendLeg>,
    leg_to: OnceLock<BackendLeg>,
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
    pub(crate) cancel: CancellationToken,
}

impl Source {
    pub(crate) fn new(call_id: String, from_tag: String, to_tag: String) -> Self {
        Self {
            call_id,
            from_tag,
            to_tag,
            leg_from: OnceLock::new(),
            leg_to: OnceLock::new(),
            sessions: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Store an established subscription. Each leg is attached exactly once,
    /// during source construction.
    pub(crate) fn attach_leg(&self, leg: Leg, backend: BackendLeg) {
        let slot = match leg {
            Leg::From => &self.leg_from,
            Leg::To => &self.leg_to,
        };
        if slot.set(backend).is_err() {
            debug!(call_id = %self.call_id, leg = leg.label(), "backend leg already attached");
        }
    }

    pub(crate) fn leg(&self, leg: Leg) -> Option<&BackendLeg> {
        match leg {
            Leg::From => self.leg_from.get(),
            Leg::To => self.leg_to.get(),
        }
    }

    pub(crate) fn add_session(&self, session: Arc<Session>) {
        self.sessions.write().insert(session.id, session);
    }

    /// Remove a spectator; returns whether the source is now spectator-less.
    pub(crate) fn remove_session(&self, id: Uuid) -> bool {
        let mut sessions = self.sessions.write();
        sessions.remove(&id);
        sessions.is_empty()
    }

    pub(crate) fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Snapshot of every attached session, for teardown.
    pub(crate) fn drain_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.write().drain().map(|(_, s)| s).collect()
    }

    /// Outbound tracks for one leg, refreshed only when the spectator count
    /// moved since the previous snapshot. Keeps the forwarding loop free of
    /// per-packet allocation while the spectator set is stable.
    pub(crate) fn refresh_tracks(
        &self,
        leg: Leg,
        last_count: &mut usize,
        tracks: &mut Vec<Arc<TrackLocalStaticRTP>>,
    ) {
        let sessions = self.sessions.read();
        if sessions.len() == *last_count {
            return;
        }
        tracks.clear();
        tracks.extend(sessions.values().map(|s| s.track(leg).clone()));
        *last_count = sessions.len();
    }
}

/// Forwarding loop for one backend leg.
///
/// Reads RTP from the engine-side track and copies each packet to every
/// spectator track in the current snapshot, in arrival order. A read error
/// is the terminal signal for the leg; per-spectator write errors are not.
pub(crate) async fn forward_leg(
    track: Arc<TrackRemote>,
    source: Arc<Source>,
    leg: Leg,
    cancel: CancellationToken,
) {
    let mut tracks: Vec<Arc<TrackLocalStaticRTP>> = Vec::new();
    let mut last_count = 0usize;

    debug!(call_id = %source.call_id, leg = leg.label(), "rtp forwarding started");
    loop {
        source.refresh_tracks(leg, &mut last_count, &mut tracks);

        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            read = track.read_rtp() => match read {
                Ok((packet, _attributes)) => packet,
                Err(e) => {
                    debug!(call_id = %source.call_id, leg = leg.label(), error = %e, "rtp read ended");
                    break;
                }
            },
        };

        for out in &tracks {
            match out.write_rtp(&packet).await {
                Ok(_) => {}
                // A spectator whose pipe closed is reaped by its own
                // connection-state handler; skip it here.
                Err(webrtc::Error::ErrClosedPipe) => {}
                Err(e) => {
                    debug!(call_id = %source.call_id, leg = leg.label(), error = %e, "spectator write failed");
                }
            }
        }
    }
    debug!(call_id = %source.call_id, leg = leg.label(), "rtp forwarding stopped");
}

#[cfg(test)]
mod tests {
    use super::super::rtc;
    use super::super::session::outbound_track;
    use super::*;
    use webrtc::peer_connection::configuration::RTCConfiguration;

    async fn test_session() -> Arc<Session> {
        let api = rtc::browser_api(None).unwrap();
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        );
        Arc::new(Session::new(
            pc,
            outbound_track(Leg::From),
            outbound_track(Leg::To),
        ))
    }

    #[tokio::test]
    async fn tracks_refresh_only_on_cardinality_change() {
        let source = Source::new("call-a".into(), "tag-a".into(), "tag-b".into());
        let mut tracks = Vec::new();
        let mut last = 0usize;

        source.refresh_tracks(Leg::From, &mut last, &mut tracks);
        assert!(tracks.is_empty());

        let session = test_session().await;
        source.add_session(session.clone());
        source.refresh_tracks(Leg::From, &mut last, &mut tracks);
        assert_eq!(tracks.len(), 1);
        assert_eq!(last, 1);

        // Stable set: the snapshot is left alone.
        let before = tracks.as_ptr();
        source.refresh_tracks(Leg::From, &mut last, &mut tracks);
        assert_eq!(tracks.as_ptr(), before);
        assert_eq!(tracks.len(), 1);

        assert!(source.remove_session(session.id));
        source.refresh_tracks(Leg::From, &mut last, &mut tracks);
        assert!(tracks.is_empty());
    }

    #[tokio::test]
    async fn removing_the_last_session_reports_empty() {
        let source = Source::new("call-a".into(), "tag-a".into(), "tag-b".into());
        let first = test_session().await;
        let second = test_session().await;
        source.add_session(first.clone());
        source.add_session(second.clone());

        assert!(!source.remove_session(first.id));
        assert!(source.remove_session(second.id));
        assert_eq!(source.session_count(), 0);
    }
}
