//! Registry and lifecycle coordinator for audio spying.
//!
//! The service owns the source table (one entry per observed call) and the
//! flat session table (one entry per connected spectator). All mutation goes
//! through the operations here; cleanup always runs service -> source ->
//! session, so teardown never chases a reference back up the chain.
//!
//! Locking: the source table is an async mutex held across the engine
//! exchange during source construction; that serialisation is what makes
//! source creation single-flight per call id. The session table is only ever
//! touched for map reads and writes. Each source guards its own spectator
//! map and is never locked while holding the session table.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;
use webrtc::api::API;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use crate::config::Config;
use crate::engine::{self, EngineError, Value};

use super::super::metrics::MonitorMetrics;
use super::rtc;
use super::session::{outbound_track, Session};
use super::source::{forward_leg, BackendLeg, Leg, Source};

/// Failures surfaced to the signaling endpoints.
#[derive(Debug, thiserror::Error)]
pub enum SpyError {
    #[error("session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("not enough tags to identify both call legs")]
    NotEnoughTags,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("webrtc failure: {0}")]
    WebRtc(String),
}

impl From<webrtc::Error> for SpyError {
    fn from(e: webrtc::Error) -> Self {
        SpyError::WebRtc(e.to_string())
    }
}

/// Everything the browser needs to start listening: the session to answer
/// to, the server's SDP offer, and the resolved leg tags.
#[derive(Debug)]
pub struct SpyOffer {
    pub session_id: Uuid,
    pub sdp: String,
    pub from_tag: String,
    pub to_tag: String,
}

pub struct SpyService {
    cfg: Config,
    engine: Arc<dyn engine::Client>,
    browser_api: API,
    backend_api: API,
    sources: Mutex<HashMap<String, Arc<Source>>>,
    sessions: DashMap<Uuid, Arc<Session>>,
    metrics: Arc<MonitorMetrics>,
}

impl SpyService {
    /// Build the service and both WebRTC API instances. `ice_socket` is the
    /// pre-bound socket every spectator connection is multiplexed over; with
    /// `None` the browser side uses ordinary ephemeral UDP.
    pub fn new(
        cfg: Config,
        engine: Arc<dyn engine::Client>,
        ice_socket: Option<UdpSocket>,
        metrics: Arc<MonitorMetrics>,
    ) -> Result<Arc<Self>, SpyError> {
        let browser_api = rtc::browser_api(ice_socket)?;
        let backend_api = rtc::backend_api(&cfg)?;
        Ok(Arc::new(Self {
            cfg,
            engine,
            browser_api,
            backend_api,
            sources: Mutex::new(HashMap::new()),
            sessions: DashMap::new(),
            metrics,
        }))
    }

    /// Attach a new spectator to a call, creating the backend source first
    /// if this is the call's first spectator.
    pub async fn start_session(
        self: &Arc<Self>,
        call_id: &str,
        from_tag: Option<String>,
        to_tag: Option<String>,
    ) -> Result<SpyOffer, SpyError> {
        let (from_tag, to_tag) = match (from_tag, to_tag) {
            (Some(f), Some(t)) if !f.is_empty() && !t.is_empty() => (f, t),
            _ => detect_tags(self.engine.as_ref(), call_id).await?,
        };
        info!(call_id = %call_id, from_tag = %from_tag, to_tag = %to_tag, "starting spy session");

        let source = {
            // The table lock stays held across the engine exchange:
            // concurrent spectators of a fresh call share one source.
            let mut sources = self.sources.lock().await;
            match sources.get(call_id) {
                Some(existing) => existing.clone(),
                None => {
                    let source = self.create_source(call_id, &from_tag, &to_tag).await?;
                    sources.insert(call_id.to_string(), source.clone());
                    self.metrics.source_opened();
                    source
                }
            }
        };

        let (session_id, sdp) = self.create_session(&source).await?;
        Ok(SpyOffer {
            session_id,
            sdp,
            from_tag,
            to_tag,
        })
    }

    /// Apply the browser's SDP answer to its session.
    pub async fn handle_answer(&self, session_id: Uuid, sdp: String) -> Result<(), SpyError> {
        let session = self
            .sessions
            .get(&session_id)
            .map(|entry| entry.value().clone())
            .ok_or(SpyError::SessionNotFound(session_id))?;

        let answer = RTCSessionDescription::answer(sdp)?;
        session.pc.set_remote_description(answer).await?;
        Ok(())
    }

    /// Subscribe to both legs of a call. On any failure nothing reaches the
    /// source table and everything already built is released again.
    async fn create_source(
        self: &Arc<Self>,
        call_id: &str,
        from_tag: &str,
        to_tag: &str,
    ) -> Result<Arc<Source>, SpyError> {
        let source = Arc::new(Source::new(
            call_id.to_string(),
            from_tag.to_string(),
            to_tag.to_string(),
        ));

        for leg in [Leg::From, Leg::To] {
            if let Err(e) = self.subscribe_leg(&source, leg).await {
                self.release_source(&source).await;
                return Err(e);
            }
        }
        Ok(source)
    }

    /// Establish one backend subscription: peer connection, engine
    /// `subscribe request`, remote offer, gathered local answer (with the
    /// rejected-audio rewrite), engine `subscribe answer`. The leg is only
    /// attached to the source once the full exchange succeeded.
    async fn subscribe_leg(self: &Arc<Self>, source: &Arc<Source>, leg: Leg) -> Result<(), SpyError> {
        let leg_tag = match leg {
            Leg::From => source.from_tag.clone(),
            Leg::To => source.to_tag.clone(),
        };

        let pc = Arc::new(
            self.backend_api
                .new_peer_connection(RTCConfiguration::default())
                .await?,
        );

        let weak_source = Arc::downgrade(source);
        let cancel = source.cancel.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let weak_source = weak_source.clone();
            let cancel = cancel.clone();
            Box::pin(async move {
                if track.kind() != RTPCodecType::Audio {
                    return;
                }
                if let Some(source) = weak_source.upgrade() {
                    tokio::spawn(forward_leg(track, source, leg, cancel));
                }
            })
        }));

        let service = Arc::downgrade(self);
        let weak_source = Arc::downgrade(source);
        pc.on_peer_connection_state_change(Box::new(move |state| {
            debug!(leg = leg.label(), state = %state, "backend peer state");
            if matches!(
                state,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
            ) {
                if let (Some(service), Some(source)) = (service.upgrade(), weak_source.upgrade()) {
                    return Box::pin(async move {
                        service.cleanup_source(&source).await;
                    });
                }
            }
            Box::pin(async {})
        }));

        let reply = match self.engine.subscribe(&source.call_id, &leg_tag).await {
            Ok(reply) => reply,
            Err(e) => {
                let _ = pc.close().await;
                return Err(e.into());
            }
        };

        let negotiated = async {
            let offer = RTCSessionDescription::offer(reply.sdp.clone())?;
            pc.set_remote_description(offer).await?;
            let answer = pc.create_answer(None).await?;
            let mut gathered = pc.gathering_complete_promise().await;
            pc.set_local_description(answer).await?;
            let _ = gathered.recv().await;
            pc.local_description().await.ok_or_else(|| {
                webrtc::Error::new("local description unavailable after gathering".to_string())
            })
        }
        .await;

        let local = match negotiated {
            Ok(local) => local,
            Err(e) => {
                self.discard_subscription(source, &pc, &reply.to_tag).await;
                return Err(e.into());
            }
        };

        let answer_sdp = rtc::rewrite_rejected_audio(&local.sdp);
        if let Err(e) = self
            .engine
            .subscribe_answer(&source.call_id, &answer_sdp, &reply.to_tag)
            .await
        {
            self.discard_subscription(source, &pc, &reply.to_tag).await;
            return Err(e.into());
        }

        source.attach_leg(
            leg,
            BackendLeg {
                pc,
                subscription_tag: reply.to_tag,
            },
        );
        Ok(())
    }

    /// Abandon a half-established leg: close the connection and reclaim the
    /// engine-side subscription best-effort.
    async fn discard_subscription(
        &self,
        source: &Arc<Source>,
        pc: &Arc<webrtc::peer_connection::RTCPeerConnection>,
        subscription_tag: &str,
    ) {
        let _ = pc.close().await;
        if let Err(e) = self
            .engine
            .unsubscribe(&source.call_id, subscription_tag)
            .await
        {
            debug!(call_id = %source.call_id, error = %e, "unsubscribe after failed setup");
        }
    }

    /// Build the spectator session against an established source and return
    /// its id plus the gathered SDP offer.
    async fn create_session(
        self: &Arc<Self>,
        source: &Arc<Source>,
    ) -> Result<(Uuid, String), SpyError> {
        let pc = Arc::new(
            self.browser_api
                .new_peer_connection(RTCConfiguration::default())
                .await?,
        );

        let track_from = outbound_track(Leg::From);
        let track_to = outbound_track(Leg::To);
        let added = async {
            pc.add_track(track_from.clone()).await?;
            pc.add_track(track_to.clone()).await?;
            Ok::<(), webrtc::Error>(())
        }
        .await;
        if let Err(e) = added {
            let _ = pc.close().await;
            return Err(e.into());
        }

        let session = Arc::new(Session::new(pc.clone(), track_from, track_to));
        let session_id = session.id;

        let service = Arc::downgrade(self);
        let weak_source = Arc::downgrade(source);
        pc.on_peer_connection_state_change(Box::new(move |state| {
            debug!(session_id = %session_id, state = %state, "spectator peer state");
            if matches!(
                state,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
            ) {
                if let Some(service) = service.upgrade() {
                    let source = weak_source.upgrade();
                    return Box::pin(async move {
                        service.cleanup_session(session_id, source).await;
                    });
                }
            }
            Box::pin(async {})
        }));

        self.sessions.insert(session_id, session.clone());
        self.metrics.session_opened();
        source.add_session(session);

        let offered = async {
            let offer = pc.create_offer(None).await?;
            let mut gathered = pc.gathering_complete_promise().await;
            pc.set_local_description(offer).await?;
            let _ = gathered.recv().await;
            pc.local_description().await.ok_or_else(|| {
                webrtc::Error::new("local description unavailable after gathering".to_string())
            })
        }
        .await;

        match offered {
            Ok(local) => {
                info!(session_id = %session_id, call_id = %source.call_id, "spy session ready");
                Ok((session_id, local.sdp))
            }
            Err(e) => {
                self.cleanup_session(session_id, Some(source.clone())).await;
                let _ = pc.close().await;
                Err(e.into())
            }
        }
    }

    /// Drop a spectator from both tables. The source stays up even without
    /// spectators unless an idle timeout is configured.
    pub async fn cleanup_session(self: &Arc<Self>, session_id: Uuid, source: Option<Arc<Source>>) {
        if self.sessions.remove(&session_id).is_some() {
            self.metrics.session_closed();
            info!(session_id = %session_id, "spy session removed");
        }

        let Some(source) = source else { return };
        let now_empty = source.remove_session(session_id);
        if now_empty && !self.cfg.spy_idle_timeout.is_zero() {
            self.spawn_idle_reaper(&source);
        }
    }

    fn spawn_idle_reaper(self: &Arc<Self>, source: &Arc<Source>) {
        let service = self.clone();
        let source = source.clone();
        let idle = self.cfg.spy_idle_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = source.cancel.cancelled() => return,
                _ = tokio::time::sleep(idle) => {}
            }
            // A spectator may have rejoined while the timer ran.
            if source.session_count() == 0 {
                info!(call_id = %source.call_id, "reclaiming idle source");
                service.cleanup_source(&source).await;
            }
        });
    }

    /// Remove a source from the table and release it asynchronously. The
    /// identity check makes stale callers (a reaper racing a rejoin, a late
    /// state-change callback) harmless: only the exact registered source is
    /// ever removed.
    pub async fn cleanup_source(self: &Arc<Self>, source: &Arc<Source>) {
        let removed = {
            let mut sources = self.sources.lock().await;
            match sources.get(source.call_id.as_str()) {
                Some(current) if Arc::ptr_eq(current, source) => {
                    sources.remove(source.call_id.as_str());
                    true
                }
                _ => false,
            }
        };
        if !removed {
            return;
        }
        self.metrics.source_closed();
        info!(call_id = %source.call_id, "source removed");

        // Stop both forwarding loops right away; connection teardown and
        // engine unsubscribes can finish in the background.
        source.cancel.cancel();

        let service = self.clone();
        let source = source.clone();
        tokio::spawn(async move {
            service.release_source(&source).await;
        });
    }

    /// Tear down everything a source holds: forwarding loops, spectator
    /// connections, backend connections, and both engine subscriptions
    /// (best-effort).
    async fn release_source(&self, source: &Arc<Source>) {
        source.cancel.cancel();

        for session in source.drain_sessions() {
            if self.sessions.remove(&session.id).is_some() {
                self.metrics.session_closed();
            }
            if let Err(e) = session.pc.close().await {
                debug!(session_id = %session.id, error = %e, "closing spectator connection");
            }
        }

        for leg in [Leg::From, Leg::To] {
            let Some(backend) = source.leg(leg) else {
                continue;
            };
            if let Err(e) = backend.pc.close().await {
                debug!(call_id = %source.call_id, leg = leg.label(), error = %e, "closing backend connection");
            }
            if let Err(e) = self
                .engine
                .unsubscribe(&source.call_id, &backend.subscription_tag)
                .await
            {
                debug!(call_id = %source.call_id, leg = leg.label(), error = %e, "unsubscribe failed");
            }
        }
    }

    /// Drain every remaining source: called once on process shutdown so the
    /// engine is not left holding subscriptions it has to time out itself.
    pub async fn shutdown(&self) {
        let sources: Vec<Arc<Source>> = {
            let mut table = self.sources.lock().await;
            table.drain().map(|(_, source)| source).collect()
        };
        if sources.is_empty() {
            return;
        }
        info!(count = sources.len(), "draining spy sources");
        for source in sources {
            self.metrics.source_closed();
            self.release_source(&source).await;
        }
    }
}

/// Resolve the two call legs from the engine's `query` response: entries of
/// the `tags` map ordered by creation time, ties broken on the tag string.
/// The earliest is the from-leg, the second earliest the to-leg.
pub(crate) async fn detect_tags(
    engine: &dyn engine::Client,
    call_id: &str,
) -> Result<(String, String), SpyError> {
    let details = engine.query_call(call_id).await?;
    let tags = match details.get("tags").and_then(Value::as_dict) {
        Some(tags) => tags,
        None => return Err(SpyError::NotEnoughTags),
    };

    let mut order: Vec<(i64, &str)> = tags
        .iter()
        .map(|(tag, info)| {
            let created = info.get("created").and_then(Value::as_int).unwrap_or(0);
            (created, tag.as_str())
        })
        .collect();
    if order.len() < 2 {
        return Err(SpyError::NotEnoughTags);
    }
    order.sort_unstable();

    Ok((order[0].1.to_string(), order[1].1.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Dict, SubscribeReply};
    use async_trait::async_trait;

    /// Engine stub whose `query` response is scripted per test.
    struct ScriptedEngine {
        query: Value,
    }

    #[async_trait]
    impl engine::Client for ScriptedEngine {
        async fn list_calls(&self) -> Result<Vec<String>, EngineError> {
            Ok(Vec::new())
        }
        async fn query_call(&self, _call_id: &str) -> Result<Value, EngineError> {
            Ok(self.query.clone())
        }
        async fn subscribe(
            &self,
            _call_id: &str,
            _from_tag: &str,
        ) -> Result<SubscribeReply, EngineError> {
            Err(EngineError::Transport("not scripted".to_string()))
        }
        async fn subscribe_answer(
            &self,
            _call_id: &str,
            _sdp: &str,
            _to_tag: &str,
        ) -> Result<(), EngineError> {
            Ok(())
        }
        async fn unsubscribe(&self, _call_id: &str, _to_tag: &str) -> Result<(), EngineError> {
            Ok(())
        }
        async fn statistics(&self) -> Result<Value, EngineError> {
            Ok(Value::Dict(Dict::new()))
        }
    }

    fn tags_response(entries: &[(&str, i64)]) -> Value {
        let mut tags = Dict::new();
        for (tag, created) in entries {
            let mut info = Dict::new();
            info.insert("created".to_string(), Value::Int(*created));
            tags.insert(tag.to_string(), Value::Dict(info));
        }
        let mut response = Dict::new();
        response.insert("tags".to_string(), Value::Dict(tags));
        Value::Dict(response)
    }

    #[tokio::test]
    async fn detects_tags_in_creation_order() {
        let engine = ScriptedEngine {
            query: tags_response(&[("tag-caller", 1000), ("tag-callee", 2000)]),
        };
        let (from, to) = detect_tags(&engine, "call-a").await.unwrap();
        assert_eq!(from, "tag-caller");
        assert_eq!(to, "tag-callee");
    }

    #[tokio::test]
    async fn creation_time_wins_over_tag_order() {
        // Lexicographic order contradicts creation order on purpose.
        let engine = ScriptedEngine {
            query: tags_response(&[("a-late", 2000), ("z-early", 1000)]),
        };
        let (from, to) = detect_tags(&engine, "call-a").await.unwrap();
        assert_eq!(from, "z-early");
        assert_eq!(to, "a-late");
    }

    #[tokio::test]
    async fn creation_ties_break_lexicographically() {
        let engine = ScriptedEngine {
            query: tags_response(&[("b", 1000), ("a", 1000)]),
        };
        let (from, to) = detect_tags(&engine, "call-a").await.unwrap();
        assert_eq!(from, "a");
        assert_eq!(to, "b");
    }

    #[tokio::test]
    async fn one_tag_is_not_enough() {
        let engine = ScriptedEngine {
            query: tags_response(&[("only", 1000)]),
        };
        let err = detect_tags(&engine, "call-a").await.unwrap_err();
        assert!(matches!(err, SpyError::NotEnoughTags));
    }

    #[tokio::test]
    async fn missing_tags_map_is_not_enough() {
        let engine = ScriptedEngine {
            query: Value::Dict(Dict::new()),
        };
        let err = detect_tags(&engine, "call-a").await.unwrap_err();
        assert!(matches!(err, SpyError::NotEnoughTags));
    }

    #[tokio::test]
    async fn answering_an_unknown_session_fails() {
        let service = SpyService::new(
            Config::default(),
            Arc::new(ScriptedEngine {
                query: Value::Dict(Dict::new()),
            }),
            None,
            Arc::new(MonitorMetrics::default()),
        )
        .unwrap();

        let unknown = Uuid::new_v4();
        let err = service
            .handle_answer(unknown, "v=0\r\n".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, SpyError::SessionNotFound(id) if id == unknown));
    }
}
