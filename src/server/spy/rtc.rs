//! WebRTC API construction for the two sides of the bridge.
//!
//! The engine-facing side and the browser-facing side need different ICE
//! policies, so each gets its own `API` instance: the backend side speaks
//! plain UDP to a trusted network with a bounded port range and optional
//! NAT 1-to-1 host candidates, while the browser side can be pinned to a
//! single pre-bound UDP socket shared by every spectator connection.

use tokio::net::UdpSocket;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::network_type::NetworkType;
use webrtc::ice::udp_mux::{UDPMuxDefault, UDPMuxParams};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::interceptor::registry::Registry;

use crate::config::Config;

/// API instance for peer connections towards the engine.
pub(crate) fn backend_api(cfg: &Config) -> Result<API, webrtc::Error> {
    let mut settings = SettingEngine::default();
    if !cfg.webrtc_nat_1to1_ips.is_empty() {
        settings.set_nat_1to1_ips(cfg.webrtc_nat_1to1_ips.clone(), RTCIceCandidateType::Host);
    }
    let ephemeral = EphemeralUDP::new(cfg.webrtc_min_port, cfg.webrtc_max_port)
        .map_err(|e| webrtc::Error::new(format!("invalid webrtc port range: {e}")))?;
    settings.set_udp_network(UDPNetwork::Ephemeral(ephemeral));

    build(settings)
}

/// API instance for peer connections towards spectator browsers.
///
/// With a pre-bound socket, every spectator connection is multiplexed over
/// that one port and candidates are restricted to IPv4 UDP.
pub(crate) fn browser_api(ice_socket: Option<UdpSocket>) -> Result<API, webrtc::Error> {
    let mut settings = SettingEngine::default();
    if let Some(socket) = ice_socket {
        let mux = UDPMuxDefault::new(UDPMuxParams::new(socket));
        settings.set_udp_network(UDPNetwork::Muxed(mux));
        settings.set_network_types(vec![NetworkType::Udp4]);
    }

    build(settings)
}

fn build(settings: SettingEngine) -> Result<API, webrtc::Error> {
    let mut media = MediaEngine::default();
    media.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media)?;

    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .with_setting_engine(settings)
        .build())
}

/// The engine refuses an answer that rejects the media section, but a local
/// answer gathered before any candidate pair exists carries port 0. Rewrite
/// the audio section to the discard port; everything else stays untouched.
pub(crate) fn rewrite_rejected_audio(sdp: &str) -> String {
    if !sdp.contains("m=audio 0 ") {
        return sdp.to_string();
    }
    sdp.replace("m=audio 0 ", "m=audio 9 ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_rejected_audio_sections() {
        let sdp = "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\nm=audio 0 UDP/TLS/RTP/SAVPF 0\r\na=mid:0\r\n";
        let rewritten = rewrite_rejected_audio(sdp);
        assert!(rewritten.contains("m=audio 9 UDP/TLS/RTP/SAVPF 0"));
        assert_eq!(
            rewritten.replace("m=audio 9 ", "m=audio 0 "),
            sdp,
            "only the audio port may change"
        );
    }

    #[test]
    fn leaves_live_ports_alone() {
        let sdp = "m=audio 9000 UDP/TLS/RTP/SAVPF 0\r\n";
        assert_eq!(rewrite_rejected_audio(sdp), sdp);
    }

    #[tokio::test]
    async fn backend_api_builds_with_defaults() {
        let cfg = Config::default();
        assert!(backend_api(&cfg).is_ok());
    }

    #[tokio::test]
    async fn browser_api_builds_with_a_mux_socket() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        assert!(browser_api(Some(socket)).is_ok());
    }
}
