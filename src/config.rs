//! Runtime configuration, read from the environment.
//!
//! Every option has a usable default; invalid values fall back to the
//! default with a warning rather than aborting startup. Listener binds are
//! validated where the listeners are created.

use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    /// Bind port for the HTTP surface.
    pub http_port: u16,
    /// `host:port` of the engine's UDP control channel.
    pub engine_addr: String,
    /// UDP port range for backend-side ICE.
    pub webrtc_min_port: u16,
    pub webrtc_max_port: u16,
    /// Host-candidate IPs advertised to the engine (NAT 1-to-1 mapping).
    pub webrtc_nat_1to1_ips: Vec<String>,
    /// Bind address for the browser-side ICE mux socket.
    pub webrtc_ice_address: String,
    /// Bind port for the browser-side ICE mux socket; 0 disables the mux.
    pub webrtc_ice_port: u16,
    /// How long a spectator-less source is kept alive; zero keeps it forever.
    pub spy_idle_timeout: Duration,
    /// Directory the operator UI is served from.
    pub static_dir: String,
    /// OTLP endpoint; surfaced in the startup log, export is wired externally.
    pub telemetry_endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8081,
            engine_addr: "127.0.0.1:22222".to_string(),
            webrtc_min_port: 50000,
            webrtc_max_port: 51000,
            webrtc_nat_1to1_ips: Vec::new(),
            webrtc_ice_address: "0.0.0.0".to_string(),
            webrtc_ice_port: 0,
            spy_idle_timeout: Duration::ZERO,
            static_dir: "./static".to_string(),
            telemetry_endpoint: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Config::default();

        if let Some(port) = parse_var(&get, "HTTP_PORT") {
            cfg.http_port = port;
        }
        if let Some(addr) = get("ENGINE_ADDR").filter(|v| !v.is_empty()) {
            cfg.engine_addr = addr;
        }
        if let Some(port) = parse_var(&get, "WEBRTC_MIN_PORT") {
            cfg.webrtc_min_port = port;
        }
        if let Some(port) = parse_var(&get, "WEBRTC_MAX_PORT") {
            cfg.webrtc_max_port = port;
        }
        if cfg.webrtc_min_port > cfg.webrtc_max_port {
            warn!(
                min = cfg.webrtc_min_port,
                max = cfg.webrtc_max_port,
                "ignoring inverted webrtc port range"
            );
            let defaults = Config::default();
            cfg.webrtc_min_port = defaults.webrtc_min_port;
            cfg.webrtc_max_port = defaults.webrtc_max_port;
        }
        if let Some(ips) = get("WEBRTC_NAT_1TO1_IPS").filter(|v| !v.is_empty()) {
            cfg.webrtc_nat_1to1_ips = ips
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(addr) = get("WEBRTC_ICE_ADDRESS").filter(|v| !v.is_empty()) {
            cfg.webrtc_ice_address = addr;
        }
        if let Some(port) = parse_var(&get, "WEBRTC_ICE_PORT") {
            cfg.webrtc_ice_port = port;
        }
        if let Some(secs) = parse_var::<u64>(&get, "SPY_IDLE_TIMEOUT_SECS") {
            cfg.spy_idle_timeout = Duration::from_secs(secs);
        }
        if let Some(dir) = get("STATIC_DIR").filter(|v| !v.is_empty()) {
            cfg.static_dir = dir;
        }
        cfg.telemetry_endpoint = get("OTEL_EXPORTER_OTLP_ENDPOINT").filter(|v| !v.is_empty());

        cfg
    }
}

fn parse_var<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = get(key)?;
    if raw.is_empty() {
        return None;
    }
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(%key, %raw, "ignoring unparsable value, keeping default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = vars.iter().copied().collect();
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn defaults_apply_with_no_environment() {
        let cfg = Config::from_lookup(|_| None);
        assert_eq!(cfg.http_port, 8081);
        assert_eq!(cfg.engine_addr, "127.0.0.1:22222");
        assert_eq!(cfg.webrtc_min_port, 50000);
        assert_eq!(cfg.webrtc_max_port, 51000);
        assert!(cfg.webrtc_nat_1to1_ips.is_empty());
        assert_eq!(cfg.webrtc_ice_port, 0);
        assert_eq!(cfg.spy_idle_timeout, Duration::ZERO);
        assert!(cfg.telemetry_endpoint.is_none());
    }

    #[test]
    fn overrides_are_read() {
        let cfg = Config::from_lookup(lookup(&[
            ("HTTP_PORT", "9090"),
            ("ENGINE_ADDR", "10.0.0.5:2223"),
            ("WEBRTC_NAT_1TO1_IPS", "198.51.100.7, 198.51.100.8"),
            ("WEBRTC_ICE_PORT", "8443"),
            ("SPY_IDLE_TIMEOUT_SECS", "45"),
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://otel:4318"),
        ]));
        assert_eq!(cfg.http_port, 9090);
        assert_eq!(cfg.engine_addr, "10.0.0.5:2223");
        assert_eq!(
            cfg.webrtc_nat_1to1_ips,
            vec!["198.51.100.7".to_string(), "198.51.100.8".to_string()]
        );
        assert_eq!(cfg.webrtc_ice_port, 8443);
        assert_eq!(cfg.spy_idle_timeout, Duration::from_secs(45));
        assert_eq!(cfg.telemetry_endpoint.as_deref(), Some("http://otel:4318"));
    }

    #[test]
    fn unparsable_values_keep_defaults() {
        let cfg = Config::from_lookup(lookup(&[("HTTP_PORT", "not-a-port")]));
        assert_eq!(cfg.http_port, 8081);
    }

    #[test]
    fn inverted_port_range_falls_back() {
        let cfg = Config::from_lookup(lookup(&[
            ("WEBRTC_MIN_PORT", "60000"),
            ("WEBRTC_MAX_PORT", "50000"),
        ]));
        assert_eq!(cfg.webrtc_min_port, 50000);
        assert_eq!(cfg.webrtc_max_port, 51000);
    }
}
