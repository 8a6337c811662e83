//! UDP control client for the media engine.
//!
//! One datagram per request: an ASCII cookie, a space, and a bencoded
//! dictionary. The engine echoes the frame shape back. Requests are
//! serialised behind a mutex, so cookie correlation is unnecessary: the
//! next datagram on the socket is the reply to the request in flight.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::bencode::{self, Dict, Value};

/// Per-request read deadline on the control socket.
const READ_DEADLINE: Duration = Duration::from_secs(2);

/// One datagram; the engine never sends more.
const RECV_BUFFER_SIZE: usize = 65535;

/// Control-channel failure taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Socket-level failure, including an expired read deadline.
    #[error("engine transport error: {0}")]
    Transport(String),

    /// The reply arrived but is not a well-formed control frame.
    #[error("malformed engine response: {0}")]
    Protocol(String),

    /// The engine processed the request and rejected it; carries the
    /// engine's own reason text.
    #[error("engine rejected request: {0}")]
    Rejected(String),
}

/// Result of a `subscribe request`: the engine's SDP offer for the leg and
/// the subscription tag needed to unsubscribe later.
#[derive(Debug, Clone)]
pub struct SubscribeReply {
    pub sdp: String,
    pub to_tag: String,
}

/// Control operations the monitor issues against the engine.
///
/// The spy service and the HTTP surface hold this as a trait object so tests
/// can substitute a scripted engine.
#[async_trait]
pub trait Client: Send + Sync {
    async fn list_calls(&self) -> Result<Vec<String>, EngineError>;
    async fn query_call(&self, call_id: &str) -> Result<Value, EngineError>;
    async fn subscribe(&self, call_id: &str, from_tag: &str) -> Result<SubscribeReply, EngineError>;
    async fn subscribe_answer(
        &self,
        call_id: &str,
        sdp: &str,
        to_tag: &str,
    ) -> Result<(), EngineError>;
    async fn unsubscribe(&self, call_id: &str, to_tag: &str) -> Result<(), EngineError>;
    async fn statistics(&self) -> Result<Value, EngineError>;
}

/// Trait-object implementation over a single connected UDP socket.
///
/// The socket closes when the client is dropped.
pub struct UdpClient {
    socket: UdpSocket,
    /// Serialises requests: one in flight at a time.
    lock: Mutex<()>,
    read_deadline: Duration,
}

impl UdpClient {
    /// Bind an ephemeral local port and connect it to the engine's control
    /// address (`host:port`).
    pub async fn new(engine_addr: &str) -> Result<Self, EngineError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| EngineError::Transport(format!("bind control socket: {e}")))?;
        socket
            .connect(engine_addr)
            .await
            .map_err(|e| EngineError::Transport(format!("resolve engine address: {e}")))?;
        Ok(Self {
            socket,
            lock: Mutex::new(()),
            read_deadline: READ_DEADLINE,
        })
    }

    #[cfg(test)]
    fn with_read_deadline(mut self, deadline: Duration) -> Self {
        self.read_deadline = deadline;
        self
    }

    fn cookie() -> String {
        format!("{:016x}", rand::random::<u64>())
    }

    async fn send_command(&self, command: &str, mut args: Dict) -> Result<Dict, EngineError> {
        args.insert("command".to_string(), Value::from(command));

        let cookie = Self::cookie();
        let mut frame = Vec::with_capacity(256);
        frame.extend_from_slice(cookie.as_bytes());
        frame.push(b' ');
        bencode::encode_into(&mut frame, &Value::Dict(args));

        let _in_flight = self.lock.lock().await;

        self.socket
            .send(&frame)
            .await
            .map_err(|e| EngineError::Transport(format!("send {command}: {e}")))?;

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let n = timeout(self.read_deadline, self.socket.recv(&mut buf))
            .await
            .map_err(|_| EngineError::Transport(format!("{command}: read deadline exceeded")))?
            .map_err(|e| EngineError::Transport(format!("recv {command}: {e}")))?;

        parse_response(&buf[..n])
    }
}

/// Split the cookie off a response frame, decode the body, and surface a
/// structured engine rejection when `result` is `"error"`.
fn parse_response(frame: &[u8]) -> Result<Dict, EngineError> {
    let space = frame
        .iter()
        .position(|&b| b == b' ')
        .ok_or_else(|| EngineError::Protocol("missing cookie separator".to_string()))?;

    let body = bencode::decode(&frame[space + 1..])
        .map_err(|e| EngineError::Protocol(e.to_string()))?;
    let dict = body
        .into_dict()
        .ok_or_else(|| EngineError::Protocol("response is not a dictionary".to_string()))?;

    if dict.get("result").and_then(Value::as_str) == Some("error") {
        let reason = dict
            .get("error-reason")
            .and_then(Value::as_str)
            .unwrap_or("unknown reason");
        return Err(EngineError::Rejected(reason.to_string()));
    }

    Ok(dict)
}

fn required_str(dict: &Dict, key: &str) -> Result<String, EngineError> {
    dict.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| EngineError::Protocol(format!("missing field {key:?}")))
}

#[async_trait]
impl Client for UdpClient {
    async fn list_calls(&self) -> Result<Vec<String>, EngineError> {
        let resp = self.send_command("list", Dict::new()).await?;
        let calls = match resp.get("calls").and_then(Value::as_list) {
            Some(list) => list
                .iter()
                .filter_map(|v| match v {
                    Value::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
                    _ => None,
                })
                .collect(),
            None => Vec::new(),
        };
        Ok(calls)
    }

    async fn query_call(&self, call_id: &str) -> Result<Value, EngineError> {
        let mut args = Dict::new();
        args.insert("call-id".to_string(), Value::from(call_id));
        let resp = self.send_command("query", args).await?;
        Ok(Value::Dict(resp))
    }

    async fn subscribe(&self, call_id: &str, from_tag: &str) -> Result<SubscribeReply, EngineError> {
        let mut args = Dict::new();
        args.insert("call-id".to_string(), Value::from(call_id));
        args.insert("from-tag".to_string(), Value::from(from_tag));
        args.insert(
            "flags".to_string(),
            Value::List(vec![
                Value::from("trust-address"),
                Value::from("generate-mid"),
                Value::from("SDES-off"),
                Value::from("no-rtcp-attribute"),
                Value::from("trickle-ICE"),
            ]),
        );
        args.insert(
            "rtcp-mux".to_string(),
            Value::List(vec![Value::from("offer"), Value::from("require")]),
        );
        args.insert(
            "transport-protocol".to_string(),
            Value::from("UDP/TLS/RTP/SAVPF"),
        );
        args.insert("ICE".to_string(), Value::from("force"));
        let mut codec = Dict::new();
        codec.insert("strip".to_string(), Value::from("all"));
        codec.insert("transcode".to_string(), Value::from("PCMU"));
        args.insert("codec".to_string(), Value::Dict(codec));

        let resp = self.send_command("subscribe request", args).await?;
        Ok(SubscribeReply {
            sdp: required_str(&resp, "sdp")?,
            to_tag: required_str(&resp, "to-tag")?,
        })
    }

    async fn subscribe_answer(
        &self,
        call_id: &str,
        sdp: &str,
        to_tag: &str,
    ) -> Result<(), EngineError> {
        let mut args = Dict::new();
        args.insert("call-id".to_string(), Value::from(call_id));
        args.insert("sdp".to_string(), Value::from(sdp));
        args.insert("to-tag".to_string(), Value::from(to_tag));
        self.send_command("subscribe answer", args).await?;
        Ok(())
    }

    async fn unsubscribe(&self, call_id: &str, to_tag: &str) -> Result<(), EngineError> {
        let mut args = Dict::new();
        args.insert("call-id".to_string(), Value::from(call_id));
        args.insert("from-tag".to_string(), Value::from(to_tag));
        args.insert("to-tag".to_string(), Value::from(to_tag));
        self.send_command("unsubscribe", args).await?;
        Ok(())
    }

    async fn statistics(&self) -> Result<Value, EngineError> {
        let mut resp = self.send_command("statistics", Dict::new()).await?;
        Ok(resp
            .remove("statistics")
            .unwrap_or_else(|| Value::Dict(resp)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal scripted engine: replies to each datagram with a fixed frame.
    async fn scripted_engine(replies: Vec<Vec<u8>>) -> String {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            for reply in replies {
                let (_, peer) = socket.recv_from(&mut buf).await.unwrap();
                socket.send_to(&reply, peer).await.unwrap();
            }
        });
        addr
    }

    fn framed(body: &[u8]) -> Vec<u8> {
        let mut frame = b"00aabbccddeeff11 ".to_vec();
        frame.extend_from_slice(body);
        frame
    }

    #[tokio::test]
    async fn surfaces_engine_rejection_with_reason() {
        let addr =
            scripted_engine(vec![framed(b"d12:error-reason12:no such call6:result5:errore")])
                .await;
        let client = UdpClient::new(&addr).await.unwrap();
        let err = client.query_call("missing").await.unwrap_err();
        match err {
            EngineError::Rejected(reason) => assert_eq!(reason, "no such call"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_separator_is_a_protocol_error() {
        let addr = scripted_engine(vec![b"abc".to_vec()]).await;
        let client = UdpClient::new(&addr).await.unwrap();
        let err = client.statistics().await.unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn non_dictionary_body_is_a_protocol_error() {
        let addr = scripted_engine(vec![framed(b"l2:oke")]).await;
        let client = UdpClient::new(&addr).await.unwrap();
        let err = client.statistics().await.unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn silence_is_a_transport_error() {
        // An engine that never answers; deadline shortened to keep the test fast.
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap().to_string();
        let client = UdpClient::new(&addr)
            .await
            .unwrap()
            .with_read_deadline(Duration::from_millis(50));
        let err = client.statistics().await.unwrap_err();
        assert!(matches!(err, EngineError::Transport(_)), "got {err:?}");
        drop(socket);
    }

    #[tokio::test]
    async fn list_calls_reads_the_calls_sequence() {
        let addr =
            scripted_engine(vec![framed(b"d5:callsl6:call-a6:call-be6:result2:oke")]).await;
        let client = UdpClient::new(&addr).await.unwrap();
        assert_eq!(client.list_calls().await.unwrap(), vec!["call-a", "call-b"]);
    }

    #[tokio::test]
    async fn list_calls_tolerates_a_missing_sequence() {
        let addr = scripted_engine(vec![framed(b"d6:result2:oke")]).await;
        let client = UdpClient::new(&addr).await.unwrap();
        assert!(client.list_calls().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscribe_requires_sdp_and_subscription_tag() {
        let addr = scripted_engine(vec![framed(b"d6:result2:ok6:to-tag4:sub1e")]).await;
        let client = UdpClient::new(&addr).await.unwrap();
        let err = client.subscribe("call-a", "tag-a").await.unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn subscribe_extracts_sdp_and_subscription_tag() {
        let addr = scripted_engine(vec![framed(
            b"d6:result2:ok3:sdp4:v=0\r6:to-tag4:sub1e",
        )])
        .await;
        let client = UdpClient::new(&addr).await.unwrap();
        let reply = client.subscribe("call-a", "tag-a").await.unwrap();
        assert_eq!(reply.sdp, "v=0\r");
        assert_eq!(reply.to_tag, "sub1");
    }

    #[test]
    fn cookies_are_sixteen_hex_chars() {
        let cookie = UdpClient::cookie();
        assert_eq!(cookie.len(), 16);
        assert!(cookie.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
