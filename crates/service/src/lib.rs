pub mod ident;
pub mod proto;
mod router;
pub mod session;
pub mod state;

use std::{future::Future, net::IpAddr, sync::Arc};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

use self::{
    ident::Id,
    proto::{IceConfig, OutboundFrame},
    session::Session,
    state::HubState,
};

/// Advisory attached to the hello frame when the configured TURN relay can
/// only ever be reached from the machine the hub runs on.
pub const TURN_LOOPBACK_WARNING: &str =
    "TURN is configured against a loopback address; remote peers will not be able to relay media.";

/// Outcome of one push sink delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushDelivery {
    Delivered,
    /// The gateway reported the subscription permanently dead (404/410); the
    /// hub drops the stored blob.
    Gone,
    /// Transient failure, logged and otherwise ignored.
    Failed,
}

/// What the hub needs from the world around it: ICE configuration for the
/// hello frame and a sink for out-of-band notifications.
///
/// The production implementation derives short-lived TURN credentials and
/// talks to a Web Push gateway; tests use a recording fake.
pub trait HubHandler: Send + Sync + 'static {
    fn ice_config(&self) -> IceConfig;

    /// Whether `pushSubscribe` frames should be stored at all.
    fn push_enabled(&self) -> bool;

    /// Deliver a payload to a previously registered subscription. Never
    /// called while the hub's state lock is held.
    fn push_send(&self, subscription: Value, payload: Value) -> impl Future<Output = PushDelivery> + Send;
}

pub struct HubOptions<T> {
    /// Whether clients reached this hub over TLS.
    pub https: bool,
    /// Configured TURN URLs, used for the hello advisory and voice stats.
    pub turn_urls: Vec<String>,
    /// Size of the relay port range when one is configured.
    pub relay_ports_total: Option<u32>,
    pub handler: T,
}

/// The signaling hub.
///
/// All connection bookkeeping lives in one [`HubState`] behind a single
/// coarse lock, so every mutation of the session, name, room and push tables
/// is observed as if serialized. The lock is never held across I/O; outbound
/// frames go through per-session unbounded queues and push deliveries are
/// flushed after release.
pub struct Hub<T> {
    pub(crate) state: Mutex<HubState>,
    pub(crate) turn_host: Option<String>,
    pub(crate) options: HubOptions<T>,
}

impl<T: HubHandler> Hub<T> {
    pub fn new(options: HubOptions<T>) -> Arc<Self> {
        Arc::new(Self {
            turn_host: options.turn_urls.first().map(|url| turn_host_of(url)),
            state: Mutex::new(HubState::default()),
            options,
        })
    }

    /// Register a freshly accepted duplex channel.
    ///
    /// The session starts anonymous; its hello frame is queued before any
    /// inbound frame can be processed. The returned receiver is the only
    /// handle to the session's outbound queue.
    pub fn accept(&self, client_ip: IpAddr) -> (Id, UnboundedReceiver<OutboundFrame>) {
        let id = Id::generate();
        let (sender, receiver) = unbounded_channel();
        let session = Session::new(id.clone(), sender);

        let mut state = self.state.lock();
        session.send(OutboundFrame::Hello {
            id: id.clone(),
            turn: self.options.handler.ice_config(),
            https: self.options.https,
            client_ip: client_ip.to_string(),
            turn_warning: self.turn_warning(client_ip),
            voice: state.voice_stats(self.turn_host.as_deref(), self.options.relay_ports_total),
        });
        state.attach(session);

        (id, receiver)
    }

    fn turn_warning(&self, client_ip: IpAddr) -> Option<&'static str> {
        let loopback_turn = self.turn_host.as_deref().is_some_and(is_loopback_host);
        (loopback_turn && !client_ip.is_loopback()).then_some(TURN_LOOPBACK_WARNING)
    }
}

/// `host:port` part of a TURN URL, scheme and query stripped.
fn turn_host_of(url: &str) -> String {
    let rest = url
        .strip_prefix("turns:")
        .or_else(|| url.strip_prefix("turn:"))
        .or_else(|| url.strip_prefix("stun:"))
        .unwrap_or(url);

    rest.split_once('?').map_or(rest, |(host, _)| host).to_string()
}

fn is_loopback_host(host_port: &str) -> bool {
    let host = host_port.rsplit_once(':').map_or(host_port, |(host, _)| host);
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host == "localhost" || host == "::1" || host.starts_with("127.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_host_extraction() {
        assert_eq!(turn_host_of("turn:turn.example.org:3478?transport=udp"), "turn.example.org:3478");
        assert_eq!(turn_host_of("turns:turn.example.org:5349"), "turn.example.org:5349");
        assert_eq!(turn_host_of("turn.example.org:3478"), "turn.example.org:3478");
    }

    #[test]
    fn loopback_hosts() {
        assert!(is_loopback_host("127.0.0.1:3478"));
        assert!(is_loopback_host("localhost:3478"));
        assert!(is_loopback_host("[::1]:3478"));
        assert!(!is_loopback_host("turn.example.org:3478"));
        assert!(!is_loopback_host("192.0.2.7:3478"));
    }
}
