pub mod api;
pub mod config;
pub mod observer;
pub mod turn;

use std::sync::Arc;

use service::{Hub, HubOptions};

use self::{config::Config, observer::Observer};

#[rustfmt::skip]
static SOFTWARE: &str = concat!(
    "voice-hub.",
    env!("CARGO_PKG_VERSION")
);

/// In order to let integration tests use the crate directly and start the
/// hub, a function is opened to replace the main function to directly start
/// the server.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    let hub = Hub::new(HubOptions {
        https: config.tls.enabled(),
        turn_urls: config.turn.urls.clone(),
        relay_ports_total: config.turn.relay_ports_total(),
        handler: Observer::new(config.clone())?,
    });

    if config.log.startup {
        log::info!("{SOFTWARE} starting: listen={}:{}", config.net.host, config.port());
        log::info!(
            "turn: urls={:?}, secret={}, relay-ports={:?}",
            config.turn.urls,
            config.turn.secret.is_some(),
            config.turn.relay_ports_total()
        );
        log::info!("push: enabled={}", config.push.enabled());
        log::info!("tls: enabled={}", config.tls.enabled());
    }

    api::start_server(config, hub).await
}
