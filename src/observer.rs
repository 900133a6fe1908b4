use std::{future::Future, sync::Arc, time::Duration};

use serde_json::Value;
use service::{HubHandler, PushDelivery, proto::IceConfig};

use crate::config::Config;

/// Bridges the hub to its external collaborators: TURN credential derivation
/// for hello frames and payload delivery to the Web Push gateway.
#[derive(Clone)]
pub struct Observer {
    config: Arc<Config>,
    client: reqwest::Client,
}

impl Observer {
    pub fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(Duration::from_secs(5)).build()?,
            config,
        })
    }
}

impl HubHandler for Observer {
    fn ice_config(&self) -> IceConfig {
        crate::turn::ice_config(&self.config.turn)
    }

    fn push_enabled(&self) -> bool {
        self.config.push.enabled()
    }

    /// Forward a payload to the gateway endpoint named by the stored
    /// subscription blob. Payload encryption and VAPID authorization are the
    /// gateway path's concern; the hub only decides whether the subscription
    /// stays registered.
    fn push_send(&self, subscription: Value, payload: Value) -> impl Future<Output = PushDelivery> + Send {
        let client = self.client.clone();

        async move {
            let Some(endpoint) = subscription.get("endpoint").and_then(Value::as_str) else {
                // A blob without an endpoint can never be delivered to.
                return PushDelivery::Gone;
            };

            match client.post(endpoint).header("TTL", "60").json(&payload).send().await {
                Ok(response) if matches!(response.status().as_u16(), 404 | 410) => PushDelivery::Gone,
                Ok(response) if response.status().is_success() => PushDelivery::Delivered,
                Ok(response) => {
                    log::warn!("push gateway status: {}", response.status());
                    PushDelivery::Failed
                }
                Err(err) => {
                    log::warn!("push gateway request failed: {err}");
                    PushDelivery::Failed
                }
            }
        }
    }
}
