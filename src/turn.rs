use std::time::{SystemTime, UNIX_EPOCH};

use aws_lc_rs::hmac;
use base64::{Engine, prelude::BASE64_STANDARD};
use service::proto::{IceConfig, IceServer};

use crate::config::Turn;

/// Public STUN server handed to every client alongside any TURN entry, so
/// that srflx candidates work even on a hub with no relay configured.
pub const PUBLIC_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Assemble the ICE configuration for a client.
///
/// When a TURN secret is configured, the TURN entry carries ephemeral
/// credentials following the TURN REST convention: the username is the unix
/// expiry timestamp and the credential signs it with the shared secret.
///
/// Because that convention does not mandate a username format beyond the
/// suggested timestamp, the relay accepts whatever validates against the
/// same secret; the expiry is enforced by the relay, not the hub.
///
/// https://datatracker.ietf.org/doc/html/draft-uberti-behave-turn-rest-00#section-2.2
pub fn ice_config(turn: &Turn) -> IceConfig {
    let mut ice_servers = vec![IceServer {
        urls: vec![PUBLIC_STUN_URL.to_string()],
        username: None,
        credential: None,
    }];

    if let Some(secret) = &turn.secret
        && !turn.urls.is_empty()
    {
        let username = expiry_timestamp(turn.username_ttl_seconds).to_string();
        let credential = BASE64_STANDARD.encode(hmac_sha1(secret.as_bytes(), username.as_bytes()));

        ice_servers.push(IceServer {
            urls: turn.urls.clone(),
            username: Some(username),
            credential: Some(credential),
        });
    }

    IceConfig { ice_servers }
}

fn expiry_timestamp(ttl_seconds: u64) -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
        + ttl_seconds
}

/// HMAC SHA1 digest, as required by the TURN REST credential convention.
fn hmac_sha1(key: &[u8], message: &[u8]) -> [u8; 20] {
    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key);
    let signature = hmac::sign(&key, message);

    let mut digest = [0u8; 20];
    digest.copy_from_slice(signature.as_ref());
    digest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stun_only_without_secret() {
        let config = ice_config(&Turn::default());
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls, vec![PUBLIC_STUN_URL.to_string()]);
        assert!(config.ice_servers[0].username.is_none());
    }

    #[test]
    fn turn_entry_carries_rest_credentials() {
        let turn = Turn {
            urls: vec!["turn:turn.example.org:3478?transport=udp".to_string()],
            secret: Some("north-of-the-wall".to_string()),
            ..Turn::default()
        };

        let config = ice_config(&turn);
        assert_eq!(config.ice_servers.len(), 2);

        let entry = &config.ice_servers[1];
        assert_eq!(entry.urls, turn.urls);

        let username: u64 = entry.username.as_deref().unwrap().parse().unwrap();
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        assert!(username >= now + 3590 && username <= now + 3610);

        // An HMAC-SHA1 digest is 20 bytes before encoding.
        let raw = BASE64_STANDARD.decode(entry.credential.as_deref().unwrap()).unwrap();
        assert_eq!(raw.len(), 20);
    }

    #[test]
    fn signing_is_deterministic_per_username() {
        let one = hmac_sha1(b"secret", b"1700000000");
        let two = hmac_sha1(b"secret", b"1700000000");
        let other = hmac_sha1(b"secret", b"1700000060");
        assert_eq!(one, two);
        assert_ne!(one, other);
    }
}
