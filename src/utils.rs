use rand::Rng;

use crate::config::{IceServerKind, ServerConfig};

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Prefix an ICE server URL with `stun:`/`turn:` when it has no scheme yet.
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    let has_scheme = ["stun:", "stuns:", "turn:", "turns:"]
        .iter()
        .any(|scheme| config.url.starts_with(scheme));
    if has_scheme {
        return config.url.clone();
    }
    let scheme = match config.kind {
        IceServerKind::Turn => "turn:",
        IceServerKind::Stun => "stun:",
    };
    format!("{}{}", scheme, config.url)
}
