use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::storage::KeyValueStore;

const KEY_RELAY_URLS: &str = "turn.urls";
const KEY_RELAY_USERNAME: &str = "turn.username";
const KEY_RELAY_CREDENTIAL: &str = "turn.credential";

/// TURN-equivalent fallback routing credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCredentials {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl RelayCredentials {
    /// Parses a comma-separated url list as supplied on the command line.
    pub fn parse(urls: &str, username: Option<&str>, credential: Option<&str>) -> Option<Self> {
        let urls: Vec<String> = urls
            .split(',')
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect();
        if urls.is_empty() {
            return None;
        }
        Some(Self {
            urls,
            username: username.map(str::to_string).filter(|s| !s.is_empty()),
            credential: credential.map(str::to_string).filter(|s| !s.is_empty()),
        })
    }
}

/// ICE configuration for new peer connections: a default STUN server plus
/// the optional relay fallback set.
#[derive(Debug, Clone, Default)]
pub struct IceSettings {
    relay: Option<RelayCredentials>,
}

impl IceSettings {
    /// Launch-supplied credentials win and are persisted for later runs;
    /// otherwise a previously persisted set is loaded.
    pub fn resolve(launch: Option<RelayCredentials>, store: &dyn KeyValueStore) -> Self {
        match launch {
            Some(relay) => {
                persist(&relay, store);
                Self { relay: Some(relay) }
            }
            None => Self {
                relay: load(store),
            },
        }
    }

    pub fn with_relay(relay: Option<RelayCredentials>) -> Self {
        Self { relay }
    }

    pub fn has_relay_fallback(&self) -> bool {
        self.relay.is_some()
    }

    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers = vec![RTCIceServer {
            urls: vec!["stun:stun.l.google.com:19302".to_string()],
            ..Default::default()
        }];
        if let Some(relay) = &self.relay {
            servers.push(RTCIceServer {
                urls: relay.urls.clone(),
                username: relay.username.clone().unwrap_or_default(),
                credential: relay.credential.clone().unwrap_or_default(),
                ..Default::default()
            });
        }
        servers
    }
}

fn persist(relay: &RelayCredentials, store: &dyn KeyValueStore) {
    let result = store
        .set(KEY_RELAY_URLS, &relay.urls.join(","))
        .and_then(|_| match &relay.username {
            Some(username) => store.set(KEY_RELAY_USERNAME, username),
            None => store.remove(KEY_RELAY_USERNAME),
        })
        .and_then(|_| match &relay.credential {
            Some(credential) => store.set(KEY_RELAY_CREDENTIAL, credential),
            None => store.remove(KEY_RELAY_CREDENTIAL),
        });
    if let Err(err) = result {
        tracing::warn!(target = "webrtc", error = %err, "failed to persist relay credentials");
    }
}

fn load(store: &dyn KeyValueStore) -> Option<RelayCredentials> {
    let urls = store.get(KEY_RELAY_URLS)?;
    RelayCredentials::parse(
        &urls,
        store.get(KEY_RELAY_USERNAME).as_deref(),
        store.get(KEY_RELAY_CREDENTIAL).as_deref(),
    )
}
