//! Durable per-server state, persisted as a cluster secret.
//!
//! Everything a restarted controller needs to reproduce a server (ports,
//! password, admin key, map, registry token) lives in one Opaque secret
//! named `<release>-settings`, so the in-memory picture can always be
//! rebuilt from cluster state alone.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use thiserror::Error;

use crate::ports::Assignment;

const KEY_PASSWORD: &str = "password";
const KEY_RCON: &str = "rcon";
const KEY_GAME_PORT: &str = "game_port";
const KEY_SOURCETV_PORT: &str = "sourcetv_port";
const KEY_CLIENT_PORT: &str = "client_port";
const KEY_STEAM_PORT: &str = "steam_port";
const KEY_MAP: &str = "map";
const KEY_TOKEN: &str = "token";

/// State-secret errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// Secret exists but a required port key is absent.
    #[error("secret missing {0}")]
    MissingField(&'static str),

    /// Secret exists but a port value is not a decimal integer.
    #[error("secret field {key} is not a valid port: {value:?}")]
    MalformedPort { key: &'static str, value: String },

    #[error("cluster error: {0}")]
    Kube(#[from] kube::Error),
}

/// The durable parameters of one running server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerState {
    pub release_name: String,
    pub ports: Assignment,
    pub password: String,
    pub rcon: String,
    pub map: String,
    pub token: String,
}

/// The stable identifier all of a round's cluster objects hang off.
pub fn release_name(match_id: i32, round_id: i32) -> String {
    format!("udl-{match_id}-r{round_id}")
}

/// The name of the state secret for a release.
pub fn settings_secret_name(release_name: &str) -> String {
    format!("{release_name}-settings")
}

/// Returns the first candidate that is non-empty after trimming.
///
/// The chain order is load-bearing: callers pass the preferred source first
/// and the configured default last.
pub fn prefer_value(candidates: &[&str]) -> String {
    candidates
        .iter()
        .map(|candidate| candidate.trim())
        .find(|candidate| !candidate.is_empty())
        .unwrap_or("")
        .to_string()
}

/// Adapter over the cluster's secret objects for [`ServerState`].
#[derive(Clone)]
pub struct StateStore {
    secrets: Api<Secret>,
    namespace: String,
    default_map: String,
}

impl StateStore {
    pub fn new(client: Client, namespace: &str, default_map: &str) -> Self {
        Self {
            secrets: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            default_map: default_map.to_string(),
        }
    }

    /// Loads the state secret for a release. Absence maps to `Ok(None)`;
    /// an undecodable secret surfaces as an error.
    pub async fn load(&self, release_name: &str) -> Result<Option<ServerState>, StateError> {
        let Some(secret) = self.secrets.get_opt(&settings_secret_name(release_name)).await? else {
            return Ok(None);
        };
        decode_state(release_name, &secret).map(Some)
    }

    /// Creates or updates the state secret, carrying the observed
    /// resource-version on update so a concurrent writer loses loudly.
    pub async fn persist(
        &self,
        match_id: i32,
        round_id: i32,
        state: &ServerState,
    ) -> Result<(), StateError> {
        let secret_name = settings_secret_name(&state.release_name);
        let mut desired = Secret {
            metadata: ObjectMeta {
                name: Some(secret_name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([
                    (
                        "app.kubernetes.io/instance".to_string(),
                        state.release_name.clone(),
                    ),
                    ("udl.tf/match-id".to_string(), match_id.to_string()),
                    ("udl.tf/round-id".to_string(), round_id.to_string()),
                ])),
                ..Default::default()
            },
            data: Some(encode_data(state, &self.default_map)),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };

        match self.secrets.get_opt(&secret_name).await? {
            None => {
                self.secrets
                    .create(&PostParams::default(), &desired)
                    .await?;
            }
            Some(existing) => {
                desired.metadata.resource_version = existing.metadata.resource_version;
                self.secrets
                    .replace(&secret_name, &PostParams::default(), &desired)
                    .await?;
            }
        }
        Ok(())
    }

    /// Deletes the state secret. Absence is not an error.
    pub async fn delete(&self, release_name: &str) -> Result<(), StateError> {
        match self
            .secrets
            .delete(&settings_secret_name(release_name), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// True when a cluster error is a plain 404.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

fn encode_data(state: &ServerState, default_map: &str) -> BTreeMap<String, ByteString> {
    let mut data = BTreeMap::new();
    let mut put = |key: &str, value: String| {
        data.insert(key.to_string(), ByteString(value.into_bytes()));
    };
    put(KEY_PASSWORD, state.password.clone());
    put(KEY_RCON, state.rcon.clone());
    put(KEY_GAME_PORT, state.ports.game.to_string());
    put(KEY_SOURCETV_PORT, state.ports.sourcetv.to_string());
    put(KEY_CLIENT_PORT, state.ports.client.to_string());
    put(KEY_STEAM_PORT, state.ports.steam.to_string());
    put(KEY_TOKEN, state.token.clone());

    let map = prefer_value(&[&state.map, default_map]);
    if !map.is_empty() {
        put(KEY_MAP, map);
    }
    data
}

fn decode_state(release_name: &str, secret: &Secret) -> Result<ServerState, StateError> {
    let empty = BTreeMap::new();
    let data = secret.data.as_ref().unwrap_or(&empty);

    let text = |key: &str| -> String {
        data.get(key)
            .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned())
            .unwrap_or_default()
    };

    let port = |key: &'static str| -> Result<u16, StateError> {
        let raw = text(key);
        if raw.is_empty() {
            return Err(StateError::MissingField(key));
        }
        raw.parse()
            .map_err(|_| StateError::MalformedPort { key, value: raw })
    };

    Ok(ServerState {
        release_name: release_name.to_string(),
        ports: Assignment {
            game: port(KEY_GAME_PORT)?,
            sourcetv: port(KEY_SOURCETV_PORT)?,
            client: port(KEY_CLIENT_PORT)?,
            steam: port(KEY_STEAM_PORT)?,
        },
        password: text(KEY_PASSWORD),
        rcon: text(KEY_RCON),
        map: text(KEY_MAP),
        token: text(KEY_TOKEN),
    })
}
