//! Credentials Map
//!
//! Maps each parameter path holding a `$secret` to the environment variable
//! the runtime reads it from. Only references are recorded, never values.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::channel::Channel;
use crate::substitution::SECRET_ENV_PREFIX;

pub const CREDENTIALS_MAP_VERSION: &str = "1";

/// Environment variable name for a secret at `path`.
pub fn secret_env_name(path: &str) -> String {
    let sanitized: String = path
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("{}{}", SECRET_ENV_PREFIX, sanitized)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialEntry {
    #[serde(rename = "ref")]
    pub reference: String,
    pub env: String,
}

/// Secret references by parameter path.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialsMap {
    pub version: String,
    pub credentials: BTreeMap<String, CredentialEntry>,
    pub aliases: BTreeMap<String, String>,
}

impl CredentialsMap {
    /// Walk stages in order; the first path using a reference owns its env
    /// var, later paths become aliases of it.
    pub fn from_channel(channel: &Channel) -> Self {
        let mut map = CredentialsMap {
            version: CREDENTIALS_MAP_VERSION.to_string(),
            ..Default::default()
        };
        let mut by_ref: HashMap<String, String> = HashMap::new();
        let mut used_env: HashSet<String> = HashSet::new();

        for stage in &channel.stages {
            let mut found = vec![];
            for (name, value) in &stage.params {
                value.collect_secrets(&format!("{}.{}", stage.id, name), &mut found);
            }
            for (path, secret) in found {
                if let Some(env) = by_ref.get(&secret.reference) {
                    map.aliases.insert(path, env.clone());
                    continue;
                }
                let base = secret_env_name(&path);
                let mut env = base.clone();
                let mut n = 2;
                while !used_env.insert(env.clone()) {
                    env = format!("{}_{}", base, n);
                    n += 1;
                }
                by_ref.insert(secret.reference.clone(), env.clone());
                map.credentials.insert(
                    path,
                    CredentialEntry {
                        reference: secret.reference.clone(),
                        env,
                    },
                );
            }
        }
        map
    }

    /// Secret reference → environment variable.
    pub fn env_by_ref(&self) -> BTreeMap<String, String> {
        self.credentials
            .values()
            .map(|c| (c.reference.clone(), c.env.clone()))
            .collect()
    }

    pub fn env_vars(&self) -> Vec<&str> {
        self.credentials.values().map(|c| c.env.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn channel(v: serde_json::Value) -> Channel {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_secret_env_name() {
        assert_eq!(secret_env_name("fetch.token"), "GJ_SECRET_FETCH_TOKEN");
        assert_eq!(secret_env_name("db-1.auth.pass"), "GJ_SECRET_DB_1_AUTH_PASS");
    }

    #[test]
    fn test_secret_env_collisions_disambiguated() {
        let c = channel(json!({
            "channelId": "c",
            "stages": [
                {"id": "a-b", "nexonId": "x", "params": {"k": {"$secret": "one"}}},
                {"id": "a_b", "nexonId": "x", "params": {"k": {"$secret": "two"}}}
            ]
        }));
        let map = CredentialsMap::from_channel(&c);
        assert_eq!(map.credentials["a-b.k"].env, "GJ_SECRET_A_B_K");
        assert_eq!(map.credentials["a_b.k"].env, "GJ_SECRET_A_B_K_2");
    }

    #[test]
    fn test_repeated_reference_becomes_alias() {
        let c = channel(json!({
            "channelId": "c",
            "stages": [
                {"id": "a", "nexonId": "x", "params": {"pw": {"$secret": "vault://db"}}},
                {"id": "b", "nexonId": "x", "params": {"auth": {"inner": {"$secret": "vault://db"}}}}
            ]
        }));
        let map = CredentialsMap::from_channel(&c);
        assert_eq!(map.credentials.len(), 1);
        assert_eq!(map.credentials["a.pw"].env, "GJ_SECRET_A_PW");
        assert_eq!(map.aliases["b.auth.inner"], "GJ_SECRET_A_PW");
        assert_eq!(map.env_vars(), vec!["GJ_SECRET_A_PW"]);
        assert_eq!(map.env_by_ref()["vault://db"], "GJ_SECRET_A_PW");
    }
}
