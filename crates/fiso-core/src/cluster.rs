use serde::{Deserialize, Serialize};

use crate::error::{FisoError, FisoResult};

/// A named message-log cluster (brokers + auth + TLS). `PublisherPool` keys
/// producers by `name`; inline (unnamed) configs are keyed by their sorted
/// broker list instead (see `fiso-publisher-pool`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub brokers: Vec<String>,
    #[serde(default)]
    pub auth: Option<SaslAuth>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl ClusterConfig {
    pub fn validate(&self) -> FisoResult<()> {
        if self.brokers.is_empty() {
            return Err(FisoError::Config(
                "cluster config must list at least one broker".into(),
            ));
        }
        if let Some(auth) = &self.auth {
            auth.validate()?;
        }
        if let Some(tls) = &self.tls {
            tls.validate()?;
        }
        Ok(())
    }

    /// The key used for this cluster in the publisher pool when it isn't
    /// registered under a name: the sorted, joined broker list.
    pub fn inline_key(&self) -> String {
        let mut brokers = self.brokers.clone();
        brokers.sort();
        brokers.join(",")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mechanism", rename_all = "SCREAMING-KEBAB-CASE")]
pub enum AuthMechanism {
    Plain { username: String, password: String },
    #[serde(rename = "SCRAM-256")]
    Scram256 { username: String, password: String },
    #[serde(rename = "SCRAM-512")]
    Scram512 { username: String, password: String },
    Oauthbearer {
        provider: String,
        tenant_id: Option<String>,
        client_id: String,
        client_secret_env: String,
        scope: Option<String>,
        #[serde(default)]
        extensions: Vec<(String, String)>,
    },
}

/// Back-compat alias: some configs model auth as a flat struct instead of
/// the tagged enum above; kept for the cluster-config invariants below.
pub type SaslAuth = AuthMechanism;

impl AuthMechanism {
    fn validate(&self) -> FisoResult<()> {
        match self {
            AuthMechanism::Plain { username, password }
            | AuthMechanism::Scram256 { username, password }
            | AuthMechanism::Scram512 { username, password } => {
                if username.is_empty() || password.is_empty() {
                    return Err(FisoError::Config(
                        "username and password are required for this SASL mechanism".into(),
                    ));
                }
                Ok(())
            }
            AuthMechanism::Oauthbearer {
                client_id,
                client_secret_env,
                ..
            } => {
                if client_id.is_empty() || client_secret_env.is_empty() {
                    return Err(FisoError::Config(
                        "client_id and client_secret_env are required for OAUTHBEARER".into(),
                    ));
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub ca_file: Option<String>,
    #[serde(default)]
    pub cert_file: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
    #[serde(default)]
    pub skip_verify: bool,
}

impl TlsConfig {
    fn validate(&self) -> FisoResult<()> {
        if self.cert_file.is_some() != self.key_file.is_some() {
            return Err(FisoError::Config(
                "cert_file and key_file must both be present or both absent".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_at_least_one_broker() {
        let cfg = ClusterConfig {
            brokers: vec![],
            auth: None,
            tls: None,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_mismatched_cert_and_key() {
        let cfg = ClusterConfig {
            brokers: vec!["broker:9092".into()],
            auth: None,
            tls: Some(TlsConfig {
                enabled: true,
                ca_file: None,
                cert_file: Some("cert.pem".into()),
                key_file: None,
                skip_verify: false,
            }),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn inline_key_is_sorted_broker_list() {
        let cfg = ClusterConfig {
            brokers: vec!["b:9092".into(), "a:9092".into()],
            auth: None,
            tls: None,
        };
        assert_eq!(cfg.inline_key(), "a:9092,b:9092");
    }
}
