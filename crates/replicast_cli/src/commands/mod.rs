//! CLI command implementations.

pub mod run;
pub mod token;

use replicast_engine::{
    EngineResult, HttpAuthenticator, IndexConfig, LoginCredentials, ReplicaConfig, ReqwestClient,
};
use std::time::Duration;

/// Service endpoint and account settings shared by every command.
#[derive(Debug, Clone)]
pub struct ServiceArgs {
    /// Service base URL.
    pub base_url: String,
    /// Websocket URL override.
    pub socket_url: Option<String>,
    /// Organization id.
    pub organization: Option<String>,
    /// Entity types to mirror, in subscription order.
    pub channels: Vec<String>,
    /// Login user name.
    pub user: Option<String>,
    /// Login password.
    pub password: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl ServiceArgs {
    /// Returns login credentials, or an error naming what is missing.
    pub fn credentials(&self) -> Result<LoginCredentials, String> {
        let user = self
            .user
            .as_deref()
            .ok_or("user name required (--user or REPLICAST_USER)")?;
        let password = self
            .password
            .as_deref()
            .ok_or("password required (--password or REPLICAST_PASSWORD)")?;
        Ok(LoginCredentials::new(user, password))
    }

    /// Builds the replica configuration.
    ///
    /// With `index`, the index source channel is appended when it is not
    /// already mirrored.
    pub fn replica_config(&self, index: bool) -> Result<ReplicaConfig, String> {
        let organization = self
            .organization
            .as_deref()
            .ok_or("organization id required (--org or REPLICAST_ORG)")?;

        let mut types: Vec<&str> = self.channels.iter().map(String::as_str).collect();
        let index_config = index.then(IndexConfig::default);
        if let Some(index_config) = &index_config {
            if !types.contains(&index_config.source_type.as_str()) {
                types.push(index_config.source_type.as_str());
            }
        }

        let mut config = ReplicaConfig::for_organization(&self.base_url, organization, &types)
            .with_request_timeout(self.timeout);
        if let Some(index_config) = index_config {
            config = config.with_index(index_config);
        }
        Ok(config)
    }

    /// Builds the HTTP authenticator for a configuration.
    pub fn authenticator(
        &self,
        config: &ReplicaConfig,
    ) -> EngineResult<HttpAuthenticator<ReqwestClient>> {
        let client = ReqwestClient::new(config.request_timeout)?;
        Ok(HttpAuthenticator::new(
            config.login_url.clone(),
            config.refresh_url.clone(),
            client,
        ))
    }

    /// Returns the websocket URL.
    pub fn socket_url(&self) -> String {
        self.socket_url
            .clone()
            .unwrap_or_else(|| crate::socketcluster::socket_url(&self.base_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replicast_protocol::ChannelName;

    fn args() -> ServiceArgs {
        ServiceArgs {
            base_url: "https://connect.example.tv".into(),
            socket_url: None,
            organization: Some("42".into()),
            channels: vec!["connections".into()],
            user: Some("ops@example.tv".into()),
            password: None,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn index_adds_source_channel() {
        let config = args().replica_config(true).unwrap();
        assert_eq!(
            config.channels,
            vec![ChannelName::new("connections", "42"), ChannelName::new("endpoints", "42")]
        );
        assert!(config.validate().is_ok());

        let config = args().replica_config(false).unwrap();
        assert_eq!(config.channels.len(), 1);
        assert!(config.index.is_none());
    }

    #[test]
    fn missing_settings_are_named() {
        assert!(args().credentials().unwrap_err().contains("password"));

        let mut no_org = args();
        no_org.organization = None;
        assert!(no_org.replica_config(false).unwrap_err().contains("--org"));
    }

    #[test]
    fn socket_url_defaults_to_service_host() {
        assert_eq!(args().socket_url(), "wss://connect.example.tv/socketcluster/");

        let mut custom = args();
        custom.socket_url = Some("ws://localhost:9000/socketcluster/".into());
        assert_eq!(custom.socket_url(), "ws://localhost:9000/socketcluster/");
    }
}
