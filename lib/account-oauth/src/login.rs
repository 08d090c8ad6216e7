//! GitHub login through the discovered OAuth service

use crate::config::OAuthConfig;
use crate::error::{LoginError, Result};
use crate::gen::githuboauth::github_o_auth_service_client::GithubOAuthServiceClient;
use crate::gen::githuboauth::{
    GetAccessTokenRequest, GetAccessTokenResponse, GetUserInfoRequest, GetUserInfoResponse,
};
use discovery_core::DiscoveryError;
use discovery_pool::{ConnectionPool, Connector, DiscoveryChannel, DiscoveryConnector};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::ClientTlsConfig;
use tracing::{debug, info, warn};

const GET_ACCESS_TOKEN: &str = "GetAccessToken";
const GET_USER_INFO: &str = "GetUserInfo";

pub struct OAuthLoginService<C = DiscoveryConnector>
where
    C: Connector<Connection = DiscoveryChannel>,
{
    pool: Arc<ConnectionPool<C>>,
    service_name: String,
    request_timeout: Duration,
    tls: Option<ClientTlsConfig>,
}

impl<C> OAuthLoginService<C>
where
    C: Connector<Connection = DiscoveryChannel>,
{
    /// Load the configured TLS files and bind to `pool`
    pub async fn new(pool: Arc<ConnectionPool<C>>, config: &OAuthConfig) -> Result<Self> {
        let tls = config.tls.load().await.map_err(LoginError::Tls)?;
        Ok(Self {
            pool,
            service_name: config.service_name.clone(),
            request_timeout: config.request_timeout(),
            tls,
        })
    }

    /// Exchange an authorization code for the GitHub login of its owner.
    ///
    /// Fails as unavailable when the pool cannot build a connection or no
    /// instance has ever been resolved. Each RPC runs under the request
    /// timeout. Failures are not retried.
    pub async fn github_login(&self, code: &str) -> Result<String> {
        if code.trim().is_empty() {
            return Err(LoginError::EmptyCode);
        }

        let connection = self
            .pool
            .get_connection(&self.service_name, self.tls.clone())
            .await
            .map_err(|e| {
                warn!(service = %self.service_name, error = %e, "No connection to OAuth service");
                LoginError::ServiceUnavailable(e)
            })?;
        if !connection.wait_for_addresses(self.request_timeout).await {
            warn!(service = %self.service_name, "No OAuth service instance has been resolved");
            return Err(LoginError::ServiceUnavailable(DiscoveryError::NoAddresses(
                self.service_name.clone(),
            )));
        }
        let mut client = GithubOAuthServiceClient::new(connection.channel());

        let token = self
            .call(
                GET_ACCESS_TOKEN,
                client.get_access_token(GetAccessTokenRequest {
                    code: code.to_string(),
                }),
            )
            .await?;
        let access_token = access_token(token)?;
        debug!("Access token obtained");

        let user = self
            .call(GET_USER_INFO, client.get_user_info(GetUserInfoRequest { access_token }))
            .await?;
        let login = open_id(user)?;

        info!(login = %login, "GitHub login succeeded");
        Ok(login)
    }

    async fn call<T>(
        &self,
        step: &'static str,
        rpc: impl Future<Output = std::result::Result<tonic::Response<T>, tonic::Status>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.request_timeout, rpc).await {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => {
                warn!(step, code = ?status.code(), message = %status.message(), "OAuth RPC failed");
                Err(LoginError::Rpc { step, status })
            }
            Err(_) => {
                warn!(step, timeout = ?self.request_timeout, "OAuth RPC timed out");
                Err(LoginError::Timeout { step })
            }
        }
    }
}

fn access_token(response: GetAccessTokenResponse) -> Result<String> {
    if !response.error.is_empty() {
        return Err(LoginError::Rejected {
            step: GET_ACCESS_TOKEN,
            message: response.error,
        });
    }
    Ok(response.access_token)
}

/// The GitHub login is unique and immutable, so it serves as the open id
fn open_id(response: GetUserInfoResponse) -> Result<String> {
    if !response.error.is_empty() {
        return Err(LoginError::Rejected {
            step: GET_USER_INFO,
            message: response.error,
        });
    }
    match response.user_info {
        Some(user) if !user.login.is_empty() => Ok(user.login),
        _ => Err(LoginError::MissingUserInfo),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gen::githuboauth::UserInfo;

    #[test]
    fn test_access_token_error_field_rejects() {
        let response = GetAccessTokenResponse {
            access_token: String::new(),
            error: "bad_verification_code".to_string(),
        };
        match access_token(response) {
            Err(LoginError::Rejected { step, message }) => {
                assert_eq!(step, "GetAccessToken");
                assert_eq!(message, "bad_verification_code");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_access_token_passes_through() {
        let response = GetAccessTokenResponse {
            access_token: "gho_abc".to_string(),
            error: String::new(),
        };
        assert_eq!(access_token(response).unwrap(), "gho_abc");
    }

    #[test]
    fn test_open_id_is_login() {
        let response = GetUserInfoResponse {
            user_info: Some(UserInfo {
                login: "octocat".to_string(),
                id: 1,
                ..Default::default()
            }),
            error: String::new(),
        };
        assert_eq!(open_id(response).unwrap(), "octocat");
    }

    #[test]
    fn test_open_id_requires_user() {
        let response = GetUserInfoResponse::default();
        assert!(matches!(open_id(response), Err(LoginError::MissingUserInfo)));

        let response = GetUserInfoResponse {
            user_info: None,
            error: "token expired".to_string(),
        };
        assert!(matches!(open_id(response), Err(LoginError::Rejected { .. })));
    }
}
