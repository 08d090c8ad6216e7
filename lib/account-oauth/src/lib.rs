//! GitHub OAuth login over discovered gRPC connections
//!
//! The login flow exchanges an authorization code for an access token and
//! the token for the user's profile, both against `github-oauth-service`
//! instances found through the connection pool.

pub mod config;
pub mod error;
pub mod gen;
pub mod login;

pub use config::{OAuthConfig, GITHUB_OAUTH_SERVICE};
pub use error::{LoginError, Result};
pub use gen::githuboauth::{
    github_o_auth_service_client::GithubOAuthServiceClient, GetAccessTokenRequest,
    GetAccessTokenResponse, GetUserInfoRequest, GetUserInfoResponse, UserInfo,
};
pub use login::OAuthLoginService;
