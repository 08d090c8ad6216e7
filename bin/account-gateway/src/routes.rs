//! HTTP routes served by the gateway

use account_oauth::{LoginError, OAuthLoginService};
use discovery_pool::DiscoveryMetrics;
use http_body_util::Full;
use hyper::{body::Bytes, Method, Request, Response, StatusCode};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct AppState {
    pub login: OAuthLoginService,
    pub metrics: Arc<DiscoveryMetrics>,
}

pub async fn handle_request<B>(
    req: Request<B>,
    state: Arc<AppState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("{} {}", method, path);

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/healthz") => text(StatusCode::OK, "OK\n"),
        (&Method::GET, "/metrics") => match state.metrics.gather() {
            Ok(body) => Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4")
                .body(Full::new(Bytes::from(body)))
                .unwrap_or_else(|_| text(StatusCode::INTERNAL_SERVER_ERROR, "")),
            Err(e) => {
                warn!(error = %e, "Failed to gather metrics");
                text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to gather metrics\n")
            }
        },
        (&Method::GET, "/oauth/callback/github") => {
            let code = query_param(req.uri().query(), "code").unwrap_or_default();
            match state.login.github_login(&code).await {
                Ok(open_id) => json_response(StatusCode::OK, json!({ "open_id": open_id })),
                Err(e) => login_failure(&e),
            }
        }
        _ => text(StatusCode::NOT_FOUND, "Not Found\n"),
    };

    Ok(response)
}

fn login_failure(error: &LoginError) -> Response<Full<Bytes>> {
    warn!(error = %error, "GitHub login failed");
    let (status, message) = login_status(error);
    json_response(status, json!({ "error": message }))
}

fn login_status(error: &LoginError) -> (StatusCode, String) {
    match error {
        LoginError::ServiceUnavailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "service unavailable".to_string())
        }
        LoginError::EmptyCode => (StatusCode::BAD_REQUEST, error.to_string()),
        _ => (StatusCode::BAD_GATEWAY, error.to_string()),
    }
}

/// First value of `name` in a query string, percent-decoded
fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use account_oauth::OAuthConfig;
    use discovery_core::{DiscoveryError, PoolConfig};
    use discovery_pool::{ConnectionPool, DiscoveryConnector};
    use http_body_util::BodyExt;

    /// State whose pool has no resolver builder, so every connection build fails
    async fn unavailable_state() -> Arc<AppState> {
        let pool = Arc::new(ConnectionPool::new(DiscoveryConnector::new(PoolConfig::default())));
        let login = OAuthLoginService::new(pool, &OAuthConfig::default())
            .await
            .unwrap();
        Arc::new(AppState {
            login,
            metrics: Arc::new(DiscoveryMetrics::new().unwrap()),
        })
    }

    async fn get(uri: &str, state: Arc<AppState>) -> (StatusCode, String) {
        let req = Request::get(uri).body(()).unwrap();
        let response = handle_request(req, state).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let state = unavailable_state().await;
        assert_eq!(get("/healthz", state.clone()).await, (StatusCode::OK, "OK\n".to_string()));

        let (status, body) = get("/metrics", state.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("discovery_pool_connections"));

        assert_eq!(get("/nope", state).await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_callback_with_failing_pool_is_503() {
        let (status, body) = get("/oauth/callback/github?code=abc", unavailable_state().await).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, r#"{"error":"service unavailable"}"#);
    }

    #[tokio::test]
    async fn test_callback_without_code_is_400() {
        let (status, _) = get("/oauth/callback/github", unavailable_state().await).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_query_param() {
        assert_eq!(query_param(Some("code=abc&state=x"), "code").as_deref(), Some("abc"));
        assert_eq!(query_param(Some("state=x&code=abc"), "code").as_deref(), Some("abc"));
        assert_eq!(query_param(Some("code"), "code").as_deref(), Some(""));
        assert_eq!(query_param(Some("state=x"), "code"), None);
        assert_eq!(query_param(None, "code"), None);
        assert_eq!(query_param(Some("code=a%2Fb+c"), "code").as_deref(), Some("a/b c"));
    }

    #[test]
    fn test_login_status_mapping() {
        let unavailable = LoginError::ServiceUnavailable(DiscoveryError::UnknownScheme("dns".into()));
        assert_eq!(
            login_status(&unavailable),
            (StatusCode::SERVICE_UNAVAILABLE, "service unavailable".to_string())
        );
        assert_eq!(login_status(&LoginError::EmptyCode).0, StatusCode::BAD_REQUEST);
        assert_eq!(
            login_status(&LoginError::Timeout { step: "GetAccessToken" }).0,
            StatusCode::BAD_GATEWAY
        );
    }
}
