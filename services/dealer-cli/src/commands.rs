//! `dealer-api` subcommands
//!
//! Each command returns the text to print on stdout so the binary stays a
//! thin shell around these functions.

use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use clap::{Args, Subcommand};
use dealer_auth::{CredentialPair, now_millis};
use dealer_client::{ApiClient, ApiResponse, RequestDescriptor};
use tokio_util::sync::CancellationToken;
use transport::Method;

#[derive(Subcommand)]
pub enum Command {
    /// Store a credential pair
    Login(LoginArgs),
    /// Forget stored credentials
    Logout,
    /// Show whether credentials are stored and when the access token expires
    Status,
    /// Exchange the refresh token for a new pair now
    Refresh,
    /// Send a request through the authenticated pipeline and print the body
    Request(RequestArgs),
}

#[derive(Args)]
pub struct LoginArgs {
    /// Access token issued by the dealer auth server
    #[arg(long, env = "DEALER_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: String,

    /// Refresh token; without one the session ends when the access token does
    #[arg(
        long,
        env = "DEALER_REFRESH_TOKEN",
        hide_env_values = true,
        default_value = ""
    )]
    pub refresh_token: String,
}

#[derive(Args)]
pub struct RequestArgs {
    /// HTTP method (GET, POST, PUT, PATCH, DELETE, ...)
    pub method: String,

    /// Path relative to the configured base URL
    pub path: String,

    /// JSON request body
    #[arg(long)]
    pub data: Option<String>,

    /// Extra header as `Name: value` (repeatable)
    #[arg(long = "header", short = 'H', value_name = "NAME:VALUE")]
    pub headers: Vec<String>,

    /// Per-call timeout in seconds, overriding the config file
    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

pub fn login(client: &ApiClient, args: LoginArgs) -> Result<String> {
    ensure!(
        !args.access_token.trim().is_empty(),
        "access token must not be empty"
    );
    let pair = CredentialPair::new(args.access_token.trim(), args.refresh_token.trim());
    let refreshable = pair.has_refresh_token();
    client.set_credentials(pair);

    Ok(if refreshable {
        "logged in".to_owned()
    } else {
        "logged in without a refresh token; the session ends when the access token expires"
            .to_owned()
    })
}

pub fn logout(client: &ApiClient) -> String {
    client.clear_credentials();
    "logged out".to_owned()
}

pub fn status(client: &ApiClient) -> String {
    let Some(pair) = client.credentials() else {
        return "not logged in".to_owned();
    };
    let refresh = if pair.has_refresh_token() {
        "present"
    } else {
        "absent"
    };
    format!(
        "logged in (refresh token {refresh}), {}",
        describe_expiry(pair.expires_at_estimate, now_millis())
    )
}

pub async fn refresh(client: &ApiClient) -> Result<String> {
    let pair = client
        .force_refresh()
        .await
        .context("token refresh failed")?;
    Ok(format!(
        "token refreshed, {}",
        describe_expiry(pair.expires_at_estimate, now_millis())
    ))
}

pub async fn request(
    client: &ApiClient,
    args: RequestArgs,
    cancel: CancellationToken,
) -> Result<String> {
    let descriptor = build_descriptor(&args)?.cancel_token(cancel);
    let response = client
        .send_raw(descriptor)
        .await
        .with_context(|| format!("{} {} failed", args.method.to_ascii_uppercase(), args.path))?;
    Ok(render_body(&response))
}

/// Turn command-line arguments into a request descriptor.
pub fn build_descriptor(args: &RequestArgs) -> Result<RequestDescriptor> {
    let method = Method::from_bytes(args.method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("invalid HTTP method {:?}", args.method))?;
    let mut descriptor = RequestDescriptor::new(method, args.path.clone());

    if let Some(data) = &args.data {
        let body: serde_json::Value =
            serde_json::from_str(data).context("--data must be valid JSON")?;
        descriptor = descriptor.json(&body)?;
    }

    for raw in &args.headers {
        let (name, value) = parse_header(raw)?;
        descriptor = descriptor.try_header(name, value)?;
    }

    if let Some(secs) = args.timeout_secs {
        ensure!(secs > 0, "--timeout-secs must be greater than 0");
        descriptor = descriptor.timeout(Duration::from_secs(secs));
    }

    Ok(descriptor)
}

fn parse_header(raw: &str) -> Result<(&str, &str)> {
    let Some((name, value)) = raw.split_once(':') else {
        bail!("header {raw:?} must look like `Name: value`");
    };
    let name = name.trim();
    ensure!(!name.is_empty(), "header {raw:?} has an empty name");
    Ok((name, value.trim()))
}

/// Pretty-print JSON bodies, pass anything else through as text.
fn render_body(response: &ApiResponse) -> String {
    match serde_json::from_slice::<serde_json::Value>(&response.body) {
        Ok(json) => serde_json::to_string_pretty(&json).unwrap_or_else(|_| response.text()),
        Err(_) => response.text(),
    }
}

fn describe_expiry(expires_at: Option<u64>, now: u64) -> String {
    match expires_at {
        None => "access token expiry unknown".to_owned(),
        Some(at) if at <= now => "access token expired".to_owned(),
        Some(at) => {
            let secs = (at - now) / 1000;
            format!(
                "access token expires in {}m {:02}s",
                secs / 60,
                secs % 60
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealer_auth::CredentialStore;
    use dealer_client::{ClientConfig, ClientError, ErrorKind};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use transport::ReqwestTransport;

    fn request_args(method: &str, path: &str) -> RequestArgs {
        RequestArgs {
            method: method.into(),
            path: path.into(),
            data: None,
            headers: Vec::new(),
            timeout_secs: None,
        }
    }

    fn offline_client() -> ApiClient {
        ApiClient::new(
            ClientConfig::new("http://127.0.0.1:9"),
            Arc::new(ReqwestTransport::try_default().unwrap()),
            Arc::new(CredentialStore::in_memory()),
        )
    }

    /// Mock dealer API: `/vehicles/v-1` requires `Bearer A2`, refresh issues A2/R2.
    async fn start_dealer_api() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new()
            .route(
                "/vehicles/v-1",
                axum::routing::get(|headers: axum::http::HeaderMap| async move {
                    if headers
                        .get("authorization")
                        .is_some_and(|v| v == "Bearer A2")
                    {
                        (
                            axum::http::StatusCode::OK,
                            axum::Json(serde_json::json!({"id": "v-1", "make": "Volvo"})),
                        )
                    } else {
                        (
                            axum::http::StatusCode::UNAUTHORIZED,
                            axum::Json(serde_json::json!({"message": "token expired"})),
                        )
                    }
                }),
            )
            .route(
                "/auth/refresh-token",
                axum::routing::post(|| async {
                    axum::Json(serde_json::json!({"accessToken": "A2", "refreshToken": "R2"}))
                }),
            );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn online_client(base_url: String) -> ApiClient {
        let client = ApiClient::new(
            ClientConfig::new(base_url),
            Arc::new(ReqwestTransport::try_default().unwrap()),
            Arc::new(CredentialStore::in_memory()),
        );
        client.set_credentials(CredentialPair::new("A1", "R1"));
        client
    }

    #[test]
    fn build_descriptor_parses_method_body_and_headers() {
        let mut args = request_args("post", "/leads");
        args.data = Some(r#"{"name":"Ada"}"#.into());
        args.headers = vec!["X-Dealer-Id: d-42".into(), "accept:application/json".into()];
        args.timeout_secs = Some(5);

        let descriptor = build_descriptor(&args).unwrap();
        assert_eq!(descriptor.method(), Method::POST);
        assert_eq!(descriptor.path(), "/leads");
        assert_eq!(descriptor.headers().get("x-dealer-id").unwrap(), "d-42");
        assert_eq!(descriptor.headers().get("accept").unwrap(), "application/json");
        assert_eq!(descriptor.timeout_override(), Some(Duration::from_secs(5)));
        let body: serde_json::Value =
            serde_json::from_slice(descriptor.body_bytes().unwrap()).unwrap();
        assert_eq!(body["name"], "Ada");
    }

    #[test]
    fn build_descriptor_rejects_bad_input() {
        let mut bad_json = request_args("POST", "/leads");
        bad_json.data = Some("{not json".into());
        assert!(build_descriptor(&bad_json).is_err());

        let mut bad_header = request_args("GET", "/leads");
        bad_header.headers = vec!["no-colon".into()];
        assert!(build_descriptor(&bad_header).is_err());

        let mut zero_timeout = request_args("GET", "/leads");
        zero_timeout.timeout_secs = Some(0);
        assert!(build_descriptor(&zero_timeout).is_err());

        assert!(build_descriptor(&request_args("GE T", "/leads")).is_err());
    }

    #[test]
    fn parse_header_trims_name_and_value() {
        assert_eq!(
            parse_header("  X-Trace :  abc ").unwrap(),
            ("X-Trace", "abc")
        );
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn describe_expiry_formats_remaining_time() {
        assert_eq!(describe_expiry(None, 0), "access token expiry unknown");
        assert_eq!(describe_expiry(Some(1_000), 2_000), "access token expired");
        assert_eq!(
            describe_expiry(Some(754_000), 4_000),
            "access token expires in 12m 30s"
        );
    }

    #[tokio::test]
    async fn login_status_logout_cycle() {
        let client = offline_client();
        assert_eq!(status(&client), "not logged in");

        let message = login(
            &client,
            LoginArgs {
                access_token: "A1".into(),
                refresh_token: "R1".into(),
            },
        )
        .unwrap();
        assert_eq!(message, "logged in");
        assert_eq!(
            status(&client),
            "logged in (refresh token present), access token expiry unknown"
        );

        assert_eq!(logout(&client), "logged out");
        assert!(client.credentials().is_none());
    }

    #[tokio::test]
    async fn login_rejects_empty_access_token() {
        let client = offline_client();
        let err = login(
            &client,
            LoginArgs {
                access_token: "  ".into(),
                refresh_token: "R1".into(),
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("must not be empty"));
        assert!(!client.is_authenticated());
    }

    #[tokio::test]
    async fn request_refreshes_and_prints_body() {
        let client = online_client(start_dealer_api().await);

        let output = request(
            &client,
            request_args("GET", "/vehicles/v-1"),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let body: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(body["id"], "v-1");
        assert_eq!(
            client.credentials().unwrap().access_token.expose(),
            "A2"
        );
    }

    #[tokio::test]
    async fn refresh_command_rotates_tokens() {
        let client = online_client(start_dealer_api().await);

        let output = refresh(&client).await.unwrap();
        assert!(output.starts_with("token refreshed"), "{output}");
        let pair = client.credentials().unwrap();
        assert_eq!(pair.access_token.expose(), "A2");
        assert_eq!(pair.refresh_token.expose(), "R2");
    }

    #[tokio::test]
    async fn cancelled_request_reports_kind() {
        let client = online_client(start_dealer_api().await);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = request(&client, request_args("GET", "/vehicles/v-1"), cancel)
            .await
            .unwrap_err();
        let client_error = err.downcast_ref::<ClientError>().unwrap();
        assert_eq!(client_error.kind, ErrorKind::Cancelled);
        assert!(format!("{err:#}").contains("CANCELLED"));
    }
}
