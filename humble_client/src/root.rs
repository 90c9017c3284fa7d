use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dotenv::dotenv;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

/// Name of the auth cookie humblebundle.com issues to logged-in sessions.
pub const SESSION_COOKIE_NAME: &str = "_simpleauth_sess";

/// Unauthenticated requests to account endpoints are answered with the login
/// page instead of an error status, so the body is the only reliable signal.
pub const LOGIN_PAGE_MARKER: &str = "Humble Bundle - Log In";

#[derive(Clone, Debug)]
pub struct HumbleConfig {
    pub site_base: String,
    pub api_base: String,
    pub session_cookie: Option<String>,
    pub user_agent: String,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub batch_concurrency: usize,
}

impl Default for HumbleConfig {
    fn default() -> Self {
        dotenv().ok();
        let site_base = std::env::var("HUMBLE_SITE_BASE")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "https://www.humblebundle.com".into());
        let site_base = site_base.trim_end_matches('/').to_string();
        let api_base = std::env::var("HUMBLE_API_BASE")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("{site_base}/api/v1"));
        let api_base = api_base.trim_end_matches('/').to_string();

        // Cookie bootstrap: prefer a file (keeps the value out of shell
        // history), fall back to the raw env var.
        let session_cookie = std::env::var("HUMBLE_SESSION_COOKIE_FILE")
            .ok()
            .and_then(|p| std::fs::read_to_string(p).ok().map(|s| s.trim().to_string()))
            .or_else(|| {
                std::env::var("HUMBLE_SESSION_COOKIE")
                    .ok()
                    .map(|s| s.trim().to_string())
            })
            .filter(|s| !s.is_empty());

        if let Some(cookie) = &session_cookie {
            if !looks_like_session_cookie(cookie) {
                warn!("session cookie does not match the expected {SESSION_COOKIE_NAME} shape");
            }
        }

        let user_agent = std::env::var("HUMBLE_UA").unwrap_or_else(|_| {
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0 Safari/537.36".to_string()
        });
        let timeout_secs = std::env::var("HUMBLE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);
        let retry_attempts = std::env::var("HUMBLE_RETRY_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);
        let retry_base_delay_ms = std::env::var("HUMBLE_RETRY_BASE_DELAY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(500);
        let batch_concurrency = std::env::var("HUMBLE_BATCH_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(4);

        Self {
            site_base,
            api_base,
            session_cookie,
            user_agent,
            timeout_secs,
            retry_attempts,
            retry_base_delay_ms,
            batch_concurrency,
        }
    }
}

impl HumbleConfig {
    /// Landing page for the Humble Choice subscription.
    pub fn membership_url(&self) -> String {
        format!("{}/membership", self.site_base)
    }

    /// Subscriber hub page carrying the current period's embedded payload.
    pub fn subscriber_home_url(&self) -> String {
        format!("{}/membership/home", self.site_base)
    }

    pub fn product_page_url(&self, url_path: &str) -> String {
        format!("{}/membership/{url_path}", self.site_base)
    }

    /// Account page listing every purchase gamekey the user owns.
    pub fn keys_page_url(&self) -> String {
        format!("{}/home/keys", self.site_base)
    }

    pub fn download_url(&self, gamekey: &str) -> String {
        format!("{}/download?key={gamekey}", self.site_base)
    }

    /// Cursor-paginated subscription listing. An empty cursor fetches the
    /// first page; the cursor value is opaque and comes from the prior page.
    pub fn subscription_products_url(&self, cursor: &str) -> String {
        format!(
            "{}/subscriptions/humble_monthly/subscription_products_with_gamekeys/{}",
            self.api_base,
            urlencoding::encode(cursor)
        )
    }

    /// Order details for up to one batch of gamekeys, passed as repeated
    /// query parameters the way the site's own frontend does.
    pub fn orders_batch_url(&self, gamekeys: &[String]) -> String {
        let params: Vec<String> = gamekeys
            .iter()
            .map(|k| format!("gamekeys={}", urlencoding::encode(k)))
            .collect();
        format!("{}/orders?all_tpkds=true&{}", self.api_base, params.join("&"))
    }
}

/// Check a candidate value against the shape of a real `_simpleauth_sess`
/// cookie: a base64 JWT-ish head, a timestamp, and a 40-char hex signature.
pub fn looks_like_session_cookie(value: &str) -> bool {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        Regex::new(r"^ey[a-zA-Z0-9+=]+\|\d+\|[a-f0-9]{40}$").expect("session cookie pattern")
    });
    re.is_match(value.trim())
}

#[derive(Error, Debug)]
pub enum HumbleError {
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("session cookie rejected (login page returned)")]
    InvalidSession,
    #[error("network: {0}")]
    Net(#[from] reqwest::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// Minimal fetch surface the discovery code runs against. Kept as a trait so
/// the walk and batch logic can be exercised against scripted responses.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Plain GET returning the response body.
    async fn get(&self, url: &str) -> Result<String, HumbleError>;

    /// GET for pages that require a logged-in session. Returns
    /// `InvalidSession` when the site answers with the login page.
    async fn get_authenticated(&self, url: &str) -> Result<String, HumbleError>;
}

fn is_login_page(body: &str) -> bool {
    body.contains(LOGIN_PAGE_MARKER)
}

#[derive(Clone)]
pub struct HumbleClient {
    http: Client,
    cfg: Arc<HumbleConfig>,
}

impl HumbleClient {
    pub fn new(cfg: HumbleConfig) -> Self {
        let mut headers = HeaderMap::new();
        // The cookie header is set manually instead of going through a cookie
        // jar; the session cookie is the only one the site needs.
        if let Some(cookie) = &cfg.session_cookie {
            let value = format!("{SESSION_COOKIE_NAME}={cookie}");
            headers.insert(
                HeaderName::from_static("cookie"),
                HeaderValue::from_str(&value).expect("valid cookie value"),
            );
        }

        let http = Client::builder()
            .default_headers(headers)
            .user_agent(&cfg.user_agent)
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()
            .expect("failed to build reqwest client");

        Self {
            http,
            cfg: Arc::new(cfg),
        }
    }

    pub fn config(&self) -> &HumbleConfig {
        &self.cfg
    }

    async fn fetch(&self, url: &str) -> Result<String, HumbleError> {
        let max_attempts = self.cfg.retry_attempts.max(1);
        let mut delay = Duration::from_millis(self.cfg.retry_base_delay_ms.max(1));
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            debug!(%url, attempt, "humble GET");

            let resp = match self.http.get(url).send().await {
                Ok(r) => r,
                Err(e) => {
                    if attempt >= max_attempts {
                        return Err(HumbleError::Net(e));
                    }
                    warn!(%url, attempt, error = %e, "network error; retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    continue;
                }
            };

            let status = resp.status();
            let body = match resp.text().await {
                Ok(b) => b,
                Err(e) => {
                    if attempt >= max_attempts {
                        return Err(HumbleError::Net(e));
                    }
                    warn!(%url, attempt, error = %e, "body read error; retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    continue;
                }
            };

            if status == StatusCode::NOT_FOUND {
                return Err(HumbleError::NotFound(url.to_string()));
            }
            if status.as_u16() >= 500 && attempt < max_attempts {
                warn!(%url, status = status.as_u16(), attempt, "server error; retrying");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                continue;
            }
            if !status.is_success() {
                return Err(HumbleError::Http {
                    status: status.as_u16(),
                    body,
                });
            }
            return Ok(body);
        }
    }
}

#[async_trait]
impl Transport for HumbleClient {
    async fn get(&self, url: &str) -> Result<String, HumbleError> {
        self.fetch(url).await
    }

    async fn get_authenticated(&self, url: &str) -> Result<String, HumbleError> {
        let body = self.fetch(url).await?;
        if is_login_page(&body) {
            return Err(HumbleError::InvalidSession);
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> HumbleConfig {
        HumbleConfig {
            site_base: "https://hb.test".into(),
            api_base: "https://hb.test/api/v1".into(),
            session_cookie: None,
            user_agent: "test".into(),
            timeout_secs: 5,
            retry_attempts: 1,
            retry_base_delay_ms: 1,
            batch_concurrency: 2,
        }
    }

    #[test]
    fn listing_url_encodes_cursor() {
        let cfg = test_config();
        assert_eq!(
            cfg.subscription_products_url(""),
            "https://hb.test/api/v1/subscriptions/humble_monthly/subscription_products_with_gamekeys/"
        );
        assert_eq!(
            cfg.subscription_products_url("a b+c"),
            "https://hb.test/api/v1/subscriptions/humble_monthly/subscription_products_with_gamekeys/a%20b%2Bc"
        );
    }

    #[test]
    fn orders_url_repeats_gamekeys_param() {
        let cfg = test_config();
        let keys = vec!["k1".to_string(), "k2".to_string()];
        assert_eq!(
            cfg.orders_batch_url(&keys),
            "https://hb.test/api/v1/orders?all_tpkds=true&gamekeys=k1&gamekeys=k2"
        );
    }

    #[test]
    fn page_urls_follow_site_layout() {
        let cfg = test_config();
        assert_eq!(cfg.membership_url(), "https://hb.test/membership");
        assert_eq!(cfg.subscriber_home_url(), "https://hb.test/membership/home");
        assert_eq!(
            cfg.product_page_url("may-2023"),
            "https://hb.test/membership/may-2023"
        );
        assert_eq!(cfg.keys_page_url(), "https://hb.test/home/keys");
        assert_eq!(cfg.download_url("abc"), "https://hb.test/download?key=abc");
    }

    #[test]
    fn session_cookie_shape() {
        let valid = format!(
            "eyJhbGciOiJIUzI1NiJ9+=|1700000000|{}",
            "0123456789abcdef0123456789abcdef01234567"
        );
        assert!(looks_like_session_cookie(&valid));
        assert!(looks_like_session_cookie(&format!("  {valid}  ")));

        assert!(!looks_like_session_cookie("not-a-cookie"));
        assert!(!looks_like_session_cookie("ey|12|abcd"));
        // Signature must be lowercase hex and exactly 40 chars.
        assert!(!looks_like_session_cookie(
            "eyABC|123|0123456789ABCDEF0123456789ABCDEF01234567"
        ));
        assert!(!looks_like_session_cookie("eyABC|123|abc123"));
    }

    #[test]
    fn login_page_detection() {
        assert!(is_login_page(
            "<html><title>Humble Bundle - Log In</title></html>"
        ));
        assert!(!is_login_page("{\"cursor\":\"abc\",\"products\":[]}"));
    }
}
