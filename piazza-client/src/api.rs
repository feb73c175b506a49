use crate::metrics::{ApiMetrics, MetricsCollector, RequestMetrics};
use crate::CourseService;
use async_trait::async_trait;
use piazza_core::{CoreError, FullPost, PiazzaApiError, PostSummary};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use url::Url;

pub const LOGIN_METHOD: &str = "user.login";
pub const FEED_METHOD: &str = "network.get_my_feed";
pub const CONTENT_METHOD: &str = "content.get";

const MAIN_API_PATH: &str = "main/api";
const LOGIC_API_PATH: &str = "logic/api";
const SESSION_COOKIE: &str = "session_id";
const CSRF_HEADER: &str = "CSRF-Token";

/// Substring Piazza puts in the error text when it throttles a caller.
const THROTTLE_MARKER: &str = "too fast";

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    method: &'a str,
    params: Value,
}

/// `{result, error}` envelope wrapping every Piazza RPC reply. `result` stays
/// untyped until `error` has been checked.
#[derive(Debug, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl RpcResponse {
    /// Error text if the reply carries a truthy `error` field.
    pub fn error_message(&self) -> Option<String> {
        match self.error.as_ref()? {
            Value::Null | Value::Bool(false) => None,
            Value::String(text) if text.is_empty() => None,
            Value::String(text) => Some(text.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Fails with the classified error if the reply carries one, otherwise
    /// decodes `result`. A null or missing result is `None`.
    pub fn into_result<T: DeserializeOwned>(self, method: &str) -> Result<Option<T>, CoreError> {
        if let Some(message) = self.error_message() {
            return Err(classify_rpc_error(method, message).into());
        }
        match self.result {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value).map(Some).map_err(|e| {
                error!("Failed to decode {} result: {}", method, e);
                PiazzaApiError::InvalidResponse {
                    details: format!("Failed to decode {} result: {}", method, e),
                }
                .into()
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedResult {
    #[serde(default)]
    pub feed: Vec<PostSummary>,
}

/// Maps a failed RPC's error text to the error taxonomy.
pub fn classify_rpc_error(method: &str, message: String) -> PiazzaApiError {
    if message.to_lowercase().contains(THROTTLE_MARKER) {
        PiazzaApiError::RateLimited { message }
    } else {
        PiazzaApiError::RequestFailed {
            method: method.to_string(),
            message,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Api {
    Main,
    Logic,
}

#[derive(Debug)]
pub struct PiazzaApiClient {
    http_client: Client,
    cookie_jar: Arc<Jar>,
    base_url: Url,
    metrics: Arc<MetricsCollector>,
    user_agent: String,
    authenticated: bool,
}

impl PiazzaApiClient {
    pub fn new(base_url: &str, user_agent: &str, timeout: Duration) -> Result<Self, CoreError> {
        // Joining relative paths needs a trailing slash on the base
        let mut base = base_url.trim_end_matches('/').to_string();
        base.push('/');
        let base_url = Url::parse(&base).map_err(|e| CoreError::InvalidInput {
            message: format!("Invalid API base URL '{}': {}", base_url, e),
        })?;

        let cookie_jar = Arc::new(Jar::default());
        let http_client = Client::builder()
            .user_agent(user_agent)
            .cookie_provider(cookie_jar.clone())
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http_client,
            cookie_jar,
            base_url,
            metrics: Arc::new(MetricsCollector::new()),
            user_agent: user_agent.to_string(),
            authenticated: false,
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Logs in with email and password; the session cookie is kept in the
    /// client's jar for later calls.
    pub async fn login(&mut self, email: &str, password: &str) -> Result<(), CoreError> {
        let params = json!({ "email": email, "pass": password });
        let reply = self.call(Api::Main, LOGIN_METHOD, params).await?;

        if let Some(message) = reply.error_message() {
            error!("Piazza login rejected: {}", message);
            return Err(PiazzaApiError::AuthenticationFailed { reason: message }.into());
        }

        match reply.result {
            Some(Value::String(ref status)) if status == "OK" => {
                self.authenticated = true;
                info!("Logged in to Piazza as {}", email);
                Ok(())
            }
            other => Err(PiazzaApiError::AuthenticationFailed {
                reason: format!("unexpected login result: {}", other.unwrap_or(Value::Null)),
            }
            .into()),
        }
    }

    /// Handle to one course ("network" in Piazza terms).
    pub fn network(self: &Arc<Self>, course_id: &str) -> Result<Course, CoreError> {
        if !self.authenticated {
            return Err(PiazzaApiError::NotAuthenticated.into());
        }
        Ok(Course {
            client: Arc::clone(self),
            course_id: course_id.to_string(),
        })
    }

    pub async fn get_feed(
        &self,
        course_id: &str,
        limit: usize,
    ) -> Result<Vec<PostSummary>, CoreError> {
        let params = json!({
            "limit": limit,
            "offset": 0,
            "sort": "updated",
            "nid": course_id,
        });
        let feed: FeedResult = self.logic_call(FEED_METHOD, params).await?;

        let mut posts = feed.feed;
        posts.truncate(limit);
        info!("Retrieved {} post summaries from {}", posts.len(), course_id);
        Ok(posts)
    }

    pub async fn get_post(&self, course_id: &str, post_id: &str) -> Result<FullPost, CoreError> {
        let params = json!({ "cid": post_id, "nid": course_id });
        let reply = self.call(Api::Logic, CONTENT_METHOD, params).await?;

        reply.into_result(CONTENT_METHOD)?.ok_or_else(|| {
            PiazzaApiError::PostNotFound {
                post_id: post_id.to_string(),
            }
            .into()
        })
    }

    async fn logic_call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, CoreError> {
        let reply = self.call(Api::Logic, method, params).await?;

        reply.into_result(method)?.ok_or_else(|| {
            PiazzaApiError::InvalidResponse {
                details: format!("{} returned no result", method),
            }
            .into()
        })
    }

    fn endpoint(&self, api: Api) -> Result<Url, CoreError> {
        let path = match api {
            Api::Main => MAIN_API_PATH,
            Api::Logic => LOGIC_API_PATH,
        };
        self.base_url.join(path).map_err(|e| CoreError::Internal {
            message: format!("Failed to build endpoint URL: {}", e),
        })
    }

    /// The CSRF header echoes the session cookie.
    fn csrf_token(&self, url: &Url) -> Option<String> {
        let header = self.cookie_jar.cookies(url)?;
        let cookies = header.to_str().ok()?;
        cookies.split(';').find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == SESSION_COOKIE).then(|| value.to_string())
        })
    }

    async fn call(
        &self,
        api: Api,
        method: &str,
        params: Value,
    ) -> Result<RpcResponse, CoreError> {
        let url = self.endpoint(api)?;
        let start_time = Instant::now();

        let mut request_builder = self
            .http_client
            .post(url.clone())
            .json(&RpcRequest { method, params });
        if let Some(token) = self.csrf_token(&url) {
            request_builder = request_builder.header(CSRF_HEADER, token);
        }

        debug!("Calling Piazza RPC {}", method);
        let (status_code, result) = match request_builder.send().await {
            Ok(response) => (
                Some(response.status().as_u16()),
                Self::decode(method, response).await,
            ),
            Err(e) => {
                error!("Network error for {}: {}", method, e);
                (None, Err(CoreError::Network(e)))
            }
        };

        let (success, rate_limited) = match &result {
            Ok(reply) => match reply.error_message() {
                None => (true, false),
                Some(message) => (false, message.to_lowercase().contains(THROTTLE_MARKER)),
            },
            Err(CoreError::Piazza(PiazzaApiError::RateLimited { .. })) => (false, true),
            Err(_) => (false, false),
        };

        self.metrics
            .record_request(RequestMetrics {
                method: method.to_string(),
                status_code,
                response_time: start_time.elapsed(),
                success,
                rate_limited,
            })
            .await;

        result
    }

    async fn decode(method: &str, response: reqwest::Response) -> Result<RpcResponse, CoreError> {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!("{} answered HTTP 429", method);
            return Err(PiazzaApiError::RateLimited {
                message: format!("HTTP 429 from {}", method),
            }
            .into());
        }
        if status.is_server_error() {
            error!("Request failed with status: {} for {}", status, method);
            return Err(PiazzaApiError::ServerError {
                status_code: status.as_u16(),
            }
            .into());
        }
        if !status.is_success() {
            error!("Request failed with status: {} for {}", status, method);
            return Err(PiazzaApiError::RequestFailed {
                method: method.to_string(),
                message: format!("HTTP {}", status),
            }
            .into());
        }

        response.json::<RpcResponse>().await.map_err(|e| {
            error!("Failed to parse {} reply: {}", method, e);
            PiazzaApiError::InvalidResponse {
                details: format!("Failed to parse {} reply: {}", method, e),
            }
            .into()
        })
    }

    pub async fn get_metrics(&self) -> ApiMetrics {
        self.metrics.get_metrics().await
    }

    pub async fn reset_metrics(&self) {
        self.metrics.reset_metrics().await;
    }
}

/// A logged-in client bound to one course.
#[derive(Debug, Clone)]
pub struct Course {
    client: Arc<PiazzaApiClient>,
    course_id: String,
}

#[async_trait]
impl CourseService for Course {
    async fn get_feed(&self, limit: usize) -> Result<Vec<PostSummary>, CoreError> {
        self.client.get_feed(&self.course_id, limit).await
    }

    async fn get_post(&self, post_id: &str) -> Result<FullPost, CoreError> {
        self.client.get_post(&self.course_id, post_id).await
    }
}
