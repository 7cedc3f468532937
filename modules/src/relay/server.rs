//! HTTP control surface of the relay

use super::{RelayEngine, RelayStatus};
use library::communication::log::{LogClient, TopicSpec};
use library::communication::queue::QueueClient;
use library::BoxedError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{error, info, warn};
use warp::http::StatusCode;
use warp::reply::{self, Json, WithStatus};
use warp::{Filter, Rejection, Reply};

type ApiReply = WithStatus<Json>;

/// Upper bound for each backend round trip of the health endpoint
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Login accepted by the admin endpoint
#[derive(Debug, Clone)]
pub struct AdminCredentials {
    /// Expected username
    pub username: String,
    /// Expected password
    pub password: String,
}

#[derive(Debug, Error)]
enum ApiError {
    #[error("Topic name is required")]
    MissingTopicName,
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("{0}")]
    Backend(BoxedError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingTopicName => StatusCode::BAD_REQUEST,
            ApiError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            ApiError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn into_reply(self) -> ApiReply {
        let status = self.status();
        reply::with_status(reply::json(&json!({ "error": self.to_string() })), status)
    }
}

fn message(text: impl Into<String>, status: StatusCode) -> ApiReply {
    reply::with_status(reply::json(&json!({ "message": text.into() })), status)
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    sqs_connected: bool,
    kafka_connected: bool,
    stream_status: RelayStatus,
}

#[derive(Debug, Deserialize)]
struct TopicRequest {
    name: Option<String>,
    partitions: Option<u32>,
    replication: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: Option<String>,
    password: Option<String>,
}

/// Builds the complete set of routes served below `/api`
pub fn routes(
    engine: Arc<RelayEngine>,
    credentials: AdminCredentials,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let cors = warp::cors()
        .allow_any_origin()
        .allow_header("content-type")
        .allow_methods(vec!["GET", "POST", "OPTIONS"]);

    let engine = warp::any().map(move || engine.clone());
    let credentials = warp::any().map(move || credentials.clone());

    let health_route = warp::path!("health")
        .and(warp::get())
        .and(engine.clone())
        .and_then(health)
        .with(warp::trace::named("health"));

    let metrics_route = warp::path!("metrics")
        .and(warp::get())
        .and(engine.clone())
        .map(|engine: Arc<RelayEngine>| reply::json(&engine.metrics()))
        .with(warp::trace::named("metrics"));

    let start_route = warp::path!("stream" / "start")
        .and(warp::post())
        .and(engine.clone())
        .and_then(start_stream)
        .with(warp::trace::named("start"));

    let stop_route = warp::path!("stream" / "stop")
        .and(warp::post())
        .and(engine.clone())
        .and_then(stop_stream)
        .with(warp::trace::named("stop"));

    let list_topics_route = warp::path!("topics")
        .and(warp::get())
        .and(engine.clone())
        .and_then(list_topics)
        .with(warp::trace::named("list_topics"));

    let create_topic_route = warp::path!("topics")
        .and(warp::post())
        .and(engine)
        .and(warp::body::json())
        .and_then(create_topic)
        .with(warp::trace::named("create_topic"));

    let login_route = warp::path!("admin" / "login")
        .and(warp::post())
        .and(credentials)
        .and(warp::body::json())
        .and_then(login)
        .with(warp::trace::named("login"));

    let api_routes = health_route
        .or(metrics_route)
        .or(start_route)
        .or(stop_route)
        .or(list_topics_route)
        .or(create_topic_route)
        .or(login_route);

    warp::path("api")
        .and(api_routes)
        .recover(handle_rejection)
        .with(cors)
        .with(warp::trace::request())
}

/// Whether the backend answered successfully within [`HEALTH_CHECK_TIMEOUT`]
async fn reachable<T>(check: impl Future<Output = Result<T, BoxedError>>) -> bool {
    matches!(timeout(HEALTH_CHECK_TIMEOUT, check).await, Ok(Ok(_)))
}

async fn health(engine: Arc<RelayEngine>) -> Result<impl Reply, Infallible> {
    let (sqs_connected, kafka_connected) = futures::join!(
        reachable(engine.queue().approximate_depth()),
        reachable(engine.log().list_topics())
    );

    let report = HealthReport {
        status: "healthy",
        sqs_connected,
        kafka_connected,
        stream_status: engine.metrics().stream_status,
    };

    Ok(reply::json(&report))
}

async fn start_stream(engine: Arc<RelayEngine>) -> Result<ApiReply, Infallible> {
    if engine.start().await {
        info!("Stream processing started");
        Ok(message(
            "Stream processing started successfully",
            StatusCode::OK,
        ))
    } else {
        Ok(message("Stream is already running", StatusCode::BAD_REQUEST))
    }
}

async fn stop_stream(engine: Arc<RelayEngine>) -> Result<ApiReply, Infallible> {
    if engine.stop().await {
        info!("Stream processing stopped");
        Ok(message(
            "Stream processing stopped successfully",
            StatusCode::OK,
        ))
    } else {
        Ok(message("Stream is already stopped", StatusCode::BAD_REQUEST))
    }
}

async fn list_topics(engine: Arc<RelayEngine>) -> Result<ApiReply, Infallible> {
    match engine.log().list_topics().await {
        Ok(topics) => Ok(reply::with_status(
            reply::json(&json!({ "topics": topics })),
            StatusCode::OK,
        )),
        Err(e) => {
            error!(error = %e, "Failed to list topics");
            Ok(ApiError::Backend(e).into_reply())
        }
    }
}

async fn create_topic(
    engine: Arc<RelayEngine>,
    request: TopicRequest,
) -> Result<ApiReply, Infallible> {
    let name = match request.name.filter(|name| !name.is_empty()) {
        Some(name) => name,
        None => return Ok(ApiError::MissingTopicName.into_reply()),
    };

    let defaults = TopicSpec::default();
    let spec = TopicSpec::new(
        request.partitions.unwrap_or(defaults.partitions),
        request.replication.unwrap_or(defaults.replication),
    );

    match engine.log().create_topic(&name, &spec).await {
        Ok(()) => Ok(message(
            format!("Topic {} created successfully", name),
            StatusCode::OK,
        )),
        Err(e) => {
            error!(error = %e, topic = %name, "Failed to create topic");
            Ok(ApiError::Backend(e).into_reply())
        }
    }
}

async fn login(
    credentials: AdminCredentials,
    request: LoginRequest,
) -> Result<ApiReply, Infallible> {
    let matches = request.username.as_deref() == Some(credentials.username.as_str())
        && request.password.as_deref() == Some(credentials.password.as_str());

    if matches {
        Ok(reply::with_status(
            reply::json(&json!({ "message": "Login successful", "role": "admin" })),
            StatusCode::OK,
        ))
    } else {
        warn!("Rejected admin login");
        Ok(ApiError::InvalidCredentials.into_reply())
    }
}

async fn handle_rejection(rejection: Rejection) -> Result<ApiReply, Infallible> {
    let (status, text) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_owned())
    } else if let Some(e) = rejection.find::<warp::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_owned())
    } else {
        error!(?rejection, "Unhandled rejection");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error".to_owned(),
        )
    };

    Ok(reply::with_status(
        reply::json(&json!({ "error": text })),
        status,
    ))
}

#[cfg(test)]
mod does {
    use super::super::RelayConfig;
    use super::*;
    use async_trait::async_trait;
    use futures::future::pending;
    use lazy_static::lazy_static;
    use library::communication::implementation::memory::{MemoryLog, MemoryQueue};
    use library::communication::log::{DeliveryReceipt, LogRecord};
    use library::EmptyResult;
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use tokio::time::Instant;
    use warp::test::request;

    lazy_static! {
        static ref CREDENTIALS: AdminCredentials = AdminCredentials {
            username: "operator".into(),
            password: "hunter2".into(),
        };
    }

    fn engine(log: MemoryLog) -> Arc<RelayEngine> {
        let config = RelayConfig {
            receive_wait: Duration::from_millis(20),
            backoff: Duration::from_millis(20),
            stop_timeout: Duration::from_secs(1),
            ..Default::default()
        };

        Arc::new(RelayEngine::new(
            Arc::new(MemoryQueue::default()),
            Arc::new(log),
            config,
        ))
    }

    fn body(bytes: &[u8]) -> Value {
        serde_json::from_slice(bytes).unwrap()
    }

    #[tokio::test]
    async fn report_health() {
        let api = routes(engine(MemoryLog::default()), CREDENTIALS.clone());

        let response = request().method("GET").path("/api/health").reply(&api).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body(response.body()),
            json!({
                "status": "healthy",
                "sqs_connected": true,
                "kafka_connected": true,
                "stream_status": "stopped"
            })
        );
    }

    /// Log whose broker never answers
    struct UnresponsiveLog;

    #[async_trait]
    impl LogClient for UnresponsiveLog {
        async fn create_topic(&self, _topic: &str, _spec: &TopicSpec) -> EmptyResult {
            pending().await
        }

        async fn list_topics(&self) -> Result<Vec<String>, BoxedError> {
            pending().await
        }

        async fn send(
            &self,
            _topic: &str,
            _record: LogRecord,
        ) -> Result<DeliveryReceipt, BoxedError> {
            pending().await
        }

        async fn flush(&self, _timeout: Duration) -> EmptyResult {
            pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bound_health_checks_of_unresponsive_backends() {
        let engine = Arc::new(RelayEngine::new(
            Arc::new(MemoryQueue::default()),
            Arc::new(UnresponsiveLog),
            RelayConfig::default(),
        ));
        let api = routes(engine, CREDENTIALS.clone());

        let started = Instant::now();
        let response = request().method("GET").path("/api/health").reply(&api).await;
        let report = body(response.body());

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(report["sqs_connected"], json!(true));
        assert_eq!(report["kafka_connected"], json!(false));
        assert!(started.elapsed() < HEALTH_CHECK_TIMEOUT + Duration::from_millis(100));
    }

    #[tokio::test]
    async fn expose_metrics() {
        let api = routes(engine(MemoryLog::default()), CREDENTIALS.clone());

        let response = request().method("GET").path("/api/metrics").reply(&api).await;
        let metrics = body(response.body());

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(metrics["messages_processed"], json!(0));
        assert_eq!(metrics["queue_send_errors"], json!(0));
        assert_eq!(metrics["stream_status"], json!("stopped"));
    }

    #[tokio::test]
    async fn refuse_duplicate_start_and_stop() {
        let engine = engine(MemoryLog::default());
        let api = routes(engine.clone(), CREDENTIALS.clone());

        let start = || request().method("POST").path("/api/stream/start");
        let stop = || request().method("POST").path("/api/stream/stop");

        assert_eq!(stop().reply(&api).await.status(), StatusCode::BAD_REQUEST);

        let response = start().reply(&api).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body(response.body()),
            json!({ "message": "Stream processing started successfully" })
        );

        let response = start().reply(&api).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body(response.body()), json!({ "message": "Stream is already running" }));

        assert_eq!(stop().reply(&api).await.status(), StatusCode::OK);
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn create_and_list_topics() {
        let log = MemoryLog::default();
        let api = routes(engine(log.clone()), CREDENTIALS.clone());

        let response = request()
            .method("POST")
            .path("/api/topics")
            .json(&json!({ "name": "orders", "partitions": 6 }))
            .reply(&api)
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body(response.body()),
            json!({ "message": "Topic orders created successfully" })
        );
        assert_eq!(log.topic_spec("orders").await, Some(TopicSpec::new(6, 3)));

        let response = request().method("GET").path("/api/topics").reply(&api).await;
        assert_eq!(body(response.body()), json!({ "topics": ["orders"] }));
    }

    #[tokio::test]
    async fn require_topic_name() {
        let api = routes(engine(MemoryLog::default()), CREDENTIALS.clone());

        let response = request()
            .method("POST")
            .path("/api/topics")
            .json(&json!({ "partitions": 1 }))
            .reply(&api)
            .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body(response.body()), json!({ "error": "Topic name is required" }));
    }

    #[tokio::test]
    async fn report_topic_creation_failures() {
        let log = MemoryLog::default();
        let api = routes(engine(log.clone()), CREDENTIALS.clone());
        log.create_topic("orders", &TopicSpec::default()).await.unwrap();

        let response = request()
            .method("POST")
            .path("/api/topics")
            .json(&json!({ "name": "orders" }))
            .reply(&api)
            .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body(response.body())["error"].is_string());
    }

    #[tokio::test]
    async fn accept_configured_admin() {
        let api = routes(engine(MemoryLog::default()), CREDENTIALS.clone());

        let response = request()
            .method("POST")
            .path("/api/admin/login")
            .json(&json!({ "username": "operator", "password": "hunter2" }))
            .reply(&api)
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body(response.body()),
            json!({ "message": "Login successful", "role": "admin" })
        );
    }

    #[tokio::test]
    async fn reject_wrong_password() {
        let api = routes(engine(MemoryLog::default()), CREDENTIALS.clone());

        let response = request()
            .method("POST")
            .path("/api/admin/login")
            .json(&json!({ "username": "operator", "password": "admin" }))
            .reply(&api)
            .await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body(response.body()), json!({ "error": "Invalid credentials" }));
    }

    #[tokio::test]
    async fn answer_unknown_paths_with_json() {
        let api = routes(engine(MemoryLog::default()), CREDENTIALS.clone());

        let response = request().method("GET").path("/api/nothing").reply(&api).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body(response.body()), json!({ "error": "Not found" }));
    }
}
