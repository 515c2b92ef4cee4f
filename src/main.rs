use portkey_callback::{
    ExecutionContext, GatewayConfig, GraphQLRequest, HttpCallbackExecutor, InMemoryPubSub,
    operation, webhook,
};

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use futures::{StreamExt, stream};
use http::HeaderMap;
use http_body_util::{BodyExt, Full, StreamBody, combinators::UnsyncBoxBody};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::task::TaskTracker;
use tracing_subscriber::EnvFilter;

type ResponseBody = UnsyncBoxBody<Bytes, hyper::Error>;

#[derive(Parser, Debug)]
#[command(name = "portkey-callback", about = "Delegates GraphQL subscriptions over HTTP callbacks")]
struct Cli {
    /// Gateway config file
    #[arg(long, env = "PORTKEY_CONFIG", default_value = "gateway.yaml")]
    config: PathBuf,
    #[arg(long)]
    port: Option<u16>,
    /// Public URL subgraphs call back to
    #[arg(long)]
    public_url: Option<String>,
    /// Heartbeat interval in milliseconds
    #[arg(long)]
    heartbeat_interval: Option<u64>,
}

struct AppState {
    executor: HttpCallbackExecutor,
    pubsub: Arc<InMemoryPubSub>,
    callback_path: String,
    tasks: TaskTracker,
}

// Create a response body from a string
fn full<T: Into<Bytes>>(value: T) -> ResponseBody {
    Full::new(value.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn graphql_error(status: StatusCode, message: impl Into<String>) -> Response<ResponseBody> {
    let error_json = json!({ "errors": [{ "message": message.into() }] }).to_string();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(full(error_json))
        .unwrap_or_else(|_| internal_server_error())
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<ResponseBody>, Infallible> {
    let path = req.uri().path().to_string();

    let result = match (req.method(), path.as_str()) {
        (&Method::POST, "/graphql") => handle_subscription(req, &state).await,

        (&Method::POST, p) if webhook::callback_id(&state.callback_path, p).is_some() => {
            handle_callback(req, &state, &path).await
        }

        (&Method::OPTIONS, _) => Response::builder()
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "POST, OPTIONS")
            .header(
                "Access-Control-Allow-Headers",
                "Content-Type, Authorization",
            )
            .body(full(""))
            .unwrap_or_else(|_| internal_server_error()),

        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header("Access-Control-Allow-Origin", "*")
            .body(full("Not Found"))
            .unwrap_or_else(|_| internal_server_error()),
    };

    Ok(result)
}

async fn handle_subscription(req: Request<Incoming>, state: &AppState) -> Response<ResponseBody> {
    let auth_headers = extract_auth_headers(req.headers());

    let body_bytes = match req.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return graphql_error(StatusCode::BAD_REQUEST, "Failed to read request body"),
    };

    let graphql_req = match serde_json::from_slice::<GraphQLRequest>(&body_bytes) {
        Ok(graphql_req) => graphql_req,
        Err(e) => {
            return graphql_error(StatusCode::BAD_REQUEST, format!("Invalid JSON request: {}", e));
        }
    };

    match operation::is_subscription(&graphql_req.query, graphql_req.operation_name.as_deref()) {
        Ok(true) => {}
        Ok(false) => {
            return graphql_error(
                StatusCode::BAD_REQUEST,
                "Only subscription operations are delegated over callbacks",
            );
        }
        Err(e) => return graphql_error(StatusCode::BAD_REQUEST, e),
    }

    let context = ExecutionContext::new(auth_headers, state.tasks.clone());
    let results = state.executor.subscribe(graphql_req, &context);
    tracing::info!(subscription_id = %results.subscription_id(), "subscription delegated");

    let events = results
        .map(|item| {
            let payload = match item {
                Ok(value) => value,
                Err(e) => json!({ "errors": e.to_graphql_errors() }),
            };
            Ok::<_, hyper::Error>(Frame::data(Bytes::from(format!(
                "event: next\ndata: {}\n\n",
                payload
            ))))
        })
        .chain(stream::once(async {
            Ok(Frame::data(Bytes::from_static(b"event: complete\ndata:\n\n")))
        }));

    Response::builder()
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Access-Control-Allow-Origin", "*")
        .body(StreamBody::new(events).boxed_unsync())
        .unwrap_or_else(|_| internal_server_error())
}

async fn handle_callback(req: Request<Incoming>, state: &AppState, path: &str) -> Response<ResponseBody> {
    let body_bytes = match req.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => {
            return Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(full("Failed to read request body"))
                .unwrap_or_else(|_| internal_server_error());
        }
    };

    let status = webhook::accept_callback(
        state.pubsub.as_ref(),
        &state.callback_path,
        path,
        &body_bytes,
    );
    Response::builder()
        .status(status)
        .body(full(""))
        .unwrap_or_else(|_| internal_server_error())
}

// Create a standard internal server error response
fn internal_server_error() -> Response<ResponseBody> {
    let mut response = Response::new(full("Internal Server Error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

// Headers the subgraph header templates may interpolate
fn extract_auth_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut auth_headers = HashMap::new();

    for header_name in ["authorization", "x-api-key", "x-token"].iter() {
        if let Some(header_value) = headers.get(*header_name) {
            if let Ok(value_str) = header_value.to_str() {
                auth_headers.insert(header_name.to_string(), value_str.to_string());
            }
        }
    }

    auth_headers
}

#[derive(Clone)]
// An Executor that uses the tokio runtime.
pub struct TokioExecutor;

impl<F> hyper::rt::Executor<F> for TokioExecutor
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        tokio::task::spawn(fut);
    }
}

fn load_config(cli: &Cli) -> Result<GatewayConfig, Box<dyn std::error::Error>> {
    let mut config = if cli.config.exists() {
        GatewayConfig::load(&cli.config)?
    } else {
        tracing::warn!(path = %cli.config.display(), "config file not found, using defaults");
        GatewayConfig::default()
    };

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(public_url) = &cli.public_url {
        config.subscriptions.callback.public_url = public_url.clone();
    }
    if let Some(heartbeat_interval) = cli.heartbeat_interval {
        config.subscriptions.callback.heartbeat_interval = heartbeat_interval;
    }
    config.subscriptions.callback.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let callback = config.subscriptions.callback.clone();

    let pubsub = Arc::new(InMemoryPubSub::new());
    let executor =
        HttpCallbackExecutor::new(config.subgraph.routing_url.clone(), callback.clone(), pubsub.clone());
    let tasks = TaskTracker::new();

    let state = Arc::new(AppState {
        executor,
        pubsub,
        callback_path: callback.path.clone(),
        tasks: tasks.clone(),
    });

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, subgraph = %config.subgraph.name, location = %state.executor.location(), "callback gateway starting");
    tracing::info!(public_url = %callback.public_url, path = %callback.path, heartbeat_interval = callback.heartbeat_interval, "accepting subscription callbacks");

    loop {
        let (stream, _addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let io = TokioIo::new(stream);

        let state_clone = Arc::clone(&state);

        let executor = TokioExecutor;

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let state = state_clone.clone();
                handle_request(req, state)
            });

            match hyper_util::server::conn::auto::Builder::new(executor)
                .serve_connection(io, service)
                .await
            {
                Ok(_) => tracing::debug!("connection closed"),
                Err(e) => tracing::warn!(error = %e, "error processing connection"),
            }
        });
    }

    tracing::info!("shutting down");
    state.executor.dispose();
    tasks.close();
    tasks.wait().await;
    Ok(())
}
