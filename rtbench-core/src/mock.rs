use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get, post};
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use chrono::{DateTime, Local};
use futures::stream;
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::MockConfig;
use crate::error::Result;
use crate::middleware;
use crate::service::{self, ServiceStatus, Shutdown, Status, StatusBody};
use crate::tls;
use crate::types::Millis;

/// Latency band a delay is drawn from, uniformly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct Band {
    #[serde(default)]
    pub min: Millis,
    #[serde(default)]
    pub max: Millis,
}

impl Band {
    fn is_valid(&self) -> bool {
        !self.min.is_negative() && self.min <= self.max
    }

    fn draw(&self, rng: &mut impl Rng) -> Duration {
        let span = self.max.as_millis() - self.min.as_millis();
        let mut delay = self.min.to_std();
        if span > 0 {
            delay += Duration::from_millis(rng.random_range(0..span as u64));
        }
        delay
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct ResponseParams {
    #[serde(default, rename = "headerLatency")]
    pub header_latency: Band,
    #[serde(default)]
    pub duration: Band,
}

/// Configuration of one mock run, POSTed to `/__mock`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct MockParams {
    #[serde(default)]
    pub duration: Millis,
    #[serde(default)]
    pub response: ResponseParams,
}

impl MockParams {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.duration.is_negative() {
            return Err("Invalid service duration: must be >= 0".to_string());
        }
        if !self.response.header_latency.is_valid() {
            return Err("Invalid header latency: min must be >= 0 and <= max".to_string());
        }
        if !self.response.duration.is_valid() {
            return Err("Invalid response duration: min must be >= 0 and <= max".to_string());
        }
        Ok(())
    }
}

/// Synthesizes responses with configurable header-phase and body-phase
/// delays so the tester can be exercised without a real upstream.
pub struct MockService {
    listener: TcpListener,
    tls: Option<RustlsConfig>,
    state: Arc<MockState>,
    handle: Handle,
}

struct MockState {
    status: ServiceStatus,
    shutdown: Shutdown,
    run: RwLock<Option<MockRun>>,
}

struct MockRun {
    params: MockParams,
    started_at: DateTime<Local>,
    running_until: DateTime<Local>,
}

impl MockService {
    pub fn bind(config: MockConfig) -> Result<Self> {
        let tls = match (&config.cert, &config.key) {
            (Some(cert), Some(key)) => {
                let server = tls::server_config(cert, key, config.cas.as_deref())?;
                Some(RustlsConfig::from_config(Arc::new(server)))
            }
            _ => None,
        };
        let listener = TcpListener::bind(("0.0.0.0", config.port))?;
        listener.set_nonblocking(true)?;
        let handle = Handle::new();
        let state = Arc::new(MockState {
            status: ServiceStatus::new(),
            shutdown: Shutdown::new(handle.clone()),
            run: RwLock::new(None),
        });
        Ok(MockService {
            listener,
            tls,
            state,
            handle,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self) -> Result<()> {
        let app = Router::new()
            .route("/__mock", post(handle_mock))
            .route("/__service", get(handle_status))
            .route("/__service/terminate", post(handle_terminate))
            .route("/__service/{*rest}", any(handle_unknown))
            .fallback(handle_traffic)
            .layer(axum::middleware::from_fn(middleware::debug_log))
            .with_state(self.state.clone());

        info!(
            port = self.local_addr()?.port(),
            tls = if self.tls.is_some() { "enabled" } else { "disabled" },
            "mock server is listening"
        );
        let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
        match self.tls {
            Some(tls) => {
                axum_server::from_tcp_rustls(self.listener, tls)
                    .handle(self.handle)
                    .serve(make_service)
                    .await?;
            }
            None => {
                axum_server::from_tcp(self.listener)
                    .handle(self.handle)
                    .serve(make_service)
                    .await?;
            }
        }
        Ok(())
    }
}

async fn handle_mock(State(state): State<Arc<MockState>>, body: Bytes) -> Response {
    let params: MockParams = match serde_json::from_slice(&body) {
        Ok(params) => params,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, format!("Malformed JSON: {err}")).into_response();
        }
    };
    if let Err(msg) = params.validate() {
        return (StatusCode::BAD_REQUEST, msg).into_response();
    }
    info!(
        duration = %params.duration,
        header_latency.min = %params.response.header_latency.min,
        header_latency.max = %params.response.header_latency.max,
        response_duration.min = %params.response.duration.min,
        response_duration.max = %params.response.duration.max,
        "loaded mock config"
    );

    if !state.status.try_activate() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Mock service is already running.")
            .into_response();
    }
    let started_at = Local::now();
    let running_until = started_at + chrono::Duration::milliseconds(params.duration.as_millis());
    *state.run.write().unwrap_or_else(|err| err.into_inner()) = Some(MockRun {
        params,
        started_at,
        running_until,
    });

    let run_duration = params.duration.to_std();
    let state_for_deadline = state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(run_duration).await;
        let started_at = state_for_deadline
            .run
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .take()
            .map(|run| run.started_at);
        state_for_deadline.status.deactivate();
        info!(started_at = ?started_at, "mock service has stopped");
    });

    info!(finishes_at = %running_until, "mock service has started");
    StatusCode::OK.into_response()
}

/// The traffic path: any method, any route not claimed by the control
/// plane. Headers leave after the header delay; the single newline body
/// byte follows after the residual response delay.
async fn handle_traffic(State(state): State<Arc<MockState>>) -> Response {
    if state.status.load() != Status::Active {
        return (StatusCode::SERVICE_UNAVAILABLE, "Service has not started.").into_response();
    }
    let Some(params) = state
        .run
        .read()
        .unwrap_or_else(|err| err.into_inner())
        .as_ref()
        .map(|run| run.params)
    else {
        return (StatusCode::SERVICE_UNAVAILABLE, "Service has not started.").into_response();
    };

    let (head_delay, resp_delay) = {
        let mut rng = rand::rng();
        (
            params.response.header_latency.draw(&mut rng),
            params.response.duration.draw(&mut rng),
        )
    };

    if !head_delay.is_zero() {
        debug!(duration = ?head_delay, "applying header delay");
        tokio::time::sleep(head_delay).await;
    }

    let body = if resp_delay > head_delay {
        let residual = resp_delay - head_delay;
        debug!(duration = ?residual, "applying response delay");
        Body::from_stream(stream::once(async move {
            tokio::time::sleep(residual).await;
            Ok::<_, std::convert::Infallible>(Bytes::from_static(b"\n"))
        }))
    } else {
        Body::empty()
    };

    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

async fn handle_status(State(state): State<Arc<MockState>>) -> Json<StatusBody> {
    let body = match state.status.load() {
        Status::Ready => StatusBody {
            status: "ready",
            duration: None,
        },
        Status::Active => {
            let remaining = state
                .run
                .read()
                .unwrap_or_else(|err| err.into_inner())
                .as_ref()
                .map(|run| service::remaining(run.running_until));
            StatusBody {
                status: "running",
                duration: remaining,
            }
        }
        Status::Stopping => StatusBody {
            status: "stopping",
            duration: None,
        },
    };
    Json(body)
}

async fn handle_terminate(State(state): State<Arc<MockState>>) -> StatusCode {
    state.status.set_stopping();
    state.shutdown.trigger("mock", None);
    StatusCode::OK
}

async fn handle_unknown() -> StatusCode {
    StatusCode::NOT_FOUND
}
