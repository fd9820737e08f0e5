mod params;
mod workers;

pub use params::{Choice, Headers, Method, Pace, RequestTemplate, Schema, TestParams, Version};

use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get, post};
use axum_server::Handle;
use chrono::{DateTime, Local};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::TesterConfig;
use crate::error::Result;
use crate::middleware;
use crate::service::{self, ServiceStatus, Shutdown, Status, StatusBody};
use crate::tls;
use crate::types::TestResult;

const IDS_BUFFER: usize = 100;
const RESULTS_BUFFER_PER_TESTER: usize = 20;

/// The load-generating service. `bind` acquires every startup resource
/// (TLS material, listener) so failures surface before `serve` runs the
/// control plane.
pub struct TesterService {
    listener: TcpListener,
    state: Arc<TesterState>,
    handle: Handle,
}

struct TesterState {
    config: TesterConfig,
    client_tls: rustls::ClientConfig,
    status: ServiceStatus,
    shutdown: Shutdown,
    run: RwLock<Option<RunHandle>>,
}

/// Bookkeeping for the run currently in flight.
struct RunHandle {
    cancel: CancellationToken,
    started_at: DateTime<Local>,
    running_until: DateTime<Local>,
}

impl TesterService {
    pub fn bind(config: TesterConfig) -> Result<Self> {
        let client_tls = tls::client_config(
            config.cas.as_deref(),
            config.cert.as_deref(),
            config.key.as_deref(),
            config.skip_name_check,
        )?;
        let listener = TcpListener::bind(("0.0.0.0", config.port))?;
        listener.set_nonblocking(true)?;
        let handle = Handle::new();
        let state = Arc::new(TesterState {
            config,
            client_tls,
            status: ServiceStatus::new(),
            shutdown: Shutdown::new(handle.clone()),
            run: RwLock::new(None),
        });
        Ok(TesterService {
            listener,
            state,
            handle,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self) -> Result<()> {
        let app = Router::new()
            .route("/test", post(handle_test))
            .route("/__service", get(handle_status))
            .route("/__service/terminate", post(handle_terminate))
            .route("/__service/{*rest}", any(handle_unknown))
            .layer(axum::middleware::from_fn(middleware::debug_log))
            .with_state(self.state.clone());

        info!(port = self.local_addr()?.port(), "tester service is listening");
        axum_server::from_tcp(self.listener)
            .handle(self.handle)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await?;
        Ok(())
    }
}

async fn handle_test(State(state): State<Arc<TesterState>>, body: Bytes) -> Response {
    let mut params: TestParams = match serde_json::from_slice(&body) {
        Ok(params) => params,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, format!("Malformed JSON: {err}")).into_response();
        }
    };
    if let Err(msg) = params.validate() {
        return (StatusCode::BAD_REQUEST, msg).into_response();
    }
    info!(
        name = %params.name,
        duration = %params.duration,
        pace = %params.pace,
        parallel_testers = params.parallel_testers,
        "loaded test config"
    );

    if !state.status.try_activate() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "Service is already running. Please try again later.",
        )
            .into_response();
    }
    start_run(state, params);
    StatusCode::OK.into_response()
}

async fn handle_status(State(state): State<Arc<TesterState>>) -> Json<StatusBody> {
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
                status: "testing",
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

async fn handle_terminate(State(state): State<Arc<TesterState>>) -> StatusCode {
    let cancel = state
        .run
        .read()
        .unwrap_or_else(|err| err.into_inner())
        .as_ref()
        .map(|run| run.cancel.clone());
    state.status.set_stopping();
    state.shutdown.trigger("tester", cancel);
    StatusCode::OK
}

async fn handle_unknown() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Launches the three run subsystems: id generator, result sender, and the
/// worker fleet with its supervisor. Admission has already happened.
fn start_run(state: Arc<TesterState>, params: TestParams) {
    let params = Arc::new(params);
    let started_at = Local::now();
    let running_until = started_at + chrono::Duration::milliseconds(params.duration.as_millis());
    let cancel = CancellationToken::new();
    *state.run.write().unwrap_or_else(|err| err.into_inner()) = Some(RunHandle {
        cancel: cancel.clone(),
        started_at,
        running_until,
    });

    let capacity = usize::from(params.parallel_testers) * RESULTS_BUFFER_PER_TESTER;
    let (results_tx, results_rx) = mpsc::channel(capacity);
    let ids = start_id_gen(cancel.clone());
    start_sender(state.config.collector.clone(), results_rx, capacity);
    start_deadline(cancel.clone(), params.duration.to_std());

    tokio::spawn(workers::run_testers(
        state,
        params,
        cancel,
        ids,
        results_tx,
    ));
    info!(finishes_at = %running_until, "tester service has started");
}

/// Cancels the run context when the configured duration elapses.
fn start_deadline(cancel: CancellationToken, duration: Duration) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => cancel.cancel(),
        }
    });
}

/// Dedicated UUID supply: decouples id generation from request issuance and
/// keeps the worker loop uniform. The shared receiver is the only source of
/// correlation ids.
fn start_id_gen(cancel: CancellationToken) -> Arc<Mutex<mpsc::Receiver<Uuid>>> {
    let (tx, rx) = mpsc::channel(IDS_BUFFER);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                permit = tx.reserve() => match permit {
                    Ok(permit) => permit.send(Uuid::new_v4()),
                    Err(_) => break,
                },
            }
        }
    });
    debug!("id generator started");
    Arc::new(Mutex::new(rx))
}

/// Forwards each record to the collector as a form-encoded POST. Failures
/// are logged and skipped; persistence hiccups must never stall workers.
fn start_sender(collector: String, mut results: mpsc::Receiver<TestResult>, capacity: usize) {
    tokio::spawn(async move {
        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(1))
            .build()
        {
            Ok(client) => client,
            Err(err) => {
                error!(error = %err, "failed to build collector client");
                return;
            }
        };
        let url = format!("http://{collector}/");
        while let Some(result) = results.recv().await {
            let queued = results.len();
            if queued > capacity / 2 {
                warn!(
                    percentage = queued * 100 / capacity,
                    "results buffer saturation"
                );
            }
            if let Err(err) = client.post(&url).form(&result).send().await {
                error!(error = %err, "failed to deliver result to collector");
            }
        }
        debug!("result sender stopped");
    });
    debug!("result sender started");
}
