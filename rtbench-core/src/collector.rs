use std::fs::{File, OpenOptions};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get, post};
use axum_server::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CollectorConfig;
use crate::error::Result;
use crate::middleware;
use crate::service::{ServiceStatus, Shutdown, Status, StatusBody};
use crate::types::TestResult;

const RESULTS_BUFFER: usize = 10;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Accepts form-encoded result records and appends them to a CSV file.
/// Ingestion drops on overload; liveness beats completeness here, the
/// tester side is the one that blocks.
pub struct CollectorService {
    listener: TcpListener,
    csv: File,
    results_rx: mpsc::Receiver<TestResult>,
    write_cancel: CancellationToken,
    state: Arc<CollectorState>,
    handle: Handle,
}

struct CollectorState {
    results: mpsc::Sender<TestResult>,
    status: ServiceStatus,
    shutdown: Shutdown,
}

impl CollectorService {
    pub fn bind(config: CollectorConfig) -> Result<Self> {
        let csv = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.csv_path)?;
        let listener = TcpListener::bind(("0.0.0.0", config.port))?;
        listener.set_nonblocking(true)?;
        let (results_tx, results_rx) = mpsc::channel(RESULTS_BUFFER);
        let handle = Handle::new();
        let state = Arc::new(CollectorState {
            results: results_tx,
            status: ServiceStatus::new_active(),
            shutdown: Shutdown::new(handle.clone()),
        });
        Ok(CollectorService {
            listener,
            csv,
            results_rx,
            write_cancel: CancellationToken::new(),
            state,
            handle,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self) -> Result<()> {
        let port = self.local_addr()?.port();
        let writer = tokio::spawn(write_results(
            self.csv,
            self.results_rx,
            self.write_cancel.clone(),
        ));

        let app = Router::new()
            .route("/", post(handle_ingest))
            .route("/__service", get(handle_status))
            .route("/__service/terminate", post(handle_terminate))
            .route("/__service/{*rest}", any(handle_unknown))
            .layer(axum::middleware::from_fn(middleware::debug_log))
            .with_state(self.state.clone());

        info!(port, "collector server is listening");
        axum_server::from_tcp(self.listener)
            .handle(self.handle)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await?;

        // Server drained; now stop the writer and let it flush and close.
        self.write_cancel.cancel();
        if let Err(err) = writer.await {
            error!(error = %err, "results writer task failed");
        }
        Ok(())
    }
}

async fn handle_ingest(
    State(state): State<Arc<CollectorState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    if content_type != Some("application/x-www-form-urlencoded") {
        return (StatusCode::UNSUPPORTED_MEDIA_TYPE, "Unsupported Content-Type").into_response();
    }
    let result: TestResult = match serde_urlencoded::from_bytes(&body) {
        Ok(result) => result,
        Err(err) => {
            debug!(error = %err, "invalid form data");
            return (StatusCode::BAD_REQUEST, "Invalid form data").into_response();
        }
    };
    if state.results.try_send(result).is_err() {
        warn!("dropping result due to full buffer");
    }
    StatusCode::OK.into_response()
}

async fn handle_status(State(state): State<Arc<CollectorState>>) -> Json<StatusBody> {
    let status = match state.status.load() {
        Status::Stopping => "stopping",
        _ => "running",
    };
    Json(StatusBody {
        status,
        duration: None,
    })
}

async fn handle_terminate(State(state): State<Arc<CollectorState>>) -> StatusCode {
    state.status.set_stopping();
    state.shutdown.trigger("collector", None);
    StatusCode::OK
}

async fn handle_unknown() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Single consumer of the intake channel. Rows become durable on the flush
/// tick even when arrival is slow; shutdown drains whatever is buffered
/// before the file closes.
async fn write_results(
    csv: File,
    mut results: mpsc::Receiver<TestResult>,
    cancel: CancellationToken,
) {
    let mut writer = csv::Writer::from_writer(csv);
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                results.close();
                while let Some(result) = results.recv().await {
                    write_row(&mut writer, &result);
                }
                break;
            }
            received = results.recv() => match received {
                Some(result) => write_row(&mut writer, &result),
                None => break,
            },
            _ = ticker.tick() => {
                if let Err(err) = writer.flush() {
                    error!(error = %err, "failed to flush results file");
                }
            }
        }
    }
    if let Err(err) = writer.flush() {
        error!(error = %err, "failed to flush results file");
    }
    debug!("results writer stopped");
}

fn write_row(writer: &mut csv::Writer<File>, result: &TestResult) {
    if let Err(err) = writer.write_record(result.as_row()) {
        error!(error = %err, "failed to write result");
    }
}
