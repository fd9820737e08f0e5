use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Local;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::TesterState;
use super::params::{Choice, RequestTemplate, Schema, TestParams};
use crate::error::{Error, Result};
use crate::types::{Millis, TestResult};

const SPINUP_FACTOR: u32 = 4;
const SPINUP_MAX: Duration = Duration::from_secs(10);

/// Spawns the worker fleet with staggered starts, waits it out, and resets
/// the service to ready. Dropping the last result sender closes the channel
/// behind the sender task.
pub(super) async fn run_testers(
    state: Arc<TesterState>,
    params: Arc<TestParams>,
    cancel: CancellationToken,
    ids: Arc<Mutex<mpsc::Receiver<Uuid>>>,
    results: mpsc::Sender<TestResult>,
) {
    let total_requests = Arc::new(AtomicU64::new(0));
    debug!(
        parallel_testers = params.parallel_testers,
        target_interval = %params.pace.interval(),
        "starting testers"
    );

    let spinup = spinup_window(params.duration.to_std(), params.parallel_testers);

    let mut fleet = JoinSet::new();
    for num in 0..params.parallel_testers {
        if !spinup.is_zero() {
            let jitter = rand::rng().random_range(Duration::ZERO..spinup);
            tokio::time::sleep(jitter).await;
        }
        fleet.spawn(run_worker(Worker {
            num,
            state: state.clone(),
            params: params.clone(),
            cancel: cancel.clone(),
            ids: ids.clone(),
            results: results.clone(),
            total_requests: total_requests.clone(),
        }));
    }
    drop(results);

    while let Some(joined) = fleet.join_next().await {
        if let Err(err) = joined {
            error!(error = %err, "tester task failed");
        }
    }

    let started_at = state
        .run
        .write()
        .unwrap_or_else(|err| err.into_inner())
        .take()
        .map(|run| run.started_at);
    state.status.deactivate();
    info!(started_at = ?started_at, "tester service has stopped");
}

/// Stagger window applied before each worker launch:
/// `min(duration/4, 10s)` spread across the fleet.
fn spinup_window(duration: Duration, testers: u8) -> Duration {
    let spinup = (duration / SPINUP_FACTOR).min(SPINUP_MAX);
    spinup / u32::from(testers.max(1))
}

struct Worker {
    num: u8,
    state: Arc<TesterState>,
    params: Arc<TestParams>,
    cancel: CancellationToken,
    ids: Arc<Mutex<mpsc::Receiver<Uuid>>>,
    results: mpsc::Sender<TestResult>,
    total_requests: Arc<AtomicU64>,
}

async fn run_worker(w: Worker) {
    debug!(num = w.num, "starting tester");
    let client = match build_client(&w) {
        Ok(client) => client,
        Err(err) => {
            error!(error = %err, num = w.num, "failed to build HTTP client");
            return;
        }
    };
    // Each worker's personal interval is inflated by the fleet size so the
    // aggregate rate matches the configured pace.
    let interval =
        w.params.pace.interval().to_std() * u32::from(w.params.parallel_testers);
    let mut rng = SmallRng::seed_from_u64(clock_seed());
    let mut local_n: usize = 0;

    loop {
        if w.cancel.is_cancelled() {
            break;
        }
        let global_n = w.total_requests.fetch_add(1, Ordering::Relaxed) + 1;
        local_n += 1;
        let template = pick_template(&w.params.requests, w.params.choice, local_n, &mut rng);

        let id = {
            let mut ids = w.ids.lock().await;
            tokio::select! {
                _ = w.cancel.cancelled() => break,
                id = ids.recv() => match id {
                    Some(id) => id,
                    None => break,
                },
            }
        };

        let url = request_url(w.params.req_schema, &w.state.config.target, &template.path);
        let request = match build_request(&client, template, &w.params, &id, &url) {
            Ok(request) => request,
            Err(err) => {
                error!(error = %err, url = %url, "failed to build request");
                continue;
            }
        };

        let start = Local::now();
        let issued = tokio::time::Instant::now();
        debug!(
            client.num = w.num,
            request.num = global_n,
            request.path = %template.path,
            "request"
        );

        let mut resp_code = String::new();
        let mut timed_out = false;
        match round_trip(request).await {
            Ok(code) => resp_code = code.to_string(),
            Err(err) if err.is_timeout() => timed_out = true,
            Err(err) => error!(error = %err, url = %url, "request failed"),
        }
        let elapsed = truncate_ms(issued.elapsed());

        let result = TestResult {
            req_time: TestResult::format_req_time(start),
            test_name: w.params.name.clone(),
            req_id: id.to_string(),
            req_num: global_n.to_string(),
            req_method: template.method.as_str().to_string(),
            req_path: template.path.clone(),
            resp_code,
            round_duration: Millis::from_std(elapsed).to_string(),
            timed_out: timed_out.to_string(),
        };

        if elapsed < interval {
            tokio::select! {
                _ = w.cancel.cancelled() => {}
                _ = tokio::time::sleep(interval - elapsed) => {}
            }
        }
        // Deliberate back-pressure: a full channel throttles the test
        // instead of losing samples we already paid for.
        if w.results.send(result).await.is_err() {
            break;
        }
    }
    debug!(num = w.num, "tester stopped");
}

/// Issues the request and drains the body so the round duration covers the
/// complete response and the connection can be reused.
async fn round_trip(request: reqwest::RequestBuilder) -> reqwest::Result<u16> {
    let response = request.send().await?;
    let code = response.status().as_u16();
    response.bytes().await?;
    Ok(code)
}

fn build_client(w: &Worker) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(usize::from(w.params.parallel_testers))
        .tcp_nodelay(true)
        .no_proxy();
    if w.params.req_schema == Schema::Https {
        builder = builder.use_preconfigured_tls(w.state.client_tls.clone());
    }
    Ok(builder.build()?)
}

fn build_request(
    client: &reqwest::Client,
    template: &RequestTemplate,
    params: &TestParams,
    id: &Uuid,
    url: &str,
) -> Result<reqwest::RequestBuilder> {
    let invalid = |err: &dyn std::fmt::Display| Error::InvalidInput(format!("invalid header: {err}"));
    let mut headers = HeaderMap::new();
    for (name, values) in template.header.iter() {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(&e))?;
        for value in values {
            headers.append(name.clone(), HeaderValue::from_str(value).map_err(|e| invalid(&e))?);
        }
    }
    headers.append(
        HeaderName::from_bytes(params.req_id_header.as_bytes()).map_err(|e| invalid(&e))?,
        HeaderValue::from_str(&id.to_string()).map_err(|e| invalid(&e))?,
    );

    let mut request = client
        .request(template.method.into(), url)
        .headers(headers)
        .body(template.body.clone());
    if !params.timeout.is_zero() {
        request = request.timeout(params.timeout.to_std());
    }
    Ok(request)
}

fn pick_template<'a>(
    requests: &'a [RequestTemplate],
    choice: Choice,
    local_n: usize,
    rng: &mut SmallRng,
) -> &'a RequestTemplate {
    match requests {
        [single] => single,
        _ => match choice {
            Choice::RoundRobin => &requests[local_n % requests.len()],
            Choice::Random => &requests[rng.random_range(0..requests.len())],
        },
    }
}

fn request_url(schema: Schema, target: &str, path: &str) -> String {
    if path.starts_with('/') {
        format!("{schema}://{target}{path}")
    } else {
        format!("{schema}://{target}/{path}")
    }
}

fn truncate_ms(elapsed: Duration) -> Duration {
    Duration::from_millis(elapsed.as_millis() as u64)
}

fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tester::params::Method;

    fn template(path: &str) -> RequestTemplate {
        RequestTemplate {
            method: Method::Get,
            path: path.to_string(),
            header: Default::default(),
            body: String::new(),
        }
    }

    #[test]
    fn spinup_is_a_quarter_of_short_runs() {
        let window = spinup_window(Duration::from_secs(2), 1);
        assert_eq!(window, Duration::from_millis(500));
    }

    #[test]
    fn spinup_caps_at_ten_seconds() {
        let window = spinup_window(Duration::from_secs(3600), 1);
        assert_eq!(window, Duration::from_secs(10));
        let window = spinup_window(Duration::from_secs(3600), 10);
        assert_eq!(window, Duration::from_secs(1));
    }

    #[test]
    fn round_robin_alternates_from_the_first_pick() {
        let requests = vec![template("/a"), template("/b")];
        let mut rng = SmallRng::seed_from_u64(1);
        // the loop increments local_n before picking, so the sequence
        // starts at index 1
        let picks: Vec<&str> = (1..=6)
            .map(|n| pick_template(&requests, Choice::RoundRobin, n, &mut rng).path.as_str())
            .collect();
        assert_eq!(picks, ["/b", "/a", "/b", "/a", "/b", "/a"]);
    }

    #[test]
    fn single_template_ignores_choice() {
        let requests = vec![template("/only")];
        let mut rng = SmallRng::seed_from_u64(1);
        for n in 1..=4 {
            assert_eq!(
                pick_template(&requests, Choice::Random, n, &mut rng).path,
                "/only"
            );
        }
    }

    #[test]
    fn random_picks_stay_in_bounds() {
        let requests = vec![template("/a"), template("/b"), template("/c")];
        let mut rng = SmallRng::seed_from_u64(7);
        for n in 1..=100 {
            let picked = pick_template(&requests, Choice::Random, n, &mut rng);
            assert!(requests.iter().any(|r| r.path == picked.path));
        }
    }

    #[test]
    fn urls_join_schema_target_and_path() {
        assert_eq!(
            request_url(Schema::Http, "localhost:8080", "/x"),
            "http://localhost:8080/x"
        );
        assert_eq!(
            request_url(Schema::Https, "localhost:8443", "x"),
            "https://localhost:8443/x"
        );
    }
}
