use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, Mutex},
};
use tracing::{debug, info, warn};

use agent_common::{
    portal::{
        apply_portal_update, build_portal_view, validate_portal_update, CAPTIVE_PATHS,
        PORTAL_HTML, PROVISIONING_AP_SSID,
    },
    status::{
        cleared_frame, indicator_colors, no_url_placeholder, provisioning_frame, BLINK_INTERVAL_MS,
        STATUS_ERROR,
    },
    AgentConfig, Frame, NetworkConfig, PortalSubmission, PortalUpdate, SleepPlan,
};

const MAX_STATUS_BODY: usize = 1024;
const STATUS_TIMEOUT: Duration = Duration::from_secs(15);
const PORTAL_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Clone)]
struct AgentStore {
    config_path: Arc<PathBuf>,
    wifi_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Clone)]
struct PortalState {
    config: AgentConfig,
    network: NetworkConfig,
    events: mpsc::Sender<PortalEvent>,
}

#[derive(Debug)]
enum PortalEvent {
    Submitted(PortalSubmission),
    RestartRequested,
}

/// Stand-in for the two WS2812 pixels; frames go to the log.
#[derive(Clone, Default)]
struct ConsoleStrip {
    shown: Arc<Mutex<Option<Frame>>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct SavedResponse {
    saved: bool,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AgentStore::new();
    let strip = ConsoleStrip::default();
    let client = build_status_client()?;
    let portal_addr = portal_addr();

    // The button is only "held" on the first boot of the process.
    let mut force_portal = std::env::var("STATUS_AGENT_PORTAL")
        .map(|value| value == "1")
        .unwrap_or(false);

    loop {
        let outcome = run_cycle(&store, &strip, &client, portal_addr, force_portal).await?;
        force_portal = false;

        let Some(plan) = outcome else {
            info!("restarting cycle");
            continue;
        };

        info!("Done. Going to sleep!");
        info!("{}", plan.as_micros());
        match plan {
            SleepPlan::Timed(duration) => tokio::time::sleep(duration).await,
            SleepPlan::Indefinite => {
                info!("no refresh interval; waiting for ctrl-c");
                tokio::signal::ctrl_c().await?;
                return Ok(());
            }
        }
    }
}

/// One boot-to-sleep pass. `None` means the device would have restarted.
async fn run_cycle(
    store: &AgentStore,
    strip: &ConsoleStrip,
    client: &reqwest::Client,
    portal_addr: SocketAddr,
    force_portal: bool,
) -> anyhow::Result<Option<SleepPlan>> {
    let config = load_config(store).await;
    let network = store.load_network_config().await.unwrap_or_else(|err| {
        warn!("failed to load wifi credentials from store: {err:#}");
        None
    });
    let network = network.unwrap_or_default();

    let needs_portal = if force_portal {
        info!("provisioning forced by STATUS_AGENT_PORTAL");
        true
    } else if !network.has_station_credentials() {
        warn!("wifi credentials missing; entering provisioning mode");
        true
    } else {
        info!("wifi connected to `{}` (simulated)", network.wifi_ssid);
        false
    };

    let submission = if needs_portal {
        match run_portal(strip, portal_addr, &config, &network).await? {
            Some(submission) => Some(submission),
            None => return Ok(None),
        }
    } else {
        None
    };

    info!("connected...");

    let active = submission
        .as_ref()
        .map(|submission| &submission.config)
        .unwrap_or(&config);

    strip.show(cleared_frame()).await;

    let status1 = poll_endpoint(client, 1, &active.url1).await;
    info!("{status1}");
    let status2 = poll_endpoint(client, 2, &active.url2).await;
    info!("{status2}");

    strip.show(indicator_colors(&status1, &status2)).await;

    if let Some(submission) = &submission {
        persist_submission(store, submission).await;
    }

    Ok(Some(active.sleep_plan()))
}

async fn load_config(store: &AgentStore) -> AgentConfig {
    let config = match store.load_agent_config().await {
        Ok(Some(config)) => config,
        Ok(None) => {
            info!("No config found");
            return AgentConfig::default();
        }
        Err(err) => {
            warn!("Failed to read config, using default configuration: {err:#}");
            AgentConfig::default()
        }
    };

    info!("Saved URL1: {}", config.url1);
    info!("Saved URL2: {}", config.url2);
    info!("Refresh: {}", config.refresh);
    config
}

async fn persist_submission(store: &AgentStore, submission: &PortalSubmission) {
    if submission.config_changed {
        info!("saving config");
        if let Err(err) = store.save_agent_config(&submission.config).await {
            warn!("Failed to write config: {err:#}");
        }
    }

    if submission.network_changed {
        if let Err(err) = store.save_network_config(&submission.network).await {
            warn!("failed to persist wifi credentials: {err:#}");
        }
    }
}

fn portal_addr() -> SocketAddr {
    let port = std::env::var("STATUS_AGENT_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    SocketAddr::from(([0, 0, 0, 0], port))
}

async fn run_portal(
    strip: &ConsoleStrip,
    addr: SocketAddr,
    config: &AgentConfig,
    network: &NetworkConfig,
) -> anyhow::Result<Option<PortalSubmission>> {
    let (events_tx, mut events_rx) = mpsc::channel(1);
    let state = PortalState {
        config: config.clone(),
        network: network.clone(),
        events: events_tx,
    };

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind provisioning portal at {addr}"))?;

    info!("Entered config mode");
    info!("http://{addr}");
    info!("{PROVISIONING_AP_SSID}");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, portal_router(state))
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
    });
    let blink = spawn_blink_loop(strip.clone());

    let event = tokio::time::timeout(PORTAL_TIMEOUT, events_rx.recv()).await;

    blink.abort();
    let _ = shutdown_tx.send(());
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("provisioning portal server error: {err}"),
        Err(err) => warn!("provisioning portal task failed: {err}"),
    }
    strip.show(cleared_frame()).await;

    match event {
        Ok(Some(PortalEvent::Submitted(submission))) => {
            info!("wifi connected to `{}` (simulated)", submission.network.wifi_ssid);
            Ok(Some(submission))
        }
        Ok(Some(PortalEvent::RestartRequested)) => Ok(None),
        Ok(None) => Err(anyhow!("provisioning portal closed without a submission")),
        Err(_) => {
            warn!("failed to connect and hit timeout");
            Ok(None)
        }
    }
}

fn portal_router(state: PortalState) -> Router {
    let mut router = Router::new();
    for path in CAPTIVE_PATHS {
        router = router.route(path, get(handle_portal_page));
    }

    router
        .route(
            "/api/config",
            get(handle_get_config).put(handle_put_config),
        )
        .route("/api/restart", post(handle_restart))
        .with_state(state)
}

fn spawn_blink_loop(strip: ConsoleStrip) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        let mut interval = tokio::time::interval(Duration::from_millis(BLINK_INTERVAL_MS));
        loop {
            interval.tick().await;
            let elapsed_ms: u64 = started.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
            strip.show(provisioning_frame(elapsed_ms)).await;
        }
    })
}

async fn handle_portal_page() -> impl IntoResponse {
    Html(PORTAL_HTML)
}

async fn handle_get_config(State(state): State<PortalState>) -> impl IntoResponse {
    Json(build_portal_view(&state.config, &state.network))
}

async fn handle_put_config(
    State(state): State<PortalState>,
    Json(update): Json<PortalUpdate>,
) -> impl IntoResponse {
    if let Err(message) = validate_portal_update(&update) {
        return error_response(StatusCode::BAD_REQUEST, message);
    }

    info!("Should save config");
    let submission = apply_portal_update(&state.config, &state.network, update);
    if state
        .events
        .try_send(PortalEvent::Submitted(submission))
        .is_err()
    {
        return error_response(StatusCode::CONFLICT, "Configuration was already submitted");
    }

    Json(SavedResponse { saved: true }).into_response()
}

async fn handle_restart(State(state): State<PortalState>) -> impl IntoResponse {
    let _ = state.events.try_send(PortalEvent::RestartRequested);
    Json(serde_json::json!({ "restarting": true }))
}

fn build_status_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(STATUS_TIMEOUT)
        .build()
        .context("failed to build status http client")
}

async fn poll_endpoint(client: &reqwest::Client, slot: usize, url: &str) -> String {
    if url.is_empty() {
        return no_url_placeholder(slot).to_string();
    }

    info!("Starting HTTPS request {slot}:");
    info!("{url}");
    fetch_status(client, url).await
}

/// Body of a 200 response, or the `error` sentinel for anything else.
async fn fetch_status(client: &reqwest::Client, url: &str) -> String {
    match request_status(client, url).await {
        Ok(body) => body,
        Err(err) => {
            warn!("status request to {url} failed: {err:#}");
            STATUS_ERROR.to_string()
        }
    }
}

async fn request_status(client: &reqwest::Client, url: &str) -> anyhow::Result<String> {
    let mut response = client.get(url).send().await?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(anyhow!("status endpoint answered HTTP {status}"));
    }

    let mut body = Vec::with_capacity(MAX_STATUS_BODY);
    while body.len() < MAX_STATUS_BODY {
        let Some(chunk) = response.chunk().await? else {
            break;
        };
        let take = chunk.len().min(MAX_STATUS_BODY - body.len());
        body.extend_from_slice(&chunk[..take]);
    }

    Ok(String::from_utf8_lossy(&body).into_owned())
}

impl ConsoleStrip {
    async fn show(&self, frame: Frame) {
        let mut shown = self.shown.lock().await;
        if *shown == Some(frame) {
            return;
        }

        debug!(
            "leds: [{},{},{}] [{},{},{}]",
            frame[0].r, frame[0].g, frame[0].b, frame[1].r, frame[1].g, frame[1].b
        );
        *shown = Some(frame);
    }

    #[cfg(test)]
    async fn current(&self) -> Option<Frame> {
        *self.shown.lock().await
    }
}

impl AgentStore {
    fn new() -> Self {
        let data_dir = std::env::var("STATUS_AGENT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.status-agent"));
        Self::with_dir(data_dir)
    }

    fn with_dir(data_dir: PathBuf) -> Self {
        Self {
            config_path: Arc::new(data_dir.join("config.json")),
            wifi_path: Arc::new(data_dir.join("wifi.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_agent_config(&self) -> anyhow::Result<Option<AgentConfig>> {
        let Some(raw) = self.read(&self.config_path).await? else {
            return Ok(None);
        };
        Ok(Some(AgentConfig::from_json(&raw)?))
    }

    async fn save_agent_config(&self, config: &AgentConfig) -> anyhow::Result<()> {
        self.write(&self.config_path, &config.to_json()?).await
    }

    async fn load_network_config(&self) -> anyhow::Result<Option<NetworkConfig>> {
        let Some(raw) = self.read(&self.wifi_path).await? else {
            return Ok(None);
        };
        Ok(Some(NetworkConfig::from_json(&raw)?))
    }

    async fn save_network_config(&self, network: &NetworkConfig) -> anyhow::Result<()> {
        self.write(&self.wifi_path, &network.to_json()?).await
    }

    async fn read(&self, path: &Path) -> anyhow::Result<Option<Vec<u8>>> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, path: &Path, payload: &[u8]) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, payload)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use agent_common::status::{COLOR_FAILED, COLOR_OK};

    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "status-agent-{name}-{}-{nanos}",
            std::process::id()
        ))
    }

    async fn serve_status_endpoints() -> SocketAddr {
        let app = Router::new()
            .route("/ok", get(|| async { "OK" }))
            .route("/ok-newline", get(|| async { "OK\n" }))
            .route("/long", get(|| async { "x".repeat(4 * MAX_STATUS_BODY) }))
            .route(
                "/down",
                get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "OK") }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn free_local_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    fn submission(config_changed: bool) -> PortalSubmission {
        PortalSubmission {
            config: AgentConfig::new("https://a.example/ok", "", "5000000"),
            network: NetworkConfig::default(),
            config_changed,
            network_changed: false,
        }
    }

    #[tokio::test]
    async fn unchanged_submission_is_not_written() {
        let dir = scratch_dir("unchanged");
        let store = AgentStore::with_dir(dir.clone());

        persist_submission(&store, &submission(false)).await;

        assert!(!dir.join("config.json").exists());
        assert!(!dir.join("wifi.json").exists());
    }

    #[tokio::test]
    async fn changed_submission_is_written() {
        let dir = scratch_dir("changed");
        let store = AgentStore::with_dir(dir.clone());
        let changed = submission(true);

        persist_submission(&store, &changed).await;

        assert_eq!(store.load_agent_config().await.unwrap(), Some(changed.config));
        assert!(!dir.join("wifi.json").exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test(start_paused = true)]
    async fn portal_gives_up_after_timeout() {
        let strip = ConsoleStrip::default();
        let started = tokio::time::Instant::now();

        let outcome = run_portal(
            &strip,
            free_local_addr().await,
            &AgentConfig::default(),
            &NetworkConfig::default(),
        )
        .await
        .unwrap();

        assert!(outcome.is_none());
        assert!(started.elapsed() >= PORTAL_TIMEOUT);
        assert_eq!(strip.current().await, Some(cleared_frame()));
    }

    #[tokio::test]
    async fn forced_portal_cycle_persists_submission() {
        let dir = scratch_dir("forced");
        let store = AgentStore::with_dir(dir.clone());
        let status_addr = serve_status_endpoints().await;
        let portal_addr = free_local_addr().await;
        let url1 = format!("http://{status_addr}/ok");

        let body = serde_json::json!({
            "url1": &url1,
            "url2": "",
            "refresh": "7000000",
            "wifiSsid": "home",
            "wifiPass": "secret",
        })
        .to_string();
        let submit = tokio::spawn(async move {
            let client = reqwest::Client::new();
            loop {
                let response = client
                    .put(format!("http://{portal_addr}/api/config"))
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body.clone())
                    .send()
                    .await;
                match response {
                    Ok(response) => return response.status(),
                    Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
                }
            }
        });

        let strip = ConsoleStrip::default();
        let client = build_status_client().unwrap();
        let plan = run_cycle(&store, &strip, &client, portal_addr, true)
            .await
            .unwrap();

        assert_eq!(submit.await.unwrap(), reqwest::StatusCode::OK);
        assert_eq!(plan, Some(SleepPlan::Timed(Duration::from_secs(7))));
        assert_eq!(strip.current().await, Some([COLOR_OK, COLOR_FAILED]));
        assert_eq!(
            store.load_agent_config().await.unwrap(),
            Some(AgentConfig::new(&url1, "", "7000000"))
        );
        let network = store.load_network_config().await.unwrap().unwrap();
        assert_eq!(network.wifi_ssid, "home");
        assert_eq!(network.wifi_pass, "secret");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn missing_config_file_loads_as_none() {
        let store = AgentStore::with_dir(scratch_dir("missing"));

        assert!(store.load_agent_config().await.unwrap().is_none());
        assert!(store.load_network_config().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_round_trips_config() {
        let dir = scratch_dir("roundtrip");
        let store = AgentStore::with_dir(dir.clone());
        let config = AgentConfig::new("https://a.example/ok", "", "30000000");

        store.save_agent_config(&config).await.unwrap();
        let reloaded = store.load_agent_config().await.unwrap();

        assert_eq!(reloaded, Some(config));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn malformed_config_file_is_an_error() {
        let dir = scratch_dir("malformed");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config.json"), b"not json").unwrap();
        let store = AgentStore::with_dir(dir.clone());

        assert!(store.load_agent_config().await.is_err());
        assert_eq!(load_config(&store).await, AgentConfig::default());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn fetch_returns_body_only_for_http_ok() {
        let addr = serve_status_endpoints().await;
        let client = build_status_client().unwrap();

        assert_eq!(fetch_status(&client, &format!("http://{addr}/ok")).await, "OK");
        assert_eq!(
            fetch_status(&client, &format!("http://{addr}/ok-newline")).await,
            "OK\n"
        );
        assert_eq!(
            fetch_status(&client, &format!("http://{addr}/down")).await,
            STATUS_ERROR
        );
    }

    #[tokio::test]
    async fn long_body_is_capped() {
        let addr = serve_status_endpoints().await;
        let client = build_status_client().unwrap();

        let body = fetch_status(&client, &format!("http://{addr}/long")).await;

        assert_eq!(body.len(), MAX_STATUS_BODY);
    }

    #[tokio::test]
    async fn unreachable_endpoint_reports_error() {
        let client = build_status_client().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert_eq!(
            fetch_status(&client, &format!("http://{addr}/ok")).await,
            STATUS_ERROR
        );
    }

    #[tokio::test]
    async fn empty_url_skips_request() {
        let client = build_status_client().unwrap();

        assert_eq!(poll_endpoint(&client, 1, "").await, "No Url (1)");
        assert_eq!(poll_endpoint(&client, 2, "").await, "No Url (2)");
    }

    #[tokio::test]
    async fn cycle_with_stored_credentials_sets_leds_without_saving() {
        let dir = scratch_dir("cycle");
        let store = AgentStore::with_dir(dir.clone());
        let addr = serve_status_endpoints().await;
        let config = AgentConfig::new(
            &format!("http://{addr}/ok"),
            &format!("http://{addr}/down"),
            "2500000",
        );
        store.save_agent_config(&config).await.unwrap();
        store
            .save_network_config(&NetworkConfig {
                wifi_ssid: "home".to_string(),
                wifi_pass: "secret".to_string(),
            })
            .await
            .unwrap();

        let strip = ConsoleStrip::default();
        let client = build_status_client().unwrap();
        let plan = run_cycle(&store, &strip, &client, free_local_addr().await, false)
            .await
            .unwrap();

        assert_eq!(plan, Some(SleepPlan::Timed(Duration::from_micros(2_500_000))));
        assert_eq!(strip.current().await, Some([COLOR_OK, COLOR_FAILED]));
        assert_eq!(store.load_agent_config().await.unwrap(), Some(config));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn portal_submission_is_forwarded_once() {
        let (events_tx, mut events_rx) = mpsc::channel(1);
        let state = PortalState {
            config: AgentConfig::default(),
            network: NetworkConfig::default(),
            events: events_tx,
        };
        let update = || PortalUpdate {
            url1: "https://a.example/ok".to_string(),
            url2: String::new(),
            refresh: "100000".to_string(),
            wifi_ssid: "home".to_string(),
            wifi_pass: Some("pw".to_string()),
        };

        let first = handle_put_config(State(state.clone()), Json(update()))
            .await
            .into_response();
        let second = handle_put_config(State(state), Json(update()))
            .await
            .into_response();

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::CONFLICT);
        match events_rx.recv().await {
            Some(PortalEvent::Submitted(submission)) => {
                assert!(submission.config_changed);
                assert_eq!(submission.network.wifi_ssid, "home");
            }
            other => panic!("unexpected portal event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn portal_rejects_blank_ssid() {
        let (events_tx, mut events_rx) = mpsc::channel(1);
        let state = PortalState {
            config: AgentConfig::default(),
            network: NetworkConfig::default(),
            events: events_tx,
        };
        let update = PortalUpdate {
            url1: String::new(),
            url2: String::new(),
            refresh: String::new(),
            wifi_ssid: " ".to_string(),
            wifi_pass: None,
        };

        let response = handle_put_config(State(state), Json(update))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(events_rx.try_recv().is_err());
    }
}
