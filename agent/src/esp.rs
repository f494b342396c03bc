use core::convert::TryInto;
use std::{
    sync::{mpsc, Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::FreeRtos,
    gpio::{AnyIOPin, IOPin, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::{
        client::{Configuration as HttpClientConfiguration, EspHttpConnection},
        server::{Configuration as HttpConfiguration, EspHttpServer},
    },
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    timer::{EspTaskTimerService, EspTimer},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use agent_common::{
    config::{MAX_CONFIG_JSON_LEN, MAX_NETWORK_JSON_LEN},
    portal::{
        apply_portal_update, build_portal_view, validate_portal_update, CAPTIVE_PATHS,
        PORTAL_HTML, PROVISIONING_AP_PASSWORD, PROVISIONING_AP_SSID,
    },
    status::{
        cleared_frame, indicator_colors, no_url_placeholder, provisioning_frame, BLINK_INTERVAL_MS,
        STATUS_ERROR,
    },
    AgentConfig, NetworkConfig, PortalSubmission, PortalUpdate, SleepPlan,
};

use crate::led::StatusStrip;

const NVS_NAMESPACE: &str = "status_agent";
const NVS_CONFIG_KEY: &str = "config_json";
const NVS_WIFI_KEY: &str = "wifi_json";

const MAX_HTTP_BODY: usize = 2048;
const MAX_STATUS_BODY: usize = 1024;
const STATUS_TIMEOUT: Duration = Duration::from_secs(15);
const PORTAL_TIMEOUT: Duration = Duration::from_secs(180);
const WIFI_CONNECT_ATTEMPTS: u32 = 3;
const WIFI_RETRY_DELAY_MS: u64 = 2_000;
const BUTTON_SETTLE_MS: u32 = 20;

type Wifi<'a> = BlockingWifi<&'a mut EspWifi<'static>>;
type SharedStrip = Arc<Mutex<StatusStrip>>;

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct SavedResponse {
    saved: bool,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let config = load_config(&nvs_store);
    let mut network = match nvs_store.load_network_config() {
        Ok(network) => network.unwrap_or_default(),
        Err(err) => {
            warn!("failed to load wifi credentials from NVS: {err:#}");
            NetworkConfig::default()
        }
    };
    ensure_wifi_defaults(&mut network);

    let Peripherals {
        modem, pins, rmt, ..
    } = Peripherals::take()?;

    let strip = match StatusStrip::new(rmt.channel0, pins.gpio4) {
        Ok(strip) => strip,
        Err(err) => {
            warn!("failed to initialize status LEDs, running without them: {err:#}");
            StatusStrip::disabled()
        }
    };
    let strip: SharedStrip = Arc::new(Mutex::new(strip));

    let force_portal = provisioning_button_held(pins.gpio0.downgrade());
    if force_portal {
        info!("provisioning button held at boot");
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let needs_portal = if force_portal {
        true
    } else if !network.has_station_credentials() {
        warn!("wifi credentials missing; entering provisioning mode");
        true
    } else {
        match connect_station(&mut wifi, &network) {
            Ok(()) => false,
            Err(err) => {
                warn!("station connection unavailable ({err:#}); entering provisioning mode");
                true
            }
        }
    };

    let submission = if needs_portal {
        Some(run_portal(&mut wifi, &strip, &config, &network)?)
    } else {
        None
    };

    info!("connected...");

    let active = submission
        .as_ref()
        .map(|submission| &submission.config)
        .unwrap_or(&config);

    show_frame(&strip, cleared_frame());

    let status1 = poll_endpoint(1, &active.url1);
    info!("{status1}");
    let status2 = poll_endpoint(2, &active.url2);
    info!("{status2}");

    show_frame(&strip, indicator_colors(&status1, &status2));

    if let Some(submission) = &submission {
        persist_submission(&nvs_store, submission);
    }

    let plan = active.sleep_plan();
    drop(wifi);
    drop(esp_wifi);
    deep_sleep(plan)
}

fn load_config(nvs_store: &NvsStore) -> AgentConfig {
    let config = match nvs_store.load_agent_config() {
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

fn persist_submission(nvs_store: &NvsStore, submission: &PortalSubmission) {
    if submission.config_changed {
        info!("saving config");
        if let Err(err) = nvs_store.save_agent_config(&submission.config) {
            warn!("Failed to write config: {err:#}");
        }
    }

    if submission.network_changed {
        if let Err(err) = nvs_store.save_network_config(&submission.network) {
            warn!("failed to persist wifi credentials: {err:#}");
        }
    }
}

fn ensure_wifi_defaults(network: &mut NetworkConfig) {
    if network.wifi_ssid.is_empty() {
        network.wifi_ssid = option_env!("WIFI_SSID").unwrap_or("CHANGE_ME").to_string();
    }

    if network.wifi_pass.is_empty() {
        network.wifi_pass = option_env!("WIFI_PASS").unwrap_or_default().to_string();
    }
}

fn provisioning_button_held(pin: AnyIOPin) -> bool {
    let mut button = match PinDriver::input(pin) {
        Ok(button) => button,
        Err(err) => {
            warn!("provisioning button unavailable: {err}");
            return false;
        }
    };

    if let Err(err) = button.set_pull(Pull::Up) {
        warn!("failed to enable provisioning button pull-up: {err}");
        return false;
    }
    FreeRtos::delay_ms(BUTTON_SETTLE_MS);

    button.is_low()
}

fn connect_station(wifi: &mut Wifi<'_>, network: &NetworkConfig) -> anyhow::Result<()> {
    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                return Ok(());
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    let _ = wifi.disconnect();
    let _ = wifi.stop();
    Err(last_err
        .map(anyhow::Error::from)
        .unwrap_or_else(|| anyhow!("wifi connect attempts exhausted")))
}

fn start_provisioning_ap(wifi: &mut Wifi<'_>) -> anyhow::Result<()> {
    if wifi.is_started()? {
        wifi.stop()?;
    }

    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: PROVISIONING_AP_SSID
            .try_into()
            .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
        password: PROVISIONING_AP_PASSWORD
            .try_into()
            .map_err(|_| anyhow!("provisioning AP password too long"))?,
        auth_method: AuthMethod::WPAWPA2Personal,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;

    info!("Entered config mode");
    match wifi.wifi().ap_netif().get_ip_info() {
        Ok(ip_info) => info!("{}", ip_info.ip),
        Err(err) => warn!("failed to read provisioning AP address: {err}"),
    }
    info!("{PROVISIONING_AP_SSID}");
    Ok(())
}

/// Blocks until the portal delivers a submission and the device has joined
/// the submitted network. Restarts the device on timeout or join failure.
fn run_portal(
    wifi: &mut Wifi<'_>,
    strip: &SharedStrip,
    config: &AgentConfig,
    network: &NetworkConfig,
) -> anyhow::Result<PortalSubmission> {
    start_provisioning_ap(wifi)?;

    let timer_service = EspTaskTimerService::new()?;
    let blink = start_blink_timer(&timer_service, strip.clone())?;

    let (tx, rx) = mpsc::channel();
    let server = create_portal_http_server(config.clone(), network.clone(), tx)?;

    let submission = match rx.recv_timeout(PORTAL_TIMEOUT) {
        Ok(submission) => submission,
        Err(_) => {
            warn!("failed to connect and hit timeout");
            restart_device();
        }
    };

    // Let the save response reach the browser before the AP goes away.
    thread::sleep(Duration::from_millis(500));
    drop(server);
    drop(blink);
    show_frame(strip, cleared_frame());

    let _ = wifi.stop();
    if let Err(err) = connect_station(wifi, &submission.network) {
        warn!("failed to join `{}` ({err:#}); restarting", submission.network.wifi_ssid);
        restart_device();
    }

    Ok(submission)
}

fn start_blink_timer(
    timer_service: &EspTaskTimerService,
    strip: SharedStrip,
) -> anyhow::Result<EspTimer<'static>> {
    let started = Instant::now();
    let timer = timer_service.timer(move || {
        let elapsed_ms: u64 = started.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
        if let Ok(mut strip) = strip.lock() {
            strip.show(provisioning_frame(elapsed_ms));
        }
    })?;
    timer.every(Duration::from_millis(BLINK_INTERVAL_MS))?;
    Ok(timer)
}

fn create_portal_http_server(
    config: AgentConfig,
    network: NetworkConfig,
    submissions: mpsc::Sender<PortalSubmission>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    for path in CAPTIVE_PATHS {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(PORTAL_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    {
        let view = build_portal_view(&config, &network);
        server.fn_handler("/api/config", Method::Get, move |req| write_json(req, &view))?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/config", Method::Put, move |mut req| {
        let body = read_request_body(&mut req)?;
        let update: PortalUpdate =
            serde_json::from_slice(&body).context("invalid config payload")?;

        if let Err(message) = validate_portal_update(&update) {
            return write_error(req, 400, message);
        }

        info!("Should save config");
        let submission = apply_portal_update(&config, &network, update);
        if submissions.send(submission).is_err() {
            return write_error(req, 409, "Configuration was already submitted");
        }

        write_json(req, &SavedResponse { saved: true })
    })?;

    server.fn_handler::<anyhow::Error, _>("/api/restart", Method::Post, move |req| {
        thread::Builder::new()
            .name("restart-request".into())
            .spawn(|| {
                thread::sleep(Duration::from_millis(500));
                unsafe { esp_idf_svc::sys::esp_restart() };
            })?;

        let payload = serde_json::json!({ "restarting": true });
        write_json(req, &payload)
    })?;

    Ok(server)
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn poll_endpoint(slot: usize, url: &str) -> String {
    if url.is_empty() {
        return no_url_placeholder(slot).to_string();
    }

    info!("Starting HTTPS request {slot}:");
    info!("{url}");
    fetch_status(url)
}

/// Body of a 200 response, or the `error` sentinel for anything else.
fn fetch_status(url: &str) -> String {
    match request_status(url) {
        Ok(body) => body,
        Err(err) => {
            warn!("status request to {url} failed: {err:#}");
            STATUS_ERROR.to_string()
        }
    }
}

fn request_status(url: &str) -> anyhow::Result<String> {
    // No CA store or bundle: the sdkconfig turns off server verification.
    let http_conf = HttpClientConfiguration {
        timeout: Some(STATUS_TIMEOUT),
        use_global_ca_store: false,
        crt_bundle_attach: None,
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);
    let request = client.request(Method::Get, url, &[])?;
    let mut response = request.submit().map_err(|e| anyhow!("{e:?}"))?;

    let status = response.status();
    if status != 200 {
        return Err(anyhow!("status endpoint answered HTTP {status}"));
    }

    let mut body = Vec::with_capacity(64);
    let mut chunk = [0_u8; 256];
    while body.len() < MAX_STATUS_BODY {
        let read = response.read(&mut chunk).map_err(|e| anyhow!("{e:?}"))?;
        if read == 0 {
            break;
        }
        let room = MAX_STATUS_BODY - body.len();
        body.extend_from_slice(&chunk[..read.min(room)]);
    }

    Ok(String::from_utf8_lossy(&body).into_owned())
}

fn show_frame(strip: &SharedStrip, frame: agent_common::Frame) {
    match strip.lock() {
        Ok(mut strip) => strip.show(frame),
        Err(_) => warn!("status LED lock poisoned; frame dropped"),
    }
}

fn deep_sleep(plan: SleepPlan) -> ! {
    info!("Done. Going to sleep!");
    info!("{}", plan.as_micros());

    match plan {
        SleepPlan::Timed(_) => unsafe { esp_idf_svc::sys::esp_deep_sleep(plan.as_micros()) },
        SleepPlan::Indefinite => unsafe { esp_idf_svc::sys::esp_deep_sleep_start() },
    }
}

fn restart_device() -> ! {
    thread::sleep(Duration::from_millis(100));
    unsafe { esp_idf_svc::sys::esp_restart() }
}

impl NvsStore {
    fn load_agent_config(&self) -> anyhow::Result<Option<AgentConfig>> {
        self.load_json(NVS_CONFIG_KEY)?
            .map(|raw| AgentConfig::from_json(raw.as_bytes()).map_err(anyhow::Error::from))
            .transpose()
    }

    fn save_agent_config(&self, config: &AgentConfig) -> anyhow::Result<()> {
        self.save_json(NVS_CONFIG_KEY, &config.to_json()?)
    }

    fn load_network_config(&self) -> anyhow::Result<Option<NetworkConfig>> {
        self.load_json(NVS_WIFI_KEY)?
            .map(|raw| NetworkConfig::from_json(raw.as_bytes()).map_err(anyhow::Error::from))
            .transpose()
    }

    fn save_network_config(&self, network: &NetworkConfig) -> anyhow::Result<()> {
        self.save_json(NVS_WIFI_KEY, &network.to_json()?)
    }

    fn load_json(&self, key: &str) -> anyhow::Result<Option<String>> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("NVS lock poisoned"))?;
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        // Room for the longest record plus the NUL terminator.
        let mut buffer = vec![0_u8; MAX_CONFIG_JSON_LEN.max(MAX_NETWORK_JSON_LEN) + 1];

        Ok(nvs.get_str(key, &mut buffer)?.map(str::to_string))
    }

    fn save_json(&self, key: &str, payload: &[u8]) -> anyhow::Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("NVS lock poisoned"))?;
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = std::str::from_utf8(payload).context("config json is not utf-8")?;
        nvs.set_str(key, payload)?;
        Ok(())
    }
}
