use std::{
    collections::VecDeque,
    io::ErrorKind,
    net::{Ipv4Addr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, SyncSender, TrySendError},
        Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use dht_sensor::dht11;
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Query, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, IOPin, Input, InputOutput, Output, PinDriver, Pull},
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
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use cloudswitch_common::{
    cloud::{
        parse_relay_command, resource_url, PutClient, PutTransport, StreamSession,
        TransportError, Value, STREAM_READ_TIMEOUT, STREAM_RECONNECT_DELAY,
    },
    config::{CloudConfig, DeviceConfig, PortalConfig, StationCredential},
    dns::{captive_response, MAX_DATAGRAM_LEN},
    link::{LinkAction, LinkEvent, LinkState, LinkSupervisor, MAX_CONNECT_ATTEMPTS},
    portal::{
        parse_connect_query, probe_redirect_html, split_uri, CONNECTING_HTML,
        MISSING_PARAMS_BODY, PORTAL_HTML, PROBE_PATHS,
    },
    switch::{Debouncer, Pulse, SwitchState},
};

const NVS_NAMESPACE: &str = "cloudswitch";
const NVS_CREDENTIAL_KEY: &str = "station_json";

const RELAY_PIN: i32 = 22;
const BUTTON_PIN: i32 = 17;
const DHT11_PIN: i32 = 4;

const DNS_PORT: u16 = 53;
const DNS_ERROR_PAUSE_MS: u64 = 10;
const RELAY_QUEUE_DEPTH: usize = 10;
const BUTTON_POLL_MS: u64 = 20;
const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const PUT_HTTP_TIMEOUT: Duration = Duration::from_secs(15);
const SENSOR_PUBLISH_INTERVAL: Duration = Duration::from_secs(300);

// Button presses are debounced by the consumer, not the producer.
enum RelayRequest {
    CloudCommand(bool),
    ButtonPress { at_ms: u64 },
}

struct CloudHardware {
    relay: PinDriver<'static, AnyIOPin, Output>,
    button: PinDriver<'static, AnyIOPin, Input>,
    dht: DhtSensor,
}

// Dropping this stops the HTTP server and joins the DNS thread.
struct PortalServices {
    _server: EspHttpServer<'static>,
    _dns: DnsResponder,
}

struct DnsResponder {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

struct DhtReading {
    temperature_c: f32,
    humidity: f32,
}

struct DhtSensor {
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

struct EspPutTransport {
    timeout: Duration,
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

    let config = DeviceConfig::default();

    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    let mut cloud_hardware = Some(CloudHardware {
        relay: PinDriver::output(pins.gpio22.downgrade())?,
        button: {
            let mut button = PinDriver::input(pins.gpio17.downgrade())?;
            button.set_pull(Pull::Up)?;
            button
        },
        dht: DhtSensor::new(pins.gpio4.downgrade()).context("failed to initialize DHT11")?,
    });

    let mut wifi = BlockingWifi::wrap(
        EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?,
        sys_loop,
    )?;

    let stored = nvs_store.load_credential().unwrap_or_else(|err| {
        warn!("failed to load station credential from NVS: {err:#}");
        None
    });

    let (credential_tx, credential_rx) = mpsc::sync_channel::<StationCredential>(1);

    let mut pending: VecDeque<LinkAction> = VecDeque::new();
    let mut portal: Option<PortalServices> = None;
    let mut active_credential: Option<StationCredential> = None;

    let mut supervisor = match stored {
        Some(credential) => {
            info!("stored credential found, connecting to `{}`", credential.ssid);
            apply_station_configuration(&mut wifi, &credential, None)?;
            wifi.start()?;
            active_credential = Some(credential);

            let mut supervisor = LinkSupervisor::provisioned();
            pending.extend(supervisor.handle(LinkEvent::StationStarted));
            supervisor
        }
        None => {
            info!(
                "no stored credential; starting setup AP `{}`",
                config.portal.ap_ssid
            );
            start_fallback_ap(&mut wifi, &config.portal)?;
            portal = Some(start_portal_services(&config.portal, credential_tx.clone())?);
            LinkSupervisor::unprovisioned()
        }
    };

    enable_wifi_power_save();
    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    loop {
        while let Some(action) = pending.pop_front() {
            match action {
                LinkAction::ApplyCredential(credential) => {
                    if let Err(err) = nvs_store.save_credential(&credential) {
                        warn!("failed to persist credential: {err:#}");
                    }
                    let _ = wifi.disconnect();
                    let keep_ap = portal.as_ref().map(|_| &config.portal);
                    apply_station_configuration(&mut wifi, &credential, keep_ap)?;
                    wifi.start()?;
                    active_credential = Some(credential);
                }
                LinkAction::Connect => {
                    if supervisor.connect_failures() > 0 {
                        feed_watchdog();
                        thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
                    }
                    feed_watchdog();

                    let attempt = supervisor.connect_failures() + 1;
                    info!("wifi connect attempt {attempt}/{MAX_CONNECT_ATTEMPTS}");
                    let event = match connect_station(&mut wifi) {
                        Ok(()) => LinkEvent::AddressAcquired,
                        Err(err) => {
                            warn!("wifi connect attempt {attempt} failed: {err:#}");
                            let _ = wifi.disconnect();
                            LinkEvent::Disconnected
                        }
                    };
                    pending.extend(supervisor.handle(event));
                }
                LinkAction::StartFallbackAp => {
                    warn!(
                        "all {MAX_CONNECT_ATTEMPTS} connect attempts failed; starting setup AP `{}`",
                        config.portal.ap_ssid
                    );
                    let _ = wifi.disconnect();
                    let _ = wifi.stop();
                    start_fallback_ap(&mut wifi, &config.portal)?;
                    if portal.is_none() {
                        portal =
                            Some(start_portal_services(&config.portal, credential_tx.clone())?);
                    }
                }
                LinkAction::StopPortal => {
                    info!("station link up; stopping captive portal");
                    portal = None;
                    if let Some(credential) = active_credential.as_ref() {
                        apply_station_configuration(&mut wifi, credential, None)?;
                    }
                }
                LinkAction::StartCloudServices => {
                    if let Some(hardware) = cloud_hardware.take() {
                        start_cloud_services(&config.cloud, hardware)?;
                    }
                }
            }
        }

        feed_watchdog();

        match supervisor.state() {
            LinkState::Connected => {
                thread::sleep(Duration::from_secs(1));
                if !is_wifi_station_connected() {
                    warn!("station association lost");
                    pending.extend(supervisor.handle(LinkEvent::Disconnected));
                }
            }
            _ => match credential_rx.recv_timeout(Duration::from_secs(1)) {
                Ok(credential) => {
                    info!("portal submitted credentials for `{}`", credential.ssid);
                    pending.extend(supervisor.handle(LinkEvent::CredentialsSubmitted(credential)));
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    thread::sleep(Duration::from_secs(1));
                }
            },
        }
    }
}

fn start_portal_services(
    portal: &PortalConfig,
    credentials: SyncSender<StationCredential>,
) -> anyhow::Result<PortalServices> {
    let server = create_portal_http_server(portal, credentials)?;
    let dns = DnsResponder::start(Ipv4Addr::from(portal.ip))?;
    Ok(PortalServices {
        _server: server,
        _dns: dns,
    })
}

fn create_portal_http_server(
    portal: &PortalConfig,
    credentials: SyncSender<StationCredential>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
            .write_all(PORTAL_HTML.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler::<anyhow::Error, _>("/connect", Method::Get, move |req| {
        let (_, query) = split_uri(req.uri());
        match parse_connect_query(query) {
            Some(credential) => {
                info!("portal received credentials for `{}`", credential.ssid);
                if let Err(err) = credentials.try_send(credential) {
                    warn!("credential handoff failed: {err}");
                }
                req.into_response(
                    200,
                    Some("OK"),
                    &[("Content-Type", "text/html; charset=utf-8")],
                )?
                .write_all(CONNECTING_HTML.as_bytes())?;
            }
            None => {
                req.into_response(404, Some("Not Found"), &[("Content-Type", "text/plain")])?
                    .write_all(MISSING_PARAMS_BODY.as_bytes())?;
            }
        }
        Ok(())
    })?;

    let redirect_target = format!("http://{}/", Ipv4Addr::from(portal.ip));
    for path in PROBE_PATHS {
        let redirect_target = redirect_target.clone();
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            let body = probe_redirect_html(&redirect_target);
            req.into_response(
                302,
                Some("Found"),
                &[
                    ("Location", redirect_target.as_str()),
                    ("Cache-Control", "no-cache, no-store, must-revalidate"),
                    ("Pragma", "no-cache"),
                    ("Expires", "0"),
                    ("Content-Type", "text/html; charset=utf-8"),
                ],
            )?
            .write_all(body.as_bytes())?;
            Ok(())
        })?;
    }

    // Registered last so every unmatched probe still lands on the form.
    server.fn_handler::<anyhow::Error, _>("/*", Method::Get, move |req| {
        req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
            .write_all(PORTAL_HTML.as_bytes())?;
        Ok(())
    })?;

    Ok(server)
}

impl DnsResponder {
    // The socket read times out every second so the thread notices the
    // stop flag.
    fn start(addr: Ipv4Addr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, DNS_PORT))
            .context("failed to bind captive DNS socket")?;
        socket.set_read_timeout(Some(Duration::from_secs(1)))?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = thread::Builder::new()
            .name("captive-dns".to_string())
            .stack_size(8192)
            .spawn(move || {
                let mut datagram = [0_u8; MAX_DATAGRAM_LEN];
                while !thread_stop.load(Ordering::Relaxed) {
                    let (len, peer) = match socket.recv_from(&mut datagram) {
                        Ok(received) => received,
                        Err(err)
                            if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                        {
                            continue;
                        }
                        Err(err) => {
                            warn!("captive dns receive failed: {err}");
                            thread::sleep(Duration::from_millis(DNS_ERROR_PAUSE_MS));
                            continue;
                        }
                    };

                    // Malformed queries are dropped without a reply.
                    if let Ok(response) = captive_response(&datagram[..len], addr) {
                        if let Err(err) = socket.send_to(&response, peer) {
                            warn!("captive dns send failed: {err}");
                        }
                    }
                }
            })
            .context("failed to spawn captive dns thread")?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for DnsResponder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn apply_station_configuration(
    wifi: &mut BlockingWifi<EspWifi<'static>>,
    credential: &StationCredential,
    keep_ap: Option<&PortalConfig>,
) -> anyhow::Result<()> {
    let client = client_configuration(credential)?;
    let conf = match keep_ap {
        Some(portal) => Configuration::Mixed(client, access_point_configuration(portal)?),
        None => Configuration::Client(client),
    };
    wifi.set_configuration(&conf)?;
    Ok(())
}

fn client_configuration(credential: &StationCredential) -> anyhow::Result<ClientConfiguration> {
    let auth_method = if credential.password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    Ok(ClientConfiguration {
        ssid: credential
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("station ssid too long"))?,
        password: credential
            .password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("station password too long"))?,
        auth_method,
        ..Default::default()
    })
}

fn access_point_configuration(portal: &PortalConfig) -> anyhow::Result<AccessPointConfiguration> {
    Ok(AccessPointConfiguration {
        ssid: portal
            .ap_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("setup AP ssid too long"))?,
        auth_method: AuthMethod::None,
        channel: portal.channel,
        max_connections: portal.max_clients.into(),
        ..Default::default()
    })
}

fn start_fallback_ap(
    wifi: &mut BlockingWifi<EspWifi<'static>>,
    portal: &PortalConfig,
) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(access_point_configuration(
        portal,
    )?))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!(
        "setup AP `{}` up on channel {} at {}",
        portal.ap_ssid,
        portal.channel,
        Ipv4Addr::from(portal.ip)
    );
    Ok(())
}

fn connect_station(wifi: &mut BlockingWifi<EspWifi<'static>>) -> anyhow::Result<()> {
    wifi.connect()?;
    wifi.wait_netif_up()?;

    let ip_info = wifi.wifi().sta_netif().get_ip_info()?;
    info!("station got address {}", ip_info.ip);
    Ok(())
}

fn start_cloud_services(cloud: &CloudConfig, hardware: CloudHardware) -> anyhow::Result<()> {
    let CloudHardware { relay, button, dht } = hardware;
    let (relay_tx, relay_rx) = mpsc::sync_channel::<RelayRequest>(RELAY_QUEUE_DEPTH);

    {
        let base_url = cloud.base_url.clone();
        let switch_path = cloud.switch_path.clone();
        thread::Builder::new()
            .name("relay-control".to_string())
            .stack_size(8192)
            .spawn(move || relay_control_loop(relay, relay_rx, &base_url, &switch_path))
            .context("failed to spawn relay control thread")?;
    }

    {
        let relay_tx = relay_tx.clone();
        thread::Builder::new()
            .name("button-watch".to_string())
            .stack_size(4096)
            .spawn(move || button_watch_loop(button, relay_tx))
            .context("failed to spawn button watch thread")?;
    }

    {
        let url = resource_url(&cloud.base_url, &cloud.switch_path);
        thread::Builder::new()
            .name("cloud-stream".to_string())
            .stack_size(16 * 1024)
            .spawn(move || loop {
                match stream_once(&url, &relay_tx) {
                    Ok(()) => warn!("command stream closed by server, reconnecting"),
                    Err(err) => warn!("command stream failed: {err:#}"),
                }
                thread::sleep(STREAM_RECONNECT_DELAY);
            })
            .context("failed to spawn cloud stream thread")?;
    }

    {
        let base_url = cloud.base_url.clone();
        let temperature_path = cloud.temperature_path.clone();
        let humidity_path = cloud.humidity_path.clone();
        thread::Builder::new()
            .name("sensor-publish".to_string())
            .stack_size(8192)
            .spawn(move || sensor_publish_loop(dht, &base_url, &temperature_path, &humidity_path))
            .context("failed to spawn sensor publish thread")?;
    }

    info!("cloud services started");
    Ok(())
}

fn relay_control_loop(
    mut relay: PinDriver<'static, AnyIOPin, Output>,
    requests: Receiver<RelayRequest>,
    base_url: &str,
    switch_path: &str,
) {
    let mut state = SwitchState::new(false);
    let mut debouncer = Debouncer::default();
    let mut store = PutClient::new(
        EspPutTransport {
            timeout: PUT_HTTP_TIMEOUT,
        },
        base_url,
    );

    info!("relay control ready on GPIO{RELAY_PIN}");

    while let Ok(request) = requests.recv() {
        match request {
            RelayRequest::CloudCommand(on) => match state.apply(on) {
                Some(pulse) => {
                    info!("cloud command: relay {}", if on { "on" } else { "off" });
                    drive_relay(&mut relay, pulse);
                }
                None => info!("cloud command matches current relay state, ignoring"),
            },
            RelayRequest::ButtonPress { at_ms } => {
                if !debouncer.accept(at_ms) {
                    info!("button press inside debounce window, ignoring");
                    continue;
                }
                let pulse = state.toggle();
                info!(
                    "button press: relay {}",
                    if state.is_on() { "on" } else { "off" }
                );
                drive_relay(&mut relay, pulse);

                let outcome = store.put(switch_path, &Value::Bool(state.is_on()));
                if !outcome.ok {
                    warn!(
                        "failed to publish relay state after {} attempts",
                        outcome.attempts
                    );
                }
            }
        }
    }
}

// A latching relay takes a fixed-width impulse, not a held level.
fn drive_relay(relay: &mut PinDriver<'static, AnyIOPin, Output>, pulse: Pulse) {
    if let Err(err) = relay.set_high() {
        warn!("relay drive failed: {err:?}");
        return;
    }
    thread::sleep(Duration::from_millis(pulse.duration_ms));
    if let Err(err) = relay.set_low() {
        warn!("relay release failed: {err:?}");
    }
}

fn button_watch_loop(
    button: PinDriver<'static, AnyIOPin, Input>,
    presses: SyncSender<RelayRequest>,
) {
    info!("watching toggle button on GPIO{BUTTON_PIN}");
    let mut pressed = button.is_low();

    loop {
        thread::sleep(Duration::from_millis(BUTTON_POLL_MS));
        let now_pressed = button.is_low();
        if now_pressed && !pressed {
            let press = RelayRequest::ButtonPress {
                at_ms: monotonic_ms(),
            };
            match presses.try_send(press) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => warn!("relay queue full, dropping button press"),
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
        pressed = now_pressed;
    }
}

fn sensor_publish_loop(
    mut sensor: DhtSensor,
    base_url: &str,
    temperature_path: &str,
    humidity_path: &str,
) {
    let mut store = PutClient::new(
        EspPutTransport {
            timeout: PUT_HTTP_TIMEOUT,
        },
        base_url,
    );

    loop {
        if let Some(reading) = sensor.read() {
            let outcome = store.put(temperature_path, &Value::Float(reading.temperature_c));
            if !outcome.ok {
                warn!(
                    "failed to publish temperature after {} attempts",
                    outcome.attempts
                );
            }

            let outcome = store.put(humidity_path, &Value::Float(reading.humidity));
            if !outcome.ok {
                warn!(
                    "failed to publish humidity after {} attempts",
                    outcome.attempts
                );
            }
        }
        thread::sleep(SENSOR_PUBLISH_INTERVAL);
    }
}

fn stream_once(url: &str, relay_commands: &SyncSender<RelayRequest>) -> anyhow::Result<()> {
    let conf = HttpClientConfiguration {
        timeout: Some(STREAM_READ_TIMEOUT),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&conf)?);

    let request = client.request(Method::Get, url, &[("Accept", "text/event-stream")])?;
    let response = request.submit().map_err(|e| anyhow!("{e:?}"))?;

    let status = response.status();
    if status != 200 {
        return Err(anyhow!("stream request returned HTTP {status}"));
    }

    info!("command stream connected");
    let mut session = StreamSession::new(EmbeddedReader(response));
    while let Some(payload) = session.next_command()? {
        match parse_relay_command(&payload) {
            Some(on) => {
                if let Err(err) = relay_commands.try_send(RelayRequest::CloudCommand(on)) {
                    warn!("relay queue refused cloud command: {err}");
                }
            }
            None => info!("ignoring stream payload without a boolean command"),
        }
    }
    Ok(())
}

struct EmbeddedReader<R>(R);

impl<R: Read> std::io::Read for EmbeddedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0
            .read(buf)
            .map_err(|err| std::io::Error::new(ErrorKind::Other, format!("{err:?}")))
    }
}

impl PutTransport for EspPutTransport {
    fn put(&mut self, url: &str, body: &str) -> Result<u16, TransportError> {
        let conf = HttpClientConfiguration {
            timeout: Some(self.timeout),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let connection = EspHttpConnection::new(&conf)
            .map_err(|err| TransportError::Request(format!("{err:?}")))?;
        let mut client = HttpClient::wrap(connection);

        let content_length = body.len().to_string();
        let headers = [
            ("Content-Type", "application/json"),
            ("Content-Length", content_length.as_str()),
        ];
        let mut request = client
            .request(Method::Put, url, &headers)
            .map_err(|err| TransportError::Request(format!("{err:?}")))?;
        request
            .write_all(body.as_bytes())
            .map_err(|err| TransportError::Request(format!("{err:?}")))?;
        request
            .flush()
            .map_err(|err| TransportError::Request(format!("{err:?}")))?;

        let response = request
            .submit()
            .map_err(|err| TransportError::Request(format!("{err:?}")))?;
        Ok(response.status())
    }
}

impl DhtSensor {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input_output_od(pin)?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;
        Ok(Self { pin, delay: Ets })
    }

    fn read(&mut self) -> Option<DhtReading> {
        if let Err(err) = self.pin.set_high() {
            warn!("failed to raise DHT11 line before read: {err:?}");
            return None;
        }

        match dht11::blocking::read(&mut self.delay, &mut self.pin) {
            Ok(reading) => {
                let temperature_c = reading.temperature as f32;
                let humidity = reading.relative_humidity as f32;
                info!("[DHT11] {temperature_c:.1}C, {humidity:.1}%");
                Some(DhtReading {
                    temperature_c,
                    humidity,
                })
            }
            Err(err) => {
                warn!("DHT11 read failed on GPIO{}: {err:?}", DHT11_PIN);
                None
            }
        }
    }
}

impl NvsStore {
    fn load_credential(&self) -> anyhow::Result<Option<StationCredential>> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 512];

        match nvs.get_str(NVS_CREDENTIAL_KEY, &mut buffer)? {
            Some(value) => Ok(Some(serde_json::from_str::<StationCredential>(value)?)),
            None => Ok(None),
        }
    }

    fn save_credential(&self, credential: &StationCredential) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(credential)?;
        nvs.set_str(NVS_CREDENTIAL_KEY, &payload)?;
        Ok(())
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn enable_wifi_power_save() {
    let rc = unsafe {
        esp_idf_svc::sys::esp_wifi_set_ps(esp_idf_svc::sys::wifi_ps_type_t_WIFI_PS_MAX_MODEM)
    };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi modem power save enabled");
    } else {
        warn!("failed to enable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
