use std::{
    collections::VecDeque,
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::{
        mpsc::{Receiver, SyncSender, TrySendError},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::{bail, Context};
use axum::{
    extract::{RawQuery, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::{
    net::{TcpListener, UdpSocket},
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use cloudswitch_common::{
    cloud::{
        parse_relay_command, resource_url, PutClient, PutTransport, StreamSession,
        TransportError, Value, STREAM_READ_TIMEOUT, STREAM_RECONNECT_DELAY,
    },
    config::{CloudConfig, DeviceConfig, PortalConfig, StationCredential},
    dns::{captive_response, MAX_DATAGRAM_LEN},
    link::{LinkAction, LinkEvent, LinkSupervisor, MAX_CONNECT_ATTEMPTS},
    portal::{
        parse_connect_query, probe_redirect_html, CONNECTING_HTML, MISSING_PARAMS_BODY,
        PORTAL_HTML, PROBE_PATHS,
    },
    switch::{Debouncer, Pulse, SwitchState},
};

const RELAY_QUEUE_DEPTH: usize = 10;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const PUT_HTTP_TIMEOUT: Duration = Duration::from_secs(15);
const SENSOR_PUBLISH_INTERVAL: Duration = Duration::from_secs(300);

enum RelayRequest {
    CloudCommand(bool),
    ButtonPress { at_ms: u64 },
}

#[derive(Clone)]
struct PortalState {
    credentials: mpsc::Sender<StationCredential>,
    redirect_target: Arc<String>,
}

struct PortalTasks {
    http: JoinHandle<()>,
    dns: JoinHandle<()>,
}

#[derive(Clone)]
struct CredentialStore {
    path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

struct HostOptions {
    publish_interval: Duration,
    button_period: Option<Duration>,
}

struct ReqwestPutTransport {
    client: reqwest::blocking::Client,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut config = DeviceConfig::default();
    if let Ok(base_url) = std::env::var("CLOUDSWITCH_BASE_URL") {
        config.cloud.base_url = base_url;
    }

    let http_port = std::env::var("CLOUDSWITCH_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    // UDP/53 needs elevated privileges on most hosts, so default off-port.
    let dns_port = std::env::var("CLOUDSWITCH_DNS_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(5353);

    let options = HostOptions {
        publish_interval: std::env::var("CLOUDSWITCH_PUBLISH_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(SENSOR_PUBLISH_INTERVAL),
        button_period: std::env::var("CLOUDSWITCH_BUTTON_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs),
    };

    let mut join_failures_left = std::env::var("CLOUDSWITCH_JOIN_FAILURES")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(0);

    let store = CredentialStore::new();
    let stored = store.load_credential().await.unwrap_or_else(|err| {
        warn!("failed to load station credential from store: {err:#}");
        None
    });

    let (credential_tx, mut credential_rx) = mpsc::channel::<StationCredential>(1);

    let mut pending: VecDeque<LinkAction> = VecDeque::new();
    let mut portal: Option<PortalTasks> = None;

    let mut supervisor = match stored {
        Some(credential) => {
            info!("stored credential found, connecting to `{}`", credential.ssid);
            let mut supervisor = LinkSupervisor::provisioned();
            pending.extend(supervisor.handle(LinkEvent::StationStarted));
            supervisor
        }
        None => {
            info!(
                "no stored credential; starting setup portal `{}`",
                config.portal.ap_ssid
            );
            portal = Some(
                start_portal_tasks(&config.portal, http_port, dns_port, credential_tx.clone())
                    .await?,
            );
            LinkSupervisor::unprovisioned()
        }
    };

    loop {
        while let Some(action) = pending.pop_front() {
            match action {
                LinkAction::ApplyCredential(credential) => {
                    if let Err(err) = store.save_credential(&credential).await {
                        warn!("failed to persist credential: {err:#}");
                    }
                    info!("station configured for `{}`", credential.ssid);
                }
                LinkAction::Connect => {
                    if supervisor.connect_failures() > 0 {
                        tokio::time::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS)).await;
                    }
                    let attempt = supervisor.connect_failures() + 1;
                    info!("wifi connect attempt {attempt}/{MAX_CONNECT_ATTEMPTS}");

                    // Hardware integration point:
                    // real station association runs on the ESP target.
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    let event = if join_failures_left > 0 {
                        join_failures_left -= 1;
                        warn!("wifi connect attempt {attempt} failed (simulated)");
                        LinkEvent::Disconnected
                    } else {
                        info!("station link up");
                        LinkEvent::AddressAcquired
                    };
                    pending.extend(supervisor.handle(event));
                }
                LinkAction::StartFallbackAp => {
                    warn!(
                        "all {MAX_CONNECT_ATTEMPTS} connect attempts failed; starting setup portal `{}`",
                        config.portal.ap_ssid
                    );
                    if portal.is_none() {
                        portal = Some(
                            start_portal_tasks(
                                &config.portal,
                                http_port,
                                dns_port,
                                credential_tx.clone(),
                            )
                            .await?,
                        );
                    }
                }
                LinkAction::StopPortal => {
                    info!("station link up; stopping captive portal");
                    if let Some(tasks) = portal.take() {
                        tasks.stop();
                    }
                }
                LinkAction::StartCloudServices => start_cloud_services(&config.cloud, &options),
            }
        }

        match credential_rx.recv().await {
            Some(credential) => {
                info!("portal submitted credentials for `{}`", credential.ssid);
                pending.extend(supervisor.handle(LinkEvent::CredentialsSubmitted(credential)));
            }
            None => tokio::time::sleep(Duration::from_secs(1)).await,
        }
    }
}

async fn start_portal_tasks(
    portal: &PortalConfig,
    http_port: u16,
    dns_port: u16,
    credentials: mpsc::Sender<StationCredential>,
) -> anyhow::Result<PortalTasks> {
    let state = PortalState {
        credentials,
        redirect_target: Arc::new(format!("http://{}/", Ipv4Addr::from(portal.ip))),
    };
    let app = portal_router(state);

    let addr: SocketAddr = format!("0.0.0.0:{http_port}").parse().unwrap();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind portal server at {addr}"))?;
    info!("captive portal listening on http://{addr}");
    let http = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!("portal server exited: {err}");
        }
    });

    let dns_addr: SocketAddr = format!("0.0.0.0:{dns_port}").parse().unwrap();
    let socket = UdpSocket::bind(dns_addr)
        .await
        .with_context(|| format!("failed to bind captive DNS socket at {dns_addr}"))?;
    info!("captive dns answering on udp://{dns_addr}");
    let portal_ip = Ipv4Addr::from(portal.ip);
    let dns = tokio::spawn(run_captive_dns(socket, portal_ip));

    Ok(PortalTasks { http, dns })
}

impl PortalTasks {
    fn stop(self) {
        self.http.abort();
        self.dns.abort();
    }
}

fn portal_router(state: PortalState) -> Router {
    let mut router = Router::new()
        .route("/", get(handle_portal_form))
        .route("/connect", get(handle_connect));
    for path in PROBE_PATHS {
        router = router.route(path, get(handle_probe_redirect));
    }
    router.fallback(handle_portal_form).with_state(state)
}

async fn handle_portal_form() -> Html<&'static str> {
    Html(PORTAL_HTML)
}

async fn handle_connect(
    State(state): State<PortalState>,
    RawQuery(query): RawQuery,
) -> Response {
    match parse_connect_query(query.as_deref().unwrap_or_default()) {
        Some(credential) => {
            info!("portal received credentials for `{}`", credential.ssid);
            if let Err(err) = state.credentials.try_send(credential) {
                warn!("credential handoff failed: {err}");
            }
            Html(CONNECTING_HTML).into_response()
        }
        None => (StatusCode::NOT_FOUND, MISSING_PARAMS_BODY).into_response(),
    }
}

async fn handle_probe_redirect(State(state): State<PortalState>) -> Response {
    let target = state.redirect_target.as_str();
    (
        StatusCode::FOUND,
        [
            (header::LOCATION, target.to_string()),
            (
                header::CACHE_CONTROL,
                "no-cache, no-store, must-revalidate".to_string(),
            ),
            (header::PRAGMA, "no-cache".to_string()),
            (header::EXPIRES, "0".to_string()),
        ],
        Html(probe_redirect_html(target)),
    )
        .into_response()
}

async fn run_captive_dns(socket: UdpSocket, addr: Ipv4Addr) {
    let mut datagram = [0_u8; MAX_DATAGRAM_LEN];
    loop {
        let (len, peer) = match socket.recv_from(&mut datagram).await {
            Ok(received) => received,
            Err(err) => {
                warn!("captive dns receive failed: {err}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        // Malformed queries are dropped without a reply.
        if let Ok(response) = captive_response(&datagram[..len], addr) {
            if let Err(err) = socket.send_to(&response, peer).await {
                warn!("captive dns send failed: {err}");
            }
        }
    }
}

fn start_cloud_services(cloud: &CloudConfig, options: &HostOptions) {
    let (relay_tx, relay_rx) = std::sync::mpsc::sync_channel::<RelayRequest>(RELAY_QUEUE_DEPTH);

    {
        let base_url = cloud.base_url.clone();
        let switch_path = cloud.switch_path.clone();
        tokio::task::spawn_blocking(move || relay_control_loop(relay_rx, &base_url, &switch_path));
    }

    {
        let url = resource_url(&cloud.base_url, &cloud.switch_path);
        let relay_tx = relay_tx.clone();
        tokio::task::spawn_blocking(move || loop {
            match stream_once(&url, &relay_tx) {
                Ok(()) => warn!("command stream closed by server, reconnecting"),
                Err(err) => warn!("command stream failed: {err:#}"),
            }
            std::thread::sleep(STREAM_RECONNECT_DELAY);
        });
    }

    if let Some(period) = options.button_period {
        let relay_tx = relay_tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let press = RelayRequest::ButtonPress {
                    at_ms: monotonic_ms(),
                };
                match relay_tx.try_send(press) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("relay queue full, dropping simulated button press");
                    }
                    Err(TrySendError::Disconnected(_)) => return,
                }
            }
        });
    }

    {
        let base_url = cloud.base_url.clone();
        let temperature_path = cloud.temperature_path.clone();
        let humidity_path = cloud.humidity_path.clone();
        let publish_interval = options.publish_interval;
        tokio::task::spawn_blocking(move || {
            sensor_publish_loop(&base_url, &temperature_path, &humidity_path, publish_interval)
        });
    }

    info!("cloud services started");
}

fn relay_control_loop(requests: Receiver<RelayRequest>, base_url: &str, switch_path: &str) {
    let transport = match ReqwestPutTransport::new(PUT_HTTP_TIMEOUT) {
        Ok(transport) => transport,
        Err(err) => {
            warn!("failed to build cloud HTTP client: {err:#}");
            return;
        }
    };
    let mut store = PutClient::new(transport, base_url);
    let mut state = SwitchState::new(false);
    let mut debouncer = Debouncer::default();

    while let Ok(request) = requests.recv() {
        match request {
            RelayRequest::CloudCommand(on) => match state.apply(on) {
                Some(pulse) => {
                    info!("cloud command: relay {}", if on { "on" } else { "off" });
                    drive_relay(pulse);
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
                drive_relay(pulse);

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

// Hardware integration point: the ESP target pulses the latching relay coil here.
fn drive_relay(pulse: Pulse) {
    info!("relay impulse for {}ms", pulse.duration_ms);
    std::thread::sleep(Duration::from_millis(pulse.duration_ms));
}

fn sensor_publish_loop(
    base_url: &str,
    temperature_path: &str,
    humidity_path: &str,
    publish_interval: Duration,
) {
    let transport = match ReqwestPutTransport::new(PUT_HTTP_TIMEOUT) {
        Ok(transport) => transport,
        Err(err) => {
            warn!("failed to build cloud HTTP client: {err:#}");
            return;
        }
    };
    let mut store = PutClient::new(transport, base_url);

    let mut tick: u64 = 0;
    loop {
        tick = tick.saturating_add(1);

        // Hardware integration point:
        // replace these simulated readings with the DHT11 driver on the ESP target.
        let temperature_c = 21.0 + ((tick % 8) as f32 * 0.2);
        let humidity = 42.0 + ((tick % 6) as f32 * 0.5);

        let outcome = store.put(temperature_path, &Value::Float(temperature_c));
        if !outcome.ok {
            warn!(
                "failed to publish temperature after {} attempts",
                outcome.attempts
            );
        }

        let outcome = store.put(humidity_path, &Value::Float(humidity));
        if !outcome.ok {
            warn!(
                "failed to publish humidity after {} attempts",
                outcome.attempts
            );
        }

        std::thread::sleep(publish_interval);
    }
}

fn stream_once(url: &str, relay_commands: &SyncSender<RelayRequest>) -> anyhow::Result<()> {
    // reqwest's blocking client applies `timeout` per send and per body read
    // (not as a whole-request deadline), so this is the read-inactivity
    // timeout for the stream; the async-only `read_timeout` knob is absent.
    let client = reqwest::blocking::Client::builder()
        .timeout(STREAM_READ_TIMEOUT)
        .build()?;

    let response = client
        .get(url)
        .header("Accept", "text/event-stream")
        .send()?;

    let status = response.status().as_u16();
    if status != 200 {
        bail!("stream request returned HTTP {status}");
    }

    info!("command stream connected");
    let mut session = StreamSession::new(response);
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

impl ReqwestPutTransport {
    fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl PutTransport for ReqwestPutTransport {
    fn put(&mut self, url: &str, body: &str) -> Result<u16, TransportError> {
        let response = self
            .client
            .put(url)
            .header("Content-Type", "application/json")
            .body(body.to_string())
            .send()
            .map_err(|err| TransportError::Request(err.to_string()))?;
        Ok(response.status().as_u16())
    }
}

impl CredentialStore {
    fn new() -> Self {
        let data_dir = std::env::var("CLOUDSWITCH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.cloudswitch"));

        Self {
            path: Arc::new(data_dir.join("station.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_credential(&self) -> anyhow::Result<Option<StationCredential>> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.path.as_ref()).await {
            Ok(raw) => Ok(Some(serde_json::from_slice::<StationCredential>(&raw)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_credential(&self, credential: &StationCredential) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(credential)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
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

#[cfg(test)]
mod tests {
    use cloudswitch_common::dns::DnsHeader;

    use super::*;

    fn a_query(id: u16) -> Vec<u8> {
        let header = DnsHeader {
            id,
            flags: 0x0100,
            qdcount: 1,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        };
        let mut out = header.to_bytes().to_vec();
        for label in ["connectivitycheck", "gstatic", "com"] {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out
    }

    #[tokio::test]
    async fn captive_dns_keeps_serving_after_a_dropped_datagram() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let responder = tokio::spawn(run_captive_dns(server, Ipv4Addr::new(192, 168, 4, 1)));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(server_addr).await.unwrap();

        // Too short for a header; dropped with no reply.
        client.send(&[0x12, 0x34, 0x00]).await.unwrap();

        let query = a_query(0xABCD);
        client.send(&query).await.unwrap();

        let mut buf = [0u8; MAX_DATAGRAM_LEN];
        let len = tokio::time::timeout(Duration::from_secs(5), client.recv(&mut buf))
            .await
            .expect("responder stopped answering after the bad datagram")
            .unwrap();

        let header = DnsHeader::from_bytes(&buf[..len]).unwrap();
        assert_eq!(header.id, 0xABCD);
        assert_eq!(header.ancount, 1);
        assert_eq!(&buf[len - 4..len], [192, 168, 4, 1]);

        responder.abort();
    }
}
