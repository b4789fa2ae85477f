//! Background discovery sessions.
//!
//! [`DiscoveryEngine`] owns a repeating M-SEARCH loop on a multicast UDP
//! socket and collects responding printers. Sessions are bounded by a
//! window and can be stopped early; the engine outlives its sessions and
//! keeps the last findings until a new session starts.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{DiscoveryError, Result};
use crate::ssdp::{self, DiscoveredPrinter};

/// Default length of a discovery session.
pub const DEFAULT_DISCOVERY_WINDOW: Duration = Duration::from_secs(10);

/// Tunables for discovery sessions.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Multicast group to query.
    pub multicast_group: Ipv4Addr,
    /// Port to bind and query; Bambu printers use 2021.
    pub port: u16,
    /// How often the search query is re-sent.
    pub requery_interval: Duration,
    /// Re-send cadence when running on a fallback ephemeral port.
    pub fallback_requery_interval: Duration,
    /// Upper bound on a single receive wait; keeps stop responsive.
    pub poll_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            multicast_group: ssdp::MULTICAST_GROUP,
            port: ssdp::DISCOVERY_PORT,
            requery_interval: Duration::from_secs(3),
            fallback_requery_interval: Duration::from_secs(2),
            poll_timeout: Duration::from_millis(100),
        }
    }
}

type PrinterMap = Arc<Mutex<HashMap<String, DiscoveredPrinter>>>;

struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Collects Bambu printers answering SSDP searches on the local network.
///
/// One engine is constructed by the application and shared by reference;
/// it runs at most one session at a time.
pub struct DiscoveryEngine {
    config: DiscoveryConfig,
    discovered: PrinterMap,
    running: Arc<AtomicBool>,
    session: AsyncMutex<Option<Session>>,
}

impl DiscoveryEngine {
    /// Creates an engine with default settings.
    pub fn new() -> Self {
        Self::with_config(DiscoveryConfig::default())
    }

    /// Creates an engine with custom settings.
    pub fn with_config(config: DiscoveryConfig) -> Self {
        Self {
            config,
            discovered: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            session: AsyncMutex::new(None),
        }
    }

    /// Starts a discovery session running for `window`.
    ///
    /// Returns immediately; the scan proceeds in the background. Calling
    /// this while a session is running does nothing. Printers from the
    /// previous session are cleared when a new session starts.
    pub async fn start(&self, window: Duration) {
        let mut slot = self.session.lock().await;
        if self.running.load(Ordering::SeqCst) {
            debug!("discovery session already running, start ignored");
            return;
        }

        self.discovered.lock().clear();
        self.running.store(true, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        let config = self.config.clone();
        let discovered = Arc::clone(&self.discovered);
        let running = Arc::clone(&self.running);
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = run_session(&config, window, &discovered, &task_cancel).await {
                warn!("discovery session aborted: {e}");
            }
            running.store(false, Ordering::SeqCst);
        });

        *slot = Some(Session { cancel, task });
    }

    /// Stops the running session and waits for it to unwind.
    ///
    /// The discovery socket is guaranteed to be released when this
    /// returns. Safe to call when no session is running.
    pub async fn stop(&self) {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.take() {
            session.cancel.cancel();
            if let Err(e) = session.task.await {
                debug!("discovery task join failed: {e}");
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether a session is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Point-in-time copy of everything found, in discovery order.
    pub fn printers(&self) -> Vec<DiscoveredPrinter> {
        sorted(&self.discovered)
    }
}

impl Default for DiscoveryEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a single discovery session and returns everything found.
///
/// Convenience for callers that do not need a long-lived engine.
pub async fn discover(window: Duration) -> Result<Vec<DiscoveredPrinter>> {
    discover_with(DiscoveryConfig::default(), window).await
}

/// Runs a single discovery session with custom settings.
pub async fn discover_with(
    config: DiscoveryConfig,
    window: Duration,
) -> Result<Vec<DiscoveredPrinter>> {
    let discovered: PrinterMap = Arc::new(Mutex::new(HashMap::new()));
    let cancel = CancellationToken::new();
    run_session(&config, window, &discovered, &cancel).await?;
    Ok(sorted(&discovered))
}

fn sorted(discovered: &PrinterMap) -> Vec<DiscoveredPrinter> {
    let mut printers: Vec<_> = discovered.lock().values().cloned().collect();
    printers.sort_by(|a, b| {
        a.discovered_at
            .cmp(&b.discovered_at)
            .then_with(|| a.serial.cmp(&b.serial))
    });
    printers
}

/// Records a printer unless its serial was already seen this session.
fn register(discovered: &PrinterMap, printer: DiscoveredPrinter) -> bool {
    let mut map = discovered.lock();
    if map.contains_key(&printer.serial) {
        return false;
    }
    info!(
        "discovered printer {} ({}) at {}",
        printer.name, printer.serial, printer.ip_address
    );
    map.insert(printer.serial.clone(), printer);
    true
}

async fn run_session(
    config: &DiscoveryConfig,
    window: Duration,
    discovered: &PrinterMap,
    cancel: &CancellationToken,
) -> Result<()> {
    let group = config.multicast_group;
    let (socket, requery_interval) = match open_socket(group, config.port) {
        Ok(socket) => (socket, config.requery_interval),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            warn!(
                "discovery port {} in use, retrying on an ephemeral port",
                config.port
            );
            let socket = open_socket(group, 0)
                .map_err(|e| DiscoveryError::SocketSetup(e.to_string()))?;
            (socket, config.fallback_requery_interval)
        }
        Err(e) => return Err(DiscoveryError::SocketSetup(e.to_string())),
    };
    let socket = UdpSocket::from_std(socket)?;

    let query = ssdp::build_msearch(group, config.port);
    let target = SocketAddr::from((group, config.port));
    let deadline = Instant::now() + window;
    let mut buf = [0u8; 2048];

    info!("discovery session started ({:?} window)", window);
    send_query(&socket, &query, target).await;
    let mut last_query = Instant::now();

    while Instant::now() < deadline {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("discovery session cancelled");
                break;
            }
            received = timeout(config.poll_timeout, socket.recv_from(&mut buf)) => {
                match received {
                    Ok(Ok((len, addr))) => {
                        let text = ssdp::decode_text(&buf[..len]);
                        match ssdp::parse_response(&text, addr.ip()) {
                            Some(printer) => {
                                register(discovered, printer);
                            }
                            None => debug!("ignoring datagram from {addr}"),
                        }
                    }
                    Ok(Err(e)) => debug!("discovery receive failed: {e}"),
                    Err(_) => {}
                }
            }
        }
        if last_query.elapsed() >= requery_interval {
            send_query(&socket, &query, target).await;
            last_query = Instant::now();
        }
    }

    info!(
        "discovery session finished, {} printer(s) found",
        discovered.lock().len()
    );
    Ok(())
}

/// Opens the discovery socket: reusable, non-blocking, joined to the
/// multicast group, broadcast enabled.
fn open_socket(group: Ipv4Addr, port: u16) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&bind_addr.into())?;

    let socket: std::net::UdpSocket = socket.into();
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

async fn send_query(socket: &UdpSocket, query: &str, target: SocketAddr) {
    match socket.send_to(query.as_bytes(), target).await {
        Ok(_) => debug!("sent M-SEARCH to {target}"),
        Err(e) => debug!("discovery query send failed: {e}"),
    }
}
