use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::watch;
use tokio::time::{timeout, Instant};

use crate::util::message::{DeviceRecord, ParseError};
use crate::util::traits::RecordSink;

/// Multicast group and port bulbs announce themselves on.
pub const DISCOVERY_MULTICAST_ADDRESS: &str = "239.255.255.250:1982";
pub const DISCOVERY_PORT: u16 = 1982;

pub const MAX_DATAGRAM_SIZE: usize = 8192;

/// How long one listener read may block before cancellation is re-checked.
pub const LISTEN_READ_DEADLINE: Duration = Duration::from_secs(2);

/// How long a probe waits for its reply.
pub const PROBE_READ_DEADLINE: Duration = Duration::from_secs(5);

/// Bulbs re-announce the same state several times in a row; records from one
/// device inside this window are dropped.
pub const DEFAULT_BOUNCE_WINDOW: Duration = Duration::from_secs(30);

const SEARCH_MESSAGE: &[u8] = b"M-SEARCH * HTTP/1.1\r\n\
HOST: 239.255.255.250:1982\r\n\
MAN: \"ssdp:discover\"\r\n\
ST: wifi_bulb\r\n";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("cannot resolve address `{address}`: {reason}")]
    Resolve { address: String, reason: String },
    #[error("cannot bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("socket failure: {0}")]
    Transport(#[source] io::Error),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("malformed reply: {0}")]
    Parse(#[from] ParseError),
    #[error("reply from {0} is not a bulb announcement")]
    NotApplicable(SocketAddr),
}

/// Resolves `address` to its first IPv4 socket address.
pub async fn resolve(address: &str) -> Result<SocketAddr, DiscoveryError> {
    let mut candidates = lookup_host(address)
        .await
        .map_err(|e| DiscoveryError::Resolve {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
    candidates
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| DiscoveryError::Resolve {
            address: address.to_string(),
            reason: "no IPv4 address".to_string(),
        })
}

/**
Passive receiver for bulb announcements.

When bound to a multicast address, the socket binds the group's port on all
interfaces and joins the group. Any other address is bound as is, which is
what the tests use.
*/
pub struct DiscoveryListener {
    socket: UdpSocket,
}

impl DiscoveryListener {
    pub async fn bind(address: &str) -> Result<Self, DiscoveryError> {
        let resolved = resolve(address).await?;
        let SocketAddr::V4(v4) = resolved else {
            return Err(DiscoveryError::Resolve {
                address: address.to_string(),
                reason: "no IPv4 address".to_string(),
            });
        };
        let socket = Self::open_socket(v4).map_err(|source| DiscoveryError::Bind {
            address: resolved,
            source,
        })?;
        info!("Listening for announcements on {}", resolved);
        Ok(DiscoveryListener { socket })
    }

    fn open_socket(address: SocketAddrV4) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_recv_buffer_size(MAX_DATAGRAM_SIZE)?;
        if address.ip().is_multicast() {
            let any = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, address.port());
            socket.bind(&any.into())?;
            socket.join_multicast_v4(address.ip(), &Ipv4Addr::UNSPECIFIED)?;
        } else {
            socket.bind(&address.into())?;
        }
        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket.into())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /**
    Receives datagrams until `cancel` turns `true`.

    Cancellation is checked before every read and every read is bounded by
    [`LISTEN_READ_DEADLINE`], so the loop returns at most one deadline after
    the signal is raised. Each decoded record is handed to `sink` and awaited
    before the next read. A socket error other than a timeout ends the loop
    with [`DiscoveryError::Transport`]; restarting is up to the caller.
    */
    pub async fn run<S>(self, sink: &S, cancel: watch::Receiver<bool>) -> Result<(), DiscoveryError>
    where
        S: RecordSink + ?Sized,
    {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            if *cancel.borrow() {
                info!("Listener stopped");
                return Ok(());
            }

            match timeout(LISTEN_READ_DEADLINE, self.socket.recv_from(&mut buffer)).await {
                Err(_) => continue,
                Ok(Ok((number_of_bytes, source))) => {
                    Self::handle_datagram(&buffer[..number_of_bytes], source, sink).await;
                }
                Ok(Err(e)) => {
                    if *cancel.borrow() {
                        return Ok(());
                    }
                    return Err(DiscoveryError::Transport(e));
                }
            }
        }
    }

    async fn handle_datagram<S>(data: &[u8], source: SocketAddr, sink: &S)
    where
        S: RecordSink + ?Sized,
    {
        match DeviceRecord::parse(data) {
            Ok(Some(record)) => {
                debug!("Announcement from {}: {}", source, record);
                sink.on_record(record).await;
            }
            Ok(None) => debug!("Ignoring foreign datagram from {}", source),
            Err(e) => warn!("Dropping malformed announcement from {}: {}", source, e),
        }
    }
}

/**
Sends one search request to `remote` from a socket bound to `local` and waits
up to [`PROBE_READ_DEADLINE`] for a single reply.

The transient socket is dropped on every return path.
*/
pub async fn probe_once(local: &str, remote: &str) -> Result<DeviceRecord, DiscoveryError> {
    let local = resolve(local).await?;
    let remote = resolve(remote).await?;

    let socket = UdpSocket::bind(local)
        .await
        .map_err(|source| DiscoveryError::Bind {
            address: local,
            source,
        })?;
    socket
        .send_to(SEARCH_MESSAGE, remote)
        .await
        .map_err(DiscoveryError::Transport)?;
    debug!("Sent search request to {}", remote);

    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
    let (number_of_bytes, source) = timeout(PROBE_READ_DEADLINE, socket.recv_from(&mut buffer))
        .await
        .map_err(|_| DiscoveryError::Timeout(PROBE_READ_DEADLINE))?
        .map_err(DiscoveryError::Transport)?;

    let record = DeviceRecord::parse(&buffer[..number_of_bytes])?
        .ok_or(DiscoveryError::NotApplicable(source))?;
    debug!("Probe reply from {}: {}", source, record);
    Ok(record)
}

/**
Drops records that arrive from the same device within `window` of the last
record accepted from it.

Acceptance is tracked per device identity, so a chatty bulb does not hide the
others.
*/
pub struct Debounced<S> {
    inner: S,
    window: Duration,
    last_accepted: Mutex<HashMap<String, Instant>>,
}

impl<S> Debounced<S> {
    pub fn new(inner: S, window: Duration) -> Self {
        Debounced {
            inner,
            window,
            last_accepted: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn accept(&self, identity: &str) -> bool {
        let now = Instant::now();
        let mut last_accepted = self
            .last_accepted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match last_accepted.get(identity) {
            Some(last) if now.duration_since(*last) < self.window => false,
            _ => {
                last_accepted.insert(identity.to_string(), now);
                true
            }
        }
    }
}

#[async_trait]
impl<S> RecordSink for Debounced<S>
where
    S: RecordSink,
{
    async fn on_record(&self, record: DeviceRecord) {
        if self.accept(&record.identity) {
            self.inner.on_record(record).await;
        } else {
            debug!("Debounced announcement from {}", record.identity);
        }
    }
}
