//! TCP simultaneous-open through NAT
//!
//! Both peers learn each other's public endpoint and a shared "go" time out
//! of band. At go time each side connects from the local port its NAT mapping
//! was learned on. While the far NAT has not yet opened its pinhole the
//! attempt is refused, reset or times out; those are retried with linear
//! backoff. Any other socket error is reported immediately.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ShareError, ShareResult};

/// Timing knobs for [`attempt_connect_with`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PunchOptions {
    /// Extra wait after go time so both sides' clocks have passed it
    pub sync_delay: Duration,
    /// Connect attempts before giving up
    pub max_attempts: u32,
    /// Backoff after attempt `n` is `backoff_step * n`
    pub backoff_step: Duration,
    /// Per-attempt connect timeout
    pub connect_timeout: Duration,
}

impl Default for PunchOptions {
    fn default() -> Self {
        Self {
            sync_delay: Duration::from_millis(50),
            max_attempts: 8,
            backoff_step: Duration::from_millis(200),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

/// Connect to `remote` from `local_port` starting at `go_time`.
pub async fn attempt_connect(
    remote: SocketAddr,
    local_port: u16,
    go_time: SystemTime,
    cancel: &CancellationToken,
) -> ShareResult<TcpStream> {
    attempt_connect_with(remote, local_port, go_time, PunchOptions::default(), cancel).await
}

/// [`attempt_connect`] with explicit timing.
pub async fn attempt_connect_with(
    remote: SocketAddr,
    local_port: u16,
    go_time: SystemTime,
    options: PunchOptions,
    cancel: &CancellationToken,
) -> ShareResult<TcpStream> {
    let until_go = go_time
        .duration_since(SystemTime::now())
        .unwrap_or(Duration::ZERO);
    debug!(%remote, local_port, ?until_go, "Waiting for punch go time");

    tokio::select! {
        _ = cancel.cancelled() => return Err(ShareError::Cancelled),
        _ = tokio::time::sleep(until_go + options.sync_delay) => {}
    }

    let mut last_error = String::new();
    for attempt in 1..=options.max_attempts.max(1) {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(ShareError::Cancelled),
            r = connect_once(remote, local_port, options.connect_timeout) => r,
        };

        match result {
            Ok(stream) => {
                info!(%remote, local_port, attempt, "Hole punch connected");
                return Ok(stream);
            }
            Err(e) if e.is_transient() => {
                debug!(%remote, attempt, error = %e, "Punch attempt failed, retrying");
                last_error = e.to_string();
                if attempt < options.max_attempts {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ShareError::Cancelled),
                        _ = tokio::time::sleep(options.backoff_step * attempt) => {}
                    }
                }
            }
            Err(e) => {
                warn!(%remote, attempt, error = %e, "Hole punch failed");
                return Err(ShareError::Transport(format!(
                    "hole punch to {} failed: {}",
                    remote, e
                )));
            }
        }
    }

    Err(ShareError::Transport(format!(
        "hole punch to {} gave up after {} attempts: {}",
        remote, options.max_attempts, last_error
    )))
}

/// One connect from a freshly bound, port-reusing socket.
async fn connect_once(
    remote: SocketAddr,
    local_port: u16,
    timeout: Duration,
) -> ShareResult<TcpStream> {
    let local_ip = match remote.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let local = SocketAddr::new(local_ip, local_port);

    let socket = Socket::new(Domain::for_address(remote), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nodelay(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;

    let socket = TcpSocket::from_std_stream(socket.into());
    match tokio::time::timeout(timeout, socket.connect(remote)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ShareError::Timeout(format!("connect to {}", remote))),
    }
}

/// NAT behaviour class of one side, as reported by an external NAT test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NatType {
    /// Public address, no translation
    Open,
    /// Any external host may use an established mapping
    FullCone,
    /// Mapping only accepts hosts we already contacted
    RestrictedCone,
    /// New mapping per destination
    Symmetric,
    /// No usable outbound mapping
    Blocked,
}

impl std::str::FromStr for NatType {
    type Err = ShareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "open" => Ok(NatType::Open),
            "full-cone" => Ok(NatType::FullCone),
            "restricted-cone" | "restricted" | "port-restricted" => Ok(NatType::RestrictedCone),
            "symmetric" => Ok(NatType::Symmetric),
            "blocked" => Ok(NatType::Blocked),
            other => Err(ShareError::Config(format!("unknown NAT type: {}", other))),
        }
    }
}

/// Coarse chance that a punch between two NAT classes succeeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PunchLikelihood {
    Impossible,
    Low,
    Medium,
    High,
}

impl PunchLikelihood {
    /// Rough probability used for display
    pub fn probability(&self) -> f32 {
        match self {
            PunchLikelihood::Impossible => 0.0,
            PunchLikelihood::Low => 0.2,
            PunchLikelihood::Medium => 0.7,
            PunchLikelihood::High => 0.95,
        }
    }
}

impl std::fmt::Display for PunchLikelihood {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PunchLikelihood::Impossible => "impossible",
            PunchLikelihood::Low => "low",
            PunchLikelihood::Medium => "medium",
            PunchLikelihood::High => "high",
        };
        write!(f, "{}", s)
    }
}

/// Estimate how likely a punch between `local` and `remote` is to work.
///
/// Symmetric with respect to its arguments.
pub fn estimate_success(local: NatType, remote: NatType) -> PunchLikelihood {
    use NatType::*;

    match (local, remote) {
        (Blocked, _) | (_, Blocked) => PunchLikelihood::Impossible,
        (Open, _) | (_, Open) => PunchLikelihood::High,
        (FullCone, _) | (_, FullCone) => PunchLikelihood::High,
        (RestrictedCone, RestrictedCone) => PunchLikelihood::Medium,
        (RestrictedCone, Symmetric) | (Symmetric, RestrictedCone) => PunchLikelihood::Low,
        (Symmetric, Symmetric) => PunchLikelihood::Low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn fast() -> PunchOptions {
        PunchOptions {
            sync_delay: Duration::from_millis(1),
            max_attempts: 3,
            backoff_step: Duration::from_millis(10),
            connect_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_estimate_table() {
        use NatType::*;
        assert_eq!(estimate_success(Blocked, Open), PunchLikelihood::Impossible);
        assert_eq!(estimate_success(Open, Symmetric), PunchLikelihood::High);
        assert_eq!(estimate_success(FullCone, RestrictedCone), PunchLikelihood::High);
        assert_eq!(estimate_success(RestrictedCone, RestrictedCone), PunchLikelihood::Medium);
        assert_eq!(estimate_success(Symmetric, Symmetric), PunchLikelihood::Low);
    }

    #[test]
    fn test_estimate_is_symmetric() {
        use NatType::*;
        let all = [Open, FullCone, RestrictedCone, Symmetric, Blocked];
        for a in all {
            for b in all {
                assert_eq!(estimate_success(a, b), estimate_success(b, a));
            }
        }
    }

    #[test]
    fn test_nat_type_parsing() {
        assert_eq!("full_cone".parse::<NatType>().unwrap(), NatType::FullCone);
        assert_eq!("Symmetric".parse::<NatType>().unwrap(), NatType::Symmetric);
        assert!("carrier-grade".parse::<NatType>().is_err());
    }

    #[tokio::test]
    async fn test_connects_to_listening_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.map(|(s, _)| s) });

        let stream = attempt_connect_with(
            remote,
            0,
            SystemTime::now(),
            fast(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(stream.peer_addr().unwrap(), remote);
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_refused_retries_then_gives_up() {
        // Grab a free port and release it so nothing listens there
        let remote = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };

        let result =
            attempt_connect_with(remote, 0, SystemTime::now(), fast(), &CancellationToken::new())
                .await;

        match result {
            Err(ShareError::Transport(msg)) => assert!(msg.contains("3 attempts"), "{}", msg),
            other => panic!("expected transport error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_before_go_time() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = attempt_connect(
            "127.0.0.1:9".parse().unwrap(),
            0,
            SystemTime::now() + Duration::from_secs(3600),
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(ShareError::Cancelled)));
    }
}
