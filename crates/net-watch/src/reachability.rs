//! OS-level "is a network path available" check

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};

/// Default probe targets (public DNS resolvers). Nothing is ever sent to them.
pub const DEFAULT_PROBE_ADDRS: [&str; 2] = ["1.1.1.1:53", "8.8.8.8:53"];

/// Best-effort reachability primitive shared by the watcher and its reactions.
///
/// Implementations must never panic; a failure to query means offline.
pub trait Reachability: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Route-based probe.
///
/// Connecting an unbound UDP socket only asks the kernel to pick a route, so it
/// fails fast with `ENETUNREACH` when no interface can reach the target and
/// succeeds otherwise, without putting a packet on the wire.
#[derive(Debug, Clone)]
pub struct RouteProbe {
    targets: Vec<SocketAddr>,
}

impl RouteProbe {
    pub fn new(targets: Vec<SocketAddr>) -> Self {
        Self { targets }
    }

    pub fn targets(&self) -> &[SocketAddr] {
        &self.targets
    }

    fn probe(target: &SocketAddr) -> bool {
        let bind_addr = if target.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = match UdpSocket::bind(bind_addr) {
            Ok(socket) => socket,
            Err(e) => {
                log::debug!("route_probe: bind failed for {} error={}", target, e);
                return false;
            }
        };
        match socket.connect(target) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("route_probe: no route to {} error={}", target, e);
                false
            }
        }
    }
}

impl Default for RouteProbe {
    fn default() -> Self {
        let targets = DEFAULT_PROBE_ADDRS
            .iter()
            .filter_map(|addr| addr.parse().ok())
            .collect();
        Self { targets }
    }
}

impl Reachability for RouteProbe {
    fn is_online(&self) -> bool {
        self.targets.iter().any(Self::probe)
    }
}

impl Reachability for AtomicBool {
    fn is_online(&self) -> bool {
        self.load(Ordering::SeqCst)
    }
}

impl<F> Reachability for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_online(&self) -> bool {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn route_probe_without_targets_reports_offline() {
        let probe = RouteProbe::new(Vec::new());
        assert!(!probe.is_online());
    }

    #[test]
    fn default_route_probe_parses_all_targets() {
        let probe = RouteProbe::default();
        assert_eq!(probe.targets().len(), DEFAULT_PROBE_ADDRS.len());
    }

    #[test]
    fn atomic_flag_and_closure_act_as_reachability() {
        let flag = Arc::new(AtomicBool::new(false));
        assert!(!flag.is_online());
        flag.store(true, Ordering::SeqCst);
        assert!(flag.is_online());

        let always = || true;
        assert!(always.is_online());
    }
}
