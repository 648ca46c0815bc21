//! Free port negotiation for the runtime and the API server.

use std::net::{Ipv4Addr, TcpListener};

use serde::Serialize;
use tracing::debug;

use crate::error::{Result, RuntimeError};

/// Outcome of a successful port reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortLease {
    /// Port the caller asked for.
    pub requested: u16,
    /// Port that was found free.
    pub bound: u16,
}

impl PortLease {
    /// Whether the preferred port was taken and another one was chosen.
    pub fn diverged(&self) -> bool {
        self.requested != self.bound
    }
}

/// Checks whether a port can currently be bound.
pub trait PortProbe: Send + Sync {
    /// `true` if `port` is free.
    fn is_free(&self, port: u16) -> bool;
}

/// Probes by binding `127.0.0.1:<port>` exclusively and releasing it.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpBindProbe;

impl PortProbe for TcpBindProbe {
    fn is_free(&self, port: u16) -> bool {
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
    }
}

/// Scans upward from a preferred port for the first free one.
#[derive(Debug, Default, Clone)]
pub struct PortNegotiator<P = TcpBindProbe> {
    probe: P,
}

impl PortNegotiator<TcpBindProbe> {
    /// Negotiator that probes real sockets.
    pub fn new() -> Self {
        Self { probe: TcpBindProbe }
    }
}

impl<P: PortProbe> PortNegotiator<P> {
    /// Negotiator with a custom probe.
    pub fn with_probe(probe: P) -> Self {
        Self { probe }
    }

    /// Reserve the first free port in `preferred, preferred + 1, …`, trying at
    /// most `max_attempts` candidates. The scan stops at 65535.
    ///
    /// Port 0 is never handed out; a scan from 0 starts at 1.
    pub fn reserve(&self, preferred: u16, max_attempts: u32) -> Result<PortLease> {
        let candidates = (preferred.max(1)..=u16::MAX).take(max_attempts as usize);

        for port in candidates {
            if self.probe.is_free(port) {
                if port != preferred {
                    debug!("Port {} busy, using {}", preferred, port);
                }
                return Ok(PortLease {
                    requested: preferred,
                    bound: port,
                });
            }
        }

        Err(RuntimeError::NoPortAvailable {
            preferred,
            attempts: max_attempts,
        })
    }
}
