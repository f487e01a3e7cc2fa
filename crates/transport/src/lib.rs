use anyhow::{bail, Result};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tracing::debug;

/// Largest payload a single UDP datagram can carry.
pub const MAX_DATAGRAM: usize = 65_507;

pub fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

pub fn interrupted(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted
}

/// A receive that came back empty because the read timeout elapsed, not
/// because the socket failed. `WouldBlock` is what Unix reports for a timed
/// out `recvfrom`, `TimedOut` is what Windows reports.
pub fn timed_out(err: &io::Error) -> bool {
    would_block(err) || err.kind() == io::ErrorKind::TimedOut
}

/// A blocking UDP endpoint shared by every thread that touches the wire.
///
/// Sends of a single datagram are atomic at the packet level, so workers may
/// call [`Endpoint::send`] concurrently without extra locking. The optional
/// drop rate simulates a lossy network on [`Endpoint::send_lossy`] only.
pub struct Endpoint {
    sock: UdpSocket,
    drop_rate: f64,
}

impl Endpoint {
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let sock = UdpSocket::bind(addr)?;
        Ok(Self {
            sock,
            drop_rate: 0.0,
        })
    }

    pub fn with_drop_rate(mut self, drop_rate: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&drop_rate) {
            bail!("drop rate must be within [0, 1], got {drop_rate}");
        }

        self.drop_rate = drop_rate;
        Ok(self)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.sock.local_addr()?)
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.sock.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Receives one datagram, retrying on EINTR. Timeouts surface as an
    /// error matching [`timed_out`].
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        loop {
            match self.sock.recv_from(buf) {
                Ok(res) => return Ok(res),
                Err(ref err) if interrupted(err) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Sends one datagram, retrying on EINTR. A partial write of a datagram
    /// cannot happen on a correctly sized payload and is treated as an error.
    pub fn send(&self, buf: &[u8], to: SocketAddr) -> io::Result<()> {
        loop {
            match self.sock.send_to(buf, to) {
                Ok(n) if n == buf.len() => return Ok(()),
                Ok(n) => {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        format!("short datagram write: {} < {}", n, buf.len()),
                    ))
                }
                Err(ref err) if interrupted(err) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Like [`Endpoint::send`] but subject to the loss-simulation knob.
    /// Returns `false` when the datagram was silently discarded.
    pub fn send_lossy(&self, buf: &[u8], to: SocketAddr) -> io::Result<bool> {
        if self.drop_rate > 0.0 && rand::random::<f64>() < self.drop_rate {
            debug!(%to, len = buf.len(), "loss simulation dropped datagram");
            return Ok(false);
        }

        self.send(buf, to)?;
        Ok(true)
    }
}
