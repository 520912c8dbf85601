use std::{
    fmt,
    net::{IpAddr, SocketAddr, SocketAddrV4},
    os::unix::io::{AsRawFd, RawFd},
};

use anyhow::{anyhow, Result};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;

// Strong type for the raw ICMPv4 socket
pub struct IcmpSocket(Socket);

impl IcmpSocket {
    /// Open a nonblocking raw ICMPv4 socket. Needs CAP_NET_RAW (or root)
    /// on Linux.
    pub fn new() -> Result<IcmpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
            .map_err(|err| {
                anyhow!(
                    "insufficient privilege or unsupported platform: {}",
                    err
                )
            })?;
        socket.set_nonblocking(true)?;

        Ok(IcmpSocket(socket))
    }
    pub fn get_mut(&mut self) -> &mut Socket {
        &mut self.0
    }
    pub fn get_ref(&self) -> &Socket {
        &self.0
    }
}

impl AsRawFd for IcmpSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

pub struct AsyncIcmpSocket {
    inner: AsyncFd<IcmpSocket>,
}

impl AsyncIcmpSocket {
    pub fn new(socket: IcmpSocket) -> Result<Self> {
        Ok(Self {
            inner: AsyncFd::new(socket)?,
        })
    }

    pub async fn send_to(
        &mut self,
        packet: &[u8],
        addr: IpAddr,
    ) -> Result<usize> {
        let mut guard = self.inner.writable().await?;
        let addr = match addr {
            IpAddr::V4(addr) => {
                SockAddr::from(SocketAddr::V4(SocketAddrV4::new(addr, 0)))
            }
            IpAddr::V6(_) => {
                return Err(anyhow!("IPv6 is not supported"));
            }
        };
        match guard
            .try_io(|inner| inner.get_ref().get_ref().send_to(packet, &addr))
        {
            Ok(res) => Ok(res?),
            Err(_would_block) => Err(anyhow!("error sending packet")),
        }
    }

    /// Receive one datagram, returning its length and source address.
    pub async fn recv_from(
        &mut self,
        buf: &mut [u8],
    ) -> Result<(usize, IpAddr)> {
        loop {
            let mut guard = self.inner.readable().await?;
            // Safety: recv_from only ever writes into the buffer
            let uninit_slice = unsafe { core::mem::transmute(&mut *buf) };

            match guard
                .try_io(|inner| inner.get_ref().get_ref().recv_from(uninit_slice))
            {
                Ok(Ok((n, addr))) => {
                    let src = addr
                        .as_socket()
                        .map(|sockaddr| sockaddr.ip())
                        .ok_or_else(|| {
                            anyhow!("received datagram without source address")
                        })?;
                    return Ok((n, src));
                }
                Ok(Err(e)) => Err(anyhow!(e.to_string()))?,
                Err(_would_block) => continue,
            }
        }
    }
}

/// Send/receive accounting for one probe session.
///
/// Mutated only by the probe loop: every send bumps `transmitted`, every
/// correlated reply bumps `received` and appends its round-trip time in
/// milliseconds. Never reset within a session.
pub struct Stats {
    transmitted: u64,
    received: u64,
    rtts: Vec<f64>,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            transmitted: 0,
            received: 0,
            rtts: Vec::new(),
        }
    }

    pub fn record_sent(&mut self) {
        self.transmitted += 1;
    }

    pub fn record_rtt(&mut self, rtt_ms: f64) {
        self.received += 1;
        self.rtts.push(rtt_ms);
    }

    pub fn transmitted(&self) -> u64 {
        self.transmitted
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Packet loss in percent. Zero when nothing was sent yet, so the
    /// report can be requested before the first probe.
    pub fn loss_pct(&self) -> f64 {
        if self.transmitted == 0 {
            return 0.0;
        }
        (1.0 - self.received as f64 / self.transmitted as f64) * 100.0
    }

    /// Min, arithmetic mean and max round-trip time, or `None` while no
    /// reply has been received.
    pub fn summary(&self) -> Option<(f64, f64, f64)> {
        if self.rtts.is_empty() {
            return None;
        }
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        for &rtt in &self.rtts {
            min = min.min(rtt);
            max = max.max(rtt);
            sum += rtt;
        }
        Some((min, sum / self.rtts.len() as f64, max))
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} transmitted, {} received, {}% packet loss",
            self.transmitted,
            self.received,
            self.loss_pct().round()
        )?;
        match self.summary() {
            Some((min, avg, max)) => write!(
                f,
                "rtt min/avg/max = {:.3}/{:.3}/{:.3} ms",
                min, avg, max
            ),
            None => write!(f, "not enough data for rtt statistics"),
        }
    }
}
