use std::{
    fmt,
    net::IpAddr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Context, Result};
use common::{AsyncIcmpSocket, IcmpSocket, Stats};
use tokio::{signal, time::Instant};

use crate::{
    args,
    packet::{self, EchoMessage},
};

/// Destination Unreachable flavors the session reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unreachable {
    Network,
    Host,
}

impl fmt::Display for Unreachable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Unreachable::Network => write!(f, "Destination Network Unreachable"),
            Unreachable::Host => write!(f, "Destination Host Unreachable"),
        }
    }
}

/// Classification of one received datagram against the in-flight probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReplyClass {
    /// Echo reply carrying our identifier and the current sequence.
    Match(EchoMessage),
    /// Destination unreachable, terminal for the session.
    Unreachable(Unreachable),
    /// Anything else: foreign identifier, stale sequence, unrecognized
    /// type, or a datagram too short to decode. The wait goes on.
    Ignore,
}

/// Classify a raw datagram (IP header still in front) against the probe
/// identified by `identifier` and `sequence`.
pub fn classify(datagram: &[u8], identifier: u16, sequence: u16) -> ReplyClass {
    if datagram.len() < packet::IPV4_HEADER_LEN {
        return ReplyClass::Ignore;
    }
    let msg = match EchoMessage::decode(&datagram[packet::IPV4_HEADER_LEN..]) {
        Ok(msg) => msg,
        Err(_) => return ReplyClass::Ignore,
    };
    match (msg.icmp_type, msg.code) {
        (packet::ECHO_REPLY, 0)
            if msg.identifier == identifier && msg.sequence == sequence =>
        {
            ReplyClass::Match(msg)
        }
        (packet::DEST_UNREACHABLE, packet::NET_UNREACHABLE) => {
            ReplyClass::Unreachable(Unreachable::Network)
        }
        (packet::DEST_UNREACHABLE, packet::HOST_UNREACHABLE) => {
            ReplyClass::Unreachable(Unreachable::Host)
        }
        _ => ReplyClass::Ignore,
    }
}

/// Outcome of one deadline-bounded wait for a reply.
pub enum RecvOutcome {
    Reply {
        from: IpAddr,
        rtt_ms: f64,
        len: usize,
    },
    TimedOut,
    Unreachable(Unreachable),
}

pub struct IcmpClient {
    /// ICMP socket
    socket: AsyncIcmpSocket,
    /// Target host as given on the command line, resolved per send
    host: String,
    /// Wait per probe before declaring a timeout
    timeout: Duration,
    /// Pause between probe cycles
    interval: Duration,
    /// Number of cycles to run, 0 meaning until interrupted
    count: u64,
    /// Identifier of ICMP packets (random per session)
    identifier: u16,
    /// Sequence number of the most recent send
    sequence: u16,
    /// Send/receive/rtt statistics
    stats: Stats,
}

impl IcmpClient {
    pub fn new(args: &args::Opts) -> Result<IcmpClient> {
        let socket = IcmpSocket::new()?;

        Ok(IcmpClient {
            socket: AsyncIcmpSocket::new(socket)?,
            host: args.host.clone(),
            timeout: Duration::from_secs_f64(args.timeout),
            interval: Duration::from_secs_f64(args.interval),
            count: args.count,
            identifier: rand::random::<u16>(),
            sequence: 0,
            stats: Stats::new(),
        })
    }

    fn resolve(&self) -> Result<IpAddr> {
        let addrs = dns_lookup::lookup_host(&self.host)
            .with_context(|| format!("could not resolve {}", self.host))?;
        addrs
            .into_iter()
            .find(|addr| addr.is_ipv4())
            .ok_or_else(|| anyhow!("{} has no IPv4 address", self.host))
    }

    /// Send one echo request and return its sequence number for
    /// correlation.
    async fn send_probe(&mut self) -> Result<u16> {
        let dst_addr = self.resolve()?;
        self.sequence = self.sequence.wrapping_add(1);
        let timestamp =
            SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs_f64();
        let msg =
            EchoMessage::echo_request(self.identifier, self.sequence, timestamp);
        self.socket.send_to(&msg.encode(), dst_addr).await?;
        self.stats.record_sent();
        Ok(self.sequence)
    }

    /// Wait for the reply to the probe sent with `sequence`.
    ///
    /// The timeout is one absolute deadline for the whole wait: datagrams
    /// that match neither our probe nor an unreachable report re-enter
    /// the wait without extending it.
    async fn recv_probe(&mut self, sequence: u16) -> Result<RecvOutcome> {
        let mut buf = [0u8; 1500];
        let deadline = Instant::now() + self.timeout;
        loop {
            let (len, from) = match tokio::time::timeout_at(
                deadline,
                self.socket.recv_from(&mut buf),
            )
            .await
            {
                Ok(res) => res?,
                Err(_elapsed) => return Ok(RecvOutcome::TimedOut),
            };
            match classify(&buf[..len], self.identifier, sequence) {
                ReplyClass::Match(msg) => {
                    let now = SystemTime::now()
                        .duration_since(UNIX_EPOCH)?
                        .as_secs_f64();
                    let rtt_ms = (now - msg.timestamp) * 1000.0;
                    self.stats.record_rtt(rtt_ms);
                    return Ok(RecvOutcome::Reply { from, rtt_ms, len });
                }
                ReplyClass::Unreachable(kind) => {
                    return Ok(RecvOutcome::Unreachable(kind));
                }
                ReplyClass::Ignore => continue,
            }
        }
    }

    /// One send/receive cycle. Returns false when the session must stop
    /// probing (the destination reported itself unreachable).
    async fn probe_cycle(&mut self) -> Result<bool> {
        let sequence = self.send_probe().await?;
        match self.recv_probe(sequence).await? {
            RecvOutcome::Reply { from, rtt_ms, len } => {
                println!("{}", format_reply(from, rtt_ms, len));
                Ok(true)
            }
            RecvOutcome::TimedOut => {
                println!("Request timed out");
                Ok(true)
            }
            RecvOutcome::Unreachable(kind) => {
                println!("{}", kind);
                Ok(false)
            }
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        let mut cycles = 0u64;
        while self.count == 0 || cycles < self.count {
            tokio::select! {
                res = self.probe_cycle() => {
                    if !res? {
                        break;
                    }
                }
                _ = signal::ctrl_c() => {
                    // Print on a new line, because some terminals will print "^C" which makes the text look ugly
                    println!();
                    break;
                }
            }
            cycles += 1;
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = signal::ctrl_c() => {
                    println!();
                    break;
                }
            }
        }
        self.report();
        Ok(())
    }

    /// Print the final statistics block.
    fn report(&self) {
        println!("--- {} ping statistics ---", self.host);
        println!("{}", self.stats);
    }
}

fn format_reply(from: IpAddr, rtt_ms: f64, len: usize) -> String {
    let ip = from.to_string();
    let name = dns_lookup::lookup_addr(&from).unwrap_or_else(|_| ip.clone());
    if name == ip {
        format!("{} bytes from {}: rtt={:.2} ms", len, ip, rtt_ms)
    } else {
        format!("{} bytes from {} ({}): rtt={:.2} ms", len, name, ip, rtt_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{EchoMessage, DEST_UNREACHABLE, ECHO_REPLY, IPV4_HEADER_LEN};

    fn datagram(msg: &EchoMessage) -> Vec<u8> {
        let mut buf = vec![0u8; IPV4_HEADER_LEN];
        buf.extend_from_slice(&msg.encode());
        buf
    }

    fn reply(identifier: u16, sequence: u16) -> EchoMessage {
        EchoMessage {
            icmp_type: ECHO_REPLY,
            code: 0,
            checksum: 0,
            identifier,
            sequence,
            timestamp: 1700000000.0,
        }
    }

    #[test]
    fn matching_reply_is_accepted() {
        let msg = reply(0x1234, 3);
        match classify(&datagram(&msg), 0x1234, 3) {
            ReplyClass::Match(decoded) => {
                assert_eq!(decoded.identifier, 0x1234);
                assert_eq!(decoded.sequence, 3);
            }
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[test]
    fn foreign_identifier_is_ignored() {
        let msg = reply(0x1111, 3);
        assert_eq!(classify(&datagram(&msg), 0x2222, 3), ReplyClass::Ignore);
    }

    #[test]
    fn stale_sequence_is_ignored() {
        // A late reply to an earlier, timed-out probe must not match
        let msg = reply(0x1234, 2);
        assert_eq!(classify(&datagram(&msg), 0x1234, 3), ReplyClass::Ignore);
    }

    #[test]
    fn echo_request_is_ignored() {
        // Our own outgoing request looped back by the kernel
        let msg = EchoMessage::echo_request(0x1234, 3, 0.0);
        assert_eq!(classify(&datagram(&msg), 0x1234, 3), ReplyClass::Ignore);
    }

    #[test]
    fn unreachable_codes_classify() {
        let mut msg = reply(0, 0);
        msg.icmp_type = DEST_UNREACHABLE;
        msg.code = 0;
        assert_eq!(
            classify(&datagram(&msg), 0x1234, 3),
            ReplyClass::Unreachable(Unreachable::Network)
        );
        msg.code = 1;
        assert_eq!(
            classify(&datagram(&msg), 0x1234, 3),
            ReplyClass::Unreachable(Unreachable::Host)
        );
        // Other unreachable codes are not reported by this client
        msg.code = 3;
        assert_eq!(classify(&datagram(&msg), 0x1234, 3), ReplyClass::Ignore);
    }

    #[test]
    fn short_datagram_is_ignored() {
        assert_eq!(classify(&[0u8; 8], 0x1234, 3), ReplyClass::Ignore);
        assert_eq!(classify(&[0u8; 30], 0x1234, 3), ReplyClass::Ignore);
        assert_eq!(classify(&[], 0x1234, 3), ReplyClass::Ignore);
    }

    #[test]
    fn unreachable_messages() {
        assert_eq!(
            Unreachable::Network.to_string(),
            "Destination Network Unreachable"
        );
        assert_eq!(
            Unreachable::Host.to_string(),
            "Destination Host Unreachable"
        );
    }
}
