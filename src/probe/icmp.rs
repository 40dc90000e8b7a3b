//! ICMP echo probe.
//!
//! Opens an unprivileged ICMP datagram socket where the kernel allows it and
//! falls back to a raw socket (root) otherwise. Echoes are sent one at a time
//! with a fixed spacing; the whole exchange is bounded by the probe timeout.

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, trace};

use super::{LatencyProbe, ProbeFailure, ProbeOutcome, ProbeSettings};

const ECHO_REQUEST_V4: u8 = 8;
const ECHO_REPLY_V4: u8 = 0;
const ECHO_REQUEST_V6: u8 = 128;
const ECHO_REPLY_V6: u8 = 129;

/// Bytes of payload carried by each echo request.
const PAYLOAD_LEN: usize = 24;
const ICMP_HEADER_LEN: usize = 8;

/// ICMP echo based [`LatencyProbe`].
#[derive(Debug, Clone, Default)]
pub struct IcmpProbe {
    settings: ProbeSettings,
}

impl IcmpProbe {
    pub fn new(settings: ProbeSettings) -> Self {
        IcmpProbe { settings }
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    async fn run(&self, ip: IpAddr) -> Result<Duration, ProbeFailure> {
        let deadline = Instant::now() + self.settings.timeout;
        let count = self.settings.count.max(1);
        // Each echo gets a fair share of the budget, but never less than the spacing
        let reply_wait = (self.settings.timeout / u32::from(count)).max(self.settings.interval);

        let socket = EchoSocket::open(ip)?;
        let identifier: u16 = rand::random();
        let first_seq: u16 = rand::random();

        let mut rtts = Vec::with_capacity(usize::from(count));
        let mut last_error = None;

        for i in 0..count {
            if i > 0 {
                let next = Instant::now() + self.settings.interval;
                if next >= deadline {
                    break;
                }
                sleep_until(next).await;
            }

            let seq = first_seq.wrapping_add(i);
            let sent_at = Instant::now();
            if let Err(err) = socket.send_echo(identifier, seq).await {
                trace!(%ip, seq, "echo send failed: {err}");
                last_error = Some(ProbeFailure::from(err));
                continue;
            }

            let wait_until = (sent_at + reply_wait).min(deadline);
            match timeout_at(wait_until, socket.recv_reply(identifier, seq)).await {
                Ok(Ok(())) => rtts.push(sent_at.elapsed()),
                Ok(Err(err)) => last_error = Some(ProbeFailure::from(err)),
                Err(_) => trace!(%ip, seq, "echo reply not received in time"),
            }
        }

        if rtts.is_empty() {
            return Err(last_error.unwrap_or(ProbeFailure::Timeout));
        }

        let total: Duration = rtts.iter().sum();
        Ok(total / rtts.len() as u32)
    }
}

#[async_trait]
impl LatencyProbe for IcmpProbe {
    async fn probe(&self, address: &str) -> ProbeOutcome {
        let ip = match resolve(address).await {
            Ok(ip) => ip,
            Err(failure) => return ProbeOutcome::Unreachable(failure),
        };

        match self.run(ip).await {
            Ok(avg) => {
                debug!(address, rtt_ms = avg.as_millis() as u64, "probe succeeded");
                ProbeOutcome::Reachable(avg)
            }
            Err(failure) => {
                debug!(address, %failure, "probe failed");
                ProbeOutcome::Unreachable(failure)
            }
        }
    }
}

async fn resolve(address: &str) -> Result<IpAddr, ProbeFailure> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }
    let mut addrs = tokio::net::lookup_host((address, 0))
        .await
        .map_err(|e| ProbeFailure::Resolve(e.to_string()))?;
    addrs
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| ProbeFailure::Resolve(format!("no addresses for {address}")))
}

/// An ICMP socket bound to one destination.
struct EchoSocket {
    socket: UdpSocket,
    target: IpAddr,
    /// Raw IPv4 sockets deliver the IP header and every ICMP packet on the host
    raw: bool,
}

impl EchoSocket {
    fn open(target: IpAddr) -> io::Result<Self> {
        let (domain, protocol) = match target {
            IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
            IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
        };

        let (socket, raw) = match Socket::new(domain, Type::DGRAM, Some(protocol)) {
            Ok(socket) => (socket, false),
            Err(err) => {
                trace!("unprivileged ICMP socket unavailable ({err}), trying raw socket");
                (Socket::new(domain, Type::RAW, Some(protocol))?, true)
            }
        };
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(EchoSocket {
            socket: UdpSocket::from_std(std_socket)?,
            target,
            raw,
        })
    }

    async fn send_echo(&self, identifier: u16, seq: u16) -> io::Result<()> {
        let packet = echo_request(self.target.is_ipv4(), identifier, seq);
        self.socket
            .send_to(&packet, SocketAddr::new(self.target, 0))
            .await?;
        Ok(())
    }

    /// Wait for the reply to `seq`, skipping unrelated ICMP traffic.
    async fn recv_reply(&self, identifier: u16, seq: u16) -> io::Result<()> {
        let mut buf = [0u8; 1500];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            if from.ip() != self.target {
                continue;
            }
            let icmp = if self.raw && self.target.is_ipv4() {
                strip_ipv4_header(&buf[..len])
            } else {
                Some(&buf[..len])
            };
            // Datagram sockets get their identifier rewritten by the kernel
            let expect_id = self.raw.then_some(identifier);
            if icmp.is_some_and(|packet| {
                is_matching_reply(packet, self.target.is_ipv4(), expect_id, seq)
            }) {
                return Ok(());
            }
        }
    }
}

fn echo_request(ipv4: bool, identifier: u16, seq: u16) -> Vec<u8> {
    let mut packet = vec![0u8; ICMP_HEADER_LEN + PAYLOAD_LEN];
    packet[0] = if ipv4 { ECHO_REQUEST_V4 } else { ECHO_REQUEST_V6 };
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&seq.to_be_bytes());
    for (i, byte) in packet[ICMP_HEADER_LEN..].iter_mut().enumerate() {
        *byte = i as u8;
    }
    // The kernel fills in the ICMPv6 checksum (it covers a pseudo-header)
    if ipv4 {
        let sum = checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
    }
    packet
}

fn strip_ipv4_header(datagram: &[u8]) -> Option<&[u8]> {
    let ihl = usize::from(*datagram.first()? & 0x0f) * 4;
    datagram.get(ihl..)
}

fn is_matching_reply(packet: &[u8], ipv4: bool, identifier: Option<u16>, seq: u16) -> bool {
    if packet.len() < ICMP_HEADER_LEN {
        return false;
    }
    let reply_type = if ipv4 { ECHO_REPLY_V4 } else { ECHO_REPLY_V6 };
    if packet[0] != reply_type || packet[1] != 0 {
        return false;
    }
    let id = u16::from_be_bytes([packet[4], packet[5]]);
    let reply_seq = u16::from_be_bytes([packet[6], packet[7]]);
    reply_seq == seq && identifier.map_or(true, |expected| expected == id)
}

/// RFC 1071 internet checksum.
fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
