//! UDP side of the pipeline: socket, sender allow-list, raw packet buffer
//! and the packet handler that feeds the transport queue.

use crate::metrics::Metrics;
use crate::queue::{PushOutcome, TransportQueue};
use crate::shutdown::Shutdown;
use photon_wire::{decode_packet, Rejection, SequencePolicy, SequenceTracker};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::Instrument;

/// Largest datagram we read; anything longer is truncated by the kernel.
const MAX_DATAGRAM: usize = 65_536;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to register UDP socket with the runtime: {0}")]
    Register(#[source] std::io::Error),
}

/// One `name=IP` or bare `IP` entry of the allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderSpec {
    pub name: Option<String>,
    pub ip: IpAddr,
}

impl FromStr for SenderSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, ip) = match s.split_once('=') {
            Some((name, ip)) => (Some(name.trim().to_string()), ip.trim()),
            None => (None, s.trim()),
        };
        let ip = ip
            .parse()
            .map_err(|e| format!("invalid sender address '{ip}': {e}"))?;
        Ok(Self { name, ip })
    }
}

/// Known TDC addresses. Only the IP is compared; the source port is ignored.
#[derive(Debug, Clone, Default)]
pub struct SenderAllowList {
    senders: HashMap<IpAddr, String>,
}

impl SenderAllowList {
    pub fn new(specs: impl IntoIterator<Item = SenderSpec>) -> Self {
        let senders = specs
            .into_iter()
            .map(|spec| {
                let name = spec.name.unwrap_or_else(|| spec.ip.to_string());
                (spec.ip, name)
            })
            .collect();
        Self { senders }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.senders.contains_key(&ip)
    }

    pub fn name_of(&self, ip: IpAddr) -> Option<&str> {
        self.senders.get(&ip).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub listen_addr: SocketAddr,
    pub senders: SenderAllowList,
    pub raw_queue_capacity: usize,
    pub sequence_policy: SequencePolicy,
}

/// A datagram from an allow-listed sender, waiting to be decoded.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub arrival_time: Instant,
    pub source: SocketAddr,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    Accepted { queued: usize, dropped: usize },
    Rejected(Rejection),
}

/// Decodes raw packets and pushes their photons onto the transport queue.
///
/// Keeps one sequence tracker per sender so that two TDCs cannot make each
/// other's packets look stale.
pub struct PacketHandler {
    policy: SequencePolicy,
    trackers: HashMap<IpAddr, SequenceTracker>,
    senders: SenderAllowList,
    queue: Arc<TransportQueue>,
    metrics: Arc<Metrics>,
}

impl PacketHandler {
    pub fn new(
        policy: SequencePolicy,
        senders: SenderAllowList,
        queue: Arc<TransportQueue>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            policy,
            trackers: HashMap::new(),
            senders,
            queue,
            metrics,
        }
    }

    pub fn last_sequence(&self, ip: IpAddr) -> Option<u16> {
        self.trackers.get(&ip).map(SequenceTracker::last)
    }

    pub fn handle(&mut self, packet: &RawPacket) -> HandleOutcome {
        let policy = self.policy;
        let tracker = self
            .trackers
            .entry(packet.source.ip())
            .or_insert_with(|| SequenceTracker::new(policy));

        let decoded = match decode_packet(&packet.payload, tracker) {
            Ok(decoded) => decoded,
            Err(rejection) => {
                self.metrics
                    .packets_rejected_total
                    .with_label_values(&[rejection.reason()])
                    .inc();
                tracing::debug!(
                    source = %packet.source,
                    reason = %rejection,
                    "Packet rejected"
                );
                return HandleOutcome::Rejected(rejection);
            }
        };

        self.metrics.packets_accepted_total.inc();
        self.metrics
            .photons_decoded_total
            .inc_by(decoded.events.len() as u64);

        tracing::trace!(
            sender = self.senders.name_of(packet.source.ip()).unwrap_or("?"),
            sequence = decoded.header.sequence,
            photons = decoded.events.len(),
            age_us = packet.arrival_time.elapsed().as_micros() as u64,
            "Packet decoded"
        );

        let mut queued = 0;
        let mut dropped = 0;
        for event in decoded.events {
            match self.queue.try_push(event) {
                PushOutcome::Accepted => queued += 1,
                PushOutcome::Dropped => dropped += 1,
            }
        }

        if dropped > 0 {
            self.metrics.transport_dropped_total.inc_by(dropped as u64);
            tracing::warn!(
                dropped,
                sequence = decoded.header.sequence,
                "Transport queue is full; photons dropped"
            );
        }

        HandleOutcome::Accepted { queued, dropped }
    }
}

/// Owns the UDP socket. Runs inside the ingestion context and never waits
/// on the transport queue.
pub struct UdpIngestService {
    socket: UdpSocket,
    config: IngestConfig,
    queue: Arc<TransportQueue>,
    metrics: Arc<Metrics>,
    shutdown: Shutdown,
}

impl UdpIngestService {
    pub async fn bind(
        config: IngestConfig,
        queue: Arc<TransportQueue>,
        metrics: Arc<Metrics>,
        shutdown: Shutdown,
    ) -> Result<Self, IngestError> {
        let socket = UdpSocket::bind(config.listen_addr)
            .await
            .map_err(|source| IngestError::Bind {
                addr: config.listen_addr,
                source,
            })?;
        Ok(Self {
            socket,
            config,
            queue,
            metrics,
            shutdown,
        })
    }

    /// Adopts a socket bound elsewhere. Must be called from inside the
    /// runtime that will drive the service.
    pub fn from_std(
        socket: std::net::UdpSocket,
        config: IngestConfig,
        queue: Arc<TransportQueue>,
        metrics: Arc<Metrics>,
        shutdown: Shutdown,
    ) -> Result<Self, IngestError> {
        socket.set_nonblocking(true).map_err(IngestError::Register)?;
        let socket = UdpSocket::from_std(socket).map_err(IngestError::Register)?;
        Ok(Self {
            socket,
            config,
            queue,
            metrics,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receives until shutdown, then closes the transport queue.
    pub async fn run(self) {
        let Self {
            socket,
            config,
            queue,
            metrics,
            shutdown,
        } = self;

        let (tx, mut rx) = mpsc::channel::<RawPacket>(config.raw_queue_capacity.max(1));
        let mut handler = PacketHandler::new(
            config.sequence_policy,
            config.senders.clone(),
            queue.clone(),
            metrics.clone(),
        );

        let handler_task = tokio::spawn(
            async move {
                while let Some(packet) = rx.recv().await {
                    handler.handle(&packet);
                }
                tracing::debug!("Packet handler drained");
            }
            .instrument(tracing::info_span!("packet_handler")),
        );

        tracing::info!(
            addr = ?socket.local_addr().ok(),
            senders = config.senders.len(),
            "UDP server started"
        );

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                res = socket.recv_from(&mut buf) => match res {
                    Ok((len, source)) => {
                        enqueue_datagram(&buf[..len], source, &config.senders, &tx, &metrics);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "UDP receive failed");
                    }
                },
            }
        }

        tracing::info!("UDP server stopping");
        drop(tx);
        if let Err(e) = handler_task.await {
            tracing::error!(error = %e, "Packet handler task failed");
        }
        queue.close();
    }
}

fn enqueue_datagram(
    data: &[u8],
    source: SocketAddr,
    senders: &SenderAllowList,
    tx: &mpsc::Sender<RawPacket>,
    metrics: &Metrics,
) {
    let arrival_time = Instant::now();
    metrics.datagrams_received_total.inc();

    if !senders.contains(source.ip()) {
        metrics.datagrams_unknown_source_total.inc();
        tracing::trace!(%source, "Datagram from unknown sender discarded");
        return;
    }

    let packet = RawPacket {
        arrival_time,
        source,
        payload: data.to_vec(),
    };

    match tx.try_send(packet) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            metrics.raw_packets_dropped_total.inc();
            tracing::warn!(%source, "Incoming packet queue is full; datagram dropped");
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!("Packet handler gone; datagram dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use photon_wire::{encode_packet, PhotonEvent};
    use std::time::Duration;

    fn allow(ips: &[&str]) -> SenderAllowList {
        SenderAllowList::new(ips.iter().map(|s| s.parse::<SenderSpec>().unwrap()))
    }

    fn raw(source: &str, payload: Vec<u8>) -> RawPacket {
        RawPacket {
            arrival_time: Instant::now(),
            source: source.parse().unwrap(),
            payload,
        }
    }

    #[test]
    fn sender_spec_parses_named_and_bare() {
        let named: SenderSpec = "tdc_0=192.168.1.10".parse().unwrap();
        assert_eq!(named.name.as_deref(), Some("tdc_0"));
        assert_eq!(named.ip, "192.168.1.10".parse::<IpAddr>().unwrap());

        let bare: SenderSpec = "10.1.2.3".parse().unwrap();
        assert_eq!(bare.name, None);

        assert!("tdc=not-an-ip".parse::<SenderSpec>().is_err());
    }

    #[test]
    fn handler_pushes_decoded_photons_in_order() {
        let queue = Arc::new(TransportQueue::new(16));
        let metrics = Arc::new(Metrics::new());
        let mut handler = PacketHandler::new(
            SequencePolicy::NonDecreasing,
            allow(&["10.0.0.1"]),
            queue.clone(),
            metrics.clone(),
        );

        let events = [PhotonEvent::new(1, 2, 3), PhotonEvent::new(4, 5, 6)];
        let outcome = handler.handle(&raw("10.0.0.1:5000", encode_packet(1, &events)));

        assert_eq!(outcome, HandleOutcome::Accepted { queued: 2, dropped: 0 });
        assert_eq!(queue.try_pop(), Some(events[0]));
        assert_eq!(queue.try_pop(), Some(events[1]));
        assert_eq!(metrics.photons_decoded_total.get(), 2);
    }

    #[test]
    fn sequence_is_tracked_per_sender() {
        let queue = Arc::new(TransportQueue::new(16));
        let metrics = Arc::new(Metrics::new());
        let mut handler = PacketHandler::new(
            SequencePolicy::NonDecreasing,
            allow(&["10.0.0.1", "10.0.0.2"]),
            queue,
            metrics.clone(),
        );

        handler.handle(&raw("10.0.0.1:5000", encode_packet(100, &[])));
        let other = handler.handle(&raw("10.0.0.2:5000", encode_packet(3, &[])));
        assert!(matches!(other, HandleOutcome::Accepted { .. }));

        let stale = handler.handle(&raw("10.0.0.1:5001", encode_packet(99, &[])));
        assert_eq!(
            stale,
            HandleOutcome::Rejected(Rejection::StaleSequence { sequence: 99, last: 100 })
        );
        assert_eq!(handler.last_sequence("10.0.0.2".parse().unwrap()), Some(3));
        assert_eq!(
            metrics
                .packets_rejected_total
                .with_label_values(&["stale_sequence"])
                .get(),
            1
        );
    }

    #[test]
    fn full_transport_queue_is_counted_not_fatal() {
        let queue = Arc::new(TransportQueue::new(1));
        let metrics = Arc::new(Metrics::new());
        let mut handler = PacketHandler::new(
            SequencePolicy::NonDecreasing,
            allow(&["10.0.0.1"]),
            queue.clone(),
            metrics.clone(),
        );

        let events = [PhotonEvent::new(1, 1, 1), PhotonEvent::new(2, 2, 2)];
        let outcome = handler.handle(&raw("10.0.0.1:1", encode_packet(0, &events)));

        assert_eq!(outcome, HandleOutcome::Accepted { queued: 1, dropped: 1 });
        assert_eq!(metrics.transport_dropped_total.get(), 1);
        assert_eq!(queue.try_pop(), Some(events[0]));
    }

    #[tokio::test]
    async fn service_forwards_allowed_and_drops_unknown_senders() {
        let queue = Arc::new(TransportQueue::new(64));
        let metrics = Arc::new(Metrics::new());
        let shutdown = Shutdown::new();
        let config = IngestConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            senders: allow(&["127.0.0.1"]),
            raw_queue_capacity: 16,
            sequence_policy: SequencePolicy::NonDecreasing,
        };

        let service = UdpIngestService::bind(config, queue.clone(), metrics.clone(), shutdown.clone())
            .await
            .unwrap();
        let addr = service.local_addr().unwrap();
        let task = tokio::spawn(service.run());

        // 127.0.0.2 is routed over loopback on Linux but is not allow-listed.
        let stranger = UdpSocket::bind("127.0.0.2:0").await.unwrap();
        stranger
            .send_to(&encode_packet(1, &[PhotonEvent::new(9, 9, 9)]), addr)
            .await
            .unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let event = PhotonEvent::new(100, 200, 50);
        sender.send_to(&encode_packet(5, &[event]), addr).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), queue.pop())
            .await
            .expect("photon never arrived");
        assert_eq!(got, Some(event));

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("service did not stop")
            .unwrap();

        assert!(queue.is_closed());
        assert_eq!(metrics.datagrams_unknown_source_total.get(), 1);
        assert_eq!(queue.try_pop(), None);
    }
}
