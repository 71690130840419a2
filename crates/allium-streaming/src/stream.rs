//! The per-connection state machine.
//!
//! A stream delivers an ordered byte sequence in both directions on top of
//! single-shot anonymized datagrams. Incoming packets are applied strictly
//! in sequence order; gaps are buffered until filled. Everything sent stays
//! in the sent-set until acknowledged, and is resent through a different
//! tunnel and lease every [`RESEND_TIMEOUT_SECS`] until either an ACK
//! arrives or the attempt cap closes the stream.
//!
//! The first packet of a conversation carries SYN with the full sender
//! identity, the maximum packet size, and a signature computed over the
//! whole packet with the signature option zeroed; the receiver verifies it
//! the same way.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tracing::{debug, warn};

use allium_types::i2np::I2npMessage;
use allium_types::traits::{DeliveryType, GarlicSession, OutboundTunnel, TunnelMessageBlock};
use allium_types::{Identity, Lease, LeaseSet, IDENTITY_SIZE, SIGNATURE_SIZE};

use crate::destination::DestinationInner;
use crate::packet::{
    Packet, PacketBuilder, FLAG_CLOSE, FLAG_DELAY_REQUESTED, FLAG_FROM_INCLUDED,
    FLAG_MAX_PACKET_SIZE_INCLUDED, FLAG_NO_ACK, FLAG_SIGNATURE_INCLUDED, FLAG_SYNCHRONIZE,
};
use crate::{
    data, Result, StreamingError, MAX_NUM_RESEND_ATTEMPTS, RESEND_TIMEOUT_SECS, STREAMING_MTU,
};

/// A handle to one stream. Cheap to clone; the destination owns the state.
#[derive(Clone)]
pub struct Stream {
    pub(crate) inner: Arc<StreamInner>,
}

impl Stream {
    pub fn recv_stream_id(&self) -> u32 {
        self.inner.recv_stream_id
    }

    pub fn send_stream_id(&self) -> u32 {
        self.inner.state.lock().unwrap().send_stream_id
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.lock().unwrap().is_open
    }

    /// Established means the peer's receive stream ID is known.
    pub fn is_established(&self) -> bool {
        self.send_stream_id() != 0
    }

    pub fn remote_identity(&self) -> Option<Identity> {
        self.inner.state.lock().unwrap().remote_identity.clone()
    }

    /// Fragment `buf` into packets and queue them for delivery. An empty
    /// buffer still opens the conversation with a SYN.
    pub fn send(&self, buf: &[u8]) -> Result<()> {
        self.inner.send(buf)
    }

    /// Read whatever ordered bytes are available, waiting up to `timeout`.
    ///
    /// Completes early when data arrives or the stream closes. Returns
    /// [`StreamingError::ConnectionReset`] once the stream is closed and
    /// drained, and [`StreamingError::TimedOut`] when the wait expires with
    /// nothing at all.
    pub async fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.inner.read(buf, timeout).await
    }

    pub fn close(&self) {
        self.inner.close();
    }

    /// Have the next outbound batch carry our fresh LeaseSet.
    pub fn set_lease_set_updated(&self) {
        self.inner.state.lock().unwrap().lease_set_updated = true;
    }

    pub(crate) fn handle_next_packet(&self, packet: Packet) {
        self.inner.handle_next_packet(packet);
    }
}

pub(crate) struct StreamInner {
    pub(crate) recv_stream_id: u32,
    dest: Weak<DestinationInner>,
    state: Mutex<StreamState>,
    readable: Notify,
}

struct StreamState {
    send_stream_id: u32,
    sequence_number: u32,
    last_received_seq: i64,
    is_open: bool,
    lease_set_updated: bool,
    remote_identity: Option<Identity>,
    remote_lease_set: Option<LeaseSet>,
    routing_session: Option<Arc<dyn GarlicSession>>,
    current_lease: Option<Lease>,
    current_outbound: Option<Arc<dyn OutboundTunnel>>,
    receive_queue: VecDeque<Packet>,
    saved_packets: BTreeMap<u32, Packet>,
    sent_packets: BTreeMap<u32, Packet>,
    resend_timer: Option<tokio::task::JoinHandle<()>>,
}

/// Work to perform after the state lock is released; nothing below may
/// touch the network while holding it.
#[derive(Default)]
struct Followup {
    quick_ack: bool,
    syn_reply: bool,
    close_packet: bool,
    closed: bool,
}

impl StreamInner {
    /// `remote` is the peer's LeaseSet for outgoing streams; incoming
    /// streams learn their peer from the SYN options.
    pub(crate) fn new(dest: &Arc<DestinationInner>, remote: Option<LeaseSet>) -> Arc<Self> {
        let recv_stream_id = loop {
            let id: u32 = rand::thread_rng().gen();
            if id != 0 {
                break id;
            }
        };
        Arc::new(Self {
            recv_stream_id,
            dest: Arc::downgrade(dest),
            state: Mutex::new(StreamState {
                send_stream_id: 0,
                sequence_number: 0,
                last_received_seq: -1,
                is_open: false,
                lease_set_updated: true,
                remote_identity: remote.as_ref().map(|ls| ls.identity().clone()),
                remote_lease_set: remote,
                routing_session: None,
                current_lease: None,
                current_outbound: None,
                receive_queue: VecDeque::new(),
                saved_packets: BTreeMap::new(),
                sent_packets: BTreeMap::new(),
                resend_timer: None,
            }),
            readable: Notify::new(),
        })
    }

    pub(crate) fn handle_next_packet(self: &Arc<Self>, packet: Packet) {
        let mut followup = Followup::default();
        {
            let mut st = self.state.lock().unwrap();
            if st.send_stream_id == 0 {
                st.send_stream_id = packet.recv_stream_id();
            }

            if !packet.is_no_ack() {
                self.process_ack(&mut st, &packet);
            }

            let seq = packet.seq();
            let is_syn = packet.is_syn();
            if seq == 0 && !is_syn {
                debug!("plain ack received");
                return;
            }

            debug!(seq, "received");
            if is_syn || seq as i64 == st.last_received_seq + 1 {
                self.process_packet(&mut st, packet, &mut followup);
                // Apply buffered continuations now that the gap is filled.
                while st
                    .saved_packets
                    .keys()
                    .next()
                    .map(|&s| s as i64 == st.last_received_seq + 1)
                    .unwrap_or(false)
                {
                    let (_, saved) = st.saved_packets.pop_first().unwrap();
                    self.process_packet(&mut st, saved, &mut followup);
                }
                if st.is_open {
                    followup.quick_ack = true;
                } else if is_syn && !followup.closed {
                    // An incoming conversation: answer with our own SYN.
                    followup.syn_reply = true;
                }
            } else if (seq as i64) <= st.last_received_seq {
                // A duplicate usually means our outbound path died; rebuild
                // it and remind the peer what we have.
                debug!(seq, "duplicate received");
                st.current_outbound = None;
                st.current_lease = None;
                followup.quick_ack = true;
            } else {
                debug!(
                    from = st.last_received_seq + 1,
                    to = seq - 1,
                    "missing range, buffering"
                );
                st.saved_packets.insert(seq, packet);
            }
        }

        if followup.close_packet {
            self.send_close_packet();
        }
        if followup.quick_ack {
            self.send_quick_ack();
        }
        if followup.syn_reply {
            let _ = self.send(&[]);
        }
    }

    /// Apply one in-sequence packet: options, signature, payload, close.
    fn process_packet(self: &Arc<Self>, st: &mut StreamState, packet: Packet, followup: &mut Followup) {
        let seq = packet.seq();
        let flags = packet.flags();
        debug!(seq, flags, "processing");
        let mut pos = packet.options_offset();
        let mut close = packet.is_close();

        if flags & FLAG_DELAY_REQUESTED != 0 {
            pos += 2;
        }
        if flags & FLAG_FROM_INCLUDED != 0 {
            match Identity::from_bytes(&packet.as_bytes()[pos..]) {
                Ok(identity) => {
                    debug!(from = %identity.ident_hash(), "from identity");
                    st.remote_identity = Some(identity);
                }
                Err(e) => {
                    warn!(error = %e, "bad identity option");
                    followup.close_packet = true;
                    close = true;
                }
            }
            pos += IDENTITY_SIZE;
        }
        if flags & FLAG_MAX_PACKET_SIZE_INCLUDED != 0 {
            let max_packet_size =
                u16::from_be_bytes(packet.as_bytes()[pos..pos + 2].try_into().unwrap());
            debug!(max_packet_size, "peer max packet size");
            pos += 2;
        }
        if flags & FLAG_SIGNATURE_INCLUDED != 0 {
            // Verify over the whole packet with the signature option zeroed.
            let verified = st.remote_identity.as_ref().map_or(false, |identity| {
                let signature = packet.as_bytes()[pos..pos + SIGNATURE_SIZE].to_vec();
                let mut unsigned = packet.clone();
                unsigned.zero_region(pos, SIGNATURE_SIZE);
                identity.verify(unsigned.as_bytes(), &signature).is_ok()
            });
            if !verified {
                warn!("signature verification failed");
                followup.close_packet = true;
                close = true;
            }
        }

        if !packet.payload().is_empty() {
            st.receive_queue.push_back(packet);
            self.readable.notify_one();
        }

        st.last_received_seq = seq as i64;

        if close {
            debug!("closed");
            followup.quick_ack = true;
            followup.closed = true;
            st.is_open = false;
            if let Some(timer) = st.resend_timer.take() {
                timer.abort();
            }
            self.readable.notify_one();
        }
    }

    /// Drop every sent packet covered by the ACK and not named in the NACK
    /// list; an empty sent-set disarms the resend timer.
    fn process_ack(&self, st: &mut StreamState, packet: &Packet) {
        let ack_through = packet.ack_through();
        let nacks: Vec<u32> = (0..packet.nack_count() as usize)
            .map(|i| packet.nack(i))
            .collect();
        let before = st.sent_packets.len();
        st.sent_packets
            .retain(|&seq, _| seq > ack_through || nacks.contains(&seq));
        if st.sent_packets.len() != before {
            debug!(
                acked = before - st.sent_packets.len(),
                ack_through, "packets acknowledged"
            );
        }
        if st.sent_packets.is_empty() {
            if let Some(timer) = st.resend_timer.take() {
                timer.abort();
            }
        }
    }

    pub(crate) fn send(self: &Arc<Self>, buf: &[u8]) -> Result<()> {
        let Some(dest) = self.dest.upgrade() else {
            return Err(StreamingError::ConnectionReset);
        };
        let mut remaining = buf;
        let mut packets = Vec::new();
        {
            let mut st = self.state.lock().unwrap();
            let is_no_ack = st.last_received_seq < 0;
            while !st.is_open || !remaining.is_empty() {
                let seq = st.sequence_number;
                st.sequence_number += 1;
                let ack_through = if is_no_ack {
                    0
                } else {
                    st.last_received_seq.max(0) as u32
                };
                let take = remaining.len().min(STREAMING_MTU);
                if !st.is_open {
                    // The opening packet introduces us: identity, maximum
                    // packet size, and a signature over the whole packet.
                    st.is_open = true;
                    let mut flags = FLAG_SYNCHRONIZE
                        | FLAG_FROM_INCLUDED
                        | FLAG_SIGNATURE_INCLUDED
                        | FLAG_MAX_PACKET_SIZE_INCLUDED;
                    if is_no_ack {
                        flags |= FLAG_NO_ACK;
                    }
                    let option_size = (IDENTITY_SIZE + 2 + SIGNATURE_SIZE) as u16;
                    let mut builder = PacketBuilder::new(
                        st.send_stream_id,
                        self.recv_stream_id,
                        seq,
                        ack_through,
                        &[],
                    )
                    .flags(flags, option_size);
                    builder.append(&dest.keys().identity().to_bytes());
                    builder.append(&(STREAMING_MTU as u16).to_be_bytes());
                    let signature_at = builder.append(&[0u8; SIGNATURE_SIZE]);
                    builder.append(&remaining[..take]);
                    let mut packet = builder.build();
                    let signature = dest.keys().sign(packet.as_bytes());
                    packet.write_region(signature_at, &signature);
                    packets.push(packet);
                } else {
                    let mut builder = PacketBuilder::new(
                        st.send_stream_id,
                        self.recv_stream_id,
                        seq,
                        ack_through,
                        &[],
                    )
                    .flags(0, 0);
                    builder.append(&remaining[..take]);
                    packets.push(builder.build());
                }
                remaining = &remaining[take..];
            }
        }
        for packet in packets {
            self.send_packet(packet);
        }
        Ok(())
    }

    /// Emit one reliable packet: deliver it and keep it for retransmission.
    fn send_packet(self: &Arc<Self>, packet: Packet) {
        self.send_packets(std::slice::from_ref(&packet));
        let arm = {
            let mut st = self.state.lock().unwrap();
            let was_empty = st.sent_packets.is_empty();
            st.sent_packets.insert(packet.seq(), packet);
            was_empty
        };
        if arm {
            self.schedule_resend();
        }
    }

    /// A headers-only packet acknowledging everything received so far.
    fn send_quick_ack(self: &Arc<Self>) {
        let packet = {
            let st = self.state.lock().unwrap();
            PacketBuilder::new(
                st.send_stream_id,
                self.recv_stream_id,
                0,
                st.last_received_seq.max(0) as u32,
                &[],
            )
            .flags(0, 0)
            .build()
        };
        self.send_packets(std::slice::from_ref(&packet));
        debug!("quick ack sent");
    }

    pub(crate) fn close(self: &Arc<Self>) {
        {
            let mut st = self.state.lock().unwrap();
            if !st.is_open {
                return;
            }
            st.is_open = false;
            if let Some(timer) = st.resend_timer.take() {
                timer.abort();
            }
        }
        self.readable.notify_one();
        self.send_close_packet();
    }

    /// The signed final packet.
    fn send_close_packet(self: &Arc<Self>) {
        let Some(dest) = self.dest.upgrade() else {
            return;
        };
        let packet = {
            let mut st = self.state.lock().unwrap();
            let seq = st.sequence_number;
            st.sequence_number += 1;
            let mut builder = PacketBuilder::new(
                st.send_stream_id,
                self.recv_stream_id,
                seq,
                st.last_received_seq.max(0) as u32,
                &[],
            )
            .flags(FLAG_CLOSE | FLAG_SIGNATURE_INCLUDED, SIGNATURE_SIZE as u16);
            let signature_at = builder.append(&[0u8; SIGNATURE_SIZE]);
            let mut packet = builder.build();
            let signature = dest.keys().sign(packet.as_bytes());
            packet.write_region(signature_at, &signature);
            packet
        };
        debug!("FIN sent");
        self.send_packet(packet);
    }

    /// Wrap packets in garlic and hand them to the current lease's gateway
    /// through the next outbound tunnel. Failures are logged and dropped;
    /// retransmission tries again later.
    fn send_packets(self: &Arc<Self>, packets: &[Packet]) {
        let Some(dest) = self.dest.upgrade() else {
            warn!("destination is gone");
            return;
        };
        let now = allium_types::millis_since_epoch();
        let (session, lease, tunnel, bundle) = {
            let mut st = self.state.lock().unwrap();
            if st.remote_lease_set.is_none() {
                if let Some(ident) = st.remote_identity.as_ref().map(|i| i.ident_hash()) {
                    st.remote_lease_set = dest
                        .netdb()
                        .store()
                        .find_lease_set(&ident)
                        .map(|ls| (*ls).clone());
                }
                if st.remote_lease_set.is_none() {
                    warn!("cannot send packets, remote LeaseSet missing");
                    return;
                }
            }
            if st.routing_session.is_none() {
                let remote = st.remote_lease_set.as_ref().unwrap();
                st.routing_session = Some(dest.garlic().routing_session(remote, 32));
            }
            let lease_valid = st
                .current_lease
                .map(|l| now < l.end_date_ms)
                .unwrap_or(false);
            if !lease_valid {
                pick_lease(&mut st, now);
            }
            let Some(lease) = st.current_lease else {
                warn!("all leases expired");
                return;
            };
            let Some(tunnel) = dest.pool().next_outbound_tunnel(st.current_outbound.as_ref())
            else {
                warn!("no outbound tunnels in the pool");
                return;
            };
            st.current_outbound = Some(tunnel.clone());
            let bundle = if st.lease_set_updated {
                st.lease_set_updated = false;
                dest.lease_set()
            } else {
                None
            };
            let session = st.routing_session.clone().unwrap();
            (session, lease, tunnel, bundle)
        };

        let mut lease_set = bundle;
        let mut blocks = Vec::with_capacity(packets.len());
        for packet in packets {
            let frame = match data::to_data_payload(packet.as_bytes()) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "dropping unframeable packet");
                    continue;
                }
            };
            let msg = session.wrap_single_message(I2npMessage::Data(frame), lease_set.as_ref());
            // The LeaseSet rides along with the first packet only.
            lease_set = None;
            blocks.push(TunnelMessageBlock {
                delivery: DeliveryType::Tunnel,
                to: lease.tunnel_gateway,
                tunnel_id: lease.tunnel_id,
                msg,
            });
        }
        if !blocks.is_empty() {
            tunnel.send_tunnel_data(blocks);
        }
    }

    /// Arm the resend timer. Without a runtime (pure state-machine tests)
    /// retransmission is driven by calling [`on_resend_timer`] directly.
    fn schedule_resend(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let handle = runtime.spawn(async move {
            tokio::time::sleep(Duration::from_secs(RESEND_TIMEOUT_SECS)).await;
            if let Some(stream) = weak.upgrade() {
                stream.on_resend_timer();
            }
        });
        let mut st = self.state.lock().unwrap();
        if let Some(old) = st.resend_timer.replace(handle) {
            old.abort();
        }
    }

    /// One resend round: bump every in-flight packet's attempt counter,
    /// close on cap, otherwise resend the whole set through a fresh tunnel
    /// and lease.
    pub(crate) fn on_resend_timer(self: &Arc<Self>) {
        let (packets, over_cap) = {
            let mut st = self.state.lock().unwrap();
            let mut over_cap = false;
            for packet in st.sent_packets.values_mut() {
                packet.num_resend_attempts += 1;
                if packet.num_resend_attempts > MAX_NUM_RESEND_ATTEMPTS {
                    over_cap = true;
                }
            }
            if !over_cap {
                // A different path for the retry.
                st.current_outbound = None;
                st.current_lease = None;
            }
            let packets: Vec<Packet> = st.sent_packets.values().cloned().collect();
            (packets, over_cap)
        };
        if over_cap {
            warn!("resend attempts exhausted, closing");
            self.close();
            return;
        }
        if !packets.is_empty() {
            debug!(count = packets.len(), "resending");
            self.send_packets(&packets);
        }
        self.schedule_resend();
    }

    async fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut st = self.state.lock().unwrap();
                let n = concatenate_packets(&mut st, buf);
                if n > 0 {
                    return Ok(n);
                }
                if !st.is_open {
                    return Err(StreamingError::ConnectionReset);
                }
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(StreamingError::TimedOut);
            }
            if tokio::time::timeout_at(deadline, self.readable.notified())
                .await
                .is_err()
            {
                let mut st = self.state.lock().unwrap();
                let n = concatenate_packets(&mut st, buf);
                return if n > 0 { Ok(n) } else { Err(StreamingError::TimedOut) };
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn sent_count(&self) -> usize {
        self.state.lock().unwrap().sent_packets.len()
    }

    #[cfg(test)]
    pub(crate) fn last_received_seq(&self) -> i64 {
        self.state.lock().unwrap().last_received_seq
    }
}

/// Pick a fresh random non-expired lease, or none when all are gone.
fn pick_lease(st: &mut StreamState, now: u64) {
    let leases = st
        .remote_lease_set
        .as_ref()
        .map(|ls| ls.non_expired_leases(now))
        .unwrap_or_default();
    st.current_lease = if leases.is_empty() {
        None
    } else {
        Some(leases[rand::thread_rng().gen_range(0..leases.len())])
    };
}

/// Drain ordered payload bytes from the receive queue into `buf`.
fn concatenate_packets(st: &mut StreamState, buf: &mut [u8]) -> usize {
    let mut pos = 0;
    while pos < buf.len() {
        let Some(packet) = st.receive_queue.front_mut() else {
            break;
        };
        let chunk = packet.remaining_payload();
        let n = chunk.len().min(buf.len() - pos);
        buf[pos..pos + n].copy_from_slice(&chunk[..n]);
        packet.consume(n);
        pos += n;
        if packet.remaining_payload().is_empty() {
            st.receive_queue.pop_front();
        }
    }
    pos
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::StreamingDestination;
    use crate::packet::FLAG_MAX_PACKET_SIZE_INCLUDED;
    use crate::testutil::{
        deliver, packet_of, pump, test_netdb, LoopPool, LoopTunnelManager, PassthroughGarlic,
    };
    use allium_types::PrivateKeys;

    struct Pair {
        _dir: tempfile::TempDir,
        a: StreamingDestination,
        pool_a: Arc<LoopPool>,
        b: StreamingDestination,
        pool_b: Arc<LoopPool>,
        accepted: Arc<Mutex<Vec<Stream>>>,
    }

    fn pair() -> Pair {
        let dir = tempfile::tempdir().unwrap();
        let netdb = test_netdb(dir.path());
        let manager = LoopTunnelManager::new();
        let garlic = Arc::new(PassthroughGarlic);
        let a = StreamingDestination::new(
            PrivateKeys::generate(),
            true,
            &manager,
            garlic.clone(),
            netdb.clone(),
        );
        let pool_a = manager.last_pool();
        let b = StreamingDestination::new(PrivateKeys::generate(), true, &manager, garlic, netdb);
        let pool_b = manager.last_pool();
        // Publish both LeaseSets so either side can look the other up.
        a.set_lease_set_updated();
        b.set_lease_set_updated();
        let accepted = Arc::new(Mutex::new(Vec::new()));
        let sink = accepted.clone();
        b.set_acceptor(Box::new(move |stream| sink.lock().unwrap().push(stream)));
        Pair {
            _dir: dir,
            a,
            pool_a,
            b,
            pool_b,
            accepted,
        }
    }

    /// Full SYN exchange; both pools are drained afterwards.
    fn establish(p: &Pair) -> (Stream, Stream) {
        let stream_a = p.a.create_outgoing_stream(p.b.lease_set().unwrap());
        stream_a.send(&[]).unwrap();
        pump(&p.pool_a, &p.b);
        pump(&p.pool_b, &p.a);
        p.pool_a.take_blocks();
        let stream_b = p.accepted.lock().unwrap()[0].clone();
        assert!(stream_a.is_established());
        assert!(stream_b.is_established());
        (stream_a, stream_b)
    }

    #[test]
    fn test_syn_exchange() {
        let p = pair();
        let stream_a = p.a.create_outgoing_stream(p.b.lease_set().unwrap());
        stream_a.send(&[]).unwrap();

        let blocks = p.pool_a.take_blocks();
        assert_eq!(blocks.len(), 1);
        let syn = packet_of(&blocks[0]);
        assert!(syn.is_syn());
        assert!(syn.is_no_ack());
        assert!(syn.flags() & FLAG_FROM_INCLUDED != 0);
        assert!(syn.flags() & FLAG_SIGNATURE_INCLUDED != 0);
        assert!(syn.flags() & FLAG_MAX_PACKET_SIZE_INCLUDED != 0);
        assert_eq!(syn.seq(), 0);
        assert_eq!(syn.ack_through(), 0);
        assert_eq!(syn.send_stream_id(), 0);
        assert_eq!(syn.recv_stream_id(), stream_a.recv_stream_id());

        deliver(blocks, &p.b);
        let accepted = p.accepted.lock().unwrap().clone();
        assert_eq!(accepted.len(), 1);
        let stream_b = accepted[0].clone();
        assert!(stream_b.is_established());
        assert_eq!(stream_b.send_stream_id(), stream_a.recv_stream_id());
        assert_eq!(
            stream_b.remote_identity().unwrap().ident_hash(),
            p.a.ident_hash()
        );

        // The peer answers with its own SYN: seq 0, ackThrough 0, no NO_ACK.
        let reply_blocks = p.pool_b.take_blocks();
        assert_eq!(reply_blocks.len(), 1);
        let reply = packet_of(&reply_blocks[0]);
        assert!(reply.is_syn());
        assert!(!reply.is_no_ack());
        assert_eq!(reply.seq(), 0);
        assert_eq!(reply.ack_through(), 0);

        deliver(reply_blocks, &p.a);
        assert!(stream_a.is_established());
        assert_eq!(stream_a.send_stream_id(), stream_b.recv_stream_id());
        // The reply's ACK cleared our SYN from the sent-set.
        assert_eq!(stream_a.inner.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_payload_round_trip() {
        let p = pair();
        let (stream_a, stream_b) = establish(&p);

        let payload: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        stream_a.send(&payload).unwrap();

        let blocks = p.pool_a.take_blocks();
        assert_eq!(blocks.len(), 3);
        let sizes: Vec<usize> = blocks.iter().map(|b| packet_of(b).payload().len()).collect();
        assert_eq!(sizes, vec![1730, 1730, 540]);
        deliver(blocks, &p.b);

        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        while received.len() < payload.len() {
            let n = stream_b
                .read(&mut buf, Duration::from_secs(1))
                .await
                .unwrap();
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, payload);

        // ACK progress: the final QuickAck covers everything sent, so the
        // sent-set empties.
        let acks = p.pool_b.take_blocks();
        let last = packet_of(acks.last().unwrap());
        assert_eq!(last.seq(), 0);
        assert_eq!(last.ack_through(), 3);
        deliver(acks, &p.a);
        assert_eq!(stream_a.inner.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_reordering() {
        let p = pair();
        let (stream_a, stream_b) = establish(&p);

        stream_a.send(b"first ").unwrap();
        stream_a.send(b"second ").unwrap();
        stream_a.send(b"third").unwrap();
        let mut blocks = p.pool_a.take_blocks();
        assert_eq!(blocks.len(), 3);
        let b2 = blocks.remove(1); // seq 2
        let b3 = blocks.remove(1); // seq 3
        let b1 = blocks.remove(0); // seq 1

        deliver(vec![b1], &p.b);
        assert_eq!(stream_b.inner.last_received_seq(), 1);
        deliver(vec![b3], &p.b);
        // The gap blocks delivery: seq 3 is buffered, not applied.
        assert_eq!(stream_b.inner.last_received_seq(), 1);
        deliver(vec![b2], &p.b);
        assert_eq!(stream_b.inner.last_received_seq(), 3);

        let mut buf = [0u8; 64];
        let n = stream_b.read(&mut buf, Duration::from_secs(1)).await.unwrap();
        assert_eq!(&buf[..n], b"first second third");

        // Acks went out for seq 1 and, once the gap filled, seq 3; the
        // out-of-order arrival was not acknowledged.
        let acks: Vec<u32> = p
            .pool_b
            .take_blocks()
            .iter()
            .map(|b| packet_of(b).ack_through())
            .collect();
        assert_eq!(acks, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_duplicate_idempotence() {
        let p = pair();
        let (stream_a, stream_b) = establish(&p);

        stream_a.send(b"payload-one").unwrap();
        let blocks = p.pool_a.take_blocks();
        let packet = packet_of(&blocks[0]);

        p.b.handle_next_packet(packet.clone());
        let mut buf = [0u8; 64];
        let n = stream_b.read(&mut buf, Duration::from_secs(1)).await.unwrap();
        assert_eq!(&buf[..n], b"payload-one");
        assert_eq!(stream_b.inner.last_received_seq(), 1);
        p.pool_b.take_blocks();

        // The duplicate is discarded: same delivered bytes, same progress,
        // one more QuickAck.
        p.b.handle_next_packet(packet);
        assert_eq!(stream_b.inner.last_received_seq(), 1);
        let acks = p.pool_b.take_blocks();
        assert_eq!(acks.len(), 1);
        let ack = packet_of(&acks[0]);
        assert_eq!(ack.seq(), 0);
        assert_eq!(ack.ack_through(), 1);
        assert!(matches!(
            stream_b.read(&mut buf, Duration::from_millis(20)).await,
            Err(StreamingError::TimedOut)
        ));
    }

    #[test]
    fn test_retry_cap_closes_stream() {
        let p = pair();
        let (stream_a, _stream_b) = establish(&p);
        stream_a.send(b"going nowhere").unwrap();
        p.pool_a.take_blocks();

        for _ in 0..MAX_NUM_RESEND_ATTEMPTS {
            stream_a.inner.on_resend_timer();
            assert!(stream_a.is_open());
        }
        // One more round pushes past the cap.
        stream_a.inner.on_resend_timer();
        assert!(!stream_a.is_open());
    }

    #[test]
    fn test_resend_uses_fresh_path() {
        let p = pair();
        let (stream_a, _stream_b) = establish(&p);
        stream_a.send(b"retry me").unwrap();
        assert_eq!(p.pool_a.take_blocks().len(), 1);

        // Unacked, so a resend round emits the packet again.
        stream_a.inner.on_resend_timer();
        let again = p.pool_a.take_blocks();
        assert_eq!(again.len(), 1);
        assert_eq!(packet_of(&again[0]).seq(), 1);
        assert_eq!(stream_a.inner.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_close_propagates() {
        let p = pair();
        let (stream_a, stream_b) = establish(&p);

        stream_a.close();
        assert!(!stream_a.is_open());
        let blocks = p.pool_a.take_blocks();
        let fin = packet_of(blocks.last().unwrap());
        assert!(fin.is_close());
        assert!(fin.flags() & FLAG_SIGNATURE_INCLUDED != 0);

        deliver(blocks, &p.b);
        assert!(!stream_b.is_open());
        let mut buf = [0u8; 16];
        assert!(matches!(
            stream_b.read(&mut buf, Duration::from_millis(20)).await,
            Err(StreamingError::ConnectionReset)
        ));
    }

    #[test]
    fn test_unknown_stream_id_dropped() {
        let p = pair();
        let (_stream_a, _stream_b) = establish(&p);

        // A packet for a stream id nobody owns is dropped without a reply.
        let packet = PacketBuilder::new(0xdeadbeef, 0x1234, 1, 0, &[])
            .flags(0, 0)
            .build();
        p.b.handle_next_packet(packet);
        assert!(p.pool_b.take_blocks().is_empty());
    }

    #[test]
    fn test_bad_signature_closes_stream() {
        let p = pair();
        let stream_a = p.a.create_outgoing_stream(p.b.lease_set().unwrap());
        stream_a.send(&[]).unwrap();
        let blocks = p.pool_a.take_blocks();
        let mut syn = packet_of(&blocks[0]);

        // Corrupt one option byte after signing.
        let tamper_at = syn.options_offset();
        let flipped = syn.as_bytes()[tamper_at] ^ 0xff;
        syn.write_region(tamper_at, &[flipped]);
        p.b.handle_next_packet(syn);

        let accepted = p.accepted.lock().unwrap().clone();
        assert_eq!(accepted.len(), 1);
        assert!(!accepted[0].is_open());
    }
}
