//! In-memory transport for tests and simulation
//!
//! [`MockChannel::pair`] builds two connected channel halves over mpsc
//! queues. The outstanding-write counter is shared between a sender and the
//! peer's receiver: `send` adds the frame length, the peer's `recv`
//! subtracts it, so a consumer that stops reading makes `buffered_amount`
//! grow exactly like a congested link. [`MockConnector`] links offer and
//! answer sides through a [`MockNetwork`] shared by all connectors in a
//! test, and records applied candidates so ordering can be asserted.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};

use crate::transport::{Candidate, Description, DirectChannel, Frame, PeerConnector, TransportError};

/// One half of an in-memory link.
pub struct MockChannel {
    tx: mpsc::UnboundedSender<Frame>,
    rx: Mutex<mpsc::UnboundedReceiver<Frame>>,
    /// Bytes we sent that the peer has not drained yet.
    outstanding: Arc<AtomicUsize>,
    /// Bytes the peer sent that we have not drained yet.
    drain: Arc<AtomicUsize>,
    open_tx: watch::Sender<bool>,
    open_rx: watch::Receiver<bool>,
    latency: Duration,
}

impl MockChannel {
    /// Create a connected pair.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        Self::pair_with_latency(Duration::ZERO)
    }

    /// Create a connected pair with a per-frame one-way delay.
    pub fn pair_with_latency(latency: Duration) -> (Arc<Self>, Arc<Self>) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let a_outstanding = Arc::new(AtomicUsize::new(0));
        let b_outstanding = Arc::new(AtomicUsize::new(0));
        // closing either half tears down the whole link
        let (open_tx, open_rx) = watch::channel(true);

        let a = Arc::new(MockChannel {
            tx: tx_b,
            rx: Mutex::new(rx_a),
            outstanding: a_outstanding.clone(),
            drain: b_outstanding.clone(),
            open_tx: open_tx.clone(),
            open_rx: open_rx.clone(),
            latency,
        });
        let b = Arc::new(MockChannel {
            tx: tx_a,
            rx: Mutex::new(rx_b),
            outstanding: b_outstanding,
            drain: a_outstanding,
            open_tx,
            open_rx,
            latency,
        });
        (a, b)
    }
}

#[async_trait]
impl DirectChannel for MockChannel {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.outstanding.fetch_add(frame.len(), Ordering::SeqCst);
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Option<Frame> {
        let mut rx = self.rx.lock().await;
        let mut open = self.open_rx.clone();
        loop {
            // in-flight frames are discarded once the link is down
            if !*open.borrow() {
                return None;
            }
            tokio::select! {
                frame = rx.recv() => {
                    let frame = frame?;
                    self.drain.fetch_sub(frame.len(), Ordering::SeqCst);
                    return Some(frame);
                }
                res = open.changed() => {
                    if res.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    fn buffered_amount(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    fn is_open(&self) -> bool {
        *self.open_rx.borrow()
    }

    async fn close(&self) {
        let _ = self.open_tx.send(false);
    }
}

/// Rendezvous point linking the offer and answer sides of mock links.
/// Create one per test; every connector in the test shares it.
#[derive(Default)]
pub struct MockNetwork {
    pending: Mutex<HashMap<String, Arc<MockChannel>>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// Mock [`PeerConnector`]: descriptions are just channel keys into the
/// shared [`MockNetwork`].
pub struct MockConnector {
    local_id: String,
    network: Arc<MockNetwork>,
    latency: Duration,
    /// Outbound links waiting for an answer.
    pending: Mutex<HashMap<String, Arc<MockChannel>>>,
    /// Candidates applied, in order, for FIFO assertions.
    applied: Mutex<Vec<(String, Candidate)>>,
}

impl MockConnector {
    pub fn new(local_id: impl Into<String>, network: Arc<MockNetwork>) -> Arc<Self> {
        Self::with_latency(local_id, network, Duration::ZERO)
    }

    pub fn with_latency(
        local_id: impl Into<String>,
        network: Arc<MockNetwork>,
        latency: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id: local_id.into(),
            network,
            latency,
            pending: Mutex::new(HashMap::new()),
            applied: Mutex::new(Vec::new()),
        })
    }

    /// Candidates applied so far, in application order.
    pub async fn applied_candidates(&self) -> Vec<(String, Candidate)> {
        self.applied.lock().await.clone()
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn create_offer(
        &self,
        peer_id: &str,
    ) -> Result<(Arc<dyn DirectChannel>, Description), TransportError> {
        let (ours, theirs) = MockChannel::pair_with_latency(self.latency);
        let key = format!("{}->{}", self.local_id, peer_id);
        self.network
            .pending
            .lock()
            .await
            .insert(key.clone(), theirs);
        self.pending
            .lock()
            .await
            .insert(peer_id.to_string(), ours.clone());
        Ok((ours, Description(key)))
    }

    async fn accept_offer(
        &self,
        peer_id: &str,
        offer: &Description,
    ) -> Result<(Arc<dyn DirectChannel>, Description), TransportError> {
        let channel = self
            .network
            .pending
            .lock()
            .await
            .remove(&offer.0)
            .ok_or_else(|| {
                TransportError::ConnectionFailed(format!("unknown offer from {}", peer_id))
            })?;
        Ok((channel, Description(format!("{}<-{}", offer.0, self.local_id))))
    }

    async fn apply_answer(
        &self,
        peer_id: &str,
        _answer: &Description,
    ) -> Result<Arc<dyn DirectChannel>, TransportError> {
        let channel = self
            .pending
            .lock()
            .await
            .remove(peer_id)
            .ok_or_else(|| TransportError::NoPendingNegotiation(peer_id.to_string()))?;
        Ok(channel)
    }

    async fn add_candidate(
        &self,
        peer_id: &str,
        candidate: &Candidate,
    ) -> Result<(), TransportError> {
        self.applied
            .lock()
            .await
            .push((peer_id.to_string(), candidate.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_mock_channel_roundtrip() {
        let (a, b) = MockChannel::pair();
        a.send(Frame::Text("hello".into())).await.unwrap();
        assert_eq!(b.recv().await, Some(Frame::Text("hello".into())));

        b.send(Frame::Binary(Bytes::from_static(b"world")))
            .await
            .unwrap();
        assert_eq!(a.recv().await, Some(Frame::Binary(Bytes::from_static(b"world"))));
    }

    #[tokio::test]
    async fn test_outstanding_volume_tracks_undrained_bytes() {
        let (a, b) = MockChannel::pair();
        a.send(Frame::Binary(Bytes::from(vec![0u8; 100]))).await.unwrap();
        a.send(Frame::Binary(Bytes::from(vec![0u8; 50]))).await.unwrap();
        assert_eq!(a.buffered_amount(), 150);
        b.recv().await.unwrap();
        assert_eq!(a.buffered_amount(), 50);
        b.recv().await.unwrap();
        assert_eq!(a.buffered_amount(), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_receiver_and_fails_sender() {
        let (a, b) = MockChannel::pair();
        let reader = tokio::spawn(async move { b.recv().await });
        a.close().await;
        assert_eq!(reader.await.unwrap(), None);
        assert!(matches!(
            a.send(Frame::Text("late".into())).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_connector_offer_answer_links_both_sides() {
        let network = MockNetwork::new();
        let alice = MockConnector::new("alice", network.clone());
        let bob = MockConnector::new("bob", network);

        let (chan_a, offer) = alice.create_offer("bob").await.unwrap();
        let (chan_b, answer) = bob.accept_offer("alice", &offer).await.unwrap();
        let chan_a2 = alice.apply_answer("bob", &answer).await.unwrap();

        chan_a.send(Frame::Text("hi".into())).await.unwrap();
        assert_eq!(chan_b.recv().await, Some(Frame::Text("hi".into())));
        // apply_answer hands back the same channel create_offer produced
        chan_b.send(Frame::Text("yo".into())).await.unwrap();
        assert_eq!(chan_a2.recv().await, Some(Frame::Text("yo".into())));
    }

    #[tokio::test]
    async fn test_connector_records_candidate_order() {
        let network = MockNetwork::new();
        let conn = MockConnector::new("alice", network);
        for i in 0..3 {
            conn.add_candidate("bob", &Candidate(format!("cand-{}", i)))
                .await
                .unwrap();
        }
        let applied = conn.applied_candidates().await;
        let order: Vec<_> = applied.iter().map(|(_, c)| c.0.as_str()).collect();
        assert_eq!(order, vec!["cand-0", "cand-1", "cand-2"]);
    }
}
