//! A fault-injecting decorator around any [Transport].
//!
//! Real networks drop and duplicate datagrams; reproducing that on demand is
//!  what makes the recovery machinery testable. The injector sits *below* the
//!  protocol engine, wrapping the real (or in-memory) transport and applying a
//!  fault plan to outgoing datagrams: deterministic drops by send index, and a
//!  seeded random loss/duplication model. Inbound datagrams pass through
//!  untouched - to disturb both directions, wrap both endpoints.
//!
//! Production code never constructs one of these; it exists for test
//!  harnesses, which is also why determinism (explicit indices, fixed seeds)
//!  trumps realism here.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::transport::Transport;

/// What to do to outgoing datagrams.
pub struct FaultPlan {
    /// send indices (0-based, counting every `send_datagram` call) that are
    ///  swallowed without reaching the wire
    pub drop_sends: HashSet<u64>,
    /// probability that any given datagram is silently dropped
    pub loss_probability: f64,
    /// probability that a datagram is delivered twice
    pub duplicate_probability: f64,
    /// seed for the random model, for reproducible failures
    pub seed: u64,
    /// send index at which the random model starts applying; earlier sends
    ///  pass through untouched
    pub first_faulty_send: u64,
}

impl FaultPlan {
    /// A transparent pass-through.
    pub fn reliable() -> FaultPlan {
        FaultPlan {
            drop_sends: HashSet::new(),
            loss_probability: 0.0,
            duplicate_probability: 0.0,
            seed: 0,
            first_faulty_send: 0,
        }
    }

    /// Drops exactly the given send indices.
    pub fn drop_sends(indices: impl IntoIterator<Item = u64>) -> FaultPlan {
        FaultPlan {
            drop_sends: indices.into_iter().collect(),
            ..FaultPlan::reliable()
        }
    }

    /// Drops a random fraction of datagrams, reproducibly for a given seed.
    pub fn lossy(loss_probability: f64, seed: u64) -> FaultPlan {
        FaultPlan {
            loss_probability,
            seed,
            ..FaultPlan::reliable()
        }
    }

    /// The random model only kicks in from the given send index - e.g. to let
    ///  a handshake pass undisturbed.
    pub fn starting_at(mut self, first_faulty_send: u64) -> FaultPlan {
        self.first_faulty_send = first_faulty_send;
        self
    }
}

enum FaultAction {
    Pass,
    Drop(u64),
    Duplicate,
}

struct FaultState {
    rng: StdRng,
    send_counter: u64,
}

pub struct FaultInjector<T> {
    inner: T,
    plan: FaultPlan,
    state: Mutex<FaultState>,
}

impl<T: Transport> FaultInjector<T> {
    pub fn new(inner: T, plan: FaultPlan) -> FaultInjector<T> {
        let rng = StdRng::seed_from_u64(plan.seed);
        FaultInjector {
            inner,
            plan,
            state: Mutex::new(FaultState {
                rng,
                send_counter: 0,
            }),
        }
    }

    fn decide(&self) -> FaultAction {
        let mut state = self.state.lock()
            .expect("fault injector state poisoned");
        let index = state.send_counter;
        state.send_counter += 1;

        if self.plan.drop_sends.contains(&index) {
            return FaultAction::Drop(index);
        }
        if index < self.plan.first_faulty_send {
            return FaultAction::Pass;
        }
        if state.rng.random_bool(self.plan.loss_probability) {
            return FaultAction::Drop(index);
        }
        if state.rng.random_bool(self.plan.duplicate_probability) {
            return FaultAction::Duplicate;
        }
        FaultAction::Pass
    }
}

#[async_trait]
impl<T: Transport> Transport for FaultInjector<T> {
    async fn send_datagram(&self, buf: &[u8]) -> anyhow::Result<()> {
        match self.decide() {
            FaultAction::Pass => self.inner.send_datagram(buf).await,
            FaultAction::Drop(index) => {
                debug!("DROP datagram #{} ({} bytes)", index, buf.len());
                Ok(())
            }
            FaultAction::Duplicate => {
                debug!("DUP datagram ({} bytes)", buf.len());
                self.inner.send_datagram(buf).await?;
                self.inner.send_datagram(buf).await
            }
        }
    }

    async fn recv_datagram(&self, timeout: Duration) -> anyhow::Result<Option<Bytes>> {
        self.inner.recv_datagram(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::datagram_pair;

    #[tokio::test]
    async fn test_indexed_drops() {
        let (local, remote) = datagram_pair();
        let injector = FaultInjector::new(local, FaultPlan::drop_sends([1u64]));

        injector.send_datagram(b"zero").await.unwrap();
        injector.send_datagram(b"one").await.unwrap();
        injector.send_datagram(b"two").await.unwrap();

        let timeout = Duration::from_millis(20);
        assert_eq!(remote.recv_datagram(timeout).await.unwrap().as_deref(), Some(b"zero".as_slice()));
        assert_eq!(remote.recv_datagram(timeout).await.unwrap().as_deref(), Some(b"two".as_slice()));
        assert!(remote.recv_datagram(timeout).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplication() {
        let (local, remote) = datagram_pair();
        let plan = FaultPlan {
            duplicate_probability: 1.0,
            ..FaultPlan::reliable()
        };
        let injector = FaultInjector::new(local, plan);

        injector.send_datagram(b"twice").await.unwrap();

        let timeout = Duration::from_millis(20);
        assert_eq!(remote.recv_datagram(timeout).await.unwrap().as_deref(), Some(b"twice".as_slice()));
        assert_eq!(remote.recv_datagram(timeout).await.unwrap().as_deref(), Some(b"twice".as_slice()));
    }

    #[tokio::test]
    async fn test_random_model_spares_early_sends() {
        let (local, remote) = datagram_pair();
        let injector = FaultInjector::new(local, FaultPlan::lossy(1.0, 7).starting_at(2));

        injector.send_datagram(b"zero").await.unwrap();
        injector.send_datagram(b"one").await.unwrap();
        injector.send_datagram(b"gone").await.unwrap();

        let timeout = Duration::from_millis(20);
        assert_eq!(remote.recv_datagram(timeout).await.unwrap().as_deref(), Some(b"zero".as_slice()));
        assert_eq!(remote.recv_datagram(timeout).await.unwrap().as_deref(), Some(b"one".as_slice()));
        assert!(remote.recv_datagram(timeout).await.unwrap().is_none());
    }
}
