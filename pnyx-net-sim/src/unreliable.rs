//! Latency injection for simulated networks.
//!
//! Wraps any [`Network`] and delays both outgoing broadcasts and incoming
//! deliveries by an exponentially distributed duration (median-centered),
//! clamped between the configured bounds. Per-message delays reorder
//! traffic exactly like a congested overlay would.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pnyx_model::Message;
use pnyx_net::{MessageFilter, Network, NetworkError, RecoveryManager};

/// Latency characteristics of the simulated links.
#[derive(Debug, Clone)]
pub struct Parameters {
    /// Seed for the latency sampler; 0 picks an arbitrary seed.
    pub seed: u64,
    pub min_latency: Duration,
    pub median_latency: Duration,
    pub max_latency: Duration,
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters {
            seed: 0,
            min_latency: Duration::from_millis(1),
            median_latency: Duration::from_millis(30),
            max_latency: Duration::from_millis(200),
        }
    }
}

/// Exponential latency sampler with the configured median, clamped to the
/// parameter bounds.
struct LatencySampler {
    params: Parameters,
    rng: Mutex<StdRng>,
}

impl LatencySampler {
    fn new(params: Parameters, seed: u64) -> Self {
        LatencySampler {
            params,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn rand_latency(&self) -> Duration {
        let u: f64 = {
            let mut rng = self.rng.lock().expect("rng lock poisoned");
            rng.gen_range(f64::EPSILON..1.0)
        };

        let factor = self.params.median_latency.as_secs_f64() / std::f64::consts::LN_2;
        let sampled = Duration::from_secs_f64(-u.ln() * factor);
        sampled.clamp(self.params.min_latency, self.params.max_latency)
    }

    fn fork(&self) -> LatencySampler {
        let seed: u64 = {
            let mut rng = self.rng.lock().expect("rng lock poisoned");
            rng.gen()
        };
        LatencySampler::new(self.params.clone(), seed)
    }
}

/// A [`Network`] decorator that makes delivery slow and unordered.
pub struct UnreliableNetwork<N> {
    parent: Arc<N>,
    sampler: LatencySampler,
}

impl<N: Network> UnreliableNetwork<N> {
    pub fn new(parent: Arc<N>, params: Parameters) -> Self {
        let seed = if params.seed == 0 {
            rand::thread_rng().gen()
        } else {
            params.seed
        };

        UnreliableNetwork {
            parent,
            sampler: LatencySampler::new(params, seed),
        }
    }
}

#[async_trait]
impl<N: Network + 'static> Network for UnreliableNetwork<N> {
    async fn broadcast(&self, message: Message) -> Result<(), NetworkError> {
        let delay = self.sampler.rand_latency();
        let parent = self.parent.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = parent.broadcast(message).await {
                tracing::debug!(error = %e, "delayed broadcast failed");
            }
        });

        Ok(())
    }

    async fn accept(
        &self,
        token: CancellationToken,
        filter: MessageFilter,
    ) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(1024);
        let mut parent_rx = self.parent.accept(token.clone(), filter).await;
        let sampler = self.sampler.fork();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = parent_rx.recv() => {
                        let Some(message) = received else { break };
                        let delay = sampler.rand_latency();
                        let tx = tx.clone();
                        let token = token.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = token.cancelled() => {}
                                _ = tokio::time::sleep(delay) => {
                                    let _ = tx.send(message).await;
                                }
                            }
                        });
                    }
                }
            }
        });

        rx
    }

    fn recovery(&self) -> Option<Arc<dyn RecoveryManager>> {
        self.parent.recovery()
    }

    async fn close(&self) {
        self.parent.close().await;
    }
}
