//! Binary Byzantine consensus with a veto variant.
//!
//! A BV-broadcast-style algorithm in the spirit of Mostéfaoui et al.,
//! "Signature-Free Asynchronous Binary Byzantine Consensus" (ACM 2015),
//! extended with a veto rule: any valid `false` choice decides the
//! instance immediately, and every honest node relays exactly one such
//! choice so the veto reaches the whole consortium.
//!
//! A `true` decision requires hearing from every participant (not just a
//! quorum): a single honest dissent must always be decisive.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use pnyx_keyring::KeyRing;
use pnyx_model::{Choice, Message, Proof};
use pnyx_net::{MessageFilter, Network};

use crate::{BbcEngine, BbcError};

/// The veto flavor of [`BbcEngine`].
pub struct VetoEngine {
    network: Arc<dyn Network>,
    keyring: Arc<KeyRing>,
    /// Number of consortium participants; a `true` decision needs a
    /// matching choice from every one of them.
    participants: usize,
}

impl VetoEngine {
    pub fn new(network: Arc<dyn Network>, keyring: Arc<KeyRing>, participants: usize) -> Self {
        VetoEngine {
            network,
            keyring,
            participants,
        }
    }
}

#[async_trait]
impl BbcEngine for VetoEngine {
    async fn execute(
        &self,
        token: CancellationToken,
        id: &str,
        choice: bool,
        proofs: Vec<Proof>,
    ) -> Result<(bool, Vec<Proof>), BbcError> {
        let mut own = Choice {
            identifier: id.to_string(),
            emitter: self.keyring.identity().to_string(),
            choice,
            proofs,
            signature: Vec::new(),
        };
        own.signature = self.keyring.sign(own.unsigned_hash().as_bytes())?;

        // Subscribe before broadcasting so the local loopback of our own
        // choice is observed too.
        let sub_token = token.child_token();
        let wanted = id.to_string();
        let filter: MessageFilter = Arc::new(move |message| {
            matches!(message, Message::Choice(c) if c.identifier == wanted)
        });
        let mut rx = self.network.accept(sub_token.clone(), filter).await;

        self.network.broadcast(Message::Choice(own)).await?;

        let mut sent_false = !choice;
        let mut received_true: HashSet<String> = HashSet::new();

        loop {
            let message = tokio::select! {
                _ = token.cancelled() => {
                    sub_token.cancel();
                    return Err(BbcError::Interrupted);
                }
                received = rx.recv() => match received {
                    Some(message) => message,
                    None => {
                        sub_token.cancel();
                        return Err(BbcError::Interrupted);
                    }
                },
            };

            let Message::Choice(received) = message else {
                continue;
            };

            if self
                .keyring
                .verify(
                    &received.emitter,
                    received.unsigned_hash().as_bytes(),
                    &received.signature,
                )
                .is_err()
            {
                continue;
            }

            if !received.choice {
                // Relay exactly one false choice so the veto reaches every
                // honest node, then decide with the falsifier's proofs.
                if !sent_false
                    && self
                        .network
                        .broadcast(Message::Choice(received.clone()))
                        .await
                        .is_ok()
                {
                    sent_false = true;
                }

                debug!(id = %received.identifier, "veto decided");
                sub_token.cancel();
                return Ok((false, received.proofs));
            }

            received_true.insert(received.emitter);
            if received_true.len() >= self.participants {
                sub_token.cancel();
                return Ok((true, Vec::new()));
            }
        }
    }
}
