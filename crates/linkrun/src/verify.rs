//! # Verification Handshake
//!
//! The accepting side sends a challenge carrying its transport token after a
//! short delay. The initiating side answers with its announced identity and
//! considers itself verified once the answer is queued. The accepting side
//! becomes verified when the answer arrives.
//!
//! ## Invariants
//!
//! - Until verified, an endpoint drops everything except the one handshake
//!   message its role expects.
//! - The transition happens once. A repeated answer is ignored and the
//!   verified event is never raised twice.

use linkwire::Message;
use linkwire::VerificationRequest;
use linkwire::VerificationResponse;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::endpoint::Endpoint;
use crate::endpoint::Side;

/// What a connecting process announces about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub id: String,
    pub port: i32,
}

impl Identity {
    pub fn new(name: impl Into<String>, id: impl Into<String>, port: i32) -> Self {
        Self { name: name.into(), id: id.into(), port }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VerificationState {
    Unverified,
    Verified,
}

impl Endpoint {
    pub(crate) fn send_challenge(&self) {
        let challenge = VerificationRequest { challenge_token: self.token().to_string() };
        match self.send(challenge) {
            Ok(()) => debug!(token = %self.token(), "verification challenge sent"),
            Err(e) => warn!(token = %self.token(), error = %e, "failed to send verification challenge"),
        }
    }

    /// Handles a message that arrived before verification completed.
    pub(crate) fn verify(&self, message: Message) {
        match (self.side(), message) {
            (Side::Accepting { .. }, Message::VerificationResponse(response)) => {
                self.accept_identity(response);
            }
            (Side::Initiating { announce }, Message::VerificationRequest(request)) => {
                let announce = announce.clone();
                self.answer_challenge(announce, request);
            }
            (_, other) => {
                warn!(
                    token = %self.token(),
                    kind = %other.kind(),
                    "message on unverified endpoint, dropping"
                );
            }
        }
    }

    fn accept_identity(&self, response: VerificationResponse) {
        let identity = Identity::new(response.name, response.id, response.port);
        let (name, id, port) = (identity.name.clone(), identity.id.clone(), identity.port);

        if !self.mark_verified(Some(identity)) {
            return;
        }

        info!(token = %self.token(), name = %name, id = %id, port, "endpoint verified");
        self.raise_verified();
    }

    fn answer_challenge(&self, announce: Identity, request: VerificationRequest) {
        debug!(
            token = %self.token(),
            challenge = %request.challenge_token,
            "answering verification challenge"
        );

        let response = VerificationResponse {
            name: announce.name,
            id: announce.id,
            port: announce.port,
        };
        if let Err(e) = self.send(response) {
            warn!(token = %self.token(), error = %e, "failed to answer verification challenge");
            return;
        }

        if self.mark_verified(None) {
            info!(token = %self.token(), "verified by remote");
            self.raise_verified();
        }
    }
}
