//! Post-call feedback: an optional 1-5 rating about the just-ended peer.

use crate::protocol::ClientMessage;

pub const SERVICE_TYPE: &str = "video";

/// Armed when a call reaches a known partner, offered at most once per
/// call, cleared as soon as the user submits or skips so a stale rating
/// can never attach to the next call.
#[derive(Debug, Default)]
pub struct FeedbackFlow {
    armed: Option<String>,
    pending: Option<String>,
}

impl FeedbackFlow {
    pub fn arm(&mut self, partner: Option<String>) {
        self.armed = partner;
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Moves the armed partner into the pending prompt. Returns the partner
    /// to show, or `None` when the ended call never had an identified one.
    pub fn offer(&mut self) -> Option<String> {
        let partner = self.armed.take()?;
        self.pending = Some(partner.clone());
        Some(partner)
    }

    /// Emits the rating message exactly once for the pending partner.
    /// Out-of-range ratings are rejected and leave the prompt open.
    pub fn submit(&mut self, rating: u8) -> Option<ClientMessage> {
        if !(1..=5).contains(&rating) {
            tracing::warn!(target = "session", rating, "rating out of range, ignoring");
            return None;
        }
        let partner = self.pending.take()?;
        Some(ClientMessage::SubmitRating {
            partner_username: partner,
            rating,
            service_type: SERVICE_TYPE.to_string(),
        })
    }

    pub fn skip(&mut self) {
        self.pending = None;
    }
}
