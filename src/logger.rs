use tracing::{debug, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::peer::types::IceCandidate;

/// Install the global tracing subscriber.
///
/// Honors `RUST_LOG`; defaults to `ssc_call=info`. Calling it twice is harmless.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ssc_call=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
    Unknown,
}

pub fn candidate_type(candidate: &IceCandidate) -> CandidateType {
    let mut parts = candidate.candidate.split_whitespace();
    while let Some(part) = parts.next() {
        if part == "typ" {
            return match parts.next() {
                Some("host") => CandidateType::Host,
                Some("srflx") => CandidateType::ServerReflexive,
                Some("prflx") => CandidateType::PeerReflexive,
                Some("relay") => CandidateType::Relay,
                _ => CandidateType::Unknown,
            };
        }
    }
    CandidateType::Unknown
}

/// Running tally of gathered local candidates, logged when gathering completes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CandidateTally {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
    pub other: usize,
}

impl CandidateTally {
    pub fn record(&mut self, candidate: &IceCandidate) {
        let kind = candidate_type(candidate);
        debug!(candidate = %candidate.candidate, ?kind, "Local ICE candidate");
        match kind {
            CandidateType::Host => self.host += 1,
            CandidateType::ServerReflexive => self.srflx += 1,
            CandidateType::Relay => self.relay += 1,
            CandidateType::PeerReflexive | CandidateType::Unknown => self.other += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.host + self.srflx + self.relay + self.other
    }

    pub fn log_summary(&self) {
        debug!(
            host = self.host,
            srflx = self.srflx,
            relay = self.relay,
            "ICE gathering complete"
        );
        if self.total() > 0 && self.srflx == 0 && self.relay == 0 {
            warn!("Only host candidates gathered; peers behind NAT may not connect");
        }
    }
}
