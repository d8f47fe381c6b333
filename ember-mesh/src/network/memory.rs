//! In-Process Transport
//!
//! Connects sessions living in the same process. Follows the same
//! offer/answer/candidate choreography as a real transport: a link opens
//! only once the initiator has applied the answer and the responder has
//! seen the initiator's candidate.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::core::ids::PeerId;
use crate::network::transport::{
    Connection, DirectTransport, IceCandidate, LinkContext, LinkSignal, SessionDescription,
    TransportError,
};

const SDP_PREFIX: &str = "ember-memory/1 token=";
const CANDIDATE_PREFIX: &str = "memory ";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Host,
    Joiner,
}

#[derive(Debug)]
struct Pair {
    host: LinkContext,
    joiner: Option<LinkContext>,
    answer_applied: bool,
    candidate_seen: bool,
    open: bool,
}

impl Pair {
    fn other(&self, side: Side) -> Option<&LinkContext> {
        match side {
            Side::Host => self.joiner.as_ref(),
            Side::Joiner => Some(&self.host),
        }
    }

    fn try_open(&mut self) {
        if self.open || !self.answer_applied || !self.candidate_seen {
            return;
        }
        if let Some(joiner) = &self.joiner {
            self.open = true;
            self.host.emit(LinkSignal::Open);
            joiner.emit(LinkSignal::Open);
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    pairs: BTreeMap<String, Pair>,
}

/// A shared in-process "network". Clone it into every session that should
/// be able to reach the others.
#[derive(Clone, Debug, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail every link `peer` takes part in, on both ends.
    pub fn fail_links(&self, peer: &PeerId) -> usize {
        let mut state = self.lock();
        let doomed: Vec<String> = state
            .pairs
            .iter()
            .filter(|(_, p)| {
                p.host.local == *peer || p.joiner.as_ref().is_some_and(|j| j.local == *peer)
            })
            .map(|(token, _)| token.clone())
            .collect();
        for token in &doomed {
            if let Some(pair) = state.pairs.remove(token) {
                pair.host.emit(LinkSignal::Failed("link dropped".to_string()));
                if let Some(joiner) = &pair.joiner {
                    joiner.emit(LinkSignal::Failed("link dropped".to_string()));
                }
            }
        }
        doomed.len()
    }

    /// Number of links currently open.
    pub fn open_link_count(&self) -> usize {
        self.lock().pairs.values().filter(|p| p.open).count()
    }
}

fn parse_token(description: &SessionDescription) -> Result<&str, TransportError> {
    description
        .sdp
        .strip_prefix(SDP_PREFIX)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| TransportError::InvalidDescription(description.sdp.clone()))
}

impl DirectTransport for MemoryNetwork {
    fn create_offer(
        &self,
        ctx: LinkContext,
    ) -> Result<(Box<dyn Connection>, SessionDescription), TransportError> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        ctx.emit(LinkSignal::LocalCandidate(IceCandidate::new(format!("{CANDIDATE_PREFIX}{token}"))));
        self.lock().pairs.insert(
            token.clone(),
            Pair { host: ctx, joiner: None, answer_applied: false, candidate_seen: false, open: false },
        );

        let offer = SessionDescription::offer(format!("{SDP_PREFIX}{token}"));
        let conn = MemoryConnection { network: self.clone(), token, side: Side::Host, closed: false };
        Ok((Box::new(conn), offer))
    }

    fn create_answer(
        &self,
        ctx: LinkContext,
        offer: &SessionDescription,
    ) -> Result<(Box<dyn Connection>, SessionDescription), TransportError> {
        let token = parse_token(offer)?.to_string();
        {
            let mut state = self.lock();
            let pair = state
                .pairs
                .get_mut(&token)
                .ok_or_else(|| TransportError::InvalidDescription("unknown offer".to_string()))?;
            if pair.joiner.is_some() {
                return Err(TransportError::InvalidState("offer already answered"));
            }
            ctx.emit(LinkSignal::LocalCandidate(IceCandidate::new(format!(
                "{CANDIDATE_PREFIX}{token}"
            ))));
            pair.joiner = Some(ctx);
        }

        let answer = SessionDescription::answer(format!("{SDP_PREFIX}{token}"));
        let conn = MemoryConnection { network: self.clone(), token, side: Side::Joiner, closed: false };
        Ok((Box::new(conn), answer))
    }
}

/// One end of an in-process link.
#[derive(Debug)]
pub struct MemoryConnection {
    network: MemoryNetwork,
    token: String,
    side: Side,
    closed: bool,
}

impl Connection for MemoryConnection {
    fn apply_answer(&mut self, answer: &SessionDescription) -> Result<(), TransportError> {
        if self.side != Side::Host {
            return Err(TransportError::InvalidState("only the offerer applies an answer"));
        }
        if parse_token(answer)? != self.token {
            return Err(TransportError::InvalidDescription("answer for another offer".to_string()));
        }
        let mut state = self.network.lock();
        let pair = state.pairs.get_mut(&self.token).ok_or(TransportError::Closed)?;
        pair.answer_applied = true;
        pair.try_open();
        Ok(())
    }

    fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let token = candidate
            .candidate
            .strip_prefix(CANDIDATE_PREFIX)
            .ok_or_else(|| TransportError::InvalidCandidate(candidate.candidate.clone()))?;
        if token != self.token {
            debug!("ignoring candidate for another link");
            return Ok(());
        }
        let mut state = self.network.lock();
        let pair = state.pairs.get_mut(&self.token).ok_or(TransportError::Closed)?;
        if self.side == Side::Joiner {
            pair.candidate_seen = true;
            pair.try_open();
        }
        Ok(())
    }

    fn send(&mut self, text: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let state = self.network.lock();
        let pair = state.pairs.get(&self.token).ok_or(TransportError::Closed)?;
        if !pair.open {
            return Err(TransportError::InvalidState("link not open"));
        }
        let other = pair.other(self.side).ok_or(TransportError::Closed)?;
        other.emit(LinkSignal::Message(text.to_string()));
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(pair) = self.network.lock().pairs.remove(&self.token) {
            if let Some(other) = pair.other(self.side) {
                other.emit(LinkSignal::Closed);
            }
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.close();
    }
}
