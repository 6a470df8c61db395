//! Both ends of a vote: the agent answering a request and the coordinator
//! gathering answers into a [`Ballot`].

use crate::consensus::tally::{Ballot, TallyOutcome};
use crate::consensus::types::{ConsensusRequest, Decision, Proposal, VoteChoice};
use crate::consensus::Vote;
use crate::error::{ConsensusError, Result, TransportError};
use crate::network::{fan_out, Message, NetworkHandler, Transport};
use crate::types::AgentId;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Handler that answers vote requests on behalf of `agent` using `choose`
pub fn voter_handler<F>(agent: impl Into<AgentId>, choose: F) -> NetworkHandler
where
    F: Fn(&Proposal) -> VoteChoice + Send + Sync + 'static,
{
    let agent = agent.into();
    NetworkHandler::new(move |from, message| match message {
        Message::VoteRequest {
            request_id,
            proposal,
        } => {
            let choice = choose(&proposal);
            debug!(agent = %agent, coordinator = %from, request_id, ?choice, "Voter: casting vote");
            Ok(Message::VoteReply(Vote::new(agent.clone(), choice)))
        }
        other => Err(TransportError::Rejected {
            peer: agent.clone(),
            reason: format!("voter cannot handle {}", other.kind()),
        }),
    })
}

/// Ask every participant for a vote and feed the replies into `ballot`.
///
/// Returns as soon as the ballot is decided or proven impossible. Votes are
/// scaled by `weights`; unreachable participants count as missing. If the
/// request deadline passes while votes are still missing the result is a
/// timeout, whichever way the remaining replies resolved.
pub async fn collect_votes(
    transport: &Arc<dyn Transport>,
    request: &ConsensusRequest,
    weights: &BTreeMap<AgentId, f64>,
    mut ballot: Ballot,
) -> Result<Decision> {
    let started = Instant::now();
    let peers: Vec<AgentId> = request.participants.iter().map(|a| a.id.clone()).collect();
    let message = Message::VoteRequest {
        request_id: request.id,
        proposal: request.proposal.clone(),
    };
    let mut calls = fan_out(transport, &peers, message, request.remaining());

    while let Some(joined) = calls.join_next().await {
        let (peer, reply) = match joined {
            Ok(reply) => reply,
            Err(e) => {
                warn!(request_id = request.id, error = %e, "Vote collection task failed");
                continue;
            }
        };
        let weight = weights.get(&peer).copied().unwrap_or(1.0);

        match reply {
            Ok(Message::VoteReply(mut vote)) if vote.agent == peer => {
                if let VoteChoice::Value(value) = &vote.choice {
                    if !request.proposal.candidates.contains(value) {
                        debug!(agent = %peer, value = %value, "Vote for unknown candidate counted as abstain");
                        vote.choice = VoteChoice::Abstain;
                    }
                }
                vote.weight = weight;
                ballot.record(&vote);
            }
            Ok(other) => {
                debug!(agent = %peer, kind = other.kind(), "Unexpected vote reply");
                ballot.record_missing(weight);
            }
            Err(e) => {
                debug!(agent = %peer, error = %e, "No vote from participant");
                ballot.record_missing(weight);
            }
        }

        match ballot.evaluate(false) {
            TallyOutcome::Decided(value) => {
                calls.abort_all();
                return Ok(Decision {
                    value,
                    tally: ballot.into_tally(),
                });
            }
            TallyOutcome::Impossible(reason) => {
                calls.abort_all();
                if deadline_cut_short(&ballot, request) {
                    break;
                }
                return Err(ConsensusError::no_quorum(reason));
            }
            TallyOutcome::Pending => {}
        }
    }

    if deadline_cut_short(&ballot, request) {
        return Err(ConsensusError::Timeout {
            elapsed: started.elapsed(),
        });
    }
    match ballot.evaluate(true) {
        TallyOutcome::Decided(value) => Ok(Decision {
            value,
            tally: ballot.into_tally(),
        }),
        TallyOutcome::Impossible(reason) => Err(ConsensusError::no_quorum(reason)),
        TallyOutcome::Pending => Err(ConsensusError::no_quorum("ballot left undecided")),
    }
}

fn deadline_cut_short(ballot: &Ballot, request: &ConsensusRequest) -> bool {
    ballot.tally().missing > 0 && Instant::now() >= request.deadline
}
