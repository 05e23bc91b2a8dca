use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::command::NodeCommand;
use crate::error::Result;
use crate::runtime::NodeHandle;
use crate::state::{Ballot, Role};
use crate::storage::ReplicatedLog;
use crate::transport::RaftClient;
use crate::types::{NodeId, RequestVote, Term};

/// Outbound connection to one peer.
pub type Peer = (NodeId, Arc<dyn RaftClient>);

/// §5.2: run one election round after the leader went quiet.
///
/// Returns `true` when this node became leader.
pub async fn campaign<L: ReplicatedLog>(node: &NodeHandle, log: &L, peers: &[Peer]) -> Result<bool> {
    node.execute(NodeCommand::TimeoutLeaderHeartbeat).await?;
    let status = node.status();
    if status.role != Role::Candidate {
        return Ok(false);
    }
    let term = status.current_term;
    node.execute(NodeCommand::GrantVote { candidate: status.id })
        .await?;
    info!(node = %status.id, term = %term, "election started");

    let cluster_size = peers.len() + 1;
    let mut ballot = Ballot::new(status.id);
    let request = RequestVote {
        term,
        candidate_id: status.id,
        last_log_index: log.last_index(),
        last_log_term: log.last_term(),
    };

    let mut votes = JoinSet::new();
    for (peer, client) in peers {
        let (peer, client, request) = (*peer, Arc::clone(client), request.clone());
        votes.spawn(async move { (peer, client.request_vote(request).await) });
    }

    while !ballot.has_majority(cluster_size) {
        let Some(joined) = votes.join_next().await else {
            break;
        };
        let Ok((peer, reply)) = joined else {
            continue;
        };
        match reply {
            Ok(response) if response.term > term => {
                debug!(peer = %peer, term = %response.term, "newer term seen during election");
                return step_down(node, response.term).await;
            }
            Ok(response) if response.vote_granted => ballot.record_vote(peer),
            Ok(_) => debug!(peer = %peer, term = %term, "vote refused"),
            Err(e) => debug!(peer = %peer, error = %e, "vote request failed"),
        }
    }

    if !ballot.has_majority(cluster_size) {
        info!(node = %status.id, term = %term, "election lost");
        return Ok(false);
    }
    let now = node.status();
    if now.role != Role::Candidate || now.current_term != term {
        return Ok(false);
    }
    node.execute(NodeCommand::WinCandidateElection).await?;
    Ok(true)
}

async fn step_down(node: &NodeHandle, term: Term) -> Result<bool> {
    if term > node.status().current_term {
        node.execute(NodeCommand::SetNewTerm { term }).await?;
    }
    Ok(false)
}
