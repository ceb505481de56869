//! Proposal manager (spec.md §3.5, §4.4 `team_proposal_*`): ephemeral, in-memory
//! voting state keyed by proposal id. Unlike the channel store, this state is
//! never persisted — a restarted workflow starts with no open proposals, which
//! is acceptable because proposals are a conversational convenience, not the
//! durable record (the channel log is).

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::now_iso8601_millis;

#[derive(Debug, Error)]
pub enum ProposalError {
    #[error("unknown proposal {0}")]
    NotFound(String),
    #[error("proposal {0} is not active")]
    NotActive(String),
    #[error("{voter} is not eligible to vote on proposal {proposal}")]
    IneligibleVoter { proposal: String, voter: String },
    #[error("option {option} is not valid for proposal {proposal}")]
    InvalidOption { proposal: String, option: String },
    #[error("only the creator ({creator}) may cancel proposal {proposal}")]
    NotCreator { proposal: String, creator: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalType {
    Election,
    Decision,
    Approval,
    Assignment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMode {
    Plurality,
    Majority,
    Unanimous,
}

/// Tie-break policy when a resolution leaves more than one option with the
/// winning vote count. "first" picks the earliest-declared option among the
/// tied set (spec.md §8 scenario 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreaker {
    First,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Active,
    Resolved,
    Cancelled,
    Expired,
}

/// Outcome attached to a proposal once it leaves `Active` via resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalResult {
    pub winner: Option<String>,
    pub counts: HashMap<String, u32>,
    pub tied: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    #[serde(rename = "type")]
    pub proposal_type: ProposalType,
    pub title: String,
    pub options: Vec<String>,
    pub creator: String,
    pub binding: bool,
    pub resolution: ResolutionMode,
    /// Minimum number of distinct voters required before resolution can succeed.
    pub quorum: Option<usize>,
    pub tie_breaker: TieBreaker,
    pub expires_at: Option<String>,
    /// Size of the valid-agent set at creation time. Gates `Plurality`
    /// resolution when no explicit `quorum` is set (spec.md §8 scenario 5:
    /// all three votes must be counted before a plurality is called).
    pub eligible_voters: usize,
    pub status: ProposalStatus,
    pub votes: HashMap<String, String>,
    pub result: Option<ProposalResult>,
    pub created_at: String,
}

/// Input to `create` (spec.md §4.4 `team_proposal_create`).
#[derive(Debug, Clone)]
pub struct ProposalSpec {
    pub proposal_type: ProposalType,
    pub title: String,
    pub options: Vec<String>,
    pub creator: String,
    pub binding: bool,
    pub resolution: ResolutionMode,
    pub quorum: Option<usize>,
    pub tie_breaker: TieBreaker,
    pub expires_at: Option<String>,
    pub eligible_voters: usize,
}

/// In-memory voting state. All mutation is serialized through `state`'s own
/// lock (spec.md §5 "Proposal manager state is entirely in-memory; all
/// mutations are serialized by the manager's own lock").
#[derive(Default)]
pub struct ProposalManager {
    state: Mutex<HashMap<String, Proposal>>,
}

impl ProposalManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, spec: ProposalSpec) -> Proposal {
        let proposal = Proposal {
            id: short_id(),
            proposal_type: spec.proposal_type,
            title: spec.title,
            options: spec.options,
            creator: spec.creator,
            binding: spec.binding,
            resolution: spec.resolution,
            quorum: spec.quorum,
            tie_breaker: spec.tie_breaker,
            expires_at: spec.expires_at,
            eligible_voters: spec.eligible_voters,
            status: ProposalStatus::Active,
            votes: HashMap::new(),
            result: None,
            created_at: now_iso8601_millis(),
        };
        self.state
            .lock()
            .unwrap()
            .insert(proposal.id.clone(), proposal.clone());
        proposal
    }

    pub fn get(&self, id: &str) -> Result<Proposal, ProposalError> {
        self.state
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| ProposalError::NotFound(id.to_string()))
    }

    /// Records a vote. Does not auto-resolve: resolution is triggered
    /// explicitly by the caller (the MCP tool layer checks quorum/status after
    /// every vote and resolves when eligible), mirroring spec.md §3.5's
    /// `create → (vote)* → resolve|cancel|expire` lifecycle.
    pub fn vote(&self, id: &str, voter: &str, choice: &str) -> Result<Proposal, ProposalError> {
        let mut state = self.state.lock().unwrap();
        let proposal = state
            .get_mut(id)
            .ok_or_else(|| ProposalError::NotFound(id.to_string()))?;
        if proposal.status != ProposalStatus::Active {
            return Err(ProposalError::NotActive(id.to_string()));
        }
        if !proposal.options.iter().any(|o| o == choice) {
            return Err(ProposalError::InvalidOption {
                proposal: id.to_string(),
                option: choice.to_string(),
            });
        }
        proposal.votes.insert(voter.to_string(), choice.to_string());
        Ok(proposal.clone())
    }

    /// Attempts resolution per `proposal.resolution`. Returns `Ok(None)` (still
    /// active) when quorum or the resolution mode's threshold is not yet met.
    pub fn try_resolve(&self, id: &str) -> Result<Option<Proposal>, ProposalError> {
        let mut state = self.state.lock().unwrap();
        let proposal = state
            .get_mut(id)
            .ok_or_else(|| ProposalError::NotFound(id.to_string()))?;
        if proposal.status != ProposalStatus::Active {
            return Ok(Some(proposal.clone()));
        }
        if let Some(quorum) = proposal.quorum {
            if proposal.votes.len() < quorum {
                return Ok(None);
            }
        }

        let mut counts: HashMap<String, u32> = HashMap::new();
        for opt in &proposal.options {
            counts.insert(opt.clone(), 0);
        }
        for choice in proposal.votes.values() {
            *counts.entry(choice.clone()).or_insert(0) += 1;
        }
        let total_votes: u32 = proposal.votes.len() as u32;

        let max_count = counts.values().copied().max().unwrap_or(0);
        let tied: Vec<String> = proposal
            .options
            .iter()
            .filter(|o| counts.get(*o).copied().unwrap_or(0) == max_count && max_count > 0)
            .cloned()
            .collect();

        let threshold_met = match proposal.resolution {
            // With no explicit quorum, plurality waits for every eligible
            // agent to vote (an early vote is trivially the max so far).
            ResolutionMode::Plurality => {
                max_count > 0
                    && (proposal.quorum.is_some()
                        || total_votes as usize >= proposal.eligible_voters)
            }
            ResolutionMode::Majority => total_votes > 0 && max_count * 2 > total_votes,
            ResolutionMode::Unanimous => {
                total_votes > 0 && tied.len() == 1 && max_count == total_votes
            }
        };
        if !threshold_met {
            return Ok(None);
        }

        let winner = if tied.len() <= 1 {
            tied.first().cloned()
        } else {
            match proposal.tie_breaker {
                TieBreaker::First => proposal
                    .options
                    .iter()
                    .find(|o| tied.contains(o))
                    .cloned(),
                TieBreaker::None => None,
            }
        };

        proposal.status = ProposalStatus::Resolved;
        proposal.result = Some(ProposalResult {
            winner,
            counts,
            tied,
        });
        Ok(Some(proposal.clone()))
    }

    pub fn cancel(&self, id: &str, requester: &str) -> Result<Proposal, ProposalError> {
        let mut state = self.state.lock().unwrap();
        let proposal = state
            .get_mut(id)
            .ok_or_else(|| ProposalError::NotFound(id.to_string()))?;
        if proposal.creator != requester {
            return Err(ProposalError::NotCreator {
                proposal: id.to_string(),
                creator: proposal.creator.clone(),
            });
        }
        if proposal.status != ProposalStatus::Active {
            return Err(ProposalError::NotActive(id.to_string()));
        }
        proposal.status = ProposalStatus::Cancelled;
        Ok(proposal.clone())
    }

    /// Marks every still-active proposal whose `expires_at` is `<= now` as
    /// expired. Called periodically by the scheduler's idle-detection tick.
    pub fn expire_due(&self, now: &str) -> Vec<Proposal> {
        let mut state = self.state.lock().unwrap();
        let mut expired = Vec::new();
        for proposal in state.values_mut() {
            if proposal.status == ProposalStatus::Active {
                if let Some(exp) = &proposal.expires_at {
                    if exp.as_str() <= now {
                        proposal.status = ProposalStatus::Expired;
                        expired.push(proposal.clone());
                    }
                }
            }
        }
        expired
    }

    pub fn list(&self) -> Vec<Proposal> {
        let mut out: Vec<Proposal> = self.state.lock().unwrap().values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..10].to_string()
}
