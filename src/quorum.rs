//! Quorum algebra: trees of all/majority requirements over node sets,
//! including the joint quorums used during configuration transitions and
//! the unanimity quorums used during branch resolution.

use std::collections::HashSet;

use crate::types::{Branch, ConfigValue, MemberConfig, NodeId};

/// A quorum requirement over sets of votes.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Quorum {
    /// Satisfied iff every node in the set has voted.
    All(HashSet<NodeId>),

    /// Satisfied iff strictly more than half of the set has voted.
    Majority(HashSet<NodeId>),

    /// Satisfied iff both sub-quorums are satisfied.
    Joint(Box<Quorum>, Box<Quorum>),
}

impl Quorum {
    /// The effective quorum of a configuration for a proposer running on
    /// `me`: the local node is always required, guaranteeing the leader
    /// observes its own writes. A joint transition requires majorities in
    /// both the outgoing and the incoming voter sets.
    pub fn of_config(me: NodeId, config: &MemberConfig) -> Quorum {
        let me_only = Quorum::All(HashSet::from([me]));
        match &config.value {
            ConfigValue::Stable(config) => Quorum::Joint(
                Box::new(me_only),
                Box::new(Quorum::Majority(config.voters.clone())),
            ),
            ConfigValue::Transition { current, future } => Quorum::Joint(
                Box::new(me_only),
                Box::new(Quorum::Joint(
                    Box::new(Quorum::Majority(current.voters.clone())),
                    Box::new(Quorum::Majority(future.voters.clone())),
                )),
            ),
        }
    }

    /// The effective quorum while resolving a branch: unanimity of the
    /// surviving peer set.
    pub fn of_branch(branch: &Branch) -> Quorum {
        Quorum::All(branch.peers.clone())
    }

    /// Union of all node sets appearing in the quorum tree.
    pub fn peers(&self) -> HashSet<NodeId> {
        match self {
            Quorum::All(nodes) | Quorum::Majority(nodes) => nodes.clone(),
            Quorum::Joint(q1, q2) => {
                let mut nodes = q1.peers();
                nodes.extend(q2.peers());
                nodes
            }
        }
    }

    /// Whether the given vote set satisfies this quorum.
    pub fn have_quorum(&self, votes: &HashSet<NodeId>) -> bool {
        match self {
            Quorum::All(nodes) => nodes.iter().all(|n| votes.contains(n)),
            Quorum::Majority(nodes) => {
                let got = nodes.iter().filter(|n| votes.contains(n)).count();
                got * 2 > nodes.len()
            }
            Quorum::Joint(q1, q2) => {
                q1.have_quorum(votes) && q2.have_quorum(votes)
            }
        }
    }

    /// Whether the quorum can still be reached once `failed_votes` are
    /// written off: i.e., whether all remaining peers voting would satisfy
    /// it. The proposer aborts the moment this turns false.
    pub fn feasible(
        &self,
        all_peers: &HashSet<NodeId>,
        failed_votes: &HashSet<NodeId>,
    ) -> bool {
        let remaining: HashSet<NodeId> =
            all_peers.difference(failed_votes).copied().collect();
        self.have_quorum(&remaining)
    }
}
