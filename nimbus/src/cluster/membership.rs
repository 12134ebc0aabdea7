use crate::cluster::{Cluster, CloudEvent, HeartBeat, LOG_LEVEL};
use crate::core::{serialize, Node, NodeKey, Opcode, Packet};
use crate::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Orders competing proposals. Rounds grow monotonically; the leader breaks ties.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub(crate) struct Ballot {
  pub round: u64,
  pub leader: NodeKey,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Proposal {
  pub ballot: Ballot,
  pub members: Vec<NodeKey>,
}

struct InFlight {
  proposal: Proposal,
  accepted: BTreeSet<NodeKey>,
  sent_at: u64,
}

#[derive(Default)]
pub(crate) struct Membership {
  round: u64,
  promised: Option<Ballot>,
  in_flight: Option<InFlight>,
  last_commit: Option<Proposal>,
  disagreement: bool,
}
impl Membership {
  fn observe_round(&mut self, round: u64) {
    self.round = self.round.max(round);
  }

  /// Promises `ballot` unless a higher one was already promised.
  fn promise(&mut self, ballot: Ballot) -> bool {
    self.observe_round(ballot.round);
    if self.promised.map_or(true, |p| ballot >= p) {
      self.promised = Some(ballot);
      if self.in_flight.as_ref().map_or(false, |f| f.proposal.ballot < ballot) {
        self.in_flight = None;
      }
      true
    } else {
      false
    }
  }

  fn next_ballot(&mut self, leader: NodeKey) -> Ballot {
    self.round = self.round.max(self.promised.map_or(0, |p| p.round)) + 1;
    Ballot {
      round: self.round,
      leader: leader,
    }
  }
}

enum Step {
  Wait,
  Commit(Proposal),
  Send(Proposal),
}

impl Cluster {
  /// The processes this one would put in the cloud right now, in [`NodeKey`] order. Always
  /// includes this process.
  pub(crate) fn candidates(&self, now: u64) -> Vec<NodeKey> {
    let cfg = &self.config().cloud;
    let timeout = cfg.timeout.as_millis() as u64;
    let suspect = cfg.suspect.as_millis() as u64;
    let cloud = self.cloud();
    let mut keys = BTreeSet::new();
    keys.insert(self.self_key());
    for node in self.nodes().all().into_iter().filter(|n| !n.is_self()) {
      if !self.may_join(&node.key()) {
        continue;
      }
      let silent = now.saturating_sub(node.last_heard_from());
      let keep = if cloud.contains(&node.key()) {
        !(cfg.evict_lost && node.has_lost_contact() && silent > suspect)
      } else {
        node.heartbeat().boot_ms != 0 && silent <= timeout
      };
      if keep {
        keys.insert(node.key());
      }
    }
    keys.into_iter().collect()
  }

  /// Reacts to a heartbeat that may disagree with our membership.
  pub(crate) fn observe_heartbeat(&self, sender: &Arc<Node>, hb: &HeartBeat, now: u64) {
    let cloud = self.cloud();
    let member = cloud.contains(&sender.key());
    if member && hb.cloud_hash == cloud.hash() {
      return;
    }
    if member && self.cloud_handle().is_id_from_prev_cloud(hb.cloud_hash) {
      let last = self.inner.membership.lock().unwrap().last_commit.clone();
      if let Some(p) = last.filter(|p| p.members.contains(&sender.key())) {
        debug!(
          LOG_LEVEL,
          self,
          format!("{} is behind, repeating commit {:?}", sender.key(), p.ballot)
        );
        self.send_membership(sender, Opcode::Commit, &p);
      }
      return;
    }
    if !member && !self.may_join(&sender.key()) {
      return;
    }
    self.inner.membership.lock().unwrap().disagreement = true;
    self.maybe_propose(now);
  }

  pub(crate) fn membership_tick(&self, now: u64) {
    self.maybe_propose(now);
  }

  /// Proposes the candidate set if this process leads and the cloud needs to change.
  fn maybe_propose(&self, now: u64) {
    let candidates = self.candidates(now);
    let me = self.self_key();
    if candidates.first() != Some(&me) {
      return;
    }
    let timeout = self.config().cloud.proposal_timeout.as_millis() as u64;
    let cloud = self.cloud();
    let step = {
      let mut m = self.inner.membership.lock().unwrap();
      let stalled = m
        .in_flight
        .as_ref()
        .map_or(true, |f| now.saturating_sub(f.sent_at) >= timeout);
      if !stalled || (!m.disagreement && cloud.keys() == &candidates[..]) {
        Step::Wait
      } else {
        let ballot = m.next_ballot(me);
        m.promised = Some(ballot);
        let proposal = Proposal {
          ballot: ballot,
          members: candidates,
        };
        if proposal.members.len() == 1 {
          m.in_flight = None;
          Step::Commit(proposal)
        } else {
          let mut accepted = BTreeSet::new();
          accepted.insert(me);
          m.in_flight = Some(InFlight {
            proposal: proposal.clone(),
            accepted: accepted,
            sent_at: now,
          });
          Step::Send(proposal)
        }
      }
    };
    match step {
      Step::Wait => {}
      Step::Commit(p) => self.commit(p),
      Step::Send(p) => {
        debug!(
          LOG_LEVEL,
          self,
          format!("Proposing {:?} under {:?}", p.members, p.ballot)
        );
        for key in p.members.iter().filter(|k| **k != me) {
          let node = self.node(*key);
          self.send_membership(&node, Opcode::Propose, &p);
        }
      }
    }
  }

  pub(crate) fn on_propose(&self, sender: &Arc<Node>, proposal: Proposal) {
    if !proposal.members.contains(&self.self_key()) {
      return;
    }
    let reply = {
      let mut m = self.inner.membership.lock().unwrap();
      if m.promise(proposal.ballot) {
        proposal.ballot
      } else {
        // Tell the proposer what it has to beat.
        m.promised.unwrap_or(proposal.ballot)
      }
    };
    self.send_membership(sender, Opcode::Accept, &reply);
  }

  pub(crate) fn on_accept(&self, sender: &Arc<Node>, ballot: Ballot) {
    let commit = {
      let mut m = self.inner.membership.lock().unwrap();
      m.observe_round(ballot.round);
      let f = match m.in_flight.as_mut() {
        Some(f) if f.proposal.ballot == ballot => f,
        _ => return,
      };
      if f.proposal.members.contains(&sender.key()) {
        f.accepted.insert(sender.key());
      }
      if f.accepted.len() * 2 > f.proposal.members.len() {
        let p = f.proposal.clone();
        m.in_flight = None;
        Some(p)
      } else {
        None
      }
    };
    if let Some(p) = commit {
      self.commit(p);
    }
  }

  /// Leader side: tell every member, then install.
  fn commit(&self, proposal: Proposal) {
    let me = self.self_key();
    for key in proposal.members.iter().filter(|k| **k != me) {
      let node = self.node(*key);
      self.send_membership(&node, Opcode::Commit, &proposal);
    }
    self.apply_commit(proposal);
  }

  pub(crate) fn on_commit(&self, sender: &Arc<Node>, proposal: Proposal) {
    if !proposal.members.contains(&self.self_key()) {
      debug!(
        LOG_LEVEL,
        self,
        format!("Ignoring commit from {} that leaves us out", sender.key())
      );
      return;
    }
    {
      let mut m = self.inner.membership.lock().unwrap();
      if m.promised.map_or(false, |p| proposal.ballot < p) {
        return;
      }
      m.promised = Some(proposal.ballot);
      m.observe_round(proposal.ballot.round);
    }
    self.apply_commit(proposal);
  }

  fn apply_commit(&self, proposal: Proposal) {
    {
      let mut m = self.inner.membership.lock().unwrap();
      m.disagreement = false;
      m.last_commit = Some(proposal.clone());
    }
    let members = proposal.members.iter().map(|k| self.node(*k)).collect();
    if let Some(cloud) = self.cloud_handle().install(members) {
      info!(
        LOG_LEVEL,
        self,
        format!(
          "Cloud {} of size {} under {:?}: {:?}",
          cloud.idx(),
          cloud.size(),
          proposal.ballot,
          cloud.keys()
        )
      );
      self.publish(CloudEvent::CloudChanged(cloud));
    }
  }

  fn send_membership<T: Serialize>(&self, node: &Arc<Node>, opcode: Opcode, msg: &T) {
    let payload = match serialize(msg) {
      Ok(p) => p,
      Err(e) => {
        warn!(LOG_LEVEL, self, format!("Could not encode {:?}: {}", opcode, e));
        return;
      }
    };
    let packet = Packet::new(opcode, self.self_key(), 0, &payload[..]);
    if let Err(e) = self.transport().send(node, &packet) {
      debug!(LOG_LEVEL, self, format!("{:?} to {} failed: {}", opcode, node.key(), e));
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::net::Ipv4Addr;

  fn ballot(round: u64, port: u16) -> Ballot {
    Ballot {
      round: round,
      leader: NodeKey::new(Ipv4Addr::LOCALHOST, port),
    }
  }

  #[test]
  fn test_ballot_order() {
    assert!(ballot(2, 7009) > ballot(1, 7001));
    assert!(ballot(2, 7002) > ballot(2, 7001));
  }

  #[test]
  fn test_promises() {
    let mut m = Membership::default();
    assert!(m.promise(ballot(3, 7002)));
    assert!(!m.promise(ballot(2, 7001)));
    assert!(m.promise(ballot(3, 7002)));
    let next = m.next_ballot(NodeKey::new(Ipv4Addr::LOCALHOST, 7001));
    assert_eq!(next, ballot(4, 7001));
    assert!(m.promise(next));
  }

  #[test]
  fn test_higher_promise_drops_own_proposal() {
    let mut m = Membership::default();
    let mine = m.next_ballot(NodeKey::new(Ipv4Addr::LOCALHOST, 7001));
    m.promised = Some(mine);
    m.in_flight = Some(InFlight {
      proposal: Proposal {
        ballot: mine,
        members: vec![],
      },
      accepted: BTreeSet::new(),
      sent_at: 0,
    });
    assert!(m.promise(ballot(5, 7003)));
    assert!(m.in_flight.is_none());
  }
}
