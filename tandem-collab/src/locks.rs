//! Edit lock manager: exclusive, non-queued "someone is editing this"
//! claims on tasks.
//!
//! Per entity the state machine is `Free → Claimed(user) → Free`. A claim
//! request against another user's claim never waits and never mutates the
//! claim; the requester is told who holds it and may try again later.
//!
//! Claims end on explicit release, when the holder's last connection
//! drops, or when the holder has been idle for longer than the claim TTL
//! (abandoned tabs). Repeated claim requests by the holder refresh the
//! idle timer.

use std::collections::HashMap;
use tokio::time::{Duration, Instant};

use crate::protocol::{EntityId, ProjectId, UserId, UserInfo};

/// An active editing claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditClaim {
    pub entity_id: EntityId,
    /// Room notified when the claim changes.
    pub project_id: ProjectId,
    pub holder: UserId,
    pub holder_name: String,
    pub acquired_at: Instant,
    pub last_activity: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// `Free → Claimed`; announce to the room.
    Acquired(EditClaim),
    /// Requester already holds the claim; idle timer refreshed.
    Refreshed(EditClaim),
    /// Held by someone else; tell only the requester.
    Conflict(EditClaim),
}

impl ClaimOutcome {
    pub fn is_granted(&self) -> bool {
        !matches!(self, ClaimOutcome::Conflict(_))
    }
}

pub struct EditLockManager {
    claims: HashMap<EntityId, EditClaim>,
    ttl: Duration,
}

impl EditLockManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            claims: HashMap::new(),
            ttl,
        }
    }

    pub fn request_claim(
        &mut self,
        project: &str,
        entity: &str,
        user: &UserInfo,
        now: Instant,
    ) -> ClaimOutcome {
        match self.claims.get_mut(entity) {
            Some(claim) if claim.holder == user.id => {
                claim.last_activity = now;
                ClaimOutcome::Refreshed(claim.clone())
            }
            Some(claim) => ClaimOutcome::Conflict(claim.clone()),
            None => {
                let claim = EditClaim {
                    entity_id: entity.to_string(),
                    project_id: project.to_string(),
                    holder: user.id.clone(),
                    holder_name: user.name.clone(),
                    acquired_at: now,
                    last_activity: now,
                };
                self.claims.insert(entity.to_string(), claim.clone());
                log::info!("{} started editing {entity}", user.name);
                ClaimOutcome::Acquired(claim)
            }
        }
    }

    /// Record holder activity on a claimed entity (e.g. typing into it).
    pub fn touch(&mut self, entity: &str, user: &str, now: Instant) -> bool {
        match self.claims.get_mut(entity) {
            Some(claim) if claim.holder == user => {
                claim.last_activity = now;
                true
            }
            _ => false,
        }
    }

    /// Release a claim. Only the holder can release; anyone else gets
    /// `None` and nothing changes.
    pub fn release_claim(&mut self, entity: &str, user: &str) -> Option<EditClaim> {
        if self.claims.get(entity)?.holder != user {
            return None;
        }
        let claim = self.claims.remove(entity)?;
        log::info!("{} stopped editing {entity}", claim.holder_name);
        Some(claim)
    }

    /// Release every claim held by a user.
    pub fn release_all_held_by(&mut self, user: &str) -> Vec<EditClaim> {
        let entities: Vec<EntityId> = self
            .claims
            .values()
            .filter(|c| c.holder == user)
            .map(|c| c.entity_id.clone())
            .collect();
        entities
            .iter()
            .filter_map(|e| self.claims.remove(e))
            .collect()
    }

    /// Remove claims whose holder has been idle past the TTL.
    pub fn expire(&mut self, now: Instant) -> Vec<EditClaim> {
        let ttl = self.ttl;
        let expired: Vec<EntityId> = self
            .claims
            .values()
            .filter(|c| now.saturating_duration_since(c.last_activity) > ttl)
            .map(|c| c.entity_id.clone())
            .collect();

        let released: Vec<EditClaim> = expired
            .iter()
            .filter_map(|e| self.claims.remove(e))
            .collect();
        for claim in &released {
            log::info!(
                "Claim on {} by {} expired after {:?} idle",
                claim.entity_id,
                claim.holder_name,
                ttl
            );
        }
        released
    }

    /// Who is editing `entity`, if anyone.
    pub fn holder(&self, entity: &str) -> Option<&EditClaim> {
        self.claims.get(entity)
    }

    pub fn claims_in(&self, project: &str) -> Vec<&EditClaim> {
        self.claims
            .values()
            .filter(|c| c.project_id == project)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}
