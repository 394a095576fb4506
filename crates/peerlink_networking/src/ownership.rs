//! # Entity Ownership
//!
//! Who may mutate which shared entity, and the request/grant exchange that
//! moves that right between peers.
//!
//! ## Protocol
//!
//! ```text
//! requester                     owner                      everyone
//!     |-- ENTITY_REQUEST_OWNER -->|                            |
//!     |                           |-- ENTITY_OWNER_CHANGED --->|
//!     |<-------------------------------------------------------|
//!  Granted
//! ```
//!
//! The owner grants unconditionally; the first request to arrive wins.
//! Requests resolve through an [`OwnershipTicket`] rather than callbacks, so a
//! destroyed entity or a torn-down session simply cancels them.

use crate::error::{SessionError, SessionResult};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use peerlink_shared::{EntityId, PeerId};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Why an ownership request failed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipFailure {
    /// The request never reached the owner.
    #[error("Failed send message")]
    SendFailed,
    /// Ownership did not arrive before the caller's deadline.
    #[error("Timed out")]
    TimedOut,
}

/// Final state of an ownership request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipOutcome {
    /// The local peer now owns the entity.
    Granted,
    /// The request failed.
    Failed(OwnershipFailure),
    /// The entity was destroyed, the request superseded, or the session closed.
    Cancelled,
}

/// Pending result of [`crate::Session::request_ownership`].
#[derive(Debug)]
pub struct OwnershipTicket {
    entity: EntityId,
    rx: Receiver<OwnershipOutcome>,
    resolved: Option<OwnershipOutcome>,
}

impl OwnershipTicket {
    fn pair(entity: EntityId) -> (Sender<OwnershipOutcome>, Self) {
        let (tx, rx) = bounded(1);
        let ticket = Self {
            entity,
            rx,
            resolved: None,
        };
        (tx, ticket)
    }

    /// Entity the request is for.
    #[must_use]
    pub const fn entity(&self) -> EntityId {
        self.entity
    }

    /// Returns the outcome once known. Never blocks.
    pub fn try_outcome(&mut self) -> Option<OwnershipOutcome> {
        if self.resolved.is_none() {
            self.resolved = match self.rx.try_recv() {
                Ok(outcome) => Some(outcome),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => Some(OwnershipOutcome::Cancelled),
            };
        }
        self.resolved
    }

    /// Returns true once an outcome is known.
    pub fn is_resolved(&mut self) -> bool {
        self.try_outcome().is_some()
    }
}

/// Ownership state of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipRecord {
    /// Current owner.
    pub owner: PeerId,
    /// Whether the entity survives its owner leaving.
    pub transferable: bool,
}

/// Result of moving a departed peer's entities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Entities now owned by the successor.
    pub reassigned: Vec<EntityId>,
    /// Non-transferable entities that were removed.
    pub destroyed: Vec<EntityId>,
}

struct PendingRequest {
    request: u64,
    tx: Sender<OwnershipOutcome>,
    deadline: Option<Instant>,
}

impl PendingRequest {
    fn resolve(self, outcome: OwnershipOutcome) {
        // The ticket may already be gone; nobody is waiting then.
        let _ = self.tx.try_send(outcome);
    }
}

/// What the caller must do after [`OwnershipTable::begin_request`].
#[derive(Debug)]
pub enum RequestPlan {
    /// Already owned locally; the ticket is resolved.
    Granted(OwnershipTicket),
    /// Ask `owner`; report send failure with `request`.
    Ask {
        /// Ticket handed to the application.
        ticket: OwnershipTicket,
        /// Current owner to send the request to.
        owner: PeerId,
        /// Request sequence, for [`OwnershipTable::fail_send`].
        request: u64,
    },
}

/// Ownership records and in-flight requests of one session.
#[derive(Default)]
pub struct OwnershipTable {
    records: HashMap<EntityId, OwnershipRecord>,
    pending: HashMap<EntityId, PendingRequest>,
    next_request: u64,
}

impl OwnershipTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `entity` as owned by `owner`.
    pub fn register(&mut self, entity: EntityId, owner: PeerId, transferable: bool) {
        self.records.insert(entity, OwnershipRecord { owner, transferable });
    }

    /// Removes `entity`, cancelling any pending request for it.
    pub fn forget(&mut self, entity: EntityId) -> Option<OwnershipRecord> {
        self.cancel(entity);
        self.records.remove(&entity)
    }

    /// Cancels the pending request for `entity`, if any.
    pub fn cancel(&mut self, entity: EntityId) -> bool {
        match self.pending.remove(&entity) {
            Some(pending) => {
                pending.resolve(OwnershipOutcome::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Ownership record of `entity`.
    #[must_use]
    pub fn record(&self, entity: EntityId) -> Option<OwnershipRecord> {
        self.records.get(&entity).copied()
    }

    /// Current owner of `entity`.
    #[must_use]
    pub fn owner_of(&self, entity: EntityId) -> Option<PeerId> {
        self.records.get(&entity).map(|record| record.owner)
    }

    /// Returns true if a request for `entity` is in flight.
    #[must_use]
    pub fn is_pending(&self, entity: EntityId) -> bool {
        self.pending.contains_key(&entity)
    }

    /// Number of known entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no entities are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Starts a request by `local` for `entity`.
    ///
    /// A request already pending for the same entity is superseded and its
    /// ticket resolves [`OwnershipOutcome::Cancelled`].
    ///
    /// # Errors
    ///
    /// [`SessionError::UnknownEntity`] if `entity` has no record.
    pub fn begin_request(
        &mut self,
        entity: EntityId,
        local: PeerId,
        now: Instant,
        timeout: Option<Duration>,
    ) -> SessionResult<RequestPlan> {
        let owner = self
            .owner_of(entity)
            .ok_or(SessionError::UnknownEntity(entity))?;

        let (tx, ticket) = OwnershipTicket::pair(entity);
        if owner == local {
            let _ = tx.try_send(OwnershipOutcome::Granted);
            return Ok(RequestPlan::Granted(ticket));
        }

        self.cancel(entity);
        self.next_request += 1;
        let request = self.next_request;
        self.pending.insert(
            entity,
            PendingRequest {
                request,
                tx,
                deadline: timeout.map(|t| now + t),
            },
        );
        Ok(RequestPlan::Ask {
            ticket,
            owner,
            request,
        })
    }

    /// Fails request `request` for `entity` because its send expired.
    ///
    /// Ignored if that request is no longer the pending one.
    pub fn fail_send(&mut self, entity: EntityId, request: u64) -> bool {
        if self.pending.get(&entity).map(|p| p.request) != Some(request) {
            return false;
        }
        if let Some(pending) = self.pending.remove(&entity) {
            pending.resolve(OwnershipOutcome::Failed(OwnershipFailure::SendFailed));
        }
        true
    }

    /// Fails every request whose deadline has passed. Returns their entities.
    pub fn expire(&mut self, now: Instant) -> Vec<EntityId> {
        let due: Vec<EntityId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline.is_some_and(|deadline| now >= deadline))
            .map(|(entity, _)| *entity)
            .collect();
        for entity in &due {
            if let Some(pending) = self.pending.remove(entity) {
                pending.resolve(OwnershipOutcome::Failed(OwnershipFailure::TimedOut));
            }
        }
        due
    }

    /// Owner side of a request: grants if `local` owns `entity`.
    ///
    /// Returns true if ownership moved to `requester`; the caller must then
    /// broadcast the change.
    pub fn grant(&mut self, entity: EntityId, requester: PeerId, local: PeerId) -> bool {
        match self.records.get_mut(&entity) {
            Some(record) if record.owner == local && requester != local => {
                record.owner = requester;
                true
            }
            _ => false,
        }
    }

    /// Applies an ownership change announced by the previous owner.
    ///
    /// Returns false for unknown entities.
    pub fn apply_owner_change(&mut self, entity: EntityId, new_owner: PeerId, local: PeerId) -> bool {
        let Some(record) = self.records.get_mut(&entity) else {
            return false;
        };
        record.owner = new_owner;
        if new_owner == local {
            if let Some(pending) = self.pending.remove(&entity) {
                pending.resolve(OwnershipOutcome::Granted);
            }
        }
        true
    }

    /// Moves every entity owned by `departed`.
    ///
    /// Non-transferable entities are removed; the rest go to `successor`
    /// without any network exchange.
    pub fn migrate(&mut self, departed: PeerId, successor: PeerId, local: PeerId) -> MigrationReport {
        let mut report = MigrationReport::default();
        let mut orphaned: Vec<(EntityId, bool)> = self
            .records
            .iter()
            .filter(|(_, record)| record.owner == departed)
            .map(|(entity, record)| (*entity, record.transferable))
            .collect();
        orphaned.sort_unstable();

        for (entity, transferable) in orphaned {
            if transferable {
                self.apply_owner_change(entity, successor, local);
                report.reassigned.push(entity);
            } else {
                self.forget(entity);
                report.destroyed.push(entity);
            }
        }
        report
    }

    /// Cancels every pending request and forgets every entity.
    pub fn clear(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.resolve(OwnershipOutcome::Cancelled);
        }
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL: PeerId = PeerId(1);
    const REMOTE: PeerId = PeerId(2);
    const CRATE: EntityId = EntityId(10);

    fn table_with(owner: PeerId, transferable: bool) -> OwnershipTable {
        let mut table = OwnershipTable::new();
        table.register(CRATE, owner, transferable);
        table
    }

    fn ask(plan: RequestPlan) -> (OwnershipTicket, PeerId, u64) {
        match plan {
            RequestPlan::Ask {
                ticket,
                owner,
                request,
            } => (ticket, owner, request),
            RequestPlan::Granted(_) => panic!("expected a network request"),
        }
    }

    #[test]
    fn test_already_owner_is_granted_synchronously() {
        let mut table = table_with(LOCAL, true);
        match table.begin_request(CRATE, LOCAL, Instant::now(), None).unwrap() {
            RequestPlan::Granted(mut ticket) => {
                assert_eq!(ticket.try_outcome(), Some(OwnershipOutcome::Granted));
            }
            RequestPlan::Ask { .. } => panic!("owner should not ask"),
        }
        assert!(!table.is_pending(CRATE));
    }

    #[test]
    fn test_unknown_entity_rejected() {
        let mut table = OwnershipTable::new();
        let result = table.begin_request(CRATE, LOCAL, Instant::now(), None);
        assert!(matches!(result, Err(SessionError::UnknownEntity(_))));
    }

    #[test]
    fn test_grant_resolves_pending() {
        let mut table = table_with(REMOTE, true);
        let (mut ticket, owner, _) = ask(table.begin_request(CRATE, LOCAL, Instant::now(), None).unwrap());
        assert_eq!(owner, REMOTE);
        assert_eq!(ticket.try_outcome(), None);

        assert!(table.apply_owner_change(CRATE, LOCAL, LOCAL));
        assert_eq!(ticket.try_outcome(), Some(OwnershipOutcome::Granted));
        assert_eq!(table.owner_of(CRATE), Some(LOCAL));
    }

    #[test]
    fn test_timeout_not_before_deadline() {
        let start = Instant::now();
        let mut table = table_with(REMOTE, true);
        let (mut ticket, _, _) = ask(
            table
                .begin_request(CRATE, LOCAL, start, Some(Duration::from_millis(1_000)))
                .unwrap(),
        );

        assert!(table.expire(start + Duration::from_millis(999)).is_empty());
        assert_eq!(ticket.try_outcome(), None);

        assert_eq!(table.expire(start + Duration::from_millis(1_000)), vec![CRATE]);
        assert_eq!(
            ticket.try_outcome(),
            Some(OwnershipOutcome::Failed(OwnershipFailure::TimedOut))
        );
        assert_eq!(OwnershipFailure::TimedOut.to_string(), "Timed out");
    }

    #[test]
    fn test_send_failure_only_for_current_request() {
        let now = Instant::now();
        let mut table = table_with(REMOTE, true);
        let (mut first, _, first_id) = ask(table.begin_request(CRATE, LOCAL, now, None).unwrap());
        let (mut second, _, second_id) = ask(table.begin_request(CRATE, LOCAL, now, None).unwrap());

        assert_eq!(first.try_outcome(), Some(OwnershipOutcome::Cancelled));
        assert!(!table.fail_send(CRATE, first_id));
        assert_eq!(second.try_outcome(), None);

        assert!(table.fail_send(CRATE, second_id));
        assert_eq!(
            second.try_outcome(),
            Some(OwnershipOutcome::Failed(OwnershipFailure::SendFailed))
        );
        assert_eq!(OwnershipFailure::SendFailed.to_string(), "Failed send message");
    }

    #[test]
    fn test_owner_grants_only_what_it_owns() {
        let mut table = table_with(LOCAL, true);
        assert!(table.grant(CRATE, REMOTE, LOCAL));
        assert_eq!(table.owner_of(CRATE), Some(REMOTE));
        // No longer the owner: a second request is ignored.
        assert!(!table.grant(CRATE, PeerId(3), LOCAL));
        assert!(!table.grant(EntityId(99), REMOTE, LOCAL));
    }

    #[test]
    fn test_forget_cancels_ticket() {
        let mut table = table_with(REMOTE, true);
        let (mut ticket, _, _) = ask(table.begin_request(CRATE, LOCAL, Instant::now(), None).unwrap());
        table.forget(CRATE);
        assert_eq!(ticket.try_outcome(), Some(OwnershipOutcome::Cancelled));
    }

    #[test]
    fn test_migration_destroys_or_reassigns() {
        let mut table = OwnershipTable::new();
        table.register(EntityId(1), REMOTE, true);
        table.register(EntityId(2), REMOTE, false);
        table.register(EntityId(3), PeerId(0), true);

        let report = table.migrate(REMOTE, PeerId(0), LOCAL);
        assert_eq!(report.reassigned, vec![EntityId(1)]);
        assert_eq!(report.destroyed, vec![EntityId(2)]);
        assert_eq!(table.owner_of(EntityId(1)), Some(PeerId(0)));
        assert_eq!(table.owner_of(EntityId(2)), None);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_migration_to_local_grants_pending() {
        let mut table = table_with(REMOTE, true);
        let (mut ticket, _, _) = ask(table.begin_request(CRATE, LOCAL, Instant::now(), None).unwrap());
        table.migrate(REMOTE, LOCAL, LOCAL);
        assert_eq!(ticket.try_outcome(), Some(OwnershipOutcome::Granted));
    }

    #[test]
    fn test_clear_cancels_everything() {
        let mut table = table_with(REMOTE, true);
        let (mut ticket, _, _) = ask(table.begin_request(CRATE, LOCAL, Instant::now(), None).unwrap());
        table.clear();
        assert!(table.is_empty());
        assert_eq!(ticket.try_outcome(), Some(OwnershipOutcome::Cancelled));
    }
}
