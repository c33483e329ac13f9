use std::sync::Arc;

use tracing::{info, warn};
use ulid::Ulid;

use crate::error::AdmissionError;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::store::{ReservationStore, TransferStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferAction {
    Accept,
    Decline,
}

/// Accept/decline workflow moving an additional occupant slot between users,
/// bounded by a fixed deadline.
///
/// Expiry is lazy: every touch re-judges the row against the deadline and
/// never trusts the persisted state alone. The background sweeper only
/// rewrites overdue rows so their expiry events eventually go out; nothing
/// depends on it for correctness.
pub struct TransferWorkflow {
    transfers: Arc<dyn TransferStore>,
    reservations: Arc<dyn ReservationStore>,
    notify: Arc<NotifyHub>,
    ttl_ms: Ms,
}

impl TransferWorkflow {
    pub fn new(
        transfers: Arc<dyn TransferStore>,
        reservations: Arc<dyn ReservationStore>,
        notify: Arc<NotifyHub>,
        ttl_ms: Ms,
    ) -> Self {
        Self {
            transfers,
            reservations,
            notify,
            ttl_ms,
        }
    }

    pub async fn create(
        &self,
        reservation_id: Ulid,
        initiator: Ulid,
        target: Ulid,
    ) -> Result<TransferRequest, AdmissionError> {
        self.create_at(reservation_id, initiator, target, now_ms()).await
    }

    /// Propose moving the initiator's slot to `target`. The proposal stays
    /// open until `now + ttl`.
    pub async fn create_at(
        &self,
        reservation_id: Ulid,
        initiator: Ulid,
        target: Ulid,
        now: Ms,
    ) -> Result<TransferRequest, AdmissionError> {
        if initiator == target {
            return Err(AdmissionError::Validation(
                "cannot transfer a slot to yourself",
            ));
        }
        let state = self
            .reservations
            .get_reservation(reservation_id)
            .await?
            .ok_or(AdmissionError::Validation("unknown reservation"))?;
        if state.reservation.status != ReservationStatus::Active {
            return Err(AdmissionError::Validation("reservation is not active"));
        }
        if !state.reservation.transferable {
            return Err(AdmissionError::Validation(
                "reservation does not allow transfers",
            ));
        }
        let Some(occupant) = state.active_occupant(initiator) else {
            return Err(AdmissionError::Authorization(
                "initiator does not occupy this reservation",
            ));
        };
        if occupant.is_primary {
            return Err(AdmissionError::Validation(
                "the primary occupant slot cannot be transferred",
            ));
        }
        if state.is_active_occupant(target) {
            return Err(AdmissionError::Conflict(
                "target already occupies this reservation",
            ));
        }

        let transfer = TransferRequest {
            id: Ulid::new(),
            reservation_id,
            initiator,
            target,
            state: TransferState::Pending,
            created_at: now,
            decided_at: None,
            expires_at: now + self.ttl_ms,
        };
        self.transfers.insert_pending(transfer.clone()).await?;
        metrics::counter!(observability::TRANSFERS_CREATED_TOTAL).increment(1);
        info!(
            transfer = %transfer.id,
            reservation = %reservation_id,
            "transfer proposed"
        );
        self.emit(&transfer, Event::TransferCreated {
            transfer_id: transfer.id,
            reservation_id,
            initiator_id: initiator,
            target_user_id: target,
        });
        Ok(transfer)
    }

    pub async fn respond(
        &self,
        transfer_id: Ulid,
        acting_user: Ulid,
        action: TransferAction,
    ) -> Result<TransferRequest, AdmissionError> {
        self.respond_at(transfer_id, acting_user, action, now_ms()).await
    }

    /// Accept or decline a proposal. The deadline check runs before
    /// anything else, whatever the stored state says.
    pub async fn respond_at(
        &self,
        transfer_id: Ulid,
        acting_user: Ulid,
        action: TransferAction,
        now: Ms,
    ) -> Result<TransferRequest, AdmissionError> {
        let transfer = self
            .transfers
            .get_transfer(transfer_id)
            .await?
            .ok_or(AdmissionError::Validation("unknown transfer"))?;

        if transfer.effective_state(now) == TransferState::Expired {
            if transfer.state == TransferState::Pending {
                // touched → the overdue row gets rewritten now
                self.mark_expired(&transfer, now).await;
            }
            return Err(AdmissionError::TransferExpired(transfer_id));
        }
        if acting_user != transfer.target {
            return Err(AdmissionError::Authorization(
                "only the target user may respond",
            ));
        }
        if transfer.state != TransferState::Pending {
            return Err(AdmissionError::Conflict("transfer already decided"));
        }

        match action {
            TransferAction::Accept => match self.transfers.accept_transfer(transfer_id, now).await
            {
                Ok(done) => {
                    metrics::counter!(
                        observability::TRANSFER_RESPONSES_TOTAL,
                        "action" => "accept"
                    )
                    .increment(1);
                    info!(transfer = %transfer_id, "transfer accepted");
                    self.emit(&done, Event::TransferAccepted {
                        transfer_id: done.id,
                        reservation_id: done.reservation_id,
                        initiator_id: done.initiator,
                        target_user_id: done.target,
                    });
                    Ok(done)
                }
                Err(err @ AdmissionError::TransferExpired(_)) => {
                    // The deadline passed between our check and the commit;
                    // the store already rewrote the row.
                    self.emit_expired(&transfer);
                    Err(err)
                }
                Err(err) => Err(err),
            },
            TransferAction::Decline => {
                let done = self
                    .transfers
                    .finish_transfer(transfer_id, TransferState::Declined, now)
                    .await?;
                metrics::counter!(
                    observability::TRANSFER_RESPONSES_TOTAL,
                    "action" => "decline"
                )
                .increment(1);
                info!(transfer = %transfer_id, "transfer declined");
                self.emit(&done, Event::TransferDeclined {
                    transfer_id: done.id,
                    reservation_id: done.reservation_id,
                    initiator_id: done.initiator,
                    target_user_id: done.target,
                });
                Ok(done)
            }
        }
    }

    pub async fn pending_for(&self, user: Ulid) -> Result<Vec<TransferRequest>, AdmissionError> {
        self.pending_for_at(user, now_ms()).await
    }

    /// Proposals still awaiting this user's answer. Overdue rows are hidden
    /// but not rewritten here.
    pub async fn pending_for_at(
        &self,
        user: Ulid,
        now: Ms,
    ) -> Result<Vec<TransferRequest>, AdmissionError> {
        self.transfers.pending_for_target(user, now).await
    }

    /// Sweep entry point: rewrite overdue PENDING rows and emit their expiry
    /// events. Returns how many rows were rewritten.
    pub async fn expire_overdue_at(&self, now: Ms) -> Result<usize, AdmissionError> {
        let ids = self.transfers.collect_expired(now).await?;
        let mut rewritten = 0;
        for id in ids {
            match self
                .transfers
                .finish_transfer(id, TransferState::Expired, now)
                .await
            {
                Ok(done) => {
                    metrics::counter!(observability::TRANSFERS_EXPIRED_TOTAL).increment(1);
                    info!(transfer = %id, "transfer expired");
                    self.emit_expired(&done);
                    rewritten += 1;
                }
                // decided (or already rewritten) in the meantime — fine
                Err(AdmissionError::Conflict(_)) => {}
                Err(err) => warn!(transfer = %id, "expiry sweep failed: {err}"),
            }
        }
        Ok(rewritten)
    }

    async fn mark_expired(&self, transfer: &TransferRequest, now: Ms) {
        match self
            .transfers
            .finish_transfer(transfer.id, TransferState::Expired, now)
            .await
        {
            Ok(done) => {
                metrics::counter!(observability::TRANSFERS_EXPIRED_TOTAL).increment(1);
                info!(transfer = %transfer.id, "transfer expired");
                self.emit_expired(&done);
            }
            // a concurrent toucher or the sweeper got there first
            Err(AdmissionError::Conflict(_)) => {}
            Err(err) => warn!(transfer = %transfer.id, "expiry rewrite failed: {err}"),
        }
    }

    fn emit_expired(&self, transfer: &TransferRequest) {
        self.emit(transfer, Event::TransferExpired {
            transfer_id: transfer.id,
            reservation_id: transfer.reservation_id,
            initiator_id: transfer.initiator,
            target_user_id: transfer.target,
        });
    }

    /// Both parties hear about every state change.
    fn emit(&self, transfer: &TransferRequest, event: Event) {
        self.notify.send_to(transfer.target, &event);
        self.notify.send_to(transfer.initiator, &event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::DEFAULT_TRANSFER_TTL_MS;
    use crate::store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        workflow: TransferWorkflow,
        notify: Arc<NotifyHub>,
        reservation_id: Ulid,
        primary: Ulid,
        giver: Ulid,
        taker: Ulid,
    }

    async fn fixture() -> Fixture {
        fixture_with_ttl(DEFAULT_TRANSFER_TTL_MS).await
    }

    async fn fixture_with_ttl(ttl_ms: Ms) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let notify = Arc::new(NotifyHub::new());
        let workflow = TransferWorkflow::new(
            store.clone(),
            store.clone(),
            notify.clone(),
            ttl_ms,
        );

        let primary = Ulid::new();
        let giver = Ulid::new();
        let taker = Ulid::new();
        let mut state = ReservationState::new(
            Reservation {
                id: Ulid::new(),
                day: Day(19_000),
                primary_user: primary,
                status: ReservationStatus::Active,
                transferable: true,
                created_at: 0,
            },
            0,
        );
        state.occupants.push(Occupant {
            user: giver,
            is_primary: false,
            status: OccupantStatus::Active,
            added_at: 0,
            cancelled_at: None,
        });
        let reservation_id = state.reservation.id;
        store.create_reservation(state).await.unwrap();

        Fixture {
            store,
            workflow,
            notify,
            reservation_id,
            primary,
            giver,
            taker,
        }
    }

    #[tokio::test]
    async fn create_sets_deadline_from_ttl() {
        let f = fixture().await;
        let t = f
            .workflow
            .create_at(f.reservation_id, f.giver, f.taker, 1_000)
            .await
            .unwrap();
        assert_eq!(t.state, TransferState::Pending);
        assert_eq!(t.expires_at, 1_000 + DEFAULT_TRANSFER_TTL_MS);
        assert_eq!(t.created_at, 1_000);
    }

    #[tokio::test]
    async fn create_requires_occupancy() {
        let f = fixture().await;
        let outsider = Ulid::new();
        let err = f
            .workflow
            .create_at(f.reservation_id, outsider, f.taker, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Authorization(_)));
    }

    #[tokio::test]
    async fn create_rejects_primary_slot() {
        let f = fixture().await;
        let err = f
            .workflow
            .create_at(f.reservation_id, f.primary, f.taker, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Validation(_)));
    }

    #[tokio::test]
    async fn create_rejects_self_transfer() {
        let f = fixture().await;
        let err = f
            .workflow
            .create_at(f.reservation_id, f.giver, f.giver, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Validation(_)));
    }

    #[tokio::test]
    async fn duplicate_pending_proposal_conflicts() {
        let f = fixture().await;
        f.workflow
            .create_at(f.reservation_id, f.giver, f.taker, 0)
            .await
            .unwrap();
        let err = f
            .workflow
            .create_at(f.reservation_id, f.giver, f.taker, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Conflict(_)));
    }

    #[tokio::test]
    async fn accept_reassigns_the_slot_and_notifies() {
        let f = fixture().await;
        let mut taker_rx = f.notify.subscribe(f.taker);
        let mut giver_rx = f.notify.subscribe(f.giver);

        let t = f
            .workflow
            .create_at(f.reservation_id, f.giver, f.taker, 0)
            .await
            .unwrap();
        let done = f
            .workflow
            .respond_at(t.id, f.taker, TransferAction::Accept, 500)
            .await
            .unwrap();
        assert_eq!(done.state, TransferState::Accepted);

        let state = f
            .store
            .get_reservation(f.reservation_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!state.is_active_occupant(f.giver));
        assert!(state.is_active_occupant(f.taker));

        // both parties saw the proposal and the acceptance
        for rx in [&mut taker_rx, &mut giver_rx] {
            assert!(matches!(
                rx.recv().await.unwrap(),
                Event::TransferCreated { .. }
            ));
            assert!(matches!(
                rx.recv().await.unwrap(),
                Event::TransferAccepted { .. }
            ));
        }
    }

    #[tokio::test]
    async fn decline_leaves_the_reservation_alone() {
        let f = fixture().await;
        let t = f
            .workflow
            .create_at(f.reservation_id, f.giver, f.taker, 0)
            .await
            .unwrap();
        let done = f
            .workflow
            .respond_at(t.id, f.taker, TransferAction::Decline, 500)
            .await
            .unwrap();
        assert_eq!(done.state, TransferState::Declined);

        let state = f
            .store
            .get_reservation(f.reservation_id)
            .await
            .unwrap()
            .unwrap();
        assert!(state.is_active_occupant(f.giver));
        assert!(!state.is_active_occupant(f.taker));
    }

    #[tokio::test]
    async fn only_the_target_may_respond() {
        let f = fixture().await;
        let t = f
            .workflow
            .create_at(f.reservation_id, f.giver, f.taker, 0)
            .await
            .unwrap();
        for wrong in [f.giver, f.primary, Ulid::new()] {
            let err = f
                .workflow
                .respond_at(t.id, wrong, TransferAction::Accept, 100)
                .await
                .unwrap_err();
            assert!(matches!(err, AdmissionError::Authorization(_)));
        }
    }

    #[tokio::test]
    async fn respond_after_deadline_expires_even_if_stored_pending() {
        let f = fixture_with_ttl(1_000).await;
        let t = f
            .workflow
            .create_at(f.reservation_id, f.giver, f.taker, 0)
            .await
            .unwrap();
        // stored state is still PENDING
        assert_eq!(
            f.store.get_transfer(t.id).await.unwrap().unwrap().state,
            TransferState::Pending
        );
        let err = f
            .workflow
            .respond_at(t.id, f.taker, TransferAction::Accept, 1_000)
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::TransferExpired(t.id));
        // the touch rewrote the row
        assert_eq!(
            f.store.get_transfer(t.id).await.unwrap().unwrap().state,
            TransferState::Expired
        );
        // and the slot never moved
        let state = f
            .store
            .get_reservation(f.reservation_id)
            .await
            .unwrap()
            .unwrap();
        assert!(state.is_active_occupant(f.giver));
    }

    #[tokio::test]
    async fn expiry_outranks_authorization() {
        let f = fixture_with_ttl(1_000).await;
        let t = f
            .workflow
            .create_at(f.reservation_id, f.giver, f.taker, 0)
            .await
            .unwrap();
        // wrong responder AND overdue: the deadline answer wins
        let err = f
            .workflow
            .respond_at(t.id, f.giver, TransferAction::Decline, 5_000)
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::TransferExpired(t.id));
    }

    #[tokio::test]
    async fn responding_twice_conflicts() {
        let f = fixture().await;
        let t = f
            .workflow
            .create_at(f.reservation_id, f.giver, f.taker, 0)
            .await
            .unwrap();
        f.workflow
            .respond_at(t.id, f.taker, TransferAction::Decline, 100)
            .await
            .unwrap();
        let err = f
            .workflow
            .respond_at(t.id, f.taker, TransferAction::Accept, 200)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Conflict(_)));
    }

    #[tokio::test]
    async fn pending_view_is_per_target_and_unexpired() {
        let f = fixture_with_ttl(1_000).await;
        let t = f
            .workflow
            .create_at(f.reservation_id, f.giver, f.taker, 0)
            .await
            .unwrap();
        let pending = f.workflow.pending_for_at(f.taker, 500).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, t.id);

        assert!(f.workflow.pending_for_at(f.giver, 500).await.unwrap().is_empty());
        // past the deadline the proposal disappears from the view
        assert!(f.workflow.pending_for_at(f.taker, 1_500).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_rewrites_overdue_rows_and_emits_once() {
        let f = fixture_with_ttl(1_000).await;
        let mut taker_rx = f.notify.subscribe(f.taker);
        let t = f
            .workflow
            .create_at(f.reservation_id, f.giver, f.taker, 0)
            .await
            .unwrap();
        assert!(matches!(
            taker_rx.recv().await.unwrap(),
            Event::TransferCreated { .. }
        ));

        assert_eq!(f.workflow.expire_overdue_at(500).await.unwrap(), 0);
        assert_eq!(f.workflow.expire_overdue_at(2_000).await.unwrap(), 1);
        // a second sweep finds nothing left to rewrite
        assert_eq!(f.workflow.expire_overdue_at(3_000).await.unwrap(), 0);

        assert_eq!(
            f.store.get_transfer(t.id).await.unwrap().unwrap().state,
            TransferState::Expired
        );
        assert!(matches!(
            taker_rx.recv().await.unwrap(),
            Event::TransferExpired { .. }
        ));
        assert!(taker_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn concurrent_responses_have_one_winner() {
        let f = fixture().await;
        let t = f
            .workflow
            .create_at(f.reservation_id, f.giver, f.taker, 0)
            .await
            .unwrap();
        let workflow = Arc::new(f.workflow);
        let mut handles = Vec::new();
        for action in [TransferAction::Accept, TransferAction::Decline] {
            let workflow = workflow.clone();
            let taker = f.taker;
            let tid = t.id;
            handles.push(tokio::spawn(async move {
                workflow.respond_at(tid, taker, action, 500).await
            }));
        }
        let mut ok = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(err) => assert!(matches!(
                    err,
                    AdmissionError::Conflict(_) | AdmissionError::TransferExpired(_)
                )),
            }
        }
        assert_eq!(ok, 1);
    }
}
