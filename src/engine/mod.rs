mod conflict;
mod error;
mod journal;
mod mutations;
mod queries;

pub use error::{EngineError, Entity};
pub use journal::{Journal, WalJournal};

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use ulid::Ulid;

use crate::directory::{GuestDirectory, PaymentLedger};
use crate::model::*;
use crate::wal::Wal;

pub type SharedBedState = Arc<RwLock<BedState>>;

/// In-memory inventory. Bed claim sets are the only contended part; each sits behind
/// its own async lock. The maps are `DashMap`s whose guards never cross an await.
#[derive(Default)]
pub(super) struct State {
    pub(super) rooms: DashMap<RoomId, Room>,
    pub(super) beds: DashMap<BedId, SharedBedState>,
    /// bed id → owning room. Written once per bed, read without touching bed locks.
    pub(super) bed_rooms: DashMap<BedId, RoomId>,
    pub(super) reservations: DashMap<Ulid, Reservation>,
    /// guest id → reservation ids
    pub(super) guest_reservations: DashMap<Ulid, Vec<Ulid>>,
}

impl State {
    pub(super) fn bed(&self, id: BedId) -> Option<SharedBedState> {
        self.beds.get(&id).map(|e| e.value().clone())
    }

    /// Make a reservation visible. Its claims must already be on the beds.
    pub(super) fn index_reservation(&self, reservation: Reservation) {
        self.guest_reservations
            .entry(reservation.guest_id)
            .or_default()
            .push(reservation.id);
        self.reservations.insert(reservation.id, reservation);
    }

    /// Apply a journaled event.
    ///
    /// `BedClaimed` goes through `try_write` on the bed, so it is only used for replay,
    /// where nothing else can hold a bed lock. Live bookings insert claims through the
    /// guards they already hold.
    pub(super) fn apply(&self, event: &Event) {
        match event {
            Event::RoomCreated { id, name, description } => {
                self.rooms
                    .insert(*id, Room::new(*id, name.clone(), description.clone()));
            }
            Event::FacilityAdded { room_id, name } => {
                if let Some(mut room) = self.rooms.get_mut(room_id) {
                    room.facilities.push(Facility { name: name.clone() });
                }
            }
            Event::PhotoAdded { room_id, url, description } => {
                if let Some(mut room) = self.rooms.get_mut(room_id) {
                    room.photos.push(Photo {
                        url: url.clone(),
                        description: description.clone(),
                    });
                }
            }
            Event::BedAdded { id, room_id } => {
                self.beds
                    .insert(*id, Arc::new(RwLock::new(BedState::new(*id, *room_id))));
                self.bed_rooms.insert(*id, *room_id);
                if let Some(mut room) = self.rooms.get_mut(room_id) {
                    room.insert_bed(*id);
                }
            }
            Event::ReservationCreated { id, stay, guest_id, special_requests } => {
                self.index_reservation(Reservation {
                    id: *id,
                    stay: *stay,
                    guest_id: *guest_id,
                    special_requests: special_requests.clone(),
                    check_in_enter_time: None,
                    beds: Vec::new(),
                });
            }
            Event::BedClaimed { reservation_id, bed_id } => {
                let Some(stay) = self.reservations.get(reservation_id).map(|r| r.stay) else {
                    tracing::warn!("replay: bed {bed_id} claimed by unknown reservation {reservation_id}");
                    return;
                };
                let Some(bed) = self.bed(*bed_id) else {
                    tracing::warn!("replay: claim on unknown bed {bed_id}");
                    return;
                };
                let Ok(mut guard) = bed.try_write() else {
                    tracing::error!("replay: bed {bed_id} unexpectedly locked");
                    return;
                };
                // Double bookings never replay, whatever the log says. Compaction may
                // reorder reservations, so only a true overlap counts here.
                if guard.claims.iter().any(|c| c.stay.overlaps(&stay)) {
                    tracing::warn!(
                        "replay: reservation {reservation_id} overlaps an existing claim on bed {bed_id}, skipping"
                    );
                    return;
                }
                guard.insert_claim(BedClaim {
                    reservation_id: *reservation_id,
                    stay,
                });
                drop(guard);
                if let Some(mut reservation) = self.reservations.get_mut(reservation_id)
                    && let Err(pos) = reservation.beds.binary_search(bed_id)
                {
                    reservation.beds.insert(pos, *bed_id);
                }
            }
            Event::CheckInRecorded { reservation_id, at } => {
                if let Some(mut reservation) = self.reservations.get_mut(reservation_id) {
                    reservation.check_in_enter_time = Some(*at);
                }
            }
        }
    }
}

/// Inventory, bookings and check-in state of one property.
pub struct Engine {
    pub(super) state: Arc<State>,
    pub(super) journal: Arc<dyn Journal>,
    pub(super) guests: Arc<dyn GuestDirectory>,
    pub(super) payments: Arc<dyn PaymentLedger>,
    /// Held shared by every commit and exclusively by compaction.
    pub(super) commit_gate: Arc<RwLock<()>>,
    pub(super) catalog_lock: Mutex<()>,
    pub(super) check_in_lock: Mutex<()>,
}

impl Engine {
    /// Open the engine for the WAL at `wal_path`, replaying it first.
    pub fn open(
        wal_path: PathBuf,
        guests: Arc<dyn GuestDirectory>,
        payments: Arc<dyn PaymentLedger>,
    ) -> std::io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let engine = Self::with_journal(Arc::new(WalJournal::spawn(wal)), guests, payments);
        for event in &events {
            engine.state.apply(event);
        }
        tracing::debug!(
            "replayed {} events from {}: {} rooms, {} reservations",
            events.len(),
            wal_path.display(),
            engine.state.rooms.len(),
            engine.state.reservations.len()
        );
        Ok(engine)
    }

    /// Empty engine over an arbitrary journal.
    pub fn with_journal(
        journal: Arc<dyn Journal>,
        guests: Arc<dyn GuestDirectory>,
        payments: Arc<dyn PaymentLedger>,
    ) -> Self {
        Self {
            state: Arc::new(State::default()),
            journal,
            guests,
            payments,
            commit_gate: Arc::new(RwLock::new(())),
            catalog_lock: Mutex::new(()),
            check_in_lock: Mutex::new(()),
        }
    }

    pub fn guests(&self) -> &Arc<dyn GuestDirectory> {
        &self.guests
    }

    pub fn payments(&self) -> &Arc<dyn PaymentLedger> {
        &self.payments
    }

    pub fn get_bed(&self, id: BedId) -> Option<SharedBedState> {
        self.state.bed(id)
    }

    pub fn reservation_count(&self) -> usize {
        self.state.reservations.len()
    }

    /// Journal `events`, then run `apply`.
    ///
    /// Both run on a detached task holding the commit gate: once the journal write
    /// starts, dropping the caller can't leave events journaled but unapplied.
    pub(super) async fn commit<T, F>(&self, events: Vec<Event>, apply: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let gate = self.commit_gate.clone().read_owned().await;
        let journal = self.journal.clone();
        let task = tokio::spawn(async move {
            let _gate = gate;
            journal.append(events).await?;
            Ok::<T, EngineError>(apply())
        });
        match task.await {
            Ok(result) => result,
            Err(e) => Err(EngineError::Storage(format!("commit task failed: {e}"))),
        }
    }

    /// Journal + apply for events that don't touch bed claims.
    pub(super) async fn commit_events(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let state = self.state.clone();
        let applied = events.clone();
        self.commit(events, move || applied.iter().for_each(|e| state.apply(e)))
            .await
    }
}
