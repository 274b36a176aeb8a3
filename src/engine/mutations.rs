use chrono::{DateTime, NaiveDate, Utc};
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{RESERVATIONS_COMMITTED_TOTAL, RESERVATION_CONFLICTS_TOTAL};

use super::conflict::{contested_beds, validate_bed_request, validate_name, validate_stay};
use super::{Engine, EngineError, Entity};

impl Engine {
    // ── Catalog ──────────────────────────────────────────────

    pub async fn create_room(
        &self,
        id: RoomId,
        name: String,
        description: Option<String>,
    ) -> Result<(), EngineError> {
        validate_name(&name)?;
        if description.as_ref().is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
            return Err(EngineError::LimitExceeded("room description too long"));
        }
        let _catalog = self.catalog_lock.lock().await;
        if self.state.rooms.len() >= MAX_ROOMS_PER_PROPERTY {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if self.state.rooms.contains_key(&id) {
            return Err(EngineError::AlreadyExists(Entity::Room(id)));
        }
        self.commit_events(vec![Event::RoomCreated { id, name, description }])
            .await
    }

    pub async fn add_bed(&self, id: BedId, room_id: RoomId) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let bed_count = self
            .state
            .rooms
            .get(&room_id)
            .map(|room| room.beds.len())
            .ok_or(EngineError::NotFound(Entity::Room(room_id)))?;
        if bed_count >= MAX_BEDS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many beds in room"));
        }
        if self.state.beds.contains_key(&id) {
            return Err(EngineError::AlreadyExists(Entity::Bed(id)));
        }
        self.commit_events(vec![Event::BedAdded { id, room_id }]).await
    }

    pub async fn add_facility(&self, room_id: RoomId, name: String) -> Result<(), EngineError> {
        validate_name(&name)?;
        let _catalog = self.catalog_lock.lock().await;
        let count = self
            .state
            .rooms
            .get(&room_id)
            .map(|room| room.facilities.len())
            .ok_or(EngineError::NotFound(Entity::Room(room_id)))?;
        if count >= MAX_FACILITIES_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many facilities in room"));
        }
        self.commit_events(vec![Event::FacilityAdded { room_id, name }])
            .await
    }

    pub async fn add_photo(
        &self,
        room_id: RoomId,
        url: String,
        description: Option<String>,
    ) -> Result<(), EngineError> {
        if url.is_empty() {
            return Err(EngineError::Validation("photo url must not be empty".into()));
        }
        if url.len() > MAX_URL_LEN {
            return Err(EngineError::LimitExceeded("photo url too long"));
        }
        if description.as_ref().is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
            return Err(EngineError::LimitExceeded("photo description too long"));
        }
        let _catalog = self.catalog_lock.lock().await;
        let count = self
            .state
            .rooms
            .get(&room_id)
            .map(|room| room.photos.len())
            .ok_or(EngineError::NotFound(Entity::Room(room_id)))?;
        if count >= MAX_PHOTOS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many photos in room"));
        }
        self.commit_events(vec![Event::PhotoAdded { room_id, url, description }])
            .await
    }

    // ── Booking ──────────────────────────────────────────────

    /// Atomically reserve `beds` for `[check_in, check_out)`.
    ///
    /// Write locks on all requested beds are taken in ascending bed id order, then
    /// availability is checked again under those locks. Either the reservation and
    /// every claim are committed, or nothing is and the caller gets `Conflict` with
    /// the beds that are taken.
    pub async fn make_reservation(
        &self,
        check_in: NaiveDate,
        check_out: NaiveDate,
        guest_id: Ulid,
        beds: &[BedId],
        special_requests: String,
    ) -> Result<Reservation, EngineError> {
        let stay = validate_stay(check_in, check_out)?;
        if stay.nights() > MAX_STAY_NIGHTS {
            return Err(EngineError::LimitExceeded("stay too long"));
        }
        if special_requests.len() > MAX_SPECIAL_REQUESTS_LEN {
            return Err(EngineError::LimitExceeded("special requests too long"));
        }
        let bed_ids = validate_bed_request(beds)?;

        if self.guests.get(guest_id).await.is_none() {
            return Err(EngineError::NotFound(Entity::Guest(guest_id)));
        }
        let shared = bed_ids
            .iter()
            .map(|&id| self.get_bed(id).ok_or(EngineError::NotFound(Entity::Bed(id))))
            .collect::<Result<Vec<_>, _>>()?;

        let mut guards = Vec::with_capacity(shared.len());
        for bed in shared {
            guards.push(bed.write_owned().await);
        }

        let contested = contested_beds(guards.iter().map(|g| &**g), &stay);
        if !contested.is_empty() {
            metrics::counter!(RESERVATION_CONFLICTS_TOTAL).increment(1);
            warn!(
                "reservation for guest {guest_id} [{check_in}, {check_out}) lost beds {contested:?}"
            );
            return Err(EngineError::Conflict(contested));
        }

        let id = Ulid::new();
        let reservation = Reservation {
            id,
            stay,
            guest_id,
            special_requests,
            check_in_enter_time: None,
            beds: bed_ids,
        };

        let mut events = Vec::with_capacity(reservation.beds.len() + 1);
        events.push(Event::ReservationCreated {
            id,
            stay,
            guest_id,
            special_requests: reservation.special_requests.clone(),
        });
        events.extend(reservation.beds.iter().map(|&bed_id| Event::BedClaimed {
            reservation_id: id,
            bed_id,
        }));

        let state = self.state.clone();
        let committed = reservation.clone();
        self.commit(events, move || {
            for guard in guards.iter_mut() {
                guard.insert_claim(BedClaim { reservation_id: id, stay });
            }
            state.index_reservation(committed);
        })
        .await?;

        metrics::counter!(RESERVATIONS_COMMITTED_TOTAL).increment(1);
        info!(
            "reservation {id} committed: guest {guest_id}, beds {:?}, [{check_in}, {check_out})",
            reservation.beds
        );
        Ok(reservation)
    }

    /// Set `check_in_enter_time`. Succeeds at most once per reservation.
    pub async fn record_check_in(
        &self,
        reservation_id: Ulid,
        at: DateTime<Utc>,
    ) -> Result<Reservation, EngineError> {
        let _check_in = self.check_in_lock.lock().await;
        let mut reservation = self
            .state
            .reservations
            .get(&reservation_id)
            .map(|r| r.value().clone())
            .ok_or(EngineError::NotFound(Entity::Reservation(reservation_id)))?;
        if reservation.is_checked_in() {
            return Err(EngineError::AlreadyCheckedIn(reservation_id));
        }
        self.commit_events(vec![Event::CheckInRecorded { reservation_id, at }])
            .await?;
        info!("reservation {reservation_id} checked in at {at}");
        reservation.check_in_enter_time = Some(at);
        Ok(reservation)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the journal with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // No commit is in flight while this is held, so the snapshot matches the log.
        let _gate = self.commit_gate.write().await;

        let mut events = Vec::new();
        let mut room_ids: Vec<RoomId> = self.state.rooms.iter().map(|e| *e.key()).collect();
        room_ids.sort_unstable();
        for room_id in room_ids {
            let Some(room) = self.state.rooms.get(&room_id).map(|r| r.value().clone()) else {
                continue;
            };
            events.push(Event::RoomCreated {
                id: room.id,
                name: room.name,
                description: room.description,
            });
            events.extend(room.facilities.into_iter().map(|f| Event::FacilityAdded {
                room_id,
                name: f.name,
            }));
            events.extend(room.photos.into_iter().map(|p| Event::PhotoAdded {
                room_id,
                url: p.url,
                description: p.description,
            }));
            events.extend(room.beds.into_iter().map(|id| Event::BedAdded { id, room_id }));
        }

        let mut reservations: Vec<Reservation> = self
            .state
            .reservations
            .iter()
            .map(|e| e.value().clone())
            .collect();
        reservations.sort_unstable_by_key(|r| r.id);
        for r in reservations {
            events.push(Event::ReservationCreated {
                id: r.id,
                stay: r.stay,
                guest_id: r.guest_id,
                special_requests: r.special_requests,
            });
            events.extend(r.beds.iter().map(|&bed_id| Event::BedClaimed {
                reservation_id: r.id,
                bed_id,
            }));
            if let Some(at) = r.check_in_enter_time {
                events.push(Event::CheckInRecorded { reservation_id: r.id, at });
            }
        }

        self.journal.compact(events).await
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.journal.appends_since_compact().await
    }
}
