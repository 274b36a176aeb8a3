use std::collections::BTreeMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::conflict::validate_query_window;
use super::{Engine, EngineError, Entity};

impl Engine {
    // ── Inventory ────────────────────────────────────────────

    /// Rooms with at least one free bed in `[check_in, check_out)`, by room id.
    ///
    /// Beds are read one at a time under shared locks, so the answer may already be
    /// stale when it returns; `make_reservation` checks again under exclusive locks.
    pub async fn find_available_rooms(
        &self,
        check_in: NaiveDate,
        check_out: NaiveDate,
    ) -> Result<Vec<AvailableRoom>, EngineError> {
        let stay = validate_query_window(check_in, check_out)?;

        let mut available = Vec::new();
        for room in self.list_rooms() {
            let free_beds = self.free_beds(&room.beds, &stay).await.len();
            if free_beds == 0 {
                continue;
            }
            available.push(AvailableRoom {
                id: room.id,
                name: room.name,
                description: room.description,
                free_beds,
                facilities: room.facilities,
                photos: room.photos,
            });
        }
        Ok(available)
    }

    /// `room_id` with its bed list narrowed to the beds free in `[check_in, check_out)`.
    pub async fn find_available_beds(
        &self,
        check_in: NaiveDate,
        check_out: NaiveDate,
        room_id: RoomId,
    ) -> Result<Room, EngineError> {
        let stay = validate_query_window(check_in, check_out)?;
        let mut room = self
            .state
            .rooms
            .get(&room_id)
            .map(|r| r.value().clone())
            .ok_or(EngineError::NotFound(Entity::Room(room_id)))?;
        room.beds = self.free_beds(&room.beds, &stay).await;
        Ok(room)
    }

    /// Subset of `bed_ids` that is free for `stay`, preserving order.
    async fn free_beds(&self, bed_ids: &[BedId], stay: &Stay) -> Vec<BedId> {
        let mut free = Vec::with_capacity(bed_ids.len());
        for &id in bed_ids {
            let Some(bed) = self.get_bed(id) else { continue };
            if bed.read().await.is_free(stay) {
                free.push(id);
            }
        }
        free
    }

    /// All rooms ordered by id.
    pub fn list_rooms(&self) -> Vec<Room> {
        let mut rooms: Vec<Room> = self
            .state
            .rooms
            .iter()
            .map(|e| e.value().clone())
            .collect();
        rooms.sort_unstable_by_key(|r| r.id);
        rooms
    }

    // ── Reservation lookup ───────────────────────────────────

    fn reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.state
            .reservations
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(EngineError::NotFound(Entity::Reservation(id)))
    }

    /// The reservation plus the rooms its beds belong to, one entry per room.
    pub fn get_reservation(&self, id: Ulid) -> Result<ReservationWithRooms, EngineError> {
        let reservation = self.reservation(id)?;
        Ok(self.with_rooms(reservation))
    }

    fn with_rooms(&self, reservation: Reservation) -> ReservationWithRooms {
        let mut by_room: BTreeMap<RoomId, Vec<BedId>> = BTreeMap::new();
        for &bed_id in &reservation.beds {
            match self.state.bed_rooms.get(&bed_id) {
                Some(room_id) => by_room.entry(*room_id).or_default().push(bed_id),
                None => tracing::warn!("reservation {}: bed {bed_id} has no room", reservation.id),
            }
        }
        let rooms = by_room
            .into_iter()
            .map(|(room_id, beds)| BookedRoom {
                id: room_id,
                name: self
                    .state
                    .rooms
                    .get(&room_id)
                    .map(|r| r.name.clone())
                    .unwrap_or_default(),
                beds,
            })
            .collect();
        ReservationWithRooms { reservation, rooms }
    }

    /// The reservation plus its payment record, if the ledger has one.
    pub async fn get_reservation_transaction(
        &self,
        id: Ulid,
    ) -> Result<ReservationWithTransaction, EngineError> {
        let reservation = self.reservation(id)?;
        let transaction = self.payments.transaction_for(id).await;
        Ok(ReservationWithTransaction { reservation, transaction })
    }

    /// The guest's reservation starting on `check_in`. Lowest id wins if there are several.
    pub fn find_guest_reservation(
        &self,
        guest_id: Ulid,
        check_in: NaiveDate,
    ) -> Option<ReservationWithRooms> {
        let ids = self
            .state
            .guest_reservations
            .get(&guest_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        ids.into_iter()
            .filter_map(|id| self.reservation(id).ok())
            .filter(|r| r.check_in() == check_in)
            .min_by_key(|r| r.id)
            .map(|r| self.with_rooms(r))
    }
}
