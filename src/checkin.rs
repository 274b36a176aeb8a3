//! Front-desk check-in on top of reservation lookup.
//!
//! Payment and the single check-in timestamp gate the transition; OTP, ID photos and
//! mail are handled elsewhere.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use ulid::Ulid;

use crate::engine::{Engine, EngineError, Entity};
use crate::model::{BookedRoom, RoomId};

#[derive(Debug, Error)]
pub enum CheckInError {
    #[error("guest not found")]
    GuestNotFound,
    #[error("reservation not found")]
    ReservationNotFound,
    #[error("reservation payment is not complete")]
    PaymentIncomplete,
    #[error("already checked in")]
    AlreadyCheckedIn,
    #[error("cannot check in on {0}")]
    WrongDay(NaiveDate),
    #[error(transparent)]
    Engine(EngineError),
}

impl From<EngineError> for CheckInError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotFound(Entity::Reservation(_)) => CheckInError::ReservationNotFound,
            EngineError::NotFound(Entity::Guest(_)) => CheckInError::GuestNotFound,
            EngineError::AlreadyCheckedIn(_) => CheckInError::AlreadyCheckedIn,
            other => CheckInError::Engine(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSummary {
    pub id: RoomId,
    pub name: String,
    pub bed_count: usize,
}

impl From<BookedRoom> for RoomSummary {
    fn from(room: BookedRoom) -> Self {
        Self {
            id: room.id,
            name: room.name,
            bed_count: room.beds.len(),
        }
    }
}

/// What the kiosk shows a guest before check-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckInDetail {
    pub id: Ulid,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub special_requests: String,
    pub is_paid: bool,
    pub rooms: Vec<RoomSummary>,
}

pub struct CheckInDesk {
    engine: Arc<Engine>,
}

impl CheckInDesk {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// The guest's paid, not yet checked-in reservation starting on `date`.
    pub async fn reservation_for_check_in(
        &self,
        national_id: &str,
        date: NaiveDate,
    ) -> Result<CheckInDetail, CheckInError> {
        let guest = self
            .engine
            .guests()
            .find_by_national_id(national_id)
            .await
            .ok_or(CheckInError::GuestNotFound)?;
        let found = self
            .engine
            .find_guest_reservation(guest.id, date)
            .ok_or(CheckInError::ReservationNotFound)?;
        let id = found.reservation.id;

        let payment = self.engine.get_reservation_transaction(id).await?;
        if !payment.is_paid() {
            return Err(CheckInError::PaymentIncomplete);
        }
        if payment.reservation.is_checked_in() {
            return Err(CheckInError::AlreadyCheckedIn);
        }

        let reservation = found.reservation;
        Ok(CheckInDetail {
            id,
            check_in: reservation.check_in(),
            check_out: reservation.check_out(),
            special_requests: reservation.special_requests,
            is_paid: true,
            rooms: found.rooms.into_iter().map(RoomSummary::from).collect(),
        })
    }

    /// Record the guest entering at `at`. Only allowed on the check-in date (UTC).
    pub async fn check_in(&self, reservation_id: Ulid, at: DateTime<Utc>) -> Result<(), CheckInError> {
        let payment = self.engine.get_reservation_transaction(reservation_id).await?;
        if !payment.is_paid() {
            return Err(CheckInError::PaymentIncomplete);
        }
        if payment.reservation.is_checked_in() {
            return Err(CheckInError::AlreadyCheckedIn);
        }
        if at.date_naive() != payment.reservation.check_in() {
            return Err(CheckInError::WrongDay(at.date_naive()));
        }
        self.engine.record_check_in(reservation_id, at).await?;
        Ok(())
    }
}
