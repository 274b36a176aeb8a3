//! Stores the booking core consults but does not own: guests and payments.
//!
//! The engine receives them as trait objects; the in-memory implementations back
//! the SQL front end and the tests.

use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::{Guest, Transaction};

#[async_trait]
pub trait GuestDirectory: Send + Sync {
    async fn get(&self, id: Ulid) -> Option<Guest>;

    async fn find_by_national_id(&self, national_id: &str) -> Option<Guest>;

    /// Insert or replace a guest.
    async fn register(&self, guest: Guest);
}

#[async_trait]
pub trait PaymentLedger: Send + Sync {
    /// The transaction paying for `reservation_id`, if any.
    async fn transaction_for(&self, reservation_id: Ulid) -> Option<Transaction>;

    /// Insert or replace the transaction for its reservation.
    async fn record(&self, transaction: Transaction);
}

#[derive(Default)]
pub struct InMemoryGuests {
    by_id: DashMap<Ulid, Guest>,
    by_national_id: DashMap<String, Ulid>,
}

impl InMemoryGuests {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GuestDirectory for InMemoryGuests {
    async fn get(&self, id: Ulid) -> Option<Guest> {
        self.by_id.get(&id).map(|g| g.value().clone())
    }

    async fn find_by_national_id(&self, national_id: &str) -> Option<Guest> {
        let id = *self.by_national_id.get(national_id)?;
        self.by_id.get(&id).map(|g| g.value().clone())
    }

    async fn register(&self, guest: Guest) {
        if let Some(previous) = self.by_id.insert(guest.id, guest.clone())
            && previous.national_id != guest.national_id
        {
            self.by_national_id.remove(&previous.national_id);
        }
        self.by_national_id.insert(guest.national_id.clone(), guest.id);
    }
}

/// One transaction per reservation.
#[derive(Default)]
pub struct InMemoryPayments {
    by_reservation: DashMap<Ulid, Transaction>,
}

impl InMemoryPayments {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentLedger for InMemoryPayments {
    async fn transaction_for(&self, reservation_id: Ulid) -> Option<Transaction> {
        self.by_reservation
            .get(&reservation_id)
            .map(|t| t.value().clone())
    }

    async fn record(&self, transaction: Transaction) {
        self.by_reservation
            .insert(transaction.reservation_id, transaction);
    }
}
