use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub type RoomId = i64;
pub type BedId = i64;

/// Calendar window `[check_in, check_out)` of a stay. `check_out > check_in` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stay {
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
}

impl Stay {
    /// Returns `None` when `check_out <= check_in`.
    pub fn new(check_in: NaiveDate, check_out: NaiveDate) -> Option<Self> {
        (check_out > check_in).then_some(Self { check_in, check_out })
    }

    pub fn nights(&self) -> i64 {
        (self.check_out - self.check_in).num_days()
    }

    /// Symmetric half-open overlap: the invariant every pair of claims on a bed satisfies.
    pub fn overlaps(&self, other: &Stay) -> bool {
        self.check_in < other.check_out && self.check_out > other.check_in
    }

    /// Whether an existing claim with window `self` leaves the bed free for `wanted`.
    ///
    /// A claim ending on the wanted check-in day is free, but a claim starting on the
    /// wanted check-out day is not. Strictly tighter than `!overlaps`.
    pub fn admits(&self, wanted: &Stay) -> bool {
        self.check_out <= wanted.check_in || self.check_in > wanted.check_out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facility {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Photo {
    pub url: String,
    pub description: Option<String>,
}

/// Catalog entry for a room. Bed ids are kept sorted ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub description: Option<String>,
    pub beds: Vec<BedId>,
    pub facilities: Vec<Facility>,
    pub photos: Vec<Photo>,
}

impl Room {
    pub fn new(id: RoomId, name: String, description: Option<String>) -> Self {
        Self {
            id,
            name,
            description,
            beds: Vec::new(),
            facilities: Vec::new(),
            photos: Vec::new(),
        }
    }

    pub fn insert_bed(&mut self, bed_id: BedId) {
        if let Err(pos) = self.beds.binary_search(&bed_id) {
            self.beds.insert(pos, bed_id);
        }
    }
}

/// A bed allocated to a reservation for the reservation's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BedClaim {
    pub reservation_id: Ulid,
    pub stay: Stay,
}

#[derive(Debug, Clone)]
pub struct BedState {
    pub id: BedId,
    pub room_id: RoomId,
    /// Sorted by `stay.check_in`.
    pub claims: Vec<BedClaim>,
}

impl BedState {
    pub fn new(id: BedId, room_id: RoomId) -> Self {
        Self {
            id,
            room_id,
            claims: Vec::new(),
        }
    }

    /// Insert claim maintaining sort order by check-in.
    pub fn insert_claim(&mut self, claim: BedClaim) {
        let pos = self
            .claims
            .partition_point(|c| c.stay.check_in <= claim.stay.check_in);
        self.claims.insert(pos, claim);
    }

    /// Free test for `wanted`: every existing claim must admit it.
    ///
    /// Claims starting after `wanted.check_out` always admit, so the scan stops there.
    pub fn is_free(&self, wanted: &Stay) -> bool {
        let right_bound = self
            .claims
            .partition_point(|c| c.stay.check_in <= wanted.check_out);
        self.claims[..right_bound]
            .iter()
            .all(|c| c.stay.admits(wanted))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: Ulid,
    pub stay: Stay,
    pub guest_id: Ulid,
    pub special_requests: String,
    pub check_in_enter_time: Option<DateTime<Utc>>,
    /// Claimed beds, ascending.
    pub beds: Vec<BedId>,
}

impl Reservation {
    pub fn check_in(&self) -> NaiveDate {
        self.stay.check_in
    }

    pub fn check_out(&self) -> NaiveDate {
        self.stay.check_out
    }

    pub fn is_checked_in(&self) -> bool {
        self.check_in_enter_time.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guest {
    pub id: Ulid,
    pub national_id: String,
    pub email: String,
}

/// Payment record owned by the payment side; only `paid` matters here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: Ulid,
    pub reservation_id: Ulid,
    pub paid: bool,
    pub amount_cents: i64,
    pub method: Option<String>,
}

/// WAL record payload. A commit writes a batch of these as one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        id: RoomId,
        name: String,
        description: Option<String>,
    },
    FacilityAdded {
        room_id: RoomId,
        name: String,
    },
    PhotoAdded {
        room_id: RoomId,
        url: String,
        description: Option<String>,
    },
    BedAdded {
        id: BedId,
        room_id: RoomId,
    },
    ReservationCreated {
        id: Ulid,
        stay: Stay,
        guest_id: Ulid,
        special_requests: String,
    },
    BedClaimed {
        reservation_id: Ulid,
        bed_id: BedId,
    },
    CheckInRecorded {
        reservation_id: Ulid,
        at: DateTime<Utc>,
    },
}

// ── Query result types ───────────────────────────────────────────

/// A room with at least one free bed for the queried window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableRoom {
    pub id: RoomId,
    pub name: String,
    pub description: Option<String>,
    pub free_beds: usize,
    pub facilities: Vec<Facility>,
    pub photos: Vec<Photo>,
}

/// A room as seen from one reservation: only the beds that reservation claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookedRoom {
    pub id: RoomId,
    pub name: String,
    pub beds: Vec<BedId>,
}

impl BookedRoom {
    pub fn bed_count(&self) -> usize {
        self.beds.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationWithRooms {
    pub reservation: Reservation,
    /// Ordered by room id, one entry per room.
    pub rooms: Vec<BookedRoom>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationWithTransaction {
    pub reservation: Reservation,
    pub transaction: Option<Transaction>,
}

impl ReservationWithTransaction {
    pub fn is_paid(&self) -> bool {
        self.transaction.as_ref().is_some_and(|t| t.paid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn stay(a: &str, b: &str) -> Stay {
        Stay::new(d(a), d(b)).unwrap()
    }

    fn claim(a: &str, b: &str) -> BedClaim {
        BedClaim {
            reservation_id: Ulid::new(),
            stay: stay(a, b),
        }
    }

    #[test]
    fn stay_rejects_empty_and_inverted() {
        assert!(Stay::new(d("2024-01-05"), d("2024-01-05")).is_none());
        assert!(Stay::new(d("2024-01-05"), d("2024-01-01")).is_none());
        assert_eq!(stay("2024-01-01", "2024-01-05").nights(), 4);
    }

    #[test]
    fn stay_overlap_is_half_open() {
        let a = stay("2024-01-01", "2024-01-05");
        assert!(a.overlaps(&stay("2024-01-04", "2024-01-06")));
        assert!(!a.overlaps(&stay("2024-01-05", "2024-01-08")));
        assert!(!stay("2024-01-05", "2024-01-08").overlaps(&a));
    }

    #[test]
    fn admits_claim_ending_on_check_in() {
        let existing = stay("2024-01-01", "2024-01-05");
        assert!(existing.admits(&stay("2024-01-05", "2024-01-08")));
        assert!(!existing.admits(&stay("2024-01-04", "2024-01-06")));
    }

    #[test]
    fn admits_rejects_claim_starting_on_check_out() {
        // Existing claim starts exactly on the wanted check-out day.
        let existing = stay("2024-01-05", "2024-01-08");
        assert!(!existing.admits(&stay("2024-01-01", "2024-01-05")));
        assert!(existing.admits(&stay("2024-01-01", "2024-01-04")));
    }

    #[test]
    fn admits_implies_no_overlap() {
        let wanted = stay("2024-03-10", "2024-03-15");
        for (a, b) in [
            ("2024-03-01", "2024-03-10"),
            ("2024-03-01", "2024-03-11"),
            ("2024-03-12", "2024-03-13"),
            ("2024-03-15", "2024-03-20"),
            ("2024-03-16", "2024-03-20"),
        ] {
            let existing = stay(a, b);
            if existing.admits(&wanted) {
                assert!(!existing.overlaps(&wanted), "{a}..{b}");
            }
        }
    }

    #[test]
    fn claims_stay_sorted() {
        let mut bed = BedState::new(1, 1);
        bed.insert_claim(claim("2024-02-10", "2024-02-12"));
        bed.insert_claim(claim("2024-01-01", "2024-01-03"));
        bed.insert_claim(claim("2024-01-20", "2024-01-25"));
        let starts: Vec<_> = bed.claims.iter().map(|c| c.stay.check_in).collect();
        assert_eq!(starts, vec![d("2024-01-01"), d("2024-01-20"), d("2024-02-10")]);
    }

    #[test]
    fn bed_free_ignores_far_claims() {
        let mut bed = BedState::new(1, 1);
        bed.insert_claim(claim("2023-12-01", "2023-12-05"));
        bed.insert_claim(claim("2024-06-01", "2024-06-05"));
        assert!(bed.is_free(&stay("2024-01-01", "2024-01-10")));
    }

    #[test]
    fn bed_not_free_when_claim_contains_window() {
        let mut bed = BedState::new(1, 1);
        bed.insert_claim(claim("2024-01-01", "2024-01-31"));
        assert!(!bed.is_free(&stay("2024-01-10", "2024-01-12")));
    }

    #[test]
    fn empty_bed_is_free() {
        let bed = BedState::new(7, 2);
        assert!(bed.is_free(&stay("2024-01-01", "2024-01-02")));
    }

    #[test]
    fn room_beds_sorted_and_unique() {
        let mut room = Room::new(1, "Dorm A".into(), None);
        room.insert_bed(3);
        room.insert_bed(1);
        room.insert_bed(2);
        room.insert_bed(3);
        assert_eq!(room.beds, vec![1, 2, 3]);
    }

    #[test]
    fn unpaid_without_transaction() {
        let r = ReservationWithTransaction {
            reservation: Reservation {
                id: Ulid::new(),
                stay: stay("2024-01-01", "2024-01-02"),
                guest_id: Ulid::new(),
                special_requests: String::new(),
                check_in_enter_time: None,
                beds: vec![1],
            },
            transaction: None,
        };
        assert!(!r.is_paid());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationCreated {
            id: Ulid::new(),
            stay: stay("2024-01-01", "2024-01-05"),
            guest_id: Ulid::new(),
            special_requests: "late arrival".into(),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
