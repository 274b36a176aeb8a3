use chrono::NaiveDate;

pub const MAX_PROPERTIES: usize = 1_000;
pub const MAX_PROPERTY_NAME_LEN: usize = 128;

pub const MAX_ROOMS_PER_PROPERTY: usize = 10_000;
pub const MAX_BEDS_PER_ROOM: usize = 64;
pub const MAX_FACILITIES_PER_ROOM: usize = 64;
pub const MAX_PHOTOS_PER_ROOM: usize = 64;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_URL_LEN: usize = 2_048;
pub const MAX_DESCRIPTION_LEN: usize = 4_096;

pub const MAX_BEDS_PER_RESERVATION: usize = 32;
pub const MAX_SPECIAL_REQUESTS_LEN: usize = 4_096;
pub const MAX_STAY_NIGHTS: i64 = 365;
pub const MAX_QUERY_WINDOW_DAYS: i64 = 366;

/// Multi-row INSERT cap for the SQL front end.
pub const MAX_BATCH_ROWS: usize = 1_000;

pub fn min_valid_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or(NaiveDate::MIN)
}

pub fn max_valid_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2200, 12, 31).unwrap_or(NaiveDate::MAX)
}
