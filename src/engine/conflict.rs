use chrono::NaiveDate;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Build the stay window, rejecting inverted or out-of-range dates.
pub(crate) fn validate_stay(check_in: NaiveDate, check_out: NaiveDate) -> Result<Stay, EngineError> {
    let stay = Stay::new(check_in, check_out).ok_or_else(|| {
        EngineError::Validation(format!(
            "check-out {check_out} must be after check-in {check_in}"
        ))
    })?;
    if stay.check_in < min_valid_date() || stay.check_out > max_valid_date() {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    Ok(stay)
}

pub(crate) fn validate_query_window(
    check_in: NaiveDate,
    check_out: NaiveDate,
) -> Result<Stay, EngineError> {
    let stay = validate_stay(check_in, check_out)?;
    if stay.nights() > MAX_QUERY_WINDOW_DAYS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(stay)
}

/// Requested beds, sorted ascending. This is also the lock acquisition order.
pub(crate) fn validate_bed_request(beds: &[BedId]) -> Result<Vec<BedId>, EngineError> {
    if beds.is_empty() {
        return Err(EngineError::Validation("at least one bed is required".into()));
    }
    if beds.len() > MAX_BEDS_PER_RESERVATION {
        return Err(EngineError::LimitExceeded("too many beds in one reservation"));
    }
    let mut sorted = beds.to_vec();
    sorted.sort_unstable();
    if let Some(w) = sorted.windows(2).find(|w| w[0] == w[1]) {
        return Err(EngineError::Validation(format!("bed {} requested twice", w[0])));
    }
    Ok(sorted)
}

pub(crate) fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Validation("name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

/// Beds among `beds` whose claims no longer admit `stay`. Callers hold the write locks.
pub(crate) fn contested_beds<'a>(
    beds: impl IntoIterator<Item = &'a BedState>,
    stay: &Stay,
) -> Vec<BedId> {
    beds.into_iter()
        .filter(|bed| !bed.is_free(stay))
        .map(|bed| bed.id)
        .collect()
}
