use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Shape, window and (unless `allow_past`) freshness checks for a requested span.
pub(crate) fn validate_span(
    window: &BookingWindow,
    span: &Span,
    now: Ms,
    allow_past: bool,
) -> Result<(), EngineError> {
    if span.end <= span.start {
        return Err(EngineError::InvalidInterval("end must be after start"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::InvalidInterval("timestamp out of range"));
    }
    if !window.contains(span) {
        return Err(EngineError::InvalidInterval("outside bookable hours"));
    }
    if !allow_past && span.start < now {
        return Err(EngineError::InvalidInterval("starts in the past"));
    }
    Ok(())
}

pub(crate) fn validate_capacity(max_participants: u32) -> Result<(), EngineError> {
    if max_participants == 0 {
        return Err(EngineError::InvalidCapacity(max_participants));
    }
    if max_participants > MAX_PARTICIPANTS {
        return Err(EngineError::LimitExceeded("max_participants too large"));
    }
    Ok(())
}

/// First reservation on `rs` overlapping `span`, ignoring `exclude` (the
/// reservation being updated).
pub(crate) fn check_no_overlap(
    rs: &ResourceState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match rs
        .overlapping(span)
        .find(|r| Some(r.id) != exclude)
    {
        Some(existing) => Err(EngineError::Overlap(existing.id)),
        None => Ok(()),
    }
}
