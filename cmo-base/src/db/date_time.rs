//! Conversions between the wire clock (`OffsetDateTime`, always UTC) and
//! the column type (`PrimitiveDateTime`).

use sea_orm::prelude::TimeDateTime;
use time::{OffsetDateTime, PrimitiveDateTime};

/// The current UTC time as a column value.
pub fn now() -> TimeDateTime {
    to_db(OffsetDateTime::now_utc())
}

/// Strip the (always-UTC) offset for storage.
pub fn to_db(dt: OffsetDateTime) -> TimeDateTime {
    PrimitiveDateTime::new(dt.date(), dt.time())
}

/// Re-attach the UTC offset on the way out.
pub fn from_db(dt: TimeDateTime) -> OffsetDateTime {
    dt.assume_utc()
}
