/// Serializes a [`UtcDateTime`](time::UtcDateTime) as milliseconds since the unix epoch.
pub mod unix_millis {
    use serde::{Serializer, ser::Error};
    use time::{UtcDateTime, macros::utc_datetime};

    const UNIX_EPOCH: UtcDateTime = utc_datetime!(1970-01-01 00:00);

    #[must_use]
    pub fn from_date_time(value: UtcDateTime) -> i128 {
        (value - UNIX_EPOCH).whole_milliseconds()
    }

    pub fn serialize<S>(value: &UtcDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = i64::try_from(from_date_time(*value))
            .map_err(|_| S::Error::custom("timestamp out of range"))?;
        serializer.serialize_i64(millis)
    }
}
