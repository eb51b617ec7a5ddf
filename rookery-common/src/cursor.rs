//! Pagination cursors.
//!
//! A cursor is the `(created_at, id)` key of the last item a caller has seen.
//! Timelines are sorted descending by this key, so a page "after" a cursor
//! contains only strictly smaller keys. Callers only ever see the opaque token
//! produced by [`Cursor::to_token`].

use crate::{
    model::{Id, RookeryEpoch, post::PostMarker},
    snowflake::Epoch,
};
use base64::{DecodeError, Engine, prelude::BASE64_URL_SAFE_NO_PAD};
use std::{fmt::Display, num::ParseIntError, str::FromStr};
use thiserror::Error;
use time::{Duration, UtcDateTime};

#[derive(Clone, Eq, PartialEq, Debug, Error)]
pub enum CursorDecodeError {
    #[error("Decoding base64 failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("Cursor was not valid UTF-8")]
    NotUtf8,
    #[error("Not enough parts separated by ':'")]
    NotEnoughParts,
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(ParseIntError),
    #[error("Timestamp out of range")]
    TimestampOutOfRange,
    #[error("Invalid post id: {0}")]
    InvalidPostId(ParseIntError),
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash)]
pub struct Cursor {
    pub created_at: UtcDateTime,
    pub id: Id<PostMarker>,
}

impl Cursor {
    #[must_use]
    pub fn new(created_at: UtcDateTime, id: Id<PostMarker>) -> Self {
        Self { created_at, id }
    }

    #[must_use]
    pub fn to_token(&self) -> String {
        let millis = (self.created_at - RookeryEpoch::EPOCH_TIME).whole_milliseconds();
        let raw = format!("{millis}:{}", self.id);

        BASE64_URL_SAFE_NO_PAD.encode(raw)
    }
}

impl Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_token())
    }
}

impl FromStr for Cursor {
    type Err = CursorDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = BASE64_URL_SAFE_NO_PAD.decode(s)?;
        let raw = std::str::from_utf8(&decoded).map_err(|_| Self::Err::NotUtf8)?;

        let (millis_part, id_part) = raw.split_once(':').ok_or(Self::Err::NotEnoughParts)?;

        let millis = i64::from_str(millis_part).map_err(Self::Err::InvalidTimestamp)?;
        let id = u64::from_str(id_part)
            .map_err(Self::Err::InvalidPostId)?
            .into();

        let created_at = RookeryEpoch::EPOCH_TIME
            .checked_add(Duration::milliseconds(millis))
            .ok_or(Self::Err::TimestampOutOfRange)?;

        Ok(Self { created_at, id })
    }
}
