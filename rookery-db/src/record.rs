use rookery_common::model::{
    ModelValidationError,
    feed::FeedEntry,
    post::{Post, PostContent},
};
use sqlx::FromRow;
use time::OffsetDateTime;

#[derive(Clone, Eq, PartialEq, Debug, Hash, FromRow)]
pub struct PostRecord {
    pub post_snowflake: i64,
    pub user_snowflake: i64,
    pub content: String,
    pub created_at: OffsetDateTime,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash, FromRow)]
pub struct FeedEntryRecord {
    pub feed_owner_snowflake: i64,
    pub post_snowflake: i64,
    pub created_at: OffsetDateTime,
}

impl TryFrom<PostRecord> for Post {
    type Error = ModelValidationError;

    fn try_from(value: PostRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.post_snowflake.cast_unsigned().into(),
            author_id: value.user_snowflake.cast_unsigned().into(),
            content: PostContent::new(value.content)?,
            created_at: value.created_at.to_utc(),
        })
    }
}

impl From<FeedEntry> for FeedEntryRecord {
    fn from(value: FeedEntry) -> Self {
        Self {
            feed_owner_snowflake: u64::from(value.feed_owner).cast_signed(),
            post_snowflake: u64::from(value.post_id).cast_signed(),
            created_at: value.created_at.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::record::{FeedEntryRecord, PostRecord};
    use rookery_common::model::{Id, ModelValidationError, feed::FeedEntry, post::Post};
    use time::macros::{datetime, utc_datetime};

    fn record(content: &str) -> PostRecord {
        PostRecord {
            post_snowflake: -5,
            user_snowflake: 7,
            content: content.to_owned(),
            created_at: datetime!(2025-04-01 12:00:00.25 +2),
        }
    }

    #[test]
    fn post_record_converts() {
        let post = Post::try_from(record("from the database")).unwrap();

        assert_eq!(u64::from(post.id), (-5_i64).cast_unsigned());
        assert_eq!(post.author_id, Id::from(7));
        assert_eq!(post.content.get(), "from the database");
        assert_eq!(post.created_at, utc_datetime!(2025-04-01 10:00:00.25));
    }

    #[test]
    fn invalid_content_is_rejected() {
        assert!(matches!(
            Post::try_from(record("")),
            Err(ModelValidationError::PostContent(_))
        ));
    }

    #[test]
    fn feed_entry_record_keeps_the_instant() {
        let entry = FeedEntry {
            feed_owner: Id::from(3),
            post_id: Id::from(9),
            created_at: utc_datetime!(2025-04-01 10:00),
        };

        let record = FeedEntryRecord::from(entry);

        assert_eq!(record.feed_owner_snowflake, 3);
        assert_eq!(record.post_snowflake, 9);
        assert_eq!(record.created_at, datetime!(2025-04-01 10:00 UTC));
    }
}
