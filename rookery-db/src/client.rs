use crate::record::{FeedEntryRecord, PostRecord};
use rookery_common::{
    cursor::Cursor,
    model::{
        Id, ModelValidationError, RookerySnowflakeGenerator,
        feed::FeedEntry,
        post::{CreatePost, Post, PostMarker},
        user::UserMarker,
    },
    snowflake::{ProcessId, WorkerId},
};
use rookery_timeline::{
    StoreError,
    store::{FeedStore, FollowGraph, PostStore},
};
use sqlx::{PgPool, migrate::MigrateError, postgres::PgPoolOptions, query, query_as, query_scalar};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::info;

pub type Result<T, E = DbError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("An object in the database was invalid: {0}")]
    Data(#[from] ModelValidationError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] MigrateError),
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        match value {
            DbError::Data(error) => StoreError::Data(error),
            other => StoreError::backend(other),
        }
    }
}

pub struct DbClient {
    pool: PgPool,
    snowflake_generator: Mutex<RookerySnowflakeGenerator>,
}

impl DbClient {
    #[must_use]
    pub fn new(pool: PgPool, worker_id: WorkerId, process_id: ProcessId) -> Self {
        let snowflake_generator = Mutex::new(RookerySnowflakeGenerator::new(worker_id, process_id));

        Self {
            pool,
            snowflake_generator,
        }
    }

    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        worker_id: WorkerId,
        process_id: ProcessId,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        Ok(Self::new(pool, worker_id, process_id))
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!().run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }

    pub async fn create_post(&self, post: CreatePost) -> Result<Post> {
        let post_snowflake = self
            .snowflake_generator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .generate()
            .map_err(ModelValidationError::from)?;
        let created_at = OffsetDateTime::from(post_snowflake.created_at());

        let record = query_as::<_, PostRecord>(
            "
            INSERT INTO posts.posts (post_snowflake, user_snowflake, content, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING post_snowflake, user_snowflake, content, created_at
            ",
        )
        .bind(post_snowflake.get().cast_signed())
        .bind(u64::from(post.author).cast_signed())
        .bind(post.content.get())
        .bind(created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(Post::try_from(record)?)
    }

    pub async fn fetch_post(&self, post_id: Id<PostMarker>) -> Result<Option<Post>> {
        let record = query_as::<_, PostRecord>(
            "
            SELECT posts.post_snowflake, posts.user_snowflake, posts.content, posts.created_at
            FROM posts.posts
            WHERE posts.post_snowflake = $1
            ",
        )
        .bind(u64::from(post_id).cast_signed())
        .fetch_optional(&self.pool)
        .await?;

        let post = record.map(Post::try_from).transpose()?;
        Ok(post)
    }

    /// Posts of `author` older than `from`, newest first.
    pub async fn fetch_posts_before(
        &self,
        author: Id<UserMarker>,
        from: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<Post>> {
        let author = u64::from(author).cast_signed();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let records = match from {
            Some(from) => {
                query_as::<_, PostRecord>(
                    "
                    SELECT posts.post_snowflake, posts.user_snowflake, posts.content, posts.created_at
                    FROM posts.posts
                    WHERE posts.user_snowflake = $1
                        AND (posts.created_at, posts.post_snowflake) < ($2, $3)
                    ORDER BY posts.created_at DESC, posts.post_snowflake DESC
                    LIMIT $4
                    ",
                )
                .bind(author)
                .bind(OffsetDateTime::from(from.created_at))
                .bind(u64::from(from.id).cast_signed())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                query_as::<_, PostRecord>(
                    "
                    SELECT posts.post_snowflake, posts.user_snowflake, posts.content, posts.created_at
                    FROM posts.posts
                    WHERE posts.user_snowflake = $1
                    ORDER BY posts.created_at DESC, posts.post_snowflake DESC
                    LIMIT $2
                    ",
                )
                .bind(author)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        records
            .into_iter()
            .map(|record| Ok(Post::try_from(record)?))
            .collect()
    }

    /// Returns whether the entry was new.
    pub async fn insert_feed_entry(&self, entry: FeedEntry) -> Result<bool> {
        let record = FeedEntryRecord::from(entry);

        let result = query(
            "
            INSERT INTO feeds.feed_entries (feed_owner_snowflake, post_snowflake, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            ",
        )
        .bind(record.feed_owner_snowflake)
        .bind(record.post_snowflake)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Posts in the feed of `feed_owner` older than `from`, newest first.
    pub async fn fetch_feed_before(
        &self,
        feed_owner: Id<UserMarker>,
        from: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<Post>> {
        let feed_owner = u64::from(feed_owner).cast_signed();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let records = match from {
            Some(from) => {
                query_as::<_, PostRecord>(
                    "
                    SELECT posts.post_snowflake, posts.user_snowflake, posts.content, posts.created_at
                    FROM feeds.feed_entries
                        JOIN posts.posts ON posts.post_snowflake = feed_entries.post_snowflake
                    WHERE feed_entries.feed_owner_snowflake = $1
                        AND (feed_entries.created_at, feed_entries.post_snowflake) < ($2, $3)
                    ORDER BY feed_entries.created_at DESC, feed_entries.post_snowflake DESC
                    LIMIT $4
                    ",
                )
                .bind(feed_owner)
                .bind(OffsetDateTime::from(from.created_at))
                .bind(u64::from(from.id).cast_signed())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                query_as::<_, PostRecord>(
                    "
                    SELECT posts.post_snowflake, posts.user_snowflake, posts.content, posts.created_at
                    FROM feeds.feed_entries
                        JOIN posts.posts ON posts.post_snowflake = feed_entries.post_snowflake
                    WHERE feed_entries.feed_owner_snowflake = $1
                    ORDER BY feed_entries.created_at DESC, feed_entries.post_snowflake DESC
                    LIMIT $2
                    ",
                )
                .bind(feed_owner)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        records
            .into_iter()
            .map(|record| Ok(Post::try_from(record)?))
            .collect()
    }

    pub async fn count_followers(&self, user: Id<UserMarker>) -> Result<u64> {
        let count = query_scalar::<_, i64>(
            "
            SELECT COUNT(*)
            FROM users.follows
            WHERE follows.followee_snowflake = $1
            ",
        )
        .bind(u64::from(user).cast_signed())
        .fetch_one(&self.pool)
        .await?;

        Ok(count.cast_unsigned())
    }

    pub async fn fetch_followers(&self, user: Id<UserMarker>) -> Result<Vec<Id<UserMarker>>> {
        let followers = query_scalar::<_, i64>(
            "
            SELECT follows.follower_snowflake
            FROM users.follows
            WHERE follows.followee_snowflake = $1
            ",
        )
        .bind(u64::from(user).cast_signed())
        .fetch_all(&self.pool)
        .await?;

        Ok(followers
            .into_iter()
            .map(|follower| follower.cast_unsigned().into())
            .collect())
    }

    /// Users followed by `reader` with more than `ceiling` followers.
    pub async fn fetch_heavy_followees(
        &self,
        reader: Id<UserMarker>,
        ceiling: u64,
    ) -> Result<Vec<Id<UserMarker>>> {
        let followees = query_scalar::<_, i64>(
            "
            SELECT follows.followee_snowflake
            FROM users.follows
            WHERE follows.follower_snowflake = $1
                AND (
                    SELECT COUNT(*)
                    FROM users.follows AS counted
                    WHERE counted.followee_snowflake = follows.followee_snowflake
                ) > $2
            ",
        )
        .bind(u64::from(reader).cast_signed())
        .bind(i64::try_from(ceiling).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(followees
            .into_iter()
            .map(|followee| followee.cast_unsigned().into())
            .collect())
    }
}

impl PostStore for DbClient {
    async fn append(&self, post: CreatePost) -> Result<Post, StoreError> {
        Ok(self.create_post(post).await?)
    }

    async fn fetch(&self, id: Id<PostMarker>) -> Result<Option<Post>, StoreError> {
        Ok(self.fetch_post(id).await?)
    }

    async fn range_query(
        &self,
        author: Id<UserMarker>,
        from: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<Post>, StoreError> {
        Ok(self.fetch_posts_before(author, from, limit).await?)
    }
}

impl FeedStore for DbClient {
    async fn insert(&self, entry: FeedEntry) -> Result<bool, StoreError> {
        Ok(self.insert_feed_entry(entry).await?)
    }

    async fn feed_range_query(
        &self,
        feed_owner: Id<UserMarker>,
        from: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<Post>, StoreError> {
        Ok(self.fetch_feed_before(feed_owner, from, limit).await?)
    }
}

impl FollowGraph for DbClient {
    async fn follower_count(&self, user: Id<UserMarker>) -> Result<u64, StoreError> {
        Ok(self.count_followers(user).await?)
    }

    async fn followers(&self, user: Id<UserMarker>) -> Result<Vec<Id<UserMarker>>, StoreError> {
        Ok(self.fetch_followers(user).await?)
    }

    async fn heavy_followees(
        &self,
        reader: Id<UserMarker>,
        ceiling: u64,
    ) -> Result<Vec<Id<UserMarker>>, StoreError> {
        Ok(self.fetch_heavy_followees(reader, ceiling).await?)
    }
}
