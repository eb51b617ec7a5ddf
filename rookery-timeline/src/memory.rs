//! An in-process store implementing every store seam.
//!
//! Used by the test suites and for running the core without a database. It
//! hands out real snowflakes against a simulated clock that advances by a fixed
//! step per appended post, which allows building timestamp ties on purpose.

use crate::{
    error::StoreError,
    store::{FeedStore, FollowGraph, PostStore},
};
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
use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};
use thiserror::Error;
use time::{Duration, UtcDateTime, macros::utc_datetime};

#[derive(Copy, Clone, Eq, PartialEq, Debug, Error)]
#[error("Injected store failure")]
pub struct InjectedFailure;

pub struct MemoryStore {
    state: Mutex<MemoryState>,
    clock_step: Duration,
    range_query_delay: Mutex<Option<std::time::Duration>>,
    follower_count_delay: Mutex<Option<std::time::Duration>>,
    failing_feed_inserts: AtomicUsize,
    failing_range_queries: AtomicUsize,
    range_queries: AtomicUsize,
}

struct MemoryState {
    clock: UtcDateTime,
    generator: RookerySnowflakeGenerator,
    posts: HashMap<Id<PostMarker>, Post>,
    by_author: HashMap<Id<UserMarker>, BTreeSet<Cursor>>,
    feeds: HashMap<Id<UserMarker>, BTreeSet<Cursor>>,
    /// `(followee, follower)` pairs.
    follows: BTreeSet<(Id<UserMarker>, Id<UserMarker>)>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_clock_step(Duration::milliseconds(1))
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose clock advances by `clock_step` for every appended post.
    #[must_use]
    pub fn with_clock_step(clock_step: Duration) -> Self {
        let generator = RookerySnowflakeGenerator::new(
            WorkerId::new(0).unwrap_or_default(),
            ProcessId::new(0).unwrap_or_default(),
        );

        Self {
            state: Mutex::new(MemoryState {
                clock: utc_datetime!(2025-06-01 00:00),
                generator,
                posts: HashMap::new(),
                by_author: HashMap::new(),
                feeds: HashMap::new(),
                follows: BTreeSet::new(),
            }),
            clock_step,
            range_query_delay: Mutex::new(None),
            follower_count_delay: Mutex::new(None),
            failing_feed_inserts: AtomicUsize::new(0),
            failing_range_queries: AtomicUsize::new(0),
            range_queries: AtomicUsize::new(0),
        }
    }

    pub fn follow(&self, follower: Id<UserMarker>, followee: Id<UserMarker>) {
        self.state().follows.insert((followee, follower));
    }

    /// Makes the next `count` feed inserts fail.
    pub fn fail_feed_inserts(&self, count: usize) {
        self.failing_feed_inserts.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` range queries (author or feed) fail.
    pub fn fail_range_queries(&self, count: usize) {
        self.failing_range_queries.store(count, Ordering::SeqCst);
    }

    pub fn delay_range_queries(&self, delay: Option<std::time::Duration>) {
        *self
            .range_query_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Makes the next follower count take `delay` before answering.
    pub fn delay_next_follower_count(&self, delay: std::time::Duration) {
        *self
            .follower_count_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    /// Number of range queries served so far.
    #[must_use]
    pub fn range_queries(&self) -> usize {
        self.range_queries.load(Ordering::SeqCst)
    }

    /// The feed of `owner`, newest first.
    #[must_use]
    pub fn feed_entries(&self, owner: Id<UserMarker>) -> Vec<FeedEntry> {
        self.state()
            .feeds
            .get(&owner)
            .map(|cursors| {
                cursors
                    .iter()
                    .rev()
                    .map(|cursor| FeedEntry {
                        feed_owner: owner,
                        post_id: cursor.id,
                        created_at: cursor.created_at,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_failure(counter: &AtomicUsize) -> Result<(), StoreError> {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .map_or(Ok(()), |_| Err(StoreError::backend(InjectedFailure)))
    }

    async fn before_range_query(&self) -> Result<(), StoreError> {
        self.range_queries.fetch_add(1, Ordering::SeqCst);
        let delay = *self
            .range_query_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Self::take_failure(&self.failing_range_queries)
    }

    fn collect(
        cursors: Option<&BTreeSet<Cursor>>,
        from: Option<Cursor>,
        limit: usize,
        posts: &HashMap<Id<PostMarker>, Post>,
    ) -> Vec<Post> {
        let Some(cursors) = cursors else {
            return Vec::new();
        };
        let newest_first: Box<dyn Iterator<Item = &Cursor> + '_> = match from {
            Some(from) => Box::new(cursors.range(..from).rev()),
            None => Box::new(cursors.iter().rev()),
        };

        newest_first
            .take(limit)
            .filter_map(|cursor| posts.get(&cursor.id).cloned())
            .collect()
    }
}

impl PostStore for MemoryStore {
    async fn append(&self, post: CreatePost) -> Result<Post, StoreError> {
        let mut state = self.state();
        state.clock += self.clock_step;
        let clock = state.clock;
        let snowflake = state
            .generator
            .generate_at(clock)
            .map_err(ModelValidationError::from)?;

        let post = Post {
            id: snowflake.into(),
            author_id: post.author,
            content: post.content,
            created_at: snowflake.created_at(),
        };
        state
            .by_author
            .entry(post.author_id)
            .or_default()
            .insert(post.cursor());
        state.posts.insert(post.id, post.clone());

        Ok(post)
    }

    async fn fetch(&self, id: Id<PostMarker>) -> Result<Option<Post>, StoreError> {
        Ok(self.state().posts.get(&id).cloned())
    }

    async fn range_query(
        &self,
        author: Id<UserMarker>,
        from: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<Post>, StoreError> {
        self.before_range_query().await?;
        let state = self.state();
        Ok(Self::collect(state.by_author.get(&author), from, limit, &state.posts))
    }
}

impl FeedStore for MemoryStore {
    async fn insert(&self, entry: FeedEntry) -> Result<bool, StoreError> {
        Self::take_failure(&self.failing_feed_inserts)?;
        Ok(self
            .state()
            .feeds
            .entry(entry.feed_owner)
            .or_default()
            .insert(entry.cursor()))
    }

    async fn feed_range_query(
        &self,
        feed_owner: Id<UserMarker>,
        from: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<Post>, StoreError> {
        self.before_range_query().await?;
        let state = self.state();
        Ok(Self::collect(state.feeds.get(&feed_owner), from, limit, &state.posts))
    }
}

impl FollowGraph for MemoryStore {
    async fn follower_count(&self, user: Id<UserMarker>) -> Result<u64, StoreError> {
        let delay = self
            .follower_count_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.followers(user).await?.len() as u64)
    }

    async fn followers(&self, user: Id<UserMarker>) -> Result<Vec<Id<UserMarker>>, StoreError> {
        Ok(self
            .state()
            .follows
            .iter()
            .filter(|(followee, _)| *followee == user)
            .map(|(_, follower)| *follower)
            .collect())
    }

    async fn heavy_followees(
        &self,
        reader: Id<UserMarker>,
        ceiling: u64,
    ) -> Result<Vec<Id<UserMarker>>, StoreError> {
        let state = self.state();
        let count = |user: Id<UserMarker>| {
            state
                .follows
                .iter()
                .filter(|(followee, _)| *followee == user)
                .count() as u64
        };

        Ok(state
            .follows
            .iter()
            .filter(|(_, follower)| *follower == reader)
            .map(|(followee, _)| *followee)
            .filter(|followee| count(*followee) > ceiling)
            .collect())
    }
}
