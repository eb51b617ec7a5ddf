//! Bounded per-owner cache of the newest posts.
//!
//! Every entry is a contiguous prefix (newest first) of the owner's sequence in
//! the backing store, strictly sorted by `(created_at desc, id desc)` and at
//! most `capacity` long. At most `max_owners` entries are kept; an evicted owner
//! is warmed again from the store on next use. Readers get cheap `Arc`
//! snapshots; writers for one owner are serialized through [`RecentCache::lock`].

use crate::{error::StoreError, store::TimelineSource};
use moka::future::Cache;
use rookery_common::model::{Id, post::Post, user::UserMarker};
use std::{
    cmp::Reverse,
    hash::{BuildHasher, RandomState},
    num::NonZeroUsize,
    sync::Arc,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Writer locks shared by all owners. An owner always maps to the same lock, so
/// entry eviction never lets two writers of one owner run at once.
const WRITER_STRIPES: u64 = 1024;

pub struct RecentCache {
    capacity: NonZeroUsize,
    entries: Cache<Id<UserMarker>, Entry>,
    writers: Box<[Arc<Mutex<()>>]>,
    stripes: RandomState,
}

#[derive(Clone)]
struct Entry {
    posts: Arc<[Post]>,
    /// The entry holds every post the owner has, not just the newest ones.
    complete: bool,
}

impl RecentCache {
    #[must_use]
    pub fn new(capacity: NonZeroUsize, max_owners: u64) -> Self {
        Self {
            capacity,
            entries: Cache::builder().max_capacity(max_owners).build(),
            writers: (0..WRITER_STRIPES).map(|_| Arc::default()).collect(),
            stripes: RandomState::new(),
        }
    }

    /// The cached posts of `owner`, newest first. Empty if nothing is cached.
    pub async fn get(&self, owner: Id<UserMarker>) -> Arc<[Post]> {
        self.entries
            .get(&owner)
            .await
            .map_or_else(|| Arc::from(Vec::new()), |entry| entry.posts)
    }

    #[must_use]
    pub fn is_loaded(&self, owner: Id<UserMarker>) -> bool {
        self.entries.contains_key(&owner)
    }

    /// Owners with an entry, once pending evictions have been applied.
    pub async fn owner_count(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }

    /// Waits until no other writer holds `owner` and returns the write handle.
    pub async fn lock(&self, owner: Id<UserMarker>) -> CacheWriter {
        let stripe = usize::try_from(self.stripes.hash_one(owner) % WRITER_STRIPES)
            .unwrap_or_default();
        let guard = Arc::clone(&self.writers[stripe]).lock_owned().await;

        CacheWriter {
            owner,
            capacity: self.capacity,
            entries: self.entries.clone(),
            _guard: guard,
        }
    }

    pub async fn push_front(&self, owner: Id<UserMarker>, post: Post) -> bool {
        self.lock(owner).await.push_front(post).await
    }

    /// Loads the newest posts of `owner` from `source` unless an entry exists.
    pub async fn warm<Src: TimelineSource>(
        &self,
        owner: Id<UserMarker>,
        source: &Src,
    ) -> Result<(), StoreError> {
        let mut writer = self.lock(owner).await;
        if writer.is_loaded() {
            return Ok(());
        }
        writer.load_from(source).await
    }
}

/// Exclusive write access to one owner's entry.
pub struct CacheWriter {
    owner: Id<UserMarker>,
    capacity: NonZeroUsize,
    entries: Cache<Id<UserMarker>, Entry>,
    _guard: OwnedMutexGuard<()>,
}

impl CacheWriter {
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.entries.contains_key(&self.owner)
    }

    /// Inserts `post` keeping the entry sorted and bounded.
    ///
    /// A missing entry is created holding just `post`. Duplicates are ignored, and so
    /// are posts at or below the tail of a trimmed entry, since the store serves those.
    /// Returns whether the entry changed.
    pub async fn push_front(&mut self, post: Post) -> bool {
        match self.entries.get(&self.owner).await {
            Some(entry) => self.insert_into(entry, post).await,
            None => {
                self.replace(Entry {
                    posts: Arc::from(vec![post]),
                    complete: false,
                })
                .await;
                true
            }
        }
    }

    /// Replaces the entry with the newest of `posts`.
    ///
    /// `posts` must be the head of the owner's sequence: everything newer than the
    /// oldest given post must be included.
    pub async fn load(&mut self, mut posts: Vec<Post>) {
        posts.sort_unstable_by_key(|post| Reverse(post.cursor()));
        posts.dedup_by_key(|post| post.id);

        let complete = posts.len() < self.capacity.get();
        posts.truncate(self.capacity.get());
        self.replace(Entry {
            posts: Arc::from(posts),
            complete,
        })
        .await;
    }

    pub async fn load_from<Src: TimelineSource>(&mut self, source: &Src) -> Result<(), StoreError> {
        let posts = source
            .range_query(self.owner, None, self.capacity.get())
            .await?;
        debug!(owner = %self.owner, loaded = posts.len(), "Warmed cache entry");
        self.load(posts).await;
        Ok(())
    }

    /// Writes a freshly stored post through to the cache.
    ///
    /// An owner without an entry (never loaded, or evicted) is loaded from `source`
    /// instead, so that the entry starts out as a true prefix of the store.
    pub async fn write_through<Src: TimelineSource>(
        &mut self,
        post: Post,
        source: &Src,
    ) -> Result<(), StoreError> {
        match self.entries.get(&self.owner).await {
            Some(entry) => {
                self.insert_into(entry, post).await;
                Ok(())
            }
            None => self.load_from(source).await,
        }
    }

    async fn insert_into(&mut self, entry: Entry, post: Post) -> bool {
        if entry.posts.iter().any(|cached| cached.id == post.id) {
            return false;
        }
        let key = post.cursor();
        if !entry.complete
            && entry
                .posts
                .last()
                .is_some_and(|tail| key <= tail.cursor())
        {
            debug!(owner = %self.owner, post_id = %post.id, "Post is beyond the cached window");
            return false;
        }

        let position = entry
            .posts
            .partition_point(|cached| cached.cursor() > key);
        if position >= self.capacity.get() {
            self.replace(Entry {
                complete: false,
                ..entry
            })
            .await;
            return false;
        }

        let mut posts = Vec::with_capacity(entry.posts.len() + 1);
        posts.extend_from_slice(&entry.posts[..position]);
        posts.push(post);
        posts.extend_from_slice(&entry.posts[position..]);

        let complete = entry.complete && posts.len() <= self.capacity.get();
        posts.truncate(self.capacity.get());
        self.replace(Entry {
            posts: Arc::from(posts),
            complete,
        })
        .await;
        true
    }

    async fn replace(&self, entry: Entry) {
        self.entries.insert(self.owner, entry).await;
    }
}
