//! Fanout of new posts into followers' feeds.
//!
//! Authors with at most `ceiling` followers get their posts pushed into every
//! follower's feed. Posts of authors above the ceiling are only pushed into the
//! author's own feed; readers merge them in at read time.

use crate::{
    cache::RecentCache,
    error::StoreError,
    retry::{RetryConfig, RetryError, with_retry},
    store::{FeedPosts, FeedStore, FollowGraph},
};
use rookery_common::model::{Id, feed::FeedEntry, post::Post, user::UserMarker};
use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Follower count above which followers pull instead of being pushed to.
    pub ceiling: u64,
    /// Feeds written concurrently for one post.
    pub concurrency: NonZeroUsize,
    pub retry: RetryConfig,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            ceiling: 10_000,
            concurrency: NonZeroUsize::new(32).unwrap_or(NonZeroUsize::MIN),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum FanoutMode {
    Push,
    Pull,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct FanoutReport {
    pub mode: FanoutMode,
    /// Feeds that received a new entry.
    pub delivered: usize,
    /// Feeds that already had the entry.
    pub duplicates: usize,
    /// Feeds that could not be written even after retrying.
    pub failed: Vec<Id<UserMarker>>,
    /// The follower list could not be read; only the author's feed was attempted.
    pub followers_unavailable: bool,
}

impl FanoutReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && !self.followers_unavailable
    }
}

pub struct FanoutService<S> {
    inner: Arc<Fanout<S>>,
    queue: Arc<AuthorQueue>,
    tracker: TaskTracker,
}

/// The last scheduled fanout of every author with fanouts in flight.
#[derive(Default)]
struct AuthorQueue {
    tails: Mutex<HashMap<Id<UserMarker>, CancellationToken>>,
}

impl AuthorQueue {
    fn enter(self: &Arc<Self>, author: Id<UserMarker>) -> Turn {
        let done = CancellationToken::new();
        let previous = self
            .tails
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(author, done.clone());

        Turn {
            queue: Arc::clone(self),
            author,
            previous,
            done,
        }
    }
}

/// A place in an author's fanout queue. Dropping it lets the next fanout run.
struct Turn {
    queue: Arc<AuthorQueue>,
    author: Id<UserMarker>,
    previous: Option<CancellationToken>,
    done: CancellationToken,
}

impl Turn {
    async fn wait(&self) {
        if let Some(previous) = &self.previous {
            previous.cancelled().await;
        }
    }
}

impl Drop for Turn {
    fn drop(&mut self) {
        let mut tails = self.queue.tails.lock().unwrap_or_else(PoisonError::into_inner);
        self.done.cancel();
        // A finished tail means nobody queued up behind it.
        if tails
            .get(&self.author)
            .is_some_and(CancellationToken::is_cancelled)
        {
            tails.remove(&self.author);
        }
    }
}

struct Fanout<S> {
    store: Arc<S>,
    feeds: Arc<RecentCache>,
    feed_source: FeedPosts<S>,
    permits: Arc<Semaphore>,
    config: FanoutConfig,
}

impl<S: FeedStore + FollowGraph> FanoutService<S> {
    #[must_use]
    pub fn new(store: Arc<S>, feeds: Arc<RecentCache>, config: FanoutConfig) -> Self {
        let inner = Fanout {
            feed_source: FeedPosts(Arc::clone(&store)),
            store,
            feeds,
            permits: Arc::new(Semaphore::new(config.concurrency.get())),
            config,
        };

        Self {
            inner: Arc::new(inner),
            queue: Arc::default(),
            tracker: TaskTracker::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &FanoutConfig {
        &self.inner.config
    }

    /// Starts fanning out `post` in the background and returns immediately.
    ///
    /// The fanout runs after every earlier fanout of the same author.
    pub fn distribute(&self, post: Post) {
        let turn = self.queue.enter(post.author_id);
        let inner = Arc::clone(&self.inner);
        self.tracker.spawn(async move {
            turn.wait().await;
            inner.deliver(post).await;
            drop(turn);
        });
    }

    /// Fans out `post` and waits for the result.
    pub async fn deliver(&self, post: Post) -> FanoutReport {
        let turn = self.queue.enter(post.author_id);
        turn.wait().await;
        let report = Arc::clone(&self.inner).deliver(post).await;
        drop(turn);
        report
    }

    /// Waits for every fanout started so far.
    pub async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Waits for outstanding fanouts; nothing is cancelled.
    pub async fn shutdown(&self) {
        self.tracker.close();
        info!(pending = self.tracker.len(), "Waiting for fanouts to finish");
        self.tracker.wait().await;
    }
}

impl<S: FeedStore + FollowGraph> Fanout<S> {
    async fn deliver(self: Arc<Self>, post: Post) -> FanoutReport {
        let author = post.author_id;
        let store = &*self.store;
        let retry = &self.config.retry;

        let mut targets = vec![author];
        let mut mode = FanoutMode::Push;
        let mut followers_unavailable = false;

        let count = with_retry(retry, "follower count", StoreError::is_retryable, move || {
            store.follower_count(author)
        })
        .await;
        match count {
            Ok(count) if count > self.config.ceiling => {
                info!(%author, followers = count, "Author above fanout ceiling, followers will pull");
                mode = FanoutMode::Pull;
            }
            Ok(_) => match with_retry(retry, "followers", StoreError::is_retryable, move || {
                store.followers(author)
            })
            .await
            {
                Ok(followers) => targets.extend(followers),
                Err(error) => {
                    error!(%author, post_id = %post.id, %error, "Could not list followers");
                    followers_unavailable = true;
                }
            },
            Err(error) => {
                error!(%author, post_id = %post.id, %error, "Could not count followers");
                followers_unavailable = true;
            }
        }
        targets.sort_unstable();
        targets.dedup();

        let mut deliveries = JoinSet::new();
        for target in targets {
            let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                break;
            };
            let fanout = Arc::clone(&self);
            let post = post.clone();
            deliveries.spawn(async move {
                let result = fanout.deliver_to(target, post).await;
                drop(permit);
                (target, result)
            });
        }

        let mut report = FanoutReport {
            mode,
            delivered: 0,
            duplicates: 0,
            failed: Vec::new(),
            followers_unavailable,
        };
        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok((_, Ok(true))) => report.delivered += 1,
                Ok((_, Ok(false))) => report.duplicates += 1,
                Ok((target, Err(error))) => {
                    warn!(feed_owner = %target, post_id = %post.id, %error, "Feed delivery failed");
                    report.failed.push(target);
                }
                Err(error) => error!(post_id = %post.id, %error, "Feed delivery task panicked"),
            }
        }

        if report.is_complete() {
            debug!(post_id = %post.id, delivered = report.delivered, duplicates = report.duplicates, "Fanout complete");
        } else {
            error!(
                post_id = %post.id,
                %author,
                failed = report.failed.len(),
                followers_unavailable = report.followers_unavailable,
                "Fanout incomplete, some feeds are missing the post"
            );
        }
        report
    }

    /// Writes one feed entry and the matching cache entry under the feed's writer lock.
    async fn deliver_to(
        &self,
        feed_owner: Id<UserMarker>,
        post: Post,
    ) -> Result<bool, RetryError<StoreError>> {
        let mut writer = self.feeds.lock(feed_owner).await;
        let entry = FeedEntry::for_post(feed_owner, &post);
        let store = &*self.store;

        let inserted = with_retry(
            &self.config.retry,
            "feed insert",
            StoreError::is_retryable,
            move || store.insert(entry),
        )
        .await?;
        if let Err(error) = writer.write_through(post, &self.feed_source).await {
            warn!(%feed_owner, %error, "Could not warm feed cache entry");
        }

        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        cache::RecentCache,
        fanout::{FanoutConfig, FanoutMode, FanoutService},
        memory::MemoryStore,
        retry::RetryConfig,
        store::PostStore,
    };
    use rookery_common::model::{
        Id,
        post::{CreatePost, Post, PostContent},
        user::UserMarker,
    };
    use std::{num::NonZeroUsize, sync::Arc, time::Duration};
    use tokio::task::JoinSet;

    const AUTHOR: u64 = 100;

    fn config(ceiling: u64) -> FanoutConfig {
        FanoutConfig {
            ceiling,
            concurrency: NonZeroUsize::new(4).unwrap(),
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                jitter: false,
            },
        }
    }

    fn feed_cache(capacity: usize) -> Arc<RecentCache> {
        Arc::new(RecentCache::new(NonZeroUsize::new(capacity).unwrap(), 100))
    }

    fn setup(followers: u64, ceiling: u64) -> (Arc<MemoryStore>, Arc<RecentCache>, FanoutService<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        for follower in 1..=followers {
            store.follow(Id::from(follower), Id::from(AUTHOR));
        }
        let feeds = feed_cache(10);
        let fanout = FanoutService::new(Arc::clone(&store), Arc::clone(&feeds), config(ceiling));
        (store, feeds, fanout)
    }

    async fn post_by(store: &MemoryStore, author: u64) -> Post {
        store
            .append(CreatePost {
                author: Id::from(author),
                content: PostContent::new("hello followers".to_owned()).unwrap(),
            })
            .await
            .unwrap()
    }

    async fn post(store: &MemoryStore) -> Post {
        post_by(store, AUTHOR).await
    }

    fn feed_ids(store: &MemoryStore, owner: u64) -> Vec<u64> {
        store
            .feed_entries(Id::<UserMarker>::from(owner))
            .iter()
            .map(|entry| entry.post_id.into())
            .collect()
    }

    fn ids(posts: &[Post]) -> Vec<u64> {
        posts.iter().map(|post| post.id.into()).collect()
    }

    #[tokio::test]
    async fn pushes_into_every_follower_and_the_author() {
        let (store, feeds, fanout) = setup(3, 10);
        let post = post(&store).await;

        let report = fanout.deliver(post.clone()).await;

        assert_eq!(report.mode, FanoutMode::Push);
        assert_eq!(report.delivered, 4);
        assert!(report.is_complete());
        for owner in [1, 2, 3, AUTHOR] {
            assert_eq!(feed_ids(&store, owner), [u64::from(post.id)]);
            assert_eq!(feeds.get(Id::from(owner)).await.to_vec(), vec![post.clone()]);
        }
    }

    #[tokio::test]
    async fn delivering_twice_changes_nothing() {
        let (store, feeds, fanout) = setup(5, 10);
        let post = post(&store).await;

        fanout.deliver(post.clone()).await;
        let before: Vec<_> = (1..=5).map(|owner| store.feed_entries(Id::from(owner))).collect();
        let second = fanout.deliver(post.clone()).await;
        let after: Vec<_> = (1..=5).map(|owner| store.feed_entries(Id::from(owner))).collect();

        assert_eq!(before, after);
        assert_eq!(second.delivered, 0);
        assert_eq!(second.duplicates, 6);
        assert_eq!(feeds.get(Id::from(1)).await.len(), 1);
    }

    #[tokio::test]
    async fn above_ceiling_only_the_author_feed_is_written() {
        let (store, _, fanout) = setup(4, 3);
        let post = post(&store).await;

        let report = fanout.deliver(post.clone()).await;

        assert_eq!(report.mode, FanoutMode::Pull);
        assert_eq!(report.delivered, 1);
        assert_eq!(feed_ids(&store, AUTHOR), [u64::from(post.id)]);
        assert!(feed_ids(&store, 1).is_empty());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (store, _, fanout) = setup(2, 10);
        let post = post(&store).await;
        store.fail_feed_inserts(2);

        let report = fanout.deliver(post.clone()).await;

        assert!(report.is_complete());
        assert_eq!(report.delivered, 3);
        for owner in [1, 2, AUTHOR] {
            assert_eq!(feed_ids(&store, owner), [u64::from(post.id)]);
        }
    }

    #[tokio::test]
    async fn persistent_failures_are_reported() {
        let (store, _, fanout) = setup(1, 10);
        let post = post(&store).await;
        store.fail_feed_inserts(usize::MAX);

        let report = fanout.deliver(post).await;

        assert!(!report.is_complete());
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.delivered, 0);
    }

    #[tokio::test]
    async fn background_distribution_completes_on_flush() {
        let (store, _, fanout) = setup(2, 10);
        let post = post(&store).await;

        fanout.distribute(post.clone());
        fanout.flush().await;

        assert_eq!(feed_ids(&store, 2), [u64::from(post.id)]);
    }

    #[tokio::test]
    async fn later_post_waits_for_a_slow_earlier_fanout() {
        let (store, feeds, fanout) = setup(1, 10);
        let first = post(&store).await;
        let second = post(&store).await;
        store.delay_next_follower_count(Duration::from_millis(200));

        fanout.distribute(first.clone());
        fanout.distribute(second.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The first fanout is still looking up followers; the second must not overtake it.
        assert!(feed_ids(&store, 1).is_empty());
        assert!(feeds.get(Id::from(1)).await.is_empty());

        fanout.flush().await;
        assert_eq!(
            feed_ids(&store, 1),
            [u64::from(second.id), u64::from(first.id)]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_fanouts_keep_shared_feeds_consistent() {
        let store = Arc::new(MemoryStore::new());
        let authors = [AUTHOR, AUTHOR + 1, AUTHOR + 2];
        for author in authors {
            for follower in 1..=4 {
                store.follow(Id::from(follower), Id::from(author));
            }
        }
        let feeds = feed_cache(50);
        let fanout = Arc::new(FanoutService::new(
            Arc::clone(&store),
            Arc::clone(&feeds),
            config(10),
        ));

        let mut posts = Vec::new();
        for _ in 0..5 {
            for author in authors {
                posts.push(post_by(&store, author).await);
            }
        }

        let mut starts = JoinSet::new();
        for post in posts.clone() {
            let fanout = Arc::clone(&fanout);
            starts.spawn(async move { fanout.distribute(post) });
        }
        while let Some(started) = starts.join_next().await {
            started.unwrap();
        }
        fanout.flush().await;

        for follower in 1..=4 {
            let stored = feed_ids(&store, follower);
            assert_eq!(stored.len(), posts.len());

            let cached = feeds.get(Id::from(follower)).await;
            assert!(
                cached.windows(2).all(|pair| pair[0].cursor() > pair[1].cursor()),
                "feed of {follower} not strictly sorted: {:?}",
                ids(&cached)
            );
            assert_eq!(ids(&cached), stored);
        }
    }
}
