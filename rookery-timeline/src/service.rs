use crate::{
    cache::RecentCache,
    error::TimelineError,
    fanout::{FanoutConfig, FanoutService},
    paginator::{CursorPaginator, Page, PageSource, within},
    store::{AuthoredPosts, FeedPosts, FeedStore, FollowGraph, PostStore},
};
use rookery_common::{
    cursor::Cursor,
    model::{
        Id,
        post::{CreatePost, Post, PostContent, PostMarker},
        user::UserMarker,
    },
};
use std::{cmp::Reverse, num::NonZeroUsize, sync::Arc, time::Duration};
use tokio::{task::JoinSet, time::Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct TimelineConfig {
    /// Posts kept per author and per feed.
    pub cache_capacity: NonZeroUsize,
    /// Authors, and separately feeds, with a cache entry at any one time.
    pub cache_max_owners: u64,
    /// Upper bound for store work during one read. `None` waits indefinitely.
    pub read_timeout: Option<Duration>,
    pub fanout: FanoutConfig,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: NonZeroUsize::new(200).unwrap_or(NonZeroUsize::MIN),
            cache_max_owners: 100_000,
            read_timeout: Some(Duration::from_secs(2)),
            fanout: FanoutConfig::default(),
        }
    }
}

/// Reading and writing the posts of single authors.
pub trait PostTimeline: Send + Sync {
    /// One page of `owner`'s posts strictly older than `cursor`, newest first.
    fn page(
        &self,
        owner: Id<UserMarker>,
        cursor: Option<Cursor>,
        page_size: NonZeroUsize,
    ) -> impl Future<Output = Result<Page, TimelineError>> + Send;

    /// Like [`page`](Self::page), but gives up on the store after `timeout` instead
    /// of the configured read timeout.
    fn page_within(
        &self,
        owner: Id<UserMarker>,
        cursor: Option<Cursor>,
        page_size: NonZeroUsize,
        timeout: Duration,
    ) -> impl Future<Output = Result<Page, TimelineError>> + Send;

    fn get(
        &self,
        id: Id<PostMarker>,
    ) -> impl Future<Output = Result<Option<Post>, TimelineError>> + Send;

    /// Stores a new post and schedules its fanout.
    fn create(
        &self,
        author: Id<UserMarker>,
        content: PostContent,
    ) -> impl Future<Output = Result<Post, TimelineError>> + Send;
}

/// Author timelines and reader feeds over one store.
pub struct Timeline<S> {
    store: Arc<S>,
    posts: CursorPaginator<AuthoredPosts<S>>,
    feeds: CursorPaginator<FeedPosts<S>>,
    fanout: FanoutService<S>,
    read_timeout: Option<Duration>,
}

impl<S: PostStore + FeedStore + FollowGraph> Timeline<S> {
    #[must_use]
    pub fn new(store: Arc<S>, config: TimelineConfig) -> Self {
        let feed_cache = Arc::new(RecentCache::new(
            config.cache_capacity,
            config.cache_max_owners,
        ));

        Self {
            posts: CursorPaginator::new(
                Arc::new(RecentCache::new(
                    config.cache_capacity,
                    config.cache_max_owners,
                )),
                AuthoredPosts(Arc::clone(&store)),
            ),
            feeds: CursorPaginator::new(Arc::clone(&feed_cache), FeedPosts(Arc::clone(&store))),
            fanout: FanoutService::new(Arc::clone(&store), feed_cache, config.fanout),
            read_timeout: config.read_timeout,
            store,
        }
    }

    #[must_use]
    pub fn fanout(&self) -> &FanoutService<S> {
        &self.fanout
    }

    /// One page of `reader`'s feed: the materialized entries merged with the newest
    /// posts of followed authors whose posts are not fanned out.
    ///
    /// A partial feed page carries the materialized posts found so far but points
    /// `next_cursor` back at `cursor`. Its posts are a preview: callers that collect
    /// pages must drop them and request the same window again.
    pub async fn feed(
        &self,
        reader: Id<UserMarker>,
        cursor: Option<Cursor>,
        page_size: NonZeroUsize,
    ) -> Result<Page, TimelineError> {
        self.feed_until(reader, cursor, page_size, self.deadline())
            .await
    }

    /// Like [`feed`](Self::feed), bounded by `timeout` instead of the configured
    /// read timeout.
    pub async fn feed_within(
        &self,
        reader: Id<UserMarker>,
        cursor: Option<Cursor>,
        page_size: NonZeroUsize,
        timeout: Duration,
    ) -> Result<Page, TimelineError> {
        self.feed_until(reader, cursor, page_size, Some(Instant::now() + timeout))
            .await
    }

    async fn feed_until(
        &self,
        reader: Id<UserMarker>,
        cursor: Option<Cursor>,
        page_size: NonZeroUsize,
        deadline: Option<Instant>,
    ) -> Result<Page, TimelineError> {
        let materialized = self
            .feeds
            .page_until(reader, cursor, page_size, deadline)
            .await?;
        if materialized.partial {
            return Ok(Page::partial(materialized.items, cursor, PageSource::Merged));
        }

        let ceiling = self.fanout.config().ceiling;
        let Some(heavy) = within(deadline, self.store.heavy_followees(reader, ceiling)).await
        else {
            warn!(%reader, "Deadline passed while looking up pulled authors");
            return Ok(Page::partial(materialized.items, cursor, PageSource::Merged));
        };
        let heavy: Vec<_> = heavy?.into_iter().filter(|author| *author != reader).collect();
        if heavy.is_empty() {
            return Ok(materialized);
        }

        let Some(pulled) = within(deadline, self.pull(&heavy, cursor, page_size)).await else {
            warn!(%reader, authors = heavy.len(), "Deadline passed while pulling authors, returning partial feed");
            return Ok(Page::partial(materialized.items, cursor, PageSource::Merged));
        };
        let (pulled, more_pulled) = pulled?;

        let mut items = materialized.items;
        items.extend(pulled);
        items.sort_unstable_by_key(|post| Reverse(post.cursor()));
        items.dedup_by_key(|post| post.id);

        let cut = items.len() > page_size.get();
        items.truncate(page_size.get());
        let exhausted = materialized.exhausted && !more_pulled && !cut;
        debug!(%reader, authors = heavy.len(), returned = items.len(), exhausted, "Merged feed page");

        Ok(Page::complete(items, exhausted, PageSource::Merged))
    }

    /// Waits until every fanout started so far has finished.
    pub async fn flush_fanout(&self) {
        self.fanout.flush().await;
    }

    pub async fn shutdown(&self) {
        self.fanout.shutdown().await;
    }

    /// Reads `page_size + 1` posts after `cursor` from each author.
    ///
    /// Also returns whether any author has posts beyond those returned.
    async fn pull(
        &self,
        authors: &[Id<UserMarker>],
        cursor: Option<Cursor>,
        page_size: NonZeroUsize,
    ) -> Result<(Vec<Post>, bool), TimelineError> {
        let mut queries = JoinSet::new();
        for &author in authors {
            let store = Arc::clone(&self.store);
            queries.spawn(async move {
                PostStore::range_query(&*store, author, cursor, page_size.get() + 1).await
            });
        }

        let mut posts = Vec::new();
        let mut more = false;
        while let Some(rows) = queries.join_next().await {
            let mut rows = rows??;
            more |= rows.len() > page_size.get();
            rows.truncate(page_size.get());
            posts.append(&mut rows);
        }

        Ok((posts, more))
    }

    fn deadline(&self) -> Option<Instant> {
        self.read_timeout.map(|timeout| Instant::now() + timeout)
    }
}

impl<S: PostStore + FeedStore + FollowGraph> PostTimeline for Timeline<S> {
    async fn page(
        &self,
        owner: Id<UserMarker>,
        cursor: Option<Cursor>,
        page_size: NonZeroUsize,
    ) -> Result<Page, TimelineError> {
        Ok(self
            .posts
            .page_until(owner, cursor, page_size, self.deadline())
            .await?)
    }

    async fn page_within(
        &self,
        owner: Id<UserMarker>,
        cursor: Option<Cursor>,
        page_size: NonZeroUsize,
        timeout: Duration,
    ) -> Result<Page, TimelineError> {
        let deadline = Instant::now() + timeout;
        Ok(self
            .posts
            .page_until(owner, cursor, page_size, Some(deadline))
            .await?)
    }

    async fn get(&self, id: Id<PostMarker>) -> Result<Option<Post>, TimelineError> {
        Ok(self.store.fetch(id).await?)
    }

    async fn create(
        &self,
        author: Id<UserMarker>,
        content: PostContent,
    ) -> Result<Post, TimelineError> {
        // Held until the post is in the cache and queued for fanout, so readers
        // never see a gap and fanouts start in creation order.
        let mut writer = self.posts.cache().lock(author).await;
        let post = self.store.append(CreatePost { author, content }).await?;
        if let Err(error) = writer.write_through(post.clone(), self.posts.source()).await {
            warn!(%author, post_id = %post.id, %error, "Could not write post through to cache");
        }
        self.fanout.distribute(post.clone());
        drop(writer);

        info!(%author, post_id = %post.id, "Created post");
        Ok(post)
    }
}
