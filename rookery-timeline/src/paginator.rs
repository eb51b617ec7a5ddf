//! Cursor pagination over a [`RecentCache`] backed by a [`TimelineSource`].
//!
//! The cache only ever holds a prefix of an owner's timeline that is contiguous
//! with the newest post. A page is served from it only when the whole page lies
//! inside that prefix; every other page is read from the source in one ordered
//! range query, so nothing is skipped or repeated at the cache/store boundary.

use crate::{cache::RecentCache, error::StoreError, store::TimelineSource};
use rookery_common::{
    cursor::Cursor,
    model::{Id, post::Post, user::UserMarker},
};
use std::{num::NonZeroUsize, sync::Arc};
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum PageSource {
    Cache,
    Store,
    /// Materialized feed merged with pulled author timelines.
    Merged,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Page {
    pub items: Vec<Post>,
    /// Where the following page starts. `None` for an empty first page.
    pub next_cursor: Option<Cursor>,
    /// No posts exist beyond this page.
    pub exhausted: bool,
    /// The deadline expired before the page was complete.
    ///
    /// Author pages continue after their last item. Merged feed pages point
    /// `next_cursor` at the request cursor instead, so their items must not be
    /// kept when following it.
    pub partial: bool,
    pub served_from: PageSource,
}

impl Page {
    pub(crate) fn complete(items: Vec<Post>, exhausted: bool, served_from: PageSource) -> Self {
        Self {
            next_cursor: items.last().map(Post::cursor),
            items,
            exhausted,
            partial: false,
            served_from,
        }
    }

    pub(crate) fn partial(
        items: Vec<Post>,
        next_cursor: Option<Cursor>,
        served_from: PageSource,
    ) -> Self {
        Self {
            items,
            next_cursor,
            exhausted: false,
            partial: true,
            served_from,
        }
    }
}

/// Runs `future` to completion, or until `deadline` passes.
pub(crate) async fn within<F: Future>(deadline: Option<Instant>, future: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, future).await.ok(),
        None => Some(future.await),
    }
}

/// The cached posts strictly after `cursor`, if the cache covers that position.
fn window_after(cached: &[Post], cursor: Option<Cursor>) -> Option<&[Post]> {
    let Some(cursor) = cursor else {
        return Some(cached);
    };
    let tail = cached.last()?;

    (cursor >= tail.cursor())
        .then(|| &cached[cached.partition_point(|post| post.cursor() >= cursor)..])
}

pub struct CursorPaginator<Src> {
    cache: Arc<RecentCache>,
    source: Src,
}

impl<Src: TimelineSource> CursorPaginator<Src> {
    #[must_use]
    pub fn new(cache: Arc<RecentCache>, source: Src) -> Self {
        Self { cache, source }
    }

    #[must_use]
    pub fn cache(&self) -> &RecentCache {
        &self.cache
    }

    #[must_use]
    pub fn source(&self) -> &Src {
        &self.source
    }

    pub async fn page(
        &self,
        owner: Id<UserMarker>,
        cursor: Option<Cursor>,
        page_size: NonZeroUsize,
    ) -> Result<Page, StoreError> {
        self.page_until(owner, cursor, page_size, None).await
    }

    /// Like [`page`](Self::page), but gives up on the source at `deadline`.
    ///
    /// An expired deadline yields the cached posts after `cursor` (possibly none),
    /// which are always a gap-free start of the requested page.
    pub async fn page_until(
        &self,
        owner: Id<UserMarker>,
        cursor: Option<Cursor>,
        page_size: NonZeroUsize,
        deadline: Option<Instant>,
    ) -> Result<Page, StoreError> {
        let page_size = page_size.get();

        if !self.cache.is_loaded(owner) {
            match within(deadline, self.cache.warm(owner, &self.source)).await {
                Some(Ok(())) => {}
                Some(Err(error)) => warn!(%owner, %error, "Could not warm cache entry"),
                None => debug!(%owner, "Deadline passed while warming cache entry"),
            }
        }

        let cached = self.cache.get(owner).await;
        let window = window_after(&cached, cursor);
        if let Some(window) = window
            && window.len() >= page_size
        {
            debug!(%owner, page_size, "Serving page from cache");
            return Ok(Page::complete(
                window[..page_size].to_vec(),
                false,
                PageSource::Cache,
            ));
        }

        let query = self.source.range_query(owner, cursor, page_size + 1);
        let Some(rows) = within(deadline, query).await else {
            let items = window.map(<[Post]>::to_vec).unwrap_or_default();
            warn!(%owner, returned = items.len(), "Range query timed out, returning partial page");
            let next_cursor = items.last().map(Post::cursor).or(cursor);
            return Ok(Page::partial(items, next_cursor, PageSource::Cache));
        };

        let mut rows = rows?;
        let exhausted = rows.len() <= page_size;
        rows.truncate(page_size);
        debug!(%owner, page_size, returned = rows.len(), exhausted, "Serving page from store");

        Ok(Page::complete(rows, exhausted, PageSource::Store))
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        cache::RecentCache,
        memory::MemoryStore,
        paginator::{CursorPaginator, PageSource},
        store::{AuthoredPosts, PostStore},
    };
    use rookery_common::{
        cursor::Cursor,
        model::{
            Id,
            post::{CreatePost, Post, PostContent},
            user::UserMarker,
        },
    };
    use std::{num::NonZeroUsize, sync::Arc, time::Duration};
    use tokio::time::Instant;

    const AUTHOR: u64 = 1;

    fn size(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    fn paginator(
        store: &Arc<MemoryStore>,
        capacity: usize,
    ) -> CursorPaginator<AuthoredPosts<MemoryStore>> {
        CursorPaginator::new(
            Arc::new(RecentCache::new(size(capacity), 100)),
            AuthoredPosts(Arc::clone(store)),
        )
    }

    /// Appends posts the way the write path does: store first, then cache.
    async fn create_posts(
        store: &MemoryStore,
        paginator: &CursorPaginator<AuthoredPosts<MemoryStore>>,
        count: usize,
    ) -> Vec<Post> {
        let author = Id::<UserMarker>::from(AUTHOR);
        let mut posts = Vec::new();
        for number in 1..=count {
            let mut writer = paginator.cache().lock(author).await;
            let post = store
                .append(CreatePost {
                    author,
                    content: PostContent::new(format!("post {number}")).unwrap(),
                })
                .await
                .unwrap();
            writer
                .write_through(post.clone(), paginator.source())
                .await
                .unwrap();
            posts.push(post);
        }
        posts
    }

    /// Reference pagination straight through the store.
    async fn store_pages(store: &MemoryStore, page_size: usize) -> Vec<Post> {
        let mut all = Vec::new();
        let mut cursor: Option<Cursor> = None;
        loop {
            let page = store
                .range_query(Id::from(AUTHOR), cursor, page_size)
                .await
                .unwrap();
            if page.is_empty() {
                return all;
            }
            cursor = page.last().map(Post::cursor);
            all.extend(page);
        }
    }

    async fn hybrid_pages(
        paginator: &CursorPaginator<AuthoredPosts<MemoryStore>>,
        page_size: usize,
    ) -> Vec<Post> {
        let mut all = Vec::new();
        let mut cursor = None;
        loop {
            let page = paginator
                .page(Id::from(AUTHOR), cursor, size(page_size))
                .await
                .unwrap();
            assert!(page.items.len() <= page_size);
            all.extend(page.items);
            if page.exhausted {
                return all;
            }
            cursor = page.next_cursor;
            assert!(cursor.is_some(), "a non-exhausted page must continue");
        }
    }

    #[tokio::test]
    async fn twelve_posts_with_five_cached() {
        let store = Arc::new(MemoryStore::new());
        let paginator = paginator(&store, 5);
        let posts = create_posts(&store, &paginator, 12).await;
        // posts[i] is post number i + 1.
        let numbered = |numbers: &[usize]| -> Vec<Post> {
            numbers.iter().map(|number| posts[number - 1].clone()).collect()
        };

        assert_eq!(
            paginator.cache().get(Id::from(AUTHOR)).await.to_vec(),
            numbered(&[12, 11, 10, 9, 8])
        );

        let queries = store.range_queries();
        let first = paginator
            .page(Id::from(AUTHOR), None, size(3))
            .await
            .unwrap();
        assert_eq!(store.range_queries(), queries);
        assert_eq!(first.items, numbered(&[12, 11, 10]));
        assert_eq!(first.next_cursor, Some(posts[9].cursor()));
        assert_eq!(first.served_from, PageSource::Cache);
        assert!(!first.exhausted);

        // Only 9 and 8 are cached after 10, so the full page comes from the store.
        let second = paginator
            .page(Id::from(AUTHOR), first.next_cursor, size(3))
            .await
            .unwrap();
        assert_eq!(second.items, numbered(&[9, 8, 7]));
        assert_eq!(second.served_from, PageSource::Store);
        assert!(!second.exhausted);

        let two_cached = paginator
            .page(Id::from(AUTHOR), first.next_cursor, size(2))
            .await
            .unwrap();
        assert_eq!(two_cached.items, numbered(&[9, 8]));
        assert_eq!(two_cached.served_from, PageSource::Cache);
    }

    #[tokio::test]
    async fn short_cache_falls_back_for_first_page() {
        let store = Arc::new(MemoryStore::new());
        let paginator = paginator(&store, 5);
        let posts = create_posts(&store, &paginator, 2).await;

        let page = paginator
            .page(Id::from(AUTHOR), None, size(3))
            .await
            .unwrap();

        assert_eq!(page.items, vec![posts[1].clone(), posts[0].clone()]);
        assert_eq!(page.served_from, PageSource::Store);
        assert!(page.exhausted);
    }

    #[tokio::test]
    async fn cursor_beyond_cache_horizon_reads_store() {
        let store = Arc::new(MemoryStore::new());
        let paginator = paginator(&store, 3);
        let posts = create_posts(&store, &paginator, 8).await;

        let page = paginator
            .page(Id::from(AUTHOR), Some(posts[3].cursor()), size(2))
            .await
            .unwrap();

        assert_eq!(page.items, vec![posts[2].clone(), posts[1].clone()]);
        assert_eq!(page.served_from, PageSource::Store);
        assert!(!page.exhausted);
    }

    #[tokio::test]
    async fn last_page_is_exhausted() {
        let store = Arc::new(MemoryStore::new());
        let paginator = paginator(&store, 2);
        let posts = create_posts(&store, &paginator, 4).await;

        let page = paginator
            .page(Id::from(AUTHOR), Some(posts[2].cursor()), size(2))
            .await
            .unwrap();
        assert_eq!(page.items, vec![posts[1].clone(), posts[0].clone()]);
        assert!(page.exhausted);

        let empty = paginator
            .page(Id::from(AUTHOR), page.next_cursor, size(2))
            .await
            .unwrap();
        assert!(empty.items.is_empty());
        assert!(empty.exhausted);
        assert_eq!(empty.next_cursor, None);
    }

    #[tokio::test]
    async fn hybrid_pagination_matches_store_pagination() {
        for clock_step in [0, 1] {
            for capacity in [1, 3, 5, 20] {
                let store = Arc::new(MemoryStore::with_clock_step(
                    time::Duration::milliseconds(clock_step),
                ));
                let warm = paginator(&store, capacity);
                create_posts(&store, &warm, 17).await;
                // Never written through, warmed on first read instead.
                let cold = paginator(&store, capacity);

                for page_size in [1, 2, 4, 7, 17, 30] {
                    let expected = store_pages(&store, page_size).await;
                    assert_eq!(expected.len(), 17);
                    assert_eq!(hybrid_pages(&warm, page_size).await, expected);
                    assert_eq!(hybrid_pages(&cold, page_size).await, expected);
                }
            }
        }
    }

    #[tokio::test]
    async fn expired_deadline_returns_cached_prefix() {
        let store = Arc::new(MemoryStore::new());
        let paginator = paginator(&store, 3);
        let posts = create_posts(&store, &paginator, 6).await;
        store.delay_range_queries(Some(Duration::from_secs(30)));

        let deadline = Instant::now() + Duration::from_millis(20);
        let page = paginator
            .page_until(Id::from(AUTHOR), None, size(5), Some(deadline))
            .await
            .unwrap();

        assert!(page.partial);
        assert!(!page.exhausted);
        assert_eq!(
            page.items,
            vec![posts[5].clone(), posts[4].clone(), posts[3].clone()]
        );
        assert_eq!(page.next_cursor, Some(posts[3].cursor()));
    }

    #[tokio::test]
    async fn store_failure_fails_the_read() {
        let store = Arc::new(MemoryStore::new());
        let paginator = paginator(&store, 3);
        let posts = create_posts(&store, &paginator, 6).await;
        store.fail_range_queries(1);

        let result = paginator
            .page(Id::from(AUTHOR), Some(posts[1].cursor()), size(2))
            .await;

        assert!(result.is_err());
    }
}
