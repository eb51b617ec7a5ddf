//! Seams to the persistent side of the system.
//!
//! Every range query returns posts strictly older than `from` (when given),
//! sorted by `(created_at desc, id desc)`, at most `limit` of them.

use crate::error::StoreError;
use rookery_common::{
    cursor::Cursor,
    model::{
        Id,
        feed::FeedEntry,
        post::{CreatePost, Post, PostMarker},
        user::UserMarker,
    },
};
use std::sync::Arc;

pub trait PostStore: Send + Sync + 'static {
    /// Durably stores a new post, assigning its id and creation time.
    fn append(&self, post: CreatePost) -> impl Future<Output = Result<Post, StoreError>> + Send;

    fn fetch(
        &self,
        id: Id<PostMarker>,
    ) -> impl Future<Output = Result<Option<Post>, StoreError>> + Send;

    fn range_query(
        &self,
        author: Id<UserMarker>,
        from: Option<Cursor>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Post>, StoreError>> + Send;
}

pub trait FeedStore: Send + Sync + 'static {
    /// Inserts the entry unless `(feed_owner, post_id)` already exists.
    ///
    /// Returns whether a new row was written.
    fn insert(&self, entry: FeedEntry) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn feed_range_query(
        &self,
        feed_owner: Id<UserMarker>,
        from: Option<Cursor>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Post>, StoreError>> + Send;
}

/// The follower-list provider.
pub trait FollowGraph: Send + Sync + 'static {
    fn follower_count(
        &self,
        user: Id<UserMarker>,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    fn followers(
        &self,
        user: Id<UserMarker>,
    ) -> impl Future<Output = Result<Vec<Id<UserMarker>>, StoreError>> + Send;

    /// Users followed by `reader` that have more than `ceiling` followers.
    fn heavy_followees(
        &self,
        reader: Id<UserMarker>,
        ceiling: u64,
    ) -> impl Future<Output = Result<Vec<Id<UserMarker>>, StoreError>> + Send;
}

/// An ordered, per-owner sequence of posts that a cache can sit in front of.
pub trait TimelineSource: Send + Sync + 'static {
    fn range_query(
        &self,
        owner: Id<UserMarker>,
        from: Option<Cursor>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Post>, StoreError>> + Send;
}

/// Posts keyed by their author.
pub struct AuthoredPosts<S>(pub Arc<S>);

/// Posts keyed by the reader whose feed they were fanned out into.
pub struct FeedPosts<S>(pub Arc<S>);

impl<S: PostStore> TimelineSource for AuthoredPosts<S> {
    async fn range_query(
        &self,
        owner: Id<UserMarker>,
        from: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<Post>, StoreError> {
        PostStore::range_query(&*self.0, owner, from, limit).await
    }
}

impl<S: FeedStore> TimelineSource for FeedPosts<S> {
    async fn range_query(
        &self,
        owner: Id<UserMarker>,
        from: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<Post>, StoreError> {
        self.0.feed_range_query(owner, from, limit).await
    }
}

impl<S> Clone for AuthoredPosts<S> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<S> Clone for FeedPosts<S> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}
