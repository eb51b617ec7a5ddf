use crate::{
    cursor::Cursor,
    model::{Id, post::Post, post::PostMarker, user::UserMarker},
};
use time::UtcDateTime;

/// A post as it appears in one reader's materialized feed.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub struct FeedEntry {
    pub feed_owner: Id<UserMarker>,
    pub post_id: Id<PostMarker>,
    pub created_at: UtcDateTime,
}

impl FeedEntry {
    #[must_use]
    pub fn for_post(feed_owner: Id<UserMarker>, post: &Post) -> Self {
        Self {
            feed_owner,
            post_id: post.id,
            created_at: post.created_at,
        }
    }

    #[must_use]
    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.created_at, self.post_id)
    }
}
