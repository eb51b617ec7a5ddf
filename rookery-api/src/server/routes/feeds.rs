use crate::server::{
    AppTimeline, Result, ServerError, ServerRouter,
    identity::Requester,
    json::Json,
    page::{PageQuery, PageResponse},
    policy::{Gatekeeper, Operation},
};
use axum::extract::{Query, State};
use axum_extra::{
    extract::WithRejection,
    routing::{RouterExt, TypedPath},
};
use serde::Deserialize;
use std::sync::Arc;

pub fn routes() -> ServerRouter {
    ServerRouter::new().typed_get(get_feed)
}

#[derive(TypedPath, Deserialize)]
#[typed_path("/feed", rejection(ServerError))]
struct FeedPath();

/// The requester's feed, including pulled posts of widely followed authors.
async fn get_feed(
    FeedPath(): FeedPath,
    State(timeline): State<Arc<AppTimeline>>,
    State(gatekeeper): State<Arc<Gatekeeper>>,
    requester: Requester,
    WithRejection(Query(query), _): WithRejection<Query<PageQuery>, ServerError>,
) -> Result<Json<PageResponse>> {
    gatekeeper.admit(Operation::ListFeed, &requester).await?;
    let reader = requester.authenticated(Operation::ListFeed)?;

    let (cursor, page_size) = (query.cursor()?, query.page_size()?);
    let page = match query.timeout()? {
        Some(timeout) => {
            timeline
                .feed_within(reader, cursor, page_size, timeout)
                .await?
        }
        None => timeline.feed(reader, cursor, page_size).await?,
    };

    Ok(Json(page.into()))
}
