use crate::server::{
    AppTimeline, Result, ServerError, ServerRouter,
    identity::Requester,
    json::{Created, Json},
    page::{PageQuery, PageResponse},
    policy::{Gatekeeper, Operation},
};
use axum::extract::{Query, State};
use axum_extra::{
    extract::WithRejection,
    routing::{RouterExt, TypedPath},
};
use rookery_common::model::{
    Id,
    post::{Post, PostContent, PostMarker},
    user::UserMarker,
};
use rookery_timeline::PostTimeline;
use serde::Deserialize;
use std::sync::Arc;

pub fn routes() -> ServerRouter {
    ServerRouter::new()
        .typed_get(get_post)
        .typed_post(create_post)
        .typed_get(list_user_posts)
}

#[derive(TypedPath, Deserialize)]
#[typed_path("/posts/{id}", rejection(ServerError))]
struct GetPostPath {
    id: Id<PostMarker>,
}

async fn get_post(
    GetPostPath { id }: GetPostPath,
    State(timeline): State<Arc<AppTimeline>>,
    State(gatekeeper): State<Arc<Gatekeeper>>,
    requester: Requester,
) -> Result<Json<Post>> {
    gatekeeper.admit(Operation::GetPost, &requester).await?;

    let post = timeline
        .get(id)
        .await?
        .ok_or(ServerError::PostByIdNotFound(id))?;

    Ok(Json(post))
}

#[derive(TypedPath, Deserialize)]
#[typed_path("/posts/create", rejection(ServerError))]
struct CreatePostPath();

#[derive(Clone, Eq, PartialEq, Debug, Hash, Deserialize)]
struct CreatePostBody {
    content: PostContent,
}

async fn create_post(
    CreatePostPath(): CreatePostPath,
    State(timeline): State<Arc<AppTimeline>>,
    State(gatekeeper): State<Arc<Gatekeeper>>,
    requester: Requester,
    Json(body): Json<CreatePostBody>,
) -> Result<Created<Post>> {
    gatekeeper.admit(Operation::CreatePost, &requester).await?;
    let author = requester.authenticated(Operation::CreatePost)?;

    let post = timeline.create(author, body.content).await?;

    Ok(Created(post))
}

#[derive(TypedPath, Deserialize)]
#[typed_path("/users/{id}/posts", rejection(ServerError))]
struct ListUserPostsPath {
    id: Id<UserMarker>,
}

async fn list_user_posts(
    ListUserPostsPath { id }: ListUserPostsPath,
    State(timeline): State<Arc<AppTimeline>>,
    State(gatekeeper): State<Arc<Gatekeeper>>,
    requester: Requester,
    WithRejection(Query(query), _): WithRejection<Query<PageQuery>, ServerError>,
) -> Result<Json<PageResponse>> {
    gatekeeper.admit(Operation::ListPosts, &requester).await?;

    let (cursor, page_size) = (query.cursor()?, query.page_size()?);
    let page = match query.timeout()? {
        Some(timeout) => timeline.page_within(id, cursor, page_size, timeout).await?,
        None => timeline.page(id, cursor, page_size).await?,
    };

    Ok(Json(page.into()))
}
