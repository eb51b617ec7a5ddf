use crate::server::ServerRouter;
use axum::Router;

mod feeds;
mod posts;

pub fn routes() -> ServerRouter {
    Router::new().merge(posts::routes()).merge(feeds::routes())
}
