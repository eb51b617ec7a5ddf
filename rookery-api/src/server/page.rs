use crate::server::ServerError;
use rookery_common::{cursor::Cursor, model::post::Post};
use rookery_timeline::Page;
use serde::{Deserialize, Serialize};
use std::{num::NonZeroUsize, time::Duration};

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;
pub const MAX_TIMEOUT_MS: u64 = 10_000;

/// `?cursor=&page_size=&timeout_ms=` of listing endpoints.
#[derive(Clone, Eq, PartialEq, Debug, Default, Hash, Deserialize)]
pub struct PageQuery {
    pub cursor: Option<String>,
    pub page_size: Option<usize>,
    /// Overrides the server's read timeout for this request.
    pub timeout_ms: Option<u64>,
}

impl PageQuery {
    pub fn cursor(&self) -> Result<Option<Cursor>, ServerError> {
        self.cursor
            .as_deref()
            .filter(|token| !token.is_empty())
            .map(str::parse::<Cursor>)
            .transpose()
            .map_err(ServerError::InvalidCursor)
    }

    pub fn page_size(&self) -> Result<NonZeroUsize, ServerError> {
        let page_size = self.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        NonZeroUsize::new(page_size)
            .filter(|page_size| page_size.get() <= MAX_PAGE_SIZE)
            .ok_or(ServerError::InvalidPageSize(page_size))
    }

    pub fn timeout(&self) -> Result<Option<Duration>, ServerError> {
        match self.timeout_ms {
            Some(timeout_ms) if timeout_ms > MAX_TIMEOUT_MS => {
                Err(ServerError::InvalidTimeout(timeout_ms))
            }
            timeout_ms => Ok(timeout_ms.map(Duration::from_millis)),
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Hash, Serialize)]
pub struct PageResponse {
    pub results: Vec<Post>,
    pub next_cursor: Option<String>,
    pub has_next_page: bool,
    /// A partial feed page repeats the request cursor; its results are a preview.
    pub partial: bool,
}

impl From<Page> for PageResponse {
    fn from(page: Page) -> Self {
        Self {
            next_cursor: page.next_cursor.map(|cursor| cursor.to_token()),
            has_next_page: !page.exhausted,
            partial: page.partial,
            results: page.items,
        }
    }
}
