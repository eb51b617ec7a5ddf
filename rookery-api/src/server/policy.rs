//! Checks run before each operation reaches the timeline: permission first,
//! then every rate limit of the operation.

use crate::server::identity::Requester;
use rookery_common::model::{Id, user::UserMarker};
use std::{
    collections::HashMap,
    fmt::{self, Display},
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

const MAX_TRACKED_KEYS: usize = 10_000;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum Operation {
    ListPosts,
    GetPost,
    CreatePost,
    ListFeed,
}

impl Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::ListPosts => "list posts",
            Operation::GetPost => "get post",
            Operation::CreatePost => "create post",
            Operation::ListFeed => "list feed",
        };
        f.write_str(name)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum Permission {
    AllowAny,
    Authenticated,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub struct RateLimit {
    pub max_requests: u32,
    pub window: Duration,
}

const fn per(max_requests: u32, window: Duration) -> RateLimit {
    RateLimit {
        max_requests,
        window,
    }
}

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);
const GET_POST_LIMITS: &[RateLimit] = &[per(5, SECOND)];
const CREATE_POST_LIMITS: &[RateLimit] = &[per(1, SECOND), per(5, MINUTE)];

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::ListPosts,
        Operation::GetPost,
        Operation::CreatePost,
        Operation::ListFeed,
    ];

    #[must_use]
    pub fn permission(self) -> Permission {
        match self {
            Operation::ListPosts | Operation::GetPost => Permission::AllowAny,
            Operation::CreatePost | Operation::ListFeed => Permission::Authenticated,
        }
    }

    /// Limits keyed by user, or by peer address for anonymous requests.
    #[must_use]
    pub fn rate_limits(self) -> &'static [RateLimit] {
        match self {
            Operation::GetPost => GET_POST_LIMITS,
            Operation::CreatePost => CREATE_POST_LIMITS,
            Operation::ListPosts | Operation::ListFeed => &[],
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash, Error)]
pub enum PolicyError {
    #[error("Authentication is required to {0}")]
    Unauthenticated(Operation),
    #[error("Too many requests to {0}")]
    RateLimited(Operation),
}

impl Requester {
    pub fn authenticated(&self, operation: Operation) -> Result<Id<UserMarker>, PolicyError> {
        self.user.ok_or(PolicyError::Unauthenticated(operation))
    }
}

#[derive(Debug, Clone)]
struct Window {
    count: u32,
    started: Instant,
}

/// Fixed-window request counter per key.
pub struct RateLimiter {
    limit: RateLimit,
    windows: RwLock<HashMap<String, Window>>,
    max_tracked_keys: usize,
}

impl RateLimiter {
    #[must_use]
    pub fn new(limit: RateLimit) -> Self {
        Self::with_max_tracked_keys(limit, MAX_TRACKED_KEYS)
    }

    #[must_use]
    pub fn with_max_tracked_keys(limit: RateLimit, max_tracked_keys: usize) -> Self {
        Self {
            limit,
            windows: RwLock::default(),
            max_tracked_keys: max_tracked_keys.max(1),
        }
    }

    /// Counts a request for `key`, or returns `false` if the window is full.
    pub async fn check_and_increment(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.write().await;

        if !windows.contains_key(key) && windows.len() >= self.max_tracked_keys {
            windows.retain(|_, window| now.duration_since(window.started) < self.limit.window);
            if windows.len() >= self.max_tracked_keys
                && let Some(oldest) = windows
                    .iter()
                    .min_by_key(|(_, window)| window.started)
                    .map(|(key, _)| key.clone())
            {
                windows.remove(&oldest);
            }
        }

        let window = windows.entry(key.to_owned()).or_insert(Window {
            count: 0,
            started: now,
        });
        if now.duration_since(window.started) >= self.limit.window {
            *window = Window {
                count: 0,
                started: now,
            };
        }
        if window.count >= self.limit.max_requests {
            return false;
        }
        window.count += 1;
        true
    }
}

/// Runs the checks of an operation.
pub struct Gatekeeper {
    limiters: HashMap<Operation, Vec<RateLimiter>>,
}

impl Default for Gatekeeper {
    fn default() -> Self {
        Self::new()
    }
}

impl Gatekeeper {
    #[must_use]
    pub fn new() -> Self {
        let limiters = Operation::ALL
            .into_iter()
            .map(|operation| {
                let limiters = operation
                    .rate_limits()
                    .iter()
                    .copied()
                    .map(RateLimiter::new)
                    .collect();
                (operation, limiters)
            })
            .collect();

        Self { limiters }
    }

    pub async fn admit(&self, operation: Operation, requester: &Requester) -> Result<(), PolicyError> {
        if operation.permission() == Permission::Authenticated {
            requester.authenticated(operation)?;
        }

        let key = requester.user_or_ip();
        for limiter in self.limiters.get(&operation).into_iter().flatten() {
            if !limiter.check_and_increment(&key).await {
                debug!(%operation, %key, "Rate limit exceeded");
                return Err(PolicyError::RateLimited(operation));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::server::{
        identity::Requester,
        policy::{Gatekeeper, Operation, PolicyError, RateLimit, RateLimiter},
    };
    use rookery_common::model::Id;
    use std::{
        net::{IpAddr, Ipv4Addr},
        time::Duration,
    };

    fn anonymous(last_octet: u8) -> Requester {
        Requester {
            user: None,
            address: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet))),
        }
    }

    fn user(id: u64) -> Requester {
        Requester {
            user: Some(Id::from(id)),
            address: None,
        }
    }

    #[tokio::test]
    async fn limiter_blocks_after_max_requests() {
        let limiter = RateLimiter::new(RateLimit {
            max_requests: 3,
            window: Duration::from_secs(60),
        });

        for _ in 0..3 {
            assert!(limiter.check_and_increment("a").await);
        }
        assert!(!limiter.check_and_increment("a").await);
        assert!(limiter.check_and_increment("b").await);
    }

    #[tokio::test]
    async fn limiter_resets_with_the_window() {
        let limiter = RateLimiter::new(RateLimit {
            max_requests: 1,
            window: Duration::from_millis(30),
        });

        assert!(limiter.check_and_increment("a").await);
        assert!(!limiter.check_and_increment("a").await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(limiter.check_and_increment("a").await);
    }

    #[tokio::test]
    async fn limiter_bounds_tracked_keys() {
        let limiter = RateLimiter::with_max_tracked_keys(
            RateLimit {
                max_requests: 1,
                window: Duration::from_secs(60),
            },
            2,
        );

        assert!(limiter.check_and_increment("a").await);
        assert!(limiter.check_and_increment("b").await);
        assert!(limiter.check_and_increment("c").await);
        assert_eq!(limiter.windows.read().await.len(), 2);
    }

    #[tokio::test]
    async fn writes_and_feeds_need_a_user() {
        let gatekeeper = Gatekeeper::new();

        for operation in [Operation::CreatePost, Operation::ListFeed] {
            assert_eq!(
                gatekeeper.admit(operation, &anonymous(1)).await,
                Err(PolicyError::Unauthenticated(operation))
            );
        }
        assert_eq!(gatekeeper.admit(Operation::ListPosts, &anonymous(1)).await, Ok(()));
        assert_eq!(gatekeeper.admit(Operation::ListFeed, &user(1)).await, Ok(()));
    }

    #[tokio::test]
    async fn get_post_is_limited_per_address() {
        let gatekeeper = Gatekeeper::new();

        for _ in 0..5 {
            assert_eq!(gatekeeper.admit(Operation::GetPost, &anonymous(1)).await, Ok(()));
        }
        assert_eq!(
            gatekeeper.admit(Operation::GetPost, &anonymous(1)).await,
            Err(PolicyError::RateLimited(Operation::GetPost))
        );
        assert_eq!(gatekeeper.admit(Operation::GetPost, &anonymous(2)).await, Ok(()));
    }

    #[tokio::test]
    async fn create_post_allows_one_per_second() {
        let gatekeeper = Gatekeeper::new();

        assert_eq!(gatekeeper.admit(Operation::CreatePost, &user(1)).await, Ok(()));
        assert_eq!(
            gatekeeper.admit(Operation::CreatePost, &user(1)).await,
            Err(PolicyError::RateLimited(Operation::CreatePost))
        );
        assert_eq!(gatekeeper.admit(Operation::CreatePost, &user(2)).await, Ok(()));
    }
}
