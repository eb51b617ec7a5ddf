use crate::server::ServerError;
use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::request::Parts,
};
use axum_extra::TypedHeader;
use headers::{Header, HeaderName, HeaderValue};
use rookery_common::model::{Id, user::UserMarker};
use std::net::{IpAddr, SocketAddr};

static X_AUTHENTICATED_USER: HeaderName = HeaderName::from_static("x-authenticated-user");

/// The user id asserted by the authenticating proxy in front of the server.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub struct XAuthenticatedUser(pub Id<UserMarker>);

impl Header for XAuthenticatedUser {
    fn name() -> &'static HeaderName {
        &X_AUTHENTICATED_USER
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        if values.next().is_some() {
            return Err(headers::Error::invalid());
        }

        value
            .to_str()
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(|id| Self(Id::from(id)))
            .ok_or_else(headers::Error::invalid)
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        values.extend(std::iter::once(HeaderValue::from(u64::from(self.0))));
    }
}

/// Who is making a request. Both parts may be unknown.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub struct Requester {
    pub user: Option<Id<UserMarker>>,
    pub address: Option<IpAddr>,
}

impl Requester {
    /// Key for limits applied per user, falling back to the peer address.
    #[must_use]
    pub fn user_or_ip(&self) -> String {
        match (self.user, self.address) {
            (Some(user), _) => format!("user:{user}"),
            (None, Some(address)) => format!("ip:{address}"),
            (None, None) => "anonymous".to_owned(),
        }
    }
}

impl<S> FromRequestParts<S> for Requester
where
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = Option::<TypedHeader<XAuthenticatedUser>>::from_request_parts(parts, state)
            .await
            .map_err(ServerError::InvalidIdentityHeader)?
            .map(|TypedHeader(XAuthenticatedUser(user))| user);

        let address = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(address)| address.ip());

        Ok(Self { user, address })
    }
}

#[cfg(test)]
mod tests {
    use crate::server::identity::{Requester, XAuthenticatedUser};
    use axum::http::{HeaderMap, HeaderValue};
    use headers::HeaderMapExt;
    use rookery_common::model::Id;
    use std::net::{IpAddr, Ipv4Addr};

    fn decode(value: &'static str) -> Option<XAuthenticatedUser> {
        let mut headers = HeaderMap::new();
        headers.insert("x-authenticated-user", HeaderValue::from_static(value));
        headers.typed_get()
    }

    #[test]
    fn header_holds_a_user_id() {
        assert_eq!(decode("42"), Some(XAuthenticatedUser(Id::from(42))));
        assert_eq!(decode(" 7 "), Some(XAuthenticatedUser(Id::from(7))));
        assert_eq!(decode("alice"), None);
        assert_eq!(decode("-1"), None);
    }

    #[test]
    fn header_encodes_back() {
        let mut headers = HeaderMap::new();
        headers.typed_insert(XAuthenticatedUser(Id::from(1234)));

        assert_eq!(headers["x-authenticated-user"], "1234");
    }

    #[test]
    fn rate_key_prefers_the_user() {
        let address = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));

        let user = Requester {
            user: Some(Id::from(5)),
            address,
        };
        let anonymous = Requester {
            user: None,
            address,
        };

        assert_eq!(user.user_or_ip(), "user:5");
        assert_eq!(anonymous.user_or_ip(), "ip:127.0.0.1");
    }
}
