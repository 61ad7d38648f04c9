use axum::http::{HeaderMap, header};
use cookie::Cookie;
use uuid::Uuid;

/// Caller identity derived from the session cookie.
///
/// The id is a UUID v5 of the raw session id, so the same session maps to the
/// same user across connections without any server side session store.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionUser {
    pub id: Uuid,
    pub session_id: String,
}

impl SessionUser {
    pub fn from_session_id(session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        Self {
            id: Uuid::new_v5(&Uuid::NAMESPACE_URL, session_id.as_bytes()),
            session_id,
        }
    }

    /// Reads the session named `cookie_name` from the request cookies.
    pub fn from_headers(headers: &HeaderMap, cookie_name: &str) -> Option<Self> {
        extract_session_cookie(headers, cookie_name).map(Self::from_session_id)
    }
}

fn extract_session_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| Cookie::split_parse(value).flatten())
        .find(|cookie| cookie.name() == name && !cookie.value().is_empty())
        .map(|cookie| cookie.value().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn same_session_maps_to_same_user() {
        let a = SessionUser::from_session_id("abc");
        let b = SessionUser::from_session_id("abc");
        let c = SessionUser::from_session_id("abd");

        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn reads_named_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; session=s-1"),
        );

        let user = SessionUser::from_headers(&headers, "session").unwrap();
        assert_eq!(user.session_id, "s-1");
        assert!(SessionUser::from_headers(&headers, "other").is_none());
    }

    #[test]
    fn empty_cookie_is_anonymous() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("session="));

        assert!(SessionUser::from_headers(&headers, "session").is_none());
    }
}
