use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
};
use axum_extra::extract::cookie::CookieJar;

use crate::routes::auth::claims::Claims;
use crate::utils::jwt::{decode_jwt, JwtKeyProvider};

pub const AUTH_COOKIE: &str = "auth_token";

#[derive(Debug, PartialEq)]
pub struct AuthSession(pub Claims);

fn bearer_token(parts: &Parts) -> Option<String> {
    let raw = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    raw.strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

impl<S> FromRequestParts<S> for AuthSession
where
    S: JwtKeyProvider + Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        let token = match jar.get(AUTH_COOKIE) {
            Some(cookie) => cookie.value().to_string(),
            None => bearer_token(parts).ok_or(StatusCode::UNAUTHORIZED)?,
        };

        let data = decode_jwt(
            &token,
            state.jwt_keys(),
            state.jwt_issuer(),
            state.jwt_audience(),
        )
        .map_err(|_| StatusCode::UNAUTHORIZED)?;

        Ok(AuthSession(data.claims))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::jwt::{create_jwt, JwtKeys};
    use axum::http::{header, Request};
    use std::time::{SystemTime, UNIX_EPOCH};

    struct Keys(JwtKeys);

    impl JwtKeyProvider for Keys {
        fn jwt_keys(&self) -> &JwtKeys {
            &self.0
        }
        fn jwt_issuer(&self) -> &str {
            "test-issuer"
        }
        fn jwt_audience(&self) -> &str {
            "test-audience"
        }
    }

    fn provider() -> Keys {
        Keys(JwtKeys::from_secret("0123456789abcdef0123456789abcdef").unwrap())
    }

    fn token(keys: &Keys) -> String {
        let exp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 3600;
        let claims = Claims {
            id: "1d7a0c7e-8a8e-4c1e-9f43-3b2f5a0e9c01".into(),
            email: "writer@example.com".into(),
            exp: exp as usize,
            iss: String::new(),
            aud: String::new(),
        };
        create_jwt(claims, keys.jwt_keys(), "test-issuer", "test-audience").unwrap()
    }

    #[tokio::test]
    async fn cookie_token_is_accepted() {
        let keys = provider();
        let request = Request::builder()
            .uri("/")
            .header(header::COOKIE, format!("{AUTH_COOKIE}={}", token(&keys)))
            .body(())
            .unwrap();
        let mut parts = request.into_parts().0;

        let session = AuthSession::from_request_parts(&mut parts, &keys)
            .await
            .unwrap();
        assert_eq!(session.0.email, "writer@example.com");
        assert!(session.0.user_id().is_some());
    }

    #[tokio::test]
    async fn bearer_token_is_accepted() {
        let keys = provider();
        let request = Request::builder()
            .uri("/")
            .header(header::AUTHORIZATION, format!("Bearer {}", token(&keys)))
            .body(())
            .unwrap();
        let mut parts = request.into_parts().0;

        assert!(AuthSession::from_request_parts(&mut parts, &keys)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn missing_or_garbage_token_is_unauthorized() {
        let keys = provider();
        let request = Request::builder().uri("/").body(()).unwrap();
        let mut parts = request.into_parts().0;
        assert_eq!(
            AuthSession::from_request_parts(&mut parts, &keys).await,
            Err(StatusCode::UNAUTHORIZED)
        );

        let request = Request::builder()
            .uri("/")
            .header(header::COOKIE, format!("{AUTH_COOKIE}=not.a.jwt"))
            .body(())
            .unwrap();
        let mut parts = request.into_parts().0;
        assert_eq!(
            AuthSession::from_request_parts(&mut parts, &keys).await,
            Err(StatusCode::UNAUTHORIZED)
        );
    }
}
