use axum::http::{header::AUTHORIZATION, HeaderMap};

use crate::config::GatewayConfig;
use crate::errors::AppError;

const BEARER_PREFIX: &str = "Bearer ";

/// Bearer-token checks for the public API and the admin routes.
#[derive(Debug, Clone)]
pub struct ApiKeyRegistry {
    api_key: Option<String>,
    admin_key: String,
}

impl ApiKeyRegistry {
    pub fn new(api_key: Option<String>, admin_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.filter(|key| !key.is_empty()),
            admin_key: admin_key.into(),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(config.api_key.clone(), config.admin_key.clone())
    }

    /// A registry without an API key lets every request through.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<(), AppError> {
        let Some(expected) = self.api_key.as_deref() else {
            return Ok(());
        };

        let header = authorization(headers).ok_or_else(|| {
            AppError::Unauthorized("Missing authentication information".to_owned())
        })?;
        let token = header.strip_prefix(BEARER_PREFIX).ok_or_else(|| {
            AppError::Unauthorized("Invalid authentication format".to_owned())
        })?;
        if token != expected {
            return Err(AppError::Unauthorized("Invalid API key".to_owned()));
        }
        Ok(())
    }

    pub fn authorize_admin(&self, headers: &HeaderMap) -> Result<(), AppError> {
        let token = authorization(headers)
            .and_then(|header| header.strip_prefix(BEARER_PREFIX))
            .ok_or_else(|| AppError::Unauthorized("Unauthorized".to_owned()))?;
        if self.admin_key.is_empty() || token != self.admin_key {
            return Err(AppError::Forbidden("Forbidden".to_owned()));
        }
        Ok(())
    }
}

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;
    use crate::errors::ErrorCode;

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).expect("header"),
        );
        headers
    }

    #[test]
    fn missing_api_key_disables_auth() {
        let registry = ApiKeyRegistry::new(Some(String::new()), "admin");
        assert!(registry.authenticate(&HeaderMap::new()).is_ok());
    }

    #[test]
    fn api_key_must_match() {
        let registry = ApiKeyRegistry::new(Some("sk-test".to_owned()), "admin");
        assert!(registry.authenticate(&bearer("sk-test")).is_ok());

        let error = registry.authenticate(&bearer("sk-other")).expect_err("wrong key");
        assert_eq!(error.code(), ErrorCode::Unauthorized);

        let mut basic = HeaderMap::new();
        basic.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        let error = registry.authenticate(&basic).expect_err("wrong scheme");
        assert_eq!(error.to_string(), "Invalid authentication format");
    }

    #[test]
    fn admin_key_distinguishes_missing_from_wrong() {
        let registry = ApiKeyRegistry::new(None, "admin-secret");
        assert_eq!(
            registry
                .authorize_admin(&HeaderMap::new())
                .expect_err("missing")
                .code(),
            ErrorCode::Unauthorized
        );
        assert_eq!(
            registry
                .authorize_admin(&bearer("nope"))
                .expect_err("wrong")
                .code(),
            ErrorCode::Forbidden
        );
        assert!(registry.authorize_admin(&bearer("admin-secret")).is_ok());
    }
}
