//! Credential profile of the caller
//!
//! The `X-API-Token` header selects a configured profile; requests without
//! a known token run as the anonymous profile.

use std::convert::Infallible;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use crate::config::CredentialProfile;
use crate::state::AppState;

pub const API_TOKEN_HEADER: &str = "x-api-token";

/// Extracted credential profile
#[derive(Debug, Clone)]
pub struct Profile(pub CredentialProfile);

#[async_trait]
impl FromRequestParts<AppState> for Profile {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(API_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|t| !t.is_empty());

        Ok(Profile(state.settings().profile_for(token)))
    }
}
