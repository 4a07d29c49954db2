//! OAuth2 identity provider: password grant, refresh grant, user info

use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use oauth2::basic::{
    BasicErrorResponse, BasicRevocationErrorResponse, BasicTokenIntrospectionResponse,
    BasicTokenType,
};
use oauth2::{
    AuthUrl, ClientId, ClientSecret, ExtraTokenFields, RefreshToken, RequestTokenError,
    ResourceOwnerPassword, ResourceOwnerUsername, Scope, StandardRevocableToken,
    StandardTokenResponse, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::provider::{
    ErrorCode, IdentityProvider, ProviderError, ProviderResult, RefreshedTokens, SignInResponse,
};
use super::tokens::SessionTokens;
use crate::config::ProviderSettings;

/// OAuth error codes that mean "another step is needed", not "rejected".
const CHALLENGE_CODES: &[&str] = &["mfa_required", "interaction_required", "new_password_required"];

/// Token response fields beyond the OAuth2 core set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

impl ExtraTokenFields for IdTokenFields {}

type IdTokenResponse = StandardTokenResponse<IdTokenFields, BasicTokenType>;

type ProviderClient = oauth2::Client<
    BasicErrorResponse,
    IdTokenResponse,
    BasicTokenType,
    BasicTokenIntrospectionResponse,
    StandardRevocableToken,
    BasicRevocationErrorResponse,
>;

type TokenError = RequestTokenError<oauth2::reqwest::Error<reqwest::Error>, BasicErrorResponse>;

/// Identity provider speaking OAuth2 to a token endpoint.
pub struct OAuthProvider {
    client: ProviderClient,
    http: reqwest::Client,
    userinfo_url: String,
    scopes: Vec<String>,
    timeout: Duration,
}

impl OAuthProvider {
    /// Build the provider from settings.
    pub fn new(settings: &ProviderSettings, timeout: Duration) -> Result<Self> {
        let auth_url =
            AuthUrl::new(settings.authorize_url.clone()).context("Invalid provider authorize_url")?;
        let token_url =
            TokenUrl::new(settings.token_url.clone()).context("Invalid provider token_url")?;

        let client = ProviderClient::new(
            ClientId::new(settings.client_id.clone()),
            settings.client_secret.clone().map(ClientSecret::new),
            auth_url,
            Some(token_url),
        );

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            http,
            userinfo_url: settings.userinfo_url.clone(),
            scopes: settings.scopes.clone(),
            timeout,
        })
    }

    fn scopes(&self) -> impl Iterator<Item = Scope> + '_ {
        self.scopes.iter().cloned().map(Scope::new)
    }

    async fn with_timeout<T, F>(&self, what: &str, fut: F) -> ProviderResult<T>
    where
        F: std::future::Future<Output = ProviderResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("{} timed out after {:?}", what, self.timeout);
                Err(ProviderError::new(
                    ErrorCode::Timeout,
                    format!("{} timed out", what),
                ))
            }
        }
    }
}

/// Split a token endpoint failure into a challenge or a provider error.
fn classify_token_error(err: TokenError) -> std::result::Result<SignInResponse, ProviderError> {
    match err {
        RequestTokenError::ServerResponse(resp) => {
            let wire = resp.error().to_string();
            if CHALLENGE_CODES.contains(&wire.as_str()) {
                return Ok(SignInResponse::Challenge {
                    name: wire,
                    session: None,
                });
            }
            let message = resp
                .error_description()
                .cloned()
                .unwrap_or_else(|| wire.clone());
            Err(ProviderError::new(ErrorCode::from_wire(&wire), message))
        }
        RequestTokenError::Request(e) => {
            Err(ProviderError::new(ErrorCode::Network, e.to_string()))
        }
        RequestTokenError::Parse(e, _body) => Err(ProviderError::new(
            ErrorCode::Other("invalid_response".into()),
            format!("Failed to parse token response: {}", e),
        )),
        RequestTokenError::Other(msg) => {
            Err(ProviderError::new(ErrorCode::Other("unknown".into()), msg))
        }
    }
}

fn token_error(err: TokenError) -> ProviderError {
    match classify_token_error(err) {
        Ok(SignInResponse::Challenge { name, .. }) => ProviderError::new(
            ErrorCode::Other(name.clone()),
            format!("Unexpected challenge: {}", name),
        ),
        Ok(SignInResponse::Tokens(_)) => {
            ProviderError::new(ErrorCode::Other("unknown".into()), "Unexpected token response")
        }
        Err(e) => e,
    }
}

/// Map a user-info failure body/status onto an error code.
fn userinfo_error(status: reqwest::StatusCode, body: &str) -> ProviderError {
    let wire = serde_json::from_str::<JsonValue>(body).ok().and_then(|v| {
        v.get("error")
            .or_else(|| v.get("__type"))
            .and_then(|e| e.as_str())
            .map(String::from)
    });

    let code = match wire {
        Some(w) => match ErrorCode::from_wire(&w) {
            // An unknown code on a 401 is still a rejected credential.
            ErrorCode::Other(_) if status == reqwest::StatusCode::UNAUTHORIZED => {
                ErrorCode::NotAuthorized
            }
            code => code,
        },
        None if status == reqwest::StatusCode::UNAUTHORIZED => ErrorCode::NotAuthorized,
        None if status == reqwest::StatusCode::TOO_MANY_REQUESTS => ErrorCode::TooManyRequests,
        None => ErrorCode::Other(format!("http_{}", status.as_u16())),
    };
    ProviderError::new(code, format!("user info HTTP {}: {}", status.as_u16(), body))
}

impl IdentityProvider for OAuthProvider {
    fn password_sign_in<'a>(
        &'a self,
        username: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, ProviderResult<SignInResponse>> {
        async move {
            tracing::debug!("Requesting password grant");
            let username = ResourceOwnerUsername::new(username.to_string());
            let password = ResourceOwnerPassword::new(password.to_string());

            self.with_timeout("Password sign-in", async {
                let response = match self
                    .client
                    .exchange_password(&username, &password)
                    .add_scopes(self.scopes())
                    .request_async(oauth2::reqwest::async_http_client)
                    .await
                {
                    Ok(r) => r,
                    Err(e) => return classify_token_error(e),
                };

                let refresh_token = response
                    .refresh_token()
                    .map(|t| t.secret().to_string())
                    .ok_or_else(|| {
                        ProviderError::new(
                            ErrorCode::Other("invalid_response".into()),
                            "Token response missing refresh_token (is offline_access granted?)",
                        )
                    })?;
                let id_token = response.extra_fields().id_token.clone().ok_or_else(|| {
                    ProviderError::new(
                        ErrorCode::Other("invalid_response".into()),
                        "Token response missing id_token (is the openid scope granted?)",
                    )
                })?;

                Ok(SignInResponse::Tokens(SessionTokens {
                    access_token: response.access_token().secret().to_string(),
                    id_token,
                    refresh_token,
                }))
            })
            .await
        }
        .boxed()
    }

    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, ProviderResult<RefreshedTokens>> {
        async move {
            tracing::debug!("Requesting refresh grant");
            let refresh_token = RefreshToken::new(refresh_token.to_string());

            self.with_timeout("Token refresh", async {
                let response = self
                    .client
                    .exchange_refresh_token(&refresh_token)
                    .add_scopes(self.scopes())
                    .request_async(oauth2::reqwest::async_http_client)
                    .await
                    .map_err(token_error)?;

                Ok::<_, ProviderError>(RefreshedTokens {
                    access_token: response.access_token().secret().to_string(),
                    id_token: response.extra_fields().id_token.clone(),
                    refresh_token: response.refresh_token().map(|t| t.secret().to_string()),
                })
            })
            .await
        }
        .boxed()
    }

    fn get_user<'a>(
        &'a self,
        access_token: &'a str,
    ) -> BoxFuture<'a, ProviderResult<Vec<(String, JsonValue)>>> {
        async move {
            tracing::debug!("GET {}", self.userinfo_url);

            self.with_timeout("User info", async {
                let resp = self
                    .http
                    .get(&self.userinfo_url)
                    .bearer_auth(access_token)
                    .send()
                    .await
                    .map_err(|e| {
                        let code = if e.is_timeout() {
                            ErrorCode::Timeout
                        } else {
                            ErrorCode::Network
                        };
                        ProviderError::new(code, e.to_string())
                    })?;

                let status = resp.status();
                let body = resp
                    .text()
                    .await
                    .map_err(|e| ProviderError::new(ErrorCode::Network, e.to_string()))?;
                if !status.is_success() {
                    return Err(userinfo_error(status, &body));
                }

                match serde_json::from_str::<JsonValue>(&body) {
                    Ok(JsonValue::Object(map)) => Ok(map.into_iter().collect()),
                    Ok(_) => Err(ProviderError::new(
                        ErrorCode::Other("invalid_response".into()),
                        "User info is not a JSON object",
                    )),
                    Err(e) => Err(ProviderError::new(
                        ErrorCode::Other("invalid_response".into()),
                        format!("Failed to parse user info: {}", e),
                    )),
                }
            })
            .await
        }
        .boxed()
    }
}
