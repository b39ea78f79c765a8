//! `IdentityProvider` over the Supabase auth API
//!
//! Endpoints used, all under `/auth/v1`:
//! - `POST token?grant_type=password` and `POST token?grant_type=refresh_token`
//! - `POST signup`, `POST logout`, `POST recover?redirect_to=...`
//! - `GET user` and `PUT user`
//! - `authorize?provider=...` (built locally, visited by the browser)

use identity::{
    AuthGrant, AuthorizationOptions, BoxFuture, IdentityProvider, Principal, PrincipalChange,
    PrincipalChangeKind, PrincipalMetadata, ProviderError, Result, SignUpOutcome, TokenPair,
};
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use url::Url;

use crate::client::SupabaseClient;
use crate::error::ApiFailure;

/// Body of a successful token grant.
#[derive(Debug, Deserialize)]
struct SessionResponse {
    access_token: String,
    refresh_token: String,
    user: Principal,
}

impl SessionResponse {
    fn into_grant(self) -> AuthGrant {
        AuthGrant {
            principal: self.user,
            tokens: TokenPair::new(self.access_token, self.refresh_token),
        }
    }
}

impl SupabaseClient {
    fn auth_endpoint(&self, path: &str) -> Result<Url> {
        self.endpoint(&format!("auth/v1/{path}"))
            .map_err(|e| ProviderError::api(format!("invalid auth endpoint {path}: {e}")))
    }

    /// Send an auth request and decode a JSON success body.
    async fn auth_call<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Network(format!("auth request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiFailure::parse(status.as_u16(), &body).into_provider_error());
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::Decode(format!("invalid auth response: {e}")))
    }

    /// Send an auth request whose success body is irrelevant.
    async fn auth_call_unit(&self, request: RequestBuilder) -> Result<()> {
        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Network(format!("auth request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiFailure::parse(status.as_u16(), &body).into_provider_error());
        }
        Ok(())
    }

    async fn token_grant(&self, grant_type: &str, body: serde_json::Value) -> Result<AuthGrant> {
        let mut url = self.auth_endpoint("token")?;
        url.query_pairs_mut().append_pair("grant_type", grant_type);
        let session: SessionResponse = self
            .auth_call(self.request(Method::POST, url, None).json(&body))
            .await?;
        Ok(session.into_grant())
    }

    async fn fetch_user(&self, access_token: &str) -> Result<Principal> {
        let url = self.auth_endpoint("user")?;
        self.auth_call(self.request(Method::GET, url, Some(access_token)))
            .await
    }

    async fn refresh_grant(&self, refresh_token: &str) -> Result<AuthGrant> {
        self.token_grant(
            "refresh_token",
            serde_json::json!({ "refresh_token": refresh_token }),
        )
        .await
    }
}

/// Interpret a sign-up body: a full session when the project auto-confirms,
/// otherwise the bare user (top level or under `user`).
///
/// Signing up an already confirmed email returns a user with no identities
/// instead of an error; that is reported as `user_already_exists`.
fn parse_sign_up(body: serde_json::Value) -> Result<SignUpOutcome> {
    if body.get("access_token").is_some() {
        let session: SessionResponse = serde_json::from_value(body)
            .map_err(|e| ProviderError::Decode(format!("invalid sign-up session: {e}")))?;
        let grant = session.into_grant();
        return Ok(SignUpOutcome {
            principal: grant.principal,
            tokens: Some(grant.tokens),
        });
    }

    let user = match body.get("user") {
        Some(user) if user.is_object() => user.clone(),
        _ => body,
    };
    let no_identities = user
        .get("identities")
        .and_then(|i| i.as_array())
        .is_some_and(|i| i.is_empty());
    if no_identities {
        return Err(ProviderError::Api {
            status: Some(422),
            code: Some("user_already_exists".into()),
            message: "User already registered".into(),
        });
    }

    let principal: Principal = serde_json::from_value(user)
        .map_err(|e| ProviderError::Decode(format!("invalid sign-up user: {e}")))?;
    Ok(SignUpOutcome {
        principal,
        tokens: None,
    })
}

impl IdentityProvider for SupabaseClient {
    fn id(&self) -> &str {
        "supabase"
    }

    fn sign_in_with_password<'a>(
        &'a self,
        email: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, Result<AuthGrant>> {
        Box::pin(async move {
            let grant = self
                .token_grant(
                    "password",
                    serde_json::json!({ "email": email, "password": password }),
                )
                .await?;
            self.install(grant.principal.clone(), grant.tokens.clone())
                .await;
            debug!(principal_id = %grant.principal.id, "password grant succeeded");
            self.emit(
                PrincipalChangeKind::SignedIn,
                Some(grant.principal.clone()),
                Some(grant.tokens.clone()),
            );
            Ok(grant)
        })
    }

    fn sign_up<'a>(
        &'a self,
        email: &'a str,
        password: &'a str,
        metadata: &'a PrincipalMetadata,
    ) -> BoxFuture<'a, Result<SignUpOutcome>> {
        Box::pin(async move {
            let url = self.auth_endpoint("signup")?;
            let body: serde_json::Value = self
                .auth_call(self.request(Method::POST, url, None).json(&serde_json::json!({
                    "email": email,
                    "password": password,
                    "data": metadata,
                })))
                .await?;

            let outcome = parse_sign_up(body)?;
            if let Some(tokens) = &outcome.tokens {
                self.install(outcome.principal.clone(), tokens.clone())
                    .await;
                self.emit(
                    PrincipalChangeKind::SignedIn,
                    Some(outcome.principal.clone()),
                    Some(tokens.clone()),
                );
            }
            Ok(outcome)
        })
    }

    fn sign_out(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            // The local session goes first; a failed revoke must not leave
            // this client acting as the user.
            let previous = self.session.write().await.take();
            self.emit(PrincipalChangeKind::SignedOut, None, None);

            let Some(previous) = previous else {
                return Ok(());
            };
            let url = self.auth_endpoint("logout")?;
            match self
                .auth_call_unit(self.request(
                    Method::POST,
                    url,
                    Some(previous.tokens.access_token.as_str()),
                ))
                .await
            {
                Ok(()) => Ok(()),
                // Session already expired or revoked server-side.
                Err(ProviderError::Api {
                    status: Some(401 | 403 | 404),
                    ..
                }) => Ok(()),
                Err(e) => {
                    warn!(error = %e, "remote sign-out failed");
                    Err(e)
                }
            }
        })
    }

    fn refresh_session<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<TokenPair>> {
        Box::pin(async move {
            let grant = self.refresh_grant(refresh_token).await?;
            self.install(grant.principal.clone(), grant.tokens.clone())
                .await;
            self.emit(
                PrincipalChangeKind::TokenRefreshed,
                Some(grant.principal),
                Some(grant.tokens.clone()),
            );
            Ok(grant.tokens)
        })
    }

    fn current_principal(&self) -> BoxFuture<'_, Result<Option<Principal>>> {
        Box::pin(async move {
            let Some(access_token) = self.access_token().await else {
                return Ok(None);
            };
            let principal = self.fetch_user(&access_token).await?;
            if let Some(current) = self.session.write().await.as_mut() {
                current.principal = principal.clone();
            }
            Ok(Some(principal))
        })
    }

    fn authorization_url<'a>(
        &'a self,
        provider: &'a str,
        redirect_url: &'a str,
        options: &'a AuthorizationOptions,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            // This client never opens a browser itself, so the URL is all
            // there is to return either way.
            if !options.skip_browser_redirect {
                debug!("browser redirect requested; returning URL for the caller to open");
            }
            let mut url = self.auth_endpoint("authorize")?;
            {
                let mut query = url.query_pairs_mut();
                query
                    .append_pair("provider", provider)
                    .append_pair("redirect_to", redirect_url);
                for (key, value) in &options.query_params {
                    query.append_pair(key, value);
                }
            }
            Ok(url.to_string())
        })
    }

    fn set_session<'a>(&'a self, tokens: &'a TokenPair) -> BoxFuture<'a, Result<AuthGrant>> {
        Box::pin(async move {
            let grant = match self.fetch_user(&tokens.access_token).await {
                Ok(principal) => AuthGrant {
                    principal,
                    tokens: tokens.clone(),
                },
                Err(ProviderError::Api {
                    status: Some(401 | 403),
                    ..
                }) => {
                    debug!("access token rejected, refreshing before installing session");
                    self.refresh_grant(&tokens.refresh_token).await?
                }
                Err(e) => return Err(e),
            };

            self.install(grant.principal.clone(), grant.tokens.clone())
                .await;
            info!(principal_id = %grant.principal.id, "session installed");
            self.emit(
                PrincipalChangeKind::SignedIn,
                Some(grant.principal.clone()),
                Some(grant.tokens.clone()),
            );
            Ok(grant)
        })
    }

    fn principal_changes(&self) -> broadcast::Receiver<PrincipalChange> {
        self.subscribe()
    }

    fn reset_password_for_email<'a>(
        &'a self,
        email: &'a str,
        redirect_url: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut url = self.auth_endpoint("recover")?;
            url.query_pairs_mut().append_pair("redirect_to", redirect_url);
            self.auth_call_unit(
                self.request(Method::POST, url, None)
                    .json(&serde_json::json!({ "email": email })),
            )
            .await
        })
    }

    fn update_principal_metadata<'a>(
        &'a self,
        metadata: &'a PrincipalMetadata,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let access_token = self.access_token().await.ok_or(ProviderError::NoSession)?;
            let url = self.auth_endpoint("user")?;
            let principal: Principal = self
                .auth_call(
                    self.request(Method::PUT, url, Some(access_token.as_str()))
                        .json(&serde_json::json!({ "data": metadata })),
                )
                .await?;

            let tokens = {
                let mut session = self.session.write().await;
                session.as_mut().map(|current| {
                    current.principal = principal.clone();
                    current.tokens.clone()
                })
            };
            self.emit(PrincipalChangeKind::UserUpdated, Some(principal), tokens);
            Ok(())
        })
    }
}
