//! REST client for the hosted data API, auth endpoint, and object store.
//!
//! DESIGN
//! ======
//! One reqwest client serves all three HTTP surfaces of the backend:
//! - `/rest/v1/{table}` — PostgREST-style row CRUD with `select=`
//!   projections (embedded joins), `order=`, `limit=`, and column filters.
//! - `/auth/v1` — password-grant sign-in and logout. Token refresh is the
//!   provider's concern and never happens here.
//! - `/storage/v1` — photo upload plus public URL formatting.
//!
//! Every request carries the project `apikey`; the bearer is the signed-in
//! user's access token when present, the anon key otherwise.

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use crate::event::Data;

use super::config::BackendConfig;
use super::{ApiError, AuthApi, AuthSession, AuthToken, DataApi, Direction, Filter, ObjectStore, Query};

pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    token: AuthToken,
}

impl RestClient {
    #[must_use]
    pub fn new(config: &BackendConfig, token: AuthToken) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            token,
        }
    }

    fn bearer(&self) -> String {
        self.token.get().unwrap_or_else(|| self.api_key.clone())
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let response = request
            .header("apikey", &self.api_key)
            .bearer_auth(self.bearer())
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status { status: status.as_u16(), body });
        }
        Ok(response)
    }
}

/// Render a query as a PostgREST query string. `%` wildcards in an `ilike`
/// needle become the `*` the API expects.
pub(crate) fn query_string(query: &Query) -> String {
    let mut parts = Vec::new();

    for filter in &query.filters {
        match filter {
            Filter::Eq(column, value) => parts.push(format!("{column}=eq.{value}")),
            Filter::ILike(column, needle) => {
                parts.push(format!("{column}=ilike.{}", needle.replace('%', "*")));
            }
        }
    }
    if let Some(select) = &query.select {
        parts.push(format!("select={select}"));
    }
    if let Some((column, direction)) = &query.order_by {
        let dir = match direction {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        };
        parts.push(format!("order={column}.{dir}"));
    }
    if let Some(limit) = query.limit {
        parts.push(format!("limit={limit}"));
    }

    parts.join("&")
}

// =============================================================================
// DATA API
// =============================================================================

#[async_trait]
impl DataApi for RestClient {
    async fn insert(&self, table: &str, row: Data) -> Result<Data, ApiError> {
        let response = self
            .send(
                self.http
                    .post(self.table_url(table))
                    .header("Prefer", "return=representation")
                    .json(&row),
            )
            .await?;

        let mut rows: Vec<Data> = response.json().await.map_err(|e| ApiError::Decode(e.to_string()))?;
        rows.pop()
            .ok_or_else(|| ApiError::Decode(format!("insert into {table} returned no row")))
    }

    async fn fetch_by_id(&self, table: &str, id: Uuid, select: &str) -> Result<Data, ApiError> {
        let url = format!("{}?id=eq.{id}&select={select}", self.table_url(table));
        let response = self.send(self.http.get(url)).await?;

        let mut rows: Vec<Data> = response.json().await.map_err(|e| ApiError::Decode(e.to_string()))?;
        rows.pop()
            .ok_or_else(|| ApiError::NotFound { table: table.to_string(), id })
    }

    async fn select(&self, query: &Query) -> Result<Vec<Data>, ApiError> {
        let url = format!("{}?{}", self.table_url(&query.table), query_string(query));
        let response = self.send(self.http.get(url)).await?;
        response.json().await.map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn delete(&self, table: &str, id: Uuid) -> Result<(), ApiError> {
        let url = format!("{}?id=eq.{id}", self.table_url(table));
        self.send(self.http.delete(url)).await?;
        Ok(())
    }
}

// =============================================================================
// AUTH API
// =============================================================================

#[derive(Debug, Deserialize)]
struct TokenUser {
    id: Uuid,
    email: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    user: TokenUser,
}

#[async_trait]
impl AuthApi for RestClient {
    async fn password_sign_in(&self, email: &str, password: &str) -> Result<AuthSession, ApiError> {
        let url = format!("{}/auth/v1/token?grant_type=password", self.base_url);
        let response = self
            .send(
                self.http
                    .post(url)
                    .json(&serde_json::json!({ "email": email, "password": password })),
            )
            .await?;

        let token: TokenResponse = response.json().await.map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(AuthSession {
            user_id: token.user.id,
            email: token.user.email,
            access_token: token.access_token,
        })
    }

    async fn sign_out(&self) -> Result<(), ApiError> {
        let url = format!("{}/auth/v1/logout", self.base_url);
        self.send(self.http.post(url)).await?;
        Ok(())
    }
}

// =============================================================================
// OBJECT STORE
// =============================================================================

#[async_trait]
impl ObjectStore for RestClient {
    async fn upload(&self, bucket: &str, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), ApiError> {
        let url = format!("{}/storage/v1/object/{bucket}/{path}", self.base_url);
        self.send(self.http.post(url).header("Content-Type", content_type).body(bytes))
            .await?;
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/public/{bucket}/{path}", self.base_url)
    }
}

// =============================================================================
// TESTS
// =============================================================================
