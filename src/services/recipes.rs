//! Recipe service — create, browse, search, delete, with photo upload.
//!
//! DESIGN
//! ======
//! Recipes are plain rows plus an optional photo in the object store. A
//! create uploads the photo first and stores its public URL on the row, so
//! a row never references an object that is not already durable. Ownership
//! is checked client-side before a delete; the backend enforces whatever
//! additional policy it has.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::info;
use uuid::Uuid;

use crate::backend::{ApiError, DataApi, Direction, ObjectStore, Query};
use crate::event::{Data, ErrorCode};

use super::auth::SessionHandle;

pub const RECIPES_TABLE: &str = "recetas";

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub photo_url: Option<String>,
    pub author_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Recipe {
    #[must_use]
    pub fn from_row(row: &Data) -> Option<Self> {
        let id = row.get("id").and_then(|v| v.as_str()).and_then(|s| s.parse().ok())?;
        let name = row.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let description = row
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let photo_url = row
            .get("photo_url")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let author_id = row
            .get("author_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(Uuid::nil);
        let created_at = row
            .get("created_at")
            .and_then(|v| v.as_str())
            .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
            .unwrap_or_else(OffsetDateTime::now_utc);

        Some(Self { id, name, description, photo_url, author_id, created_at })
    }
}

/// A photo to attach to a new recipe.
#[derive(Debug, Clone)]
pub struct Photo {
    pub bytes: Vec<u8>,
    pub content_type: String,
    /// File extension without the dot, e.g. `jpg`.
    pub extension: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RecipeError {
    #[error("recipe name is empty")]
    EmptyName,
    #[error("no active session")]
    Unauthenticated,
    #[error("recipe not found: {0}")]
    NotFound(Uuid),
    #[error("recipe {0} belongs to another user")]
    NotOwner(Uuid),
    #[error("backend error: {0}")]
    Backend(#[from] ApiError),
}

impl ErrorCode for RecipeError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::EmptyName => "E_EMPTY_NAME",
            Self::Unauthenticated => "E_UNAUTHENTICATED",
            Self::NotFound(_) => "E_RECIPE_NOT_FOUND",
            Self::NotOwner(_) => "E_NOT_OWNER",
            Self::Backend(_) => "E_BACKEND",
        }
    }
}

// =============================================================================
// SERVICE
// =============================================================================

pub struct RecipeService {
    api: Arc<dyn DataApi>,
    store: Arc<dyn ObjectStore>,
    bucket: String,
    session: SessionHandle,
}

impl RecipeService {
    #[must_use]
    pub fn new(
        api: Arc<dyn DataApi>,
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        session: SessionHandle,
    ) -> Self {
        Self { api, store, bucket: bucket.into(), session }
    }

    /// Create a recipe, uploading the photo first when one is given.
    ///
    /// # Errors
    ///
    /// `EmptyName` for a blank name, `Unauthenticated` without a session;
    /// upload and insert failures pass through.
    pub async fn create(&self, name: &str, description: &str, photo: Option<Photo>) -> Result<Recipe, RecipeError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RecipeError::EmptyName);
        }
        let Some(session) = self.session.current() else {
            return Err(RecipeError::Unauthenticated);
        };

        let photo_url = match photo {
            Some(photo) => {
                let path = format!("{}.{}", Uuid::new_v4(), photo.extension);
                self.store
                    .upload(&self.bucket, &path, photo.bytes, &photo.content_type)
                    .await?;
                Some(self.store.public_url(&self.bucket, &path))
            }
            None => None,
        };

        let mut row = Data::new();
        row.insert("name".into(), serde_json::json!(name));
        row.insert("description".into(), serde_json::json!(description));
        row.insert("author_id".into(), serde_json::json!(session.user_id.to_string()));
        if let Some(url) = &photo_url {
            row.insert("photo_url".into(), serde_json::json!(url));
        }

        let inserted = self.api.insert(RECIPES_TABLE, row).await?;
        let recipe = Recipe::from_row(&inserted)
            .ok_or_else(|| ApiError::Decode("recipe insert returned an unreadable row".into()))?;
        info!(recipe_id = %recipe.id, "recipe created");
        Ok(recipe)
    }

    /// All recipes, newest first.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the query fails.
    pub async fn list(&self) -> Result<Vec<Recipe>, RecipeError> {
        let query = Query::new(RECIPES_TABLE).order("created_at", Direction::Descending);
        let rows = self.api.select(&query).await?;
        Ok(rows.iter().filter_map(Recipe::from_row).collect())
    }

    /// Case-insensitive name search, newest first. A blank term lists all.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the query fails.
    pub async fn search(&self, term: &str) -> Result<Vec<Recipe>, RecipeError> {
        let term = term.trim();
        if term.is_empty() {
            return self.list().await;
        }
        let query = Query::new(RECIPES_TABLE)
            .ilike("name", format!("%{term}%"))
            .order("created_at", Direction::Descending);
        let rows = self.api.select(&query).await?;
        Ok(rows.iter().filter_map(Recipe::from_row).collect())
    }

    /// Delete the caller's own recipe.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, `NotOwner` when the recipe belongs to
    /// someone else, `Unauthenticated` without a session.
    pub async fn delete(&self, id: Uuid) -> Result<(), RecipeError> {
        let Some(session) = self.session.current() else {
            return Err(RecipeError::Unauthenticated);
        };

        let row = match self.api.fetch_by_id(RECIPES_TABLE, id, "*").await {
            Ok(row) => row,
            Err(ApiError::NotFound { .. }) => return Err(RecipeError::NotFound(id)),
            Err(e) => return Err(RecipeError::Backend(e)),
        };
        let owner = row
            .get("author_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Uuid>().ok());
        if owner != Some(session.user_id) {
            return Err(RecipeError::NotOwner(id));
        }

        self.api.delete(RECIPES_TABLE, id).await?;
        info!(recipe_id = %id, "recipe deleted");
        Ok(())
    }
}

#[cfg(test)]
#[path = "recipes_test.rs"]
mod tests;
