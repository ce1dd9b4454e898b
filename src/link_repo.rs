use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use rearch::CapsuleHandle;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DbConn, DbErr, EntityTrait, QueryFilter,
    QueryOrder, SqlErr,
    sea_query::{Expr, ExprTrait},
};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::instrument;

use crate::{config::db_conn_capsule, orm::link};

pub const SLUG_LEN: usize = 5;

/// A validated short-link identifier: exactly [`SLUG_LEN`] lowercase hex characters.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Slug(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlugValidationError {
    #[error("slug must be exactly {SLUG_LEN} characters, got {actual}")]
    InvalidLength { actual: usize },
    #[error("slug contains invalid characters: {invalid_chars}")]
    InvalidCharacters { invalid_chars: String },
}

impl Slug {
    /// # Errors
    /// Will return [`Err`] when `value` is not exactly [`SLUG_LEN`]
    /// lowercase hex characters.
    pub fn new(value: String) -> Result<Self, SlugValidationError> {
        let actual = value.chars().count();
        if actual != SLUG_LEN {
            return Err(SlugValidationError::InvalidLength { actual });
        }

        let invalid_chars: String = value
            .chars()
            .filter(|c| !matches!(c, '0'..='9' | 'a'..='f'))
            .collect();
        if !invalid_chars.is_empty() {
            return Err(SlugValidationError::InvalidCharacters { invalid_chars });
        }

        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

/// A link mapping as it exists in the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredLink {
    pub slug: Slug,
    pub original_url: String,
    pub short_url: String,
    pub track_count: i64,
    pub created_at: OffsetDateTime,
}

/// A link mapping about to be inserted; the store assigns the rest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewLink {
    pub slug: Slug,
    pub original_url: String,
    pub short_url: String,
}

#[derive(Debug, Error)]
pub enum SaveLinkError {
    #[error("slug is already taken")]
    SlugTaken,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SaveLinkError {
    fn from_db_err(err: DbErr) -> Self {
        Self::from_parts(err.sql_err(), err)
    }

    // NOTE: split from `from_db_err` so the constraint mapping can be
    // exercised without a live database.
    fn from_parts(sql_err: Option<SqlErr>, source: DbErr) -> Self {
        match sql_err {
            Some(SqlErr::UniqueConstraintViolation(_)) => Self::SlugTaken,
            _ => Self::Internal(source.into()),
        }
    }
}

pub fn link_repository_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> Arc<dyn LinkRepository> {
    let db = get.as_ref(db_conn_capsule).clone();
    Arc::new(LinkRepositoryImpl { db })
}

#[async_trait]
pub trait LinkRepository: Send + Sync {
    /// Inserts one mapping, relying on the store's unique constraint on `slug`.
    async fn insert(&self, link: NewLink) -> Result<StoredLink, SaveLinkError>;

    /// All mappings, in insertion order. Unbounded.
    async fn list(&self) -> anyhow::Result<Vec<StoredLink>>;

    async fn find_by_slug(&self, slug: &Slug) -> anyhow::Result<Option<StoredLink>>;

    /// Removes matching rows and returns what was removed.
    async fn delete_by_slug(&self, slug: &Slug) -> anyhow::Result<Vec<StoredLink>>;

    /// Atomically bumps the visit counter; returns rows affected.
    async fn record_visit(&self, slug: &Slug) -> anyhow::Result<u64>;
}

struct LinkRepositoryImpl {
    db: DbConn,
}

#[async_trait]
impl LinkRepository for LinkRepositoryImpl {
    #[instrument(skip(self))]
    async fn insert(&self, new_link: NewLink) -> Result<StoredLink, SaveLinkError> {
        let to_insert = link::ActiveModel {
            slug: Set(new_link.slug.into_inner()),
            original_url: Set(new_link.original_url),
            shorten_url: Set(new_link.short_url),
            track_count: Set(0),
            created_at: Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };

        match to_insert.insert(&self.db).await {
            Ok(model) => model.try_into().map_err(SaveLinkError::Internal),
            Err(err) => Err(SaveLinkError::from_db_err(err)),
        }
    }

    #[instrument(skip(self))]
    async fn list(&self) -> anyhow::Result<Vec<StoredLink>> {
        link::Entity::find()
            .order_by_asc(link::Column::Id)
            .all(&self.db)
            .await?
            .into_iter()
            .map(StoredLink::try_from)
            .collect()
    }

    #[instrument(skip(self))]
    async fn find_by_slug(&self, slug: &Slug) -> anyhow::Result<Option<StoredLink>> {
        // The unique constraint should make ties impossible; the ordering
        // pins the tie-break to the most recent row regardless.
        link::Entity::find()
            .filter(link::Column::Slug.eq(slug.as_str()))
            .order_by_desc(link::Column::Id)
            .one(&self.db)
            .await?
            .map(StoredLink::try_from)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn delete_by_slug(&self, slug: &Slug) -> anyhow::Result<Vec<StoredLink>> {
        // Single DELETE .. RETURNING statement: what comes back is exactly
        // what was removed, even under concurrent writers.
        link::Entity::delete_many()
            .filter(link::Column::Slug.eq(slug.as_str()))
            .exec_with_returning(&self.db)
            .await?
            .into_iter()
            .map(StoredLink::try_from)
            .collect()
    }

    #[instrument(skip(self))]
    async fn record_visit(&self, slug: &Slug) -> anyhow::Result<u64> {
        let update = link::Entity::update_many()
            .col_expr(
                link::Column::TrackCount,
                Expr::col(link::Column::TrackCount).add(1),
            )
            .filter(link::Column::Slug.eq(slug.as_str()))
            .exec(&self.db)
            .await?;
        Ok(update.rows_affected)
    }
}

impl TryFrom<link::Model> for StoredLink {
    type Error = anyhow::Error;

    fn try_from(model: link::Model) -> Result<Self, Self::Error> {
        Ok(Self {
            slug: Slug::new(model.slug).context("Stored slug failed validation")?,
            original_url: model.original_url,
            short_url: model.shorten_url,
            track_count: model.track_count,
            created_at: model.created_at,
        })
    }
}
