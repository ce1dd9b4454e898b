use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use rearch::CapsuleHandle;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use tracing::{instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    api::LinkRecord,
    config::base_url_capsule,
    link_repo::{
        LinkRepository, NewLink, SLUG_LEN, SaveLinkError, Slug, SlugValidationError,
        link_repository_capsule,
    },
};

/// Maximum accepted length, in characters, for a submitted URL, matching
/// the dashboard's own input limit but enforced server-side as well.
pub const MAX_URL_LEN: usize = 2048;

/// How many fresh slugs to try before declaring the slug space exhausted.
const SLUG_ATTEMPTS: usize = 5;

#[derive(Debug)]
pub struct Redirect {
    pub url: String,
}

pub fn link_rest_service_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> Arc<dyn LinkRestService> {
    let link_repo = Arc::clone(get.as_ref(link_repository_capsule));
    let base_url = get.as_ref(base_url_capsule).clone();
    Arc::new(LinkRestServiceImpl {
        link_repo,
        base_url,
    })
}

#[async_trait]
pub trait LinkRestService: Send + Sync {
    async fn create_link(&self, url: &str) -> Result<LinkRecord, CreateLinkError>;
    async fn list_links(&self) -> Result<Vec<LinkRecord>, ListLinksError>;
    async fn get_link(&self, code: &str) -> Result<LinkRecord, GetLinkError>;
    async fn delete_link(&self, code: &str) -> Result<LinkRecord, DeleteLinkError>;
    async fn resolve_link(&self, code: &str) -> Result<Redirect, GetLinkError>;
}

#[derive(Debug, Error)]
pub enum InvalidUrlError {
    #[error("failed to parse URL: {0}")]
    Parse(#[from] url::ParseError),
    #[error("unsupported scheme `{scheme}`; only http and https are allowed")]
    UnsupportedScheme { scheme: String },
    #[error("URL exceeds the maximum length of {MAX_URL_LEN} characters")]
    TooLong,
}

#[derive(Debug, Error)]
pub enum CreateLinkError {
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] InvalidUrlError),
    #[error("could not find a free slug after {SLUG_ATTEMPTS} attempts")]
    SlugSpaceExhausted,
    #[error("internal/database error: {0}")]
    Internal(anyhow::Error), // NOTE: no #[from] so we have to be explicit
}

#[derive(Debug, Error)]
pub enum ListLinksError {
    #[error("internal/database error: {0}")]
    Internal(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum GetLinkError {
    #[error("invalid slug: {0}")]
    InvalidSlug(#[from] SlugValidationError),
    #[error("no link found for the given slug")]
    NotFound,
    #[error("internal/database error: {0}")]
    Internal(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum DeleteLinkError {
    #[error("invalid slug: {0}")]
    InvalidSlug(#[from] SlugValidationError),
    #[error("no link found for the given slug")]
    NotFound,
    #[error("internal/database error: {0}")]
    Internal(anyhow::Error),
}

/// Checks that `input` parses as an absolute http(s) URL within the length
/// limit. Purely syntactic; no reachability check.
///
/// # Errors
/// Will return [`Err`] describing the first violated rule.
pub fn validate_url(input: &str) -> Result<(), InvalidUrlError> {
    if input.chars().count() > MAX_URL_LEN {
        return Err(InvalidUrlError::TooLong);
    }
    let parsed = Url::parse(input)?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(InvalidUrlError::UnsupportedScheme {
            scheme: scheme.to_owned(),
        }),
    }
}

#[must_use]
pub fn is_valid_url(input: &str) -> bool {
    validate_url(input).is_ok()
}

/// Produces a [`SLUG_LEN`]-character candidate slug: the leading hex
/// characters of a separator-free v4 UUID.
#[must_use]
pub fn generate_slug() -> String {
    let mut hex = Uuid::new_v4().simple().to_string();
    hex.truncate(SLUG_LEN);
    hex
}

struct LinkRestServiceImpl {
    link_repo: Arc<dyn LinkRepository>,
    base_url: String,
}

#[async_trait]
impl LinkRestService for LinkRestServiceImpl {
    #[instrument(skip(self))]
    async fn create_link(&self, url: &str) -> Result<LinkRecord, CreateLinkError> {
        validate_url(url)?;

        for _ in 0..SLUG_ATTEMPTS {
            let attempt = generate_slug();
            let slug = match Slug::new(attempt.clone()) {
                Ok(slug) => slug,
                Err(err) => {
                    // Only reachable if the generator itself misbehaves.
                    warn!(?attempt, ?err, "Generated an invalid slug");
                    continue;
                }
            };

            let to_insert = NewLink {
                short_url: format!("{}/{}", self.base_url, slug.as_str()),
                original_url: url.to_owned(),
                slug,
            };

            match self.link_repo.insert(to_insert).await {
                Ok(stored) => {
                    return stored
                        .try_into()
                        .context("Failed to convert new link into external format")
                        .map_err(CreateLinkError::Internal);
                }
                Err(SaveLinkError::SlugTaken) => {
                    warn!(?attempt, "Generated slug that was already taken");
                }
                Err(SaveLinkError::Internal(err)) => return Err(CreateLinkError::Internal(err)),
            }
        }

        Err(CreateLinkError::SlugSpaceExhausted)
    }

    #[instrument(skip(self))]
    async fn list_links(&self) -> Result<Vec<LinkRecord>, ListLinksError> {
        self.link_repo
            .list()
            .await
            .map_err(ListLinksError::Internal)?
            .into_iter()
            .map(|stored| {
                stored
                    .try_into()
                    .context("Failed to convert stored link into external format")
            })
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(ListLinksError::Internal)
    }

    #[instrument(skip(self))]
    async fn get_link(&self, code: &str) -> Result<LinkRecord, GetLinkError> {
        let slug = Slug::new(code.to_owned())?;
        match self.link_repo.find_by_slug(&slug).await {
            Ok(Some(stored)) => stored
                .try_into()
                .context("Failed to convert stored link into external format")
                .map_err(GetLinkError::Internal),
            Ok(None) => Err(GetLinkError::NotFound),
            Err(err) => Err(GetLinkError::Internal(err)),
        }
    }

    #[instrument(skip(self))]
    async fn delete_link(&self, code: &str) -> Result<LinkRecord, DeleteLinkError> {
        let slug = Slug::new(code.to_owned())?;
        let mut removed = self
            .link_repo
            .delete_by_slug(&slug)
            .await
            .map_err(DeleteLinkError::Internal)?;

        match removed.pop() {
            Some(stored) => stored
                .try_into()
                .context("Failed to convert deleted link into external format")
                .map_err(DeleteLinkError::Internal),
            None => Err(DeleteLinkError::NotFound),
        }
    }

    #[instrument(skip(self))]
    async fn resolve_link(&self, code: &str) -> Result<Redirect, GetLinkError> {
        let slug = Slug::new(code.to_owned())?;
        let stored = match self.link_repo.find_by_slug(&slug).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return Err(GetLinkError::NotFound),
            Err(err) => return Err(GetLinkError::Internal(err)),
        };

        // A failed counter bump must not block the redirect itself.
        if let Err(err) = self.link_repo.record_visit(&slug).await {
            warn!(?err, "Failed to record visit");
        }

        Ok(Redirect {
            url: stored.original_url,
        })
    }
}

impl TryFrom<crate::link_repo::StoredLink> for LinkRecord {
    type Error = anyhow::Error;

    fn try_from(
        crate::link_repo::StoredLink {
            slug,
            original_url,
            short_url,
            track_count,
            created_at,
        }: crate::link_repo::StoredLink,
    ) -> Result<Self, Self::Error> {
        Ok(Self {
            slug: slug.into_inner(),
            original_url,
            short_url,
            track_count,
            created_at: created_at
                .format(&Rfc3339)
                .context("Failed to format creation timestamp")?,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use mockall::{Sequence, mock, predicate::*};
    use time::OffsetDateTime;

    use crate::link_repo::StoredLink;

    use super::*;

    mock! {
        LinkRepository {}

        #[async_trait]
        impl LinkRepository for LinkRepository {
            async fn insert(&self, link: NewLink) -> Result<StoredLink, SaveLinkError>;
            async fn list(&self) -> anyhow::Result<Vec<StoredLink>>;
            async fn find_by_slug(&self, slug: &Slug) -> anyhow::Result<Option<StoredLink>>;
            async fn delete_by_slug(&self, slug: &Slug) -> anyhow::Result<Vec<StoredLink>>;
            async fn record_visit(&self, slug: &Slug) -> anyhow::Result<u64>;
        }
    }

    const BASE_URL: &str = "http://localhost:3000";

    fn new_service(mock_repo: MockLinkRepository) -> LinkRestServiceImpl {
        LinkRestServiceImpl {
            link_repo: Arc::new(mock_repo),
            base_url: BASE_URL.to_owned(),
        }
    }

    fn new_stored_link(slug: &str, original_url: &str) -> StoredLink {
        StoredLink {
            slug: Slug::new(slug.to_owned()).unwrap(),
            original_url: original_url.to_owned(),
            short_url: format!("{BASE_URL}/{slug}"),
            track_count: 0,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    fn stored_from(new_link: NewLink) -> StoredLink {
        StoredLink {
            slug: new_link.slug,
            original_url: new_link.original_url,
            short_url: new_link.short_url,
            track_count: 0,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_generate_slug_is_lowercase_hex() {
        for _ in 0..100 {
            let candidate = generate_slug();
            assert_eq!(candidate.len(), SLUG_LEN);
            assert!(Slug::new(candidate).is_ok());
        }
    }

    #[test]
    fn test_validate_url_accepts_http_and_https() {
        assert!(is_valid_url("https://example.com/some/path?q=1"));
        assert!(is_valid_url("http://example.com"));
    }

    #[test]
    fn test_validate_url_rejects_garbage() {
        assert!(!is_valid_url("not a url"));
        assert!(matches!(
            validate_url("not a url").unwrap_err(),
            InvalidUrlError::Parse(_)
        ));
    }

    #[test]
    fn test_validate_url_rejects_missing_scheme() {
        assert!(!is_valid_url("example.com"));
    }

    #[test]
    fn test_validate_url_rejects_unsupported_scheme() {
        assert!(matches!(
            validate_url("ftp://example.com/file").unwrap_err(),
            InvalidUrlError::UnsupportedScheme { scheme } if scheme == "ftp"
        ));
    }

    #[test]
    fn test_validate_url_rejects_over_long_input() {
        let long_url = format!("https://example.com/{}", "a".repeat(MAX_URL_LEN));
        assert!(matches!(
            validate_url(&long_url).unwrap_err(),
            InvalidUrlError::TooLong
        ));
    }

    #[test]
    fn test_validate_url_limit_counts_characters_not_bytes() {
        // Two bytes per character: well past the limit in bytes, under it
        // in characters.
        let url = format!("https://example.com/{}", "é".repeat(1200));
        assert!(url.len() > MAX_URL_LEN);
        assert!(is_valid_url(&url));
    }

    #[tokio::test]
    async fn test_create_link_success() {
        let long_url = "https://example.com/long";

        let mut mock_repo = MockLinkRepository::new();
        mock_repo
            .expect_insert()
            .withf(move |new_link| {
                new_link.original_url == long_url
                    && new_link.short_url == format!("{BASE_URL}/{}", new_link.slug.as_str())
            })
            .once()
            .return_once(|new_link| Ok(stored_from(new_link)));

        let record = new_service(mock_repo).create_link(long_url).await.unwrap();
        assert_eq!(record.original_url, long_url);
        assert_eq!(record.slug.len(), SLUG_LEN);
        assert_eq!(record.short_url, format!("{BASE_URL}/{}", record.slug));
        assert_eq!(record.track_count, 0);
    }

    #[tokio::test]
    async fn test_create_link_retries_on_taken_slug() {
        let long_url = "https://example.com/long";

        let mut mock_repo = MockLinkRepository::new();
        let mut seq = Sequence::new();
        mock_repo
            .expect_insert()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(SaveLinkError::SlugTaken));
        mock_repo
            .expect_insert()
            .once()
            .in_sequence(&mut seq)
            .return_once(|new_link| Ok(stored_from(new_link)));

        let record = new_service(mock_repo).create_link(long_url).await.unwrap();
        assert_eq!(record.original_url, long_url);
    }

    #[tokio::test]
    async fn test_create_link_exhausts_slug_attempts() {
        let mut mock_repo = MockLinkRepository::new();
        mock_repo
            .expect_insert()
            .times(SLUG_ATTEMPTS)
            .returning(|_| Err(SaveLinkError::SlugTaken));

        let result = new_service(mock_repo)
            .create_link("https://example.com")
            .await
            .unwrap_err();
        assert!(matches!(result, CreateLinkError::SlugSpaceExhausted));
    }

    #[tokio::test]
    async fn test_create_link_invalid_url() {
        let result = new_service(MockLinkRepository::new())
            .create_link("not a url")
            .await
            .unwrap_err();
        assert!(matches!(
            result,
            CreateLinkError::InvalidUrl(InvalidUrlError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_create_link_missing_scheme() {
        let result = new_service(MockLinkRepository::new())
            .create_link("example.com")
            .await
            .unwrap_err();
        assert!(matches!(result, CreateLinkError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_create_link_db_error_propagates() {
        let mut mock_repo = MockLinkRepository::new();
        mock_repo
            .expect_insert()
            .once()
            .return_once(|_| Err(SaveLinkError::Internal(anyhow::anyhow!("test failure"))));

        let result = new_service(mock_repo)
            .create_link("https://example.com")
            .await
            .unwrap_err();
        assert!(matches!(result, CreateLinkError::Internal(_)));
    }

    #[tokio::test]
    async fn test_list_links_returns_all_records() {
        let mut mock_repo = MockLinkRepository::new();
        mock_repo.expect_list().once().return_once(|| {
            Ok(vec![
                new_stored_link("aaaa1", "https://one.test"),
                new_stored_link("bbbb2", "https://two.test"),
                new_stored_link("cccc3", "https://three.test"),
            ])
        });

        let records = new_service(mock_repo).list_links().await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].slug, "aaaa1");
        assert_eq!(records[2].original_url, "https://three.test");
    }

    #[tokio::test]
    async fn test_list_links_db_error() {
        let mut mock_repo = MockLinkRepository::new();
        mock_repo
            .expect_list()
            .once()
            .return_once(|| Err(anyhow::anyhow!("test error")));

        let result = new_service(mock_repo).list_links().await.unwrap_err();
        assert!(matches!(result, ListLinksError::Internal(_)));
    }

    #[tokio::test]
    async fn test_get_link_success() {
        let slug = Slug::new("abcde".to_owned()).unwrap();
        let stored = new_stored_link("abcde", "https://x.test");

        let mut mock_repo = MockLinkRepository::new();
        mock_repo
            .expect_find_by_slug()
            .with(eq(slug))
            .once()
            .return_once(move |_| Ok(Some(stored)));

        let record = new_service(mock_repo).get_link("abcde").await.unwrap();
        assert_eq!(record.slug, "abcde");
        assert_eq!(record.original_url, "https://x.test");
        assert_eq!(record.track_count, 0);
    }

    #[tokio::test]
    async fn test_get_link_not_found() {
        let mut mock_repo = MockLinkRepository::new();
        mock_repo
            .expect_find_by_slug()
            .once()
            .return_once(|_| Ok(None));

        let result = new_service(mock_repo).get_link("abcde").await.unwrap_err();
        assert!(matches!(result, GetLinkError::NotFound));
    }

    #[tokio::test]
    async fn test_get_link_invalid_slug() {
        let result = new_service(MockLinkRepository::new())
            .get_link("not-a-slug")
            .await
            .unwrap_err();
        assert!(matches!(result, GetLinkError::InvalidSlug(_)));
    }

    #[tokio::test]
    async fn test_get_link_db_error() {
        let mut mock_repo = MockLinkRepository::new();
        mock_repo
            .expect_find_by_slug()
            .once()
            .return_once(|_| Err(anyhow::anyhow!("test error")));

        let result = new_service(mock_repo).get_link("abcde").await.unwrap_err();
        assert!(matches!(result, GetLinkError::Internal(_)));
    }

    #[tokio::test]
    async fn test_delete_link_returns_removed_record() {
        let slug = Slug::new("abcde".to_owned()).unwrap();
        let stored = new_stored_link("abcde", "https://x.test");

        let mut mock_repo = MockLinkRepository::new();
        mock_repo
            .expect_delete_by_slug()
            .with(eq(slug))
            .once()
            .return_once(move |_| Ok(vec![stored]));

        let record = new_service(mock_repo).delete_link("abcde").await.unwrap();
        assert_eq!(record.slug, "abcde");
    }

    #[tokio::test]
    async fn test_delete_link_not_found() {
        let mut mock_repo = MockLinkRepository::new();
        mock_repo
            .expect_delete_by_slug()
            .once()
            .return_once(|_| Ok(Vec::new()));

        let result = new_service(mock_repo)
            .delete_link("abcde")
            .await
            .unwrap_err();
        assert!(matches!(result, DeleteLinkError::NotFound));
    }

    #[tokio::test]
    async fn test_delete_link_invalid_slug() {
        let result = new_service(MockLinkRepository::new())
            .delete_link("ABCDE")
            .await
            .unwrap_err();
        assert!(matches!(result, DeleteLinkError::InvalidSlug(_)));
    }

    #[tokio::test]
    async fn test_resolve_link_redirects_and_records_visit() {
        let slug = Slug::new("abcde".to_owned()).unwrap();
        let stored = new_stored_link("abcde", "https://x.test/landing");

        let mut mock_repo = MockLinkRepository::new();
        mock_repo
            .expect_find_by_slug()
            .with(eq(slug.clone()))
            .once()
            .return_once(move |_| Ok(Some(stored)));
        mock_repo
            .expect_record_visit()
            .with(eq(slug))
            .once()
            .return_once(|_| Ok(1));

        let redirect = new_service(mock_repo).resolve_link("abcde").await.unwrap();
        assert_eq!(redirect.url, "https://x.test/landing");
    }

    #[tokio::test]
    async fn test_resolve_link_redirects_despite_counter_failure() {
        let stored = new_stored_link("abcde", "https://x.test/landing");

        let mut mock_repo = MockLinkRepository::new();
        mock_repo
            .expect_find_by_slug()
            .once()
            .return_once(move |_| Ok(Some(stored)));
        mock_repo
            .expect_record_visit()
            .once()
            .return_once(|_| Err(anyhow::anyhow!("counter down")));

        let redirect = new_service(mock_repo).resolve_link("abcde").await.unwrap();
        assert_eq!(redirect.url, "https://x.test/landing");
    }

    #[tokio::test]
    async fn test_resolve_link_not_found() {
        let mut mock_repo = MockLinkRepository::new();
        mock_repo
            .expect_find_by_slug()
            .once()
            .return_once(|_| Ok(None));

        let result = new_service(mock_repo)
            .resolve_link("abcde")
            .await
            .unwrap_err();
        assert!(matches!(result, GetLinkError::NotFound));
    }

    #[test]
    fn test_link_record_try_from_stored_link() {
        let created_at = OffsetDateTime::now_utc();
        let stored = StoredLink {
            slug: Slug::new("abcde".to_owned()).unwrap(),
            original_url: "https://example.com/page".to_owned(),
            short_url: format!("{BASE_URL}/abcde"),
            track_count: 7,
            created_at,
        };

        let record: LinkRecord = stored.try_into().unwrap();
        assert_eq!(record.slug, "abcde");
        assert_eq!(record.original_url, "https://example.com/page");
        assert_eq!(record.short_url, format!("{BASE_URL}/abcde"));
        assert_eq!(record.track_count, 7);
        assert_eq!(record.created_at, created_at.format(&Rfc3339).unwrap());
    }
}
