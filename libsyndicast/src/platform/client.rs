//! Platform REST client
//!
//! Each method is a single HTTP exchange. Failures come back already
//! classified; inline retries are the caller's decision (see
//! [`retry_with_backoff`](crate::retry::retry_with_backoff)).

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::classify::{classify_status, classify_transport, ApiCall, PublishError};
use crate::config::PlatformConfig;
use crate::error::{ConfigError, Result};
use crate::images::{FetchedImage, ImageFetcher};
use crate::quota::{DailyQuota, QuotaKind};
use crate::types::FormattedContent;

use super::wire::{
    CreatePostResponse, PostAttachment, RegisterUploadRequest, RegisterUploadResponse, UgcPost,
    UserInfo, UPLOAD_MECHANISM_KEY,
};

const RESTLI_PROTOCOL_HEADER: &str = "X-Restli-Protocol-Version";
const RESTLI_PROTOCOL_VERSION: &str = "2.0.0";
const RESTLI_ID_HEADER: &str = "x-restli-id";
const POST_URL_BASE: &str = "https://www.linkedin.com/feed/update";

/// The authenticated member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    /// Person URN used as post author and asset owner
    pub author_urn: String,
    pub name: Option<String>,
    pub email: Option<String>,
}

/// Target of a registered media upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaUpload {
    pub upload_url: String,
    pub asset_urn: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedPost {
    pub id: String,
    pub url: String,
}

pub struct PublishingClient {
    api: Client,
    media: Client,
    api_base_url: String,
    max_image_bytes: u64,
    quota: DailyQuota,
}

impl PublishingClient {
    /// Build a client with separate timeouts for API and media transfers
    pub fn new(config: &PlatformConfig, max_image_bytes: u64, quota: DailyQuota) -> Result<Self> {
        let user_agent = format!("syndicast/{}", env!("CARGO_PKG_VERSION"));

        let api = Client::builder()
            .timeout(config.api_timeout)
            .user_agent(user_agent.clone())
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: "platform.api_timeout".to_string(),
                reason: e.to_string(),
            })?;

        let media = Client::builder()
            .timeout(config.media_timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: "platform.media_timeout".to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            api,
            media,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            max_image_bytes,
            quota,
        })
    }

    pub fn quota(&self) -> &DailyQuota {
        &self.quota
    }

    /// `GET /v2/userinfo`
    #[instrument(skip(self, token))]
    pub async fn get_profile(
        &self,
        token: &SecretString,
    ) -> std::result::Result<Profile, PublishError> {
        let url = format!("{}/v2/userinfo", self.api_base_url);
        let response = self
            .api
            .get(&url)
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .map_err(|e| classify_transport(ApiCall::Profile, &e))?;

        let info: UserInfo = parse_json(ApiCall::Profile, response).await?;
        if info.sub.trim().is_empty() {
            return Err(PublishError::Content(
                "profile response has an empty subject".to_string(),
            ));
        }

        let name = match (&info.given_name, &info.family_name) {
            (Some(given), Some(family)) => Some(format!("{} {}", given, family)),
            (Some(given), None) => Some(given.clone()),
            (None, Some(family)) => Some(family.clone()),
            (None, None) => None,
        };

        Ok(Profile {
            author_urn: format!("urn:li:person:{}", info.sub),
            name,
            email: info.email,
        })
    }

    /// `POST /v2/assets?action=registerUpload`
    ///
    /// Counts against the daily media upload quota.
    #[instrument(skip(self, token))]
    pub async fn register_media_upload(
        &self,
        token: &SecretString,
        owner_urn: &str,
    ) -> std::result::Result<MediaUpload, PublishError> {
        self.reserve_quota(QuotaKind::MediaUploads).await?;

        let url = format!("{}/v2/assets?action=registerUpload", self.api_base_url);
        let response = self
            .api
            .post(&url)
            .bearer_auth(token.expose_secret())
            .header(RESTLI_PROTOCOL_HEADER, RESTLI_PROTOCOL_VERSION)
            .json(&RegisterUploadRequest::feed_image(owner_urn))
            .send()
            .await
            .map_err(|e| classify_transport(ApiCall::RegisterUpload, &e))?;

        let parsed: RegisterUploadResponse = parse_json(ApiCall::RegisterUpload, response).await?;

        let upload_url = parsed
            .value
            .upload_mechanism
            .get(UPLOAD_MECHANISM_KEY)
            .map(|m| m.upload_url.clone())
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                PublishError::MediaRegistrationFailed("response has no upload URL".to_string())
            })?;

        if parsed.value.asset.is_empty() {
            return Err(PublishError::MediaRegistrationFailed(
                "response has no asset URN".to_string(),
            ));
        }

        Ok(MediaUpload {
            upload_url,
            asset_urn: parsed.value.asset,
        })
    }

    /// Download an image, enforcing content type and size limits
    #[instrument(skip(self))]
    pub async fn download_binary(
        &self,
        url: &str,
    ) -> std::result::Result<FetchedImage, PublishError> {
        let mut response = self
            .media
            .get(url)
            .send()
            .await
            .map_err(|e| classify_transport(ApiCall::DownloadImage, &e))?;

        if !response.status().is_success() {
            return Err(error_from_response(ApiCall::DownloadImage, response).await);
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        match &content_type {
            Some(ct) if ct.trim().to_lowercase().starts_with("image/") => {}
            Some(ct) => return Err(PublishError::UnsupportedFormat(ct.clone())),
            None => {
                return Err(PublishError::UnsupportedFormat(
                    "missing content type".to_string(),
                ))
            }
        }

        let declared = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if let Some(size) = declared {
            if size > self.max_image_bytes {
                return Err(PublishError::ImageTooLarge {
                    size,
                    limit: self.max_image_bytes,
                });
            }
        }

        // Content-Length can be absent or wrong, so enforce the limit while reading
        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| classify_transport(ApiCall::DownloadImage, &e))?
        {
            bytes.extend_from_slice(&chunk);
            if bytes.len() as u64 > self.max_image_bytes {
                return Err(PublishError::ImageTooLarge {
                    size: bytes.len() as u64,
                    limit: self.max_image_bytes,
                });
            }
        }

        debug!(url, bytes = bytes.len(), "Downloaded image");
        Ok(FetchedImage {
            bytes,
            content_type,
        })
    }

    /// PUT raw bytes to a pre-signed upload URL (no Authorization header)
    #[instrument(skip(self, bytes), fields(bytes = bytes.len()))]
    pub async fn upload_binary(
        &self,
        upload_url: &str,
        bytes: &[u8],
    ) -> std::result::Result<(), PublishError> {
        let response = self
            .media
            .put(upload_url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| classify_transport(ApiCall::UploadBinary, &e))?;

        if !response.status().is_success() {
            return Err(error_from_response(ApiCall::UploadBinary, response).await);
        }
        Ok(())
    }

    /// `POST /v2/ugcPosts`
    ///
    /// With `asset_urn` the post is an image share, otherwise a link share of
    /// the content URL. Counts against the daily post quota.
    #[instrument(skip(self, token, content))]
    pub async fn create_post(
        &self,
        token: &SecretString,
        author_urn: &str,
        content: &FormattedContent,
        asset_urn: Option<&str>,
    ) -> std::result::Result<CreatedPost, PublishError> {
        self.reserve_quota(QuotaKind::Posts).await?;

        let attachment = match asset_urn {
            Some(asset_urn) => PostAttachment::Image {
                asset_urn,
                title: &content.title,
                description: None,
            },
            None => PostAttachment::Article {
                url: &content.url,
                title: &content.title,
            },
        };
        let body = UgcPost::public(author_urn, &content.body, attachment);

        let url = format!("{}/v2/ugcPosts", self.api_base_url);
        let response = self
            .api
            .post(&url)
            .bearer_auth(token.expose_secret())
            .header(RESTLI_PROTOCOL_HEADER, RESTLI_PROTOCOL_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(ApiCall::CreatePost, &e))?;

        if !response.status().is_success() {
            return Err(error_from_response(ApiCall::CreatePost, response).await);
        }

        let header_id = response
            .headers()
            .get(RESTLI_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let id = match header_id {
            Some(id) if !id.is_empty() => id,
            _ => {
                let text = response
                    .text()
                    .await
                    .map_err(|e| classify_transport(ApiCall::CreatePost, &e))?;
                serde_json::from_str::<CreatePostResponse>(&text)
                    .ok()
                    .and_then(|r| r.id)
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| {
                        // not retryable: the post may exist, retrying could duplicate it
                        PublishError::Content(
                            "post creation succeeded without returning an id".to_string(),
                        )
                    })?
            }
        };

        Ok(CreatedPost {
            url: post_url(&id),
            id,
        })
    }

    /// Reserve a slot before the request goes out
    async fn reserve_quota(&self, kind: QuotaKind) -> std::result::Result<(), PublishError> {
        let retry_after = match self.quota.reserve(kind, Utc::now()).await {
            Ok(None) => return Ok(()),
            Ok(Some(retry_after)) => retry_after,
            Err(e) => {
                warn!(quota = %kind, "Quota reservation failed, allowing call: {}", e);
                return Ok(());
            }
        };

        warn!(quota = %kind, reset_secs = retry_after.as_secs(), "Daily quota exhausted");
        Err(match kind {
            QuotaKind::MediaUploads => PublishError::QuotaExceeded {
                quota: kind,
                retry_after,
            },
            QuotaKind::Posts => PublishError::RateLimit {
                message: "daily post quota exhausted".to_string(),
                retry_after: Some(retry_after),
                quota: Some(kind),
            },
        })
    }

}

#[async_trait]
impl ImageFetcher for PublishingClient {
    async fn fetch_image(&self, url: &str) -> std::result::Result<FetchedImage, PublishError> {
        self.download_binary(url).await
    }
}

/// Public URL of a created post
pub fn post_url(id: &str) -> String {
    format!("{}/{}/", POST_URL_BASE, id)
}

async fn parse_json<T: DeserializeOwned>(
    call: ApiCall,
    response: Response,
) -> std::result::Result<T, PublishError> {
    if !response.status().is_success() {
        return Err(error_from_response(call, response).await);
    }
    response
        .json::<T>()
        .await
        .map_err(|e| classify_transport(call, &e))
}

pub(crate) async fn error_from_response(call: ApiCall, response: Response) -> PublishError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let body = response.text().await.unwrap_or_default();

    classify_status(call, status, retry_after.as_deref(), &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::{MemoryQuotaCounter, QuotaLimits};
    use std::sync::Arc;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(server: &MockServer, limits: QuotaLimits) -> PublishingClient {
        let config = PlatformConfig {
            api_base_url: server.uri(),
            api_timeout: Duration::from_secs(5),
            media_timeout: Duration::from_secs(5),
            ..PlatformConfig::default()
        };
        let quota = DailyQuota::new(Arc::new(MemoryQuotaCounter::new()), limits);
        PublishingClient::new(&config, 1024, quota).unwrap()
    }

    fn token() -> SecretString {
        SecretString::from("test-token".to_string())
    }

    fn formatted() -> FormattedContent {
        FormattedContent {
            title: "Title".to_string(),
            body: "Title\n\nhttps://blog.example.com/p".to_string(),
            url: "https://blog.example.com/p".to_string(),
            hashtags: Vec::new(),
            character_count: 31,
        }
    }

    #[tokio::test]
    async fn test_get_profile() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/userinfo"))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sub": "abc123",
                "given_name": "Ada",
                "family_name": "Lovelace",
                "email": "ada@example.com"
            })))
            .mount(&server)
            .await;

        let client = test_client(&server, QuotaLimits::default());
        let profile = client.get_profile(&token()).await.unwrap();
        assert_eq!(profile.author_urn, "urn:li:person:abc123");
        assert_eq!(profile.name.as_deref(), Some("Ada Lovelace"));
    }

    #[tokio::test]
    async fn test_get_profile_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/userinfo"))
            .respond_with(ResponseTemplate::new(401).set_body_string("expired"))
            .mount(&server)
            .await;

        let client = test_client(&server, QuotaLimits::default());
        let err = client.get_profile(&token()).await.unwrap_err();
        assert!(matches!(
            err,
            PublishError::Auth {
                needs_reauth: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_register_media_upload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/assets"))
            .and(query_param("action", "registerUpload"))
            .and(body_partial_json(serde_json::json!({
                "registerUploadRequest": {"owner": "urn:li:person:abc"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": {
                    "uploadMechanism": {
                        UPLOAD_MECHANISM_KEY: {"uploadUrl": format!("{}/upload/1", server.uri())}
                    },
                    "asset": "urn:li:digitalmediaAsset:1"
                }
            })))
            .mount(&server)
            .await;

        let client = test_client(&server, QuotaLimits::default());
        let upload = client
            .register_media_upload(&token(), "urn:li:person:abc")
            .await
            .unwrap();
        assert_eq!(upload.asset_urn, "urn:li:digitalmediaAsset:1");
        assert!(upload.upload_url.ends_with("/upload/1"));

        let remaining = client
            .quota()
            .remaining(QuotaKind::MediaUploads, Utc::now())
            .await
            .unwrap();
        assert_eq!(remaining, 149);
    }

    #[tokio::test]
    async fn test_register_media_upload_quota_exhausted() {
        let server = MockServer::start().await;
        let client = test_client(
            &server,
            QuotaLimits {
                posts_per_day: 10,
                uploads_per_day: 1,
            },
        );
        client
            .quota()
            .record(QuotaKind::MediaUploads, Utc::now())
            .await
            .unwrap();

        let err = client
            .register_media_upload(&token(), "urn:li:person:abc")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PublishError::QuotaExceeded {
                quota: QuotaKind::MediaUploads,
                ..
            }
        ));
        assert!(err.is_image_error());
    }

    #[tokio::test]
    async fn test_download_rejects_non_image() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page.html"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<html></html>"),
            )
            .mount(&server)
            .await;

        let client = test_client(&server, QuotaLimits::default());
        let err = client
            .download_binary(&format!("{}/page.html", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::UnsupportedFormat(_)));
    }

    #[tokio::test]
    async fn test_download_rejects_oversized_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/big.jpg"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/jpeg")
                    .set_body_bytes(vec![0u8; 4096]),
            )
            .mount(&server)
            .await;

        let client = test_client(&server, QuotaLimits::default());
        let err = client
            .download_binary(&format!("{}/big.jpg", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::ImageTooLarge { limit: 1024, .. }));
    }

    #[tokio::test]
    async fn test_download_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone.jpg"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = test_client(&server, QuotaLimits::default());
        let err = client
            .download_binary(&format!("{}/gone.jpg", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::ImageDownloadFailed(_)));
    }

    #[tokio::test]
    async fn test_upload_binary_sends_no_auth() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/upload/1"))
            .and(header("content-type", "application/octet-stream"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server, QuotaLimits::default());
        client
            .upload_binary(&format!("{}/upload/1", server.uri()), b"bytes")
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        assert!(requests[0].headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_create_post_reads_restli_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/ugcPosts"))
            .and(header("x-restli-protocol-version", "2.0.0"))
            .and(body_partial_json(serde_json::json!({
                "author": "urn:li:person:abc",
                "lifecycleState": "PUBLISHED"
            })))
            .respond_with(
                ResponseTemplate::new(201).insert_header("x-restli-id", "urn:li:share:777"),
            )
            .mount(&server)
            .await;

        let client = test_client(&server, QuotaLimits::default());
        let created = client
            .create_post(&token(), "urn:li:person:abc", &formatted(), None)
            .await
            .unwrap();
        assert_eq!(created.id, "urn:li:share:777");
        assert_eq!(
            created.url,
            "https://www.linkedin.com/feed/update/urn:li:share:777/"
        );
    }

    #[tokio::test]
    async fn test_create_post_falls_back_to_body_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/ugcPosts"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(serde_json::json!({"id": "urn:li:ugcPost:42"})),
            )
            .mount(&server)
            .await;

        let client = test_client(&server, QuotaLimits::default());
        let created = client
            .create_post(
                &token(),
                "urn:li:person:abc",
                &formatted(),
                Some("urn:li:digitalmediaAsset:1"),
            )
            .await
            .unwrap();
        assert_eq!(created.id, "urn:li:ugcPost:42");
    }

    #[tokio::test]
    async fn test_create_post_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/ugcPosts"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "120"))
            .mount(&server)
            .await;

        let client = test_client(&server, QuotaLimits::default());
        let err = client
            .create_post(&token(), "urn:li:person:abc", &formatted(), None)
            .await
            .unwrap_err();
        match err {
            PublishError::RateLimit { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(120)));
            }
            other => panic!("Expected RateLimit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_post_quota_exhausted_is_rate_limit() {
        let server = MockServer::start().await;
        let client = test_client(
            &server,
            QuotaLimits {
                posts_per_day: 1,
                uploads_per_day: 1,
            },
        );
        client.quota().record(QuotaKind::Posts, Utc::now()).await.unwrap();

        let err = client
            .create_post(&token(), "urn:li:person:abc", &formatted(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PublishError::RateLimit {
                quota: Some(QuotaKind::Posts),
                retry_after: Some(_),
                ..
            }
        ));
        assert!(!err.is_image_error());
    }

    #[tokio::test]
    async fn test_concurrent_posts_share_last_quota_slot() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/ugcPosts"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("x-restli-id", "urn:li:share:7")
                    .set_delay(Duration::from_millis(200)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(
            &server,
            QuotaLimits {
                posts_per_day: 1,
                uploads_per_day: 1,
            },
        );
        let content = formatted();
        let token = token();

        let (a, b, c) = tokio::join!(
            client.create_post(&token, "urn:li:person:abc", &content, None),
            client.create_post(&token, "urn:li:person:abc", &content, None),
            client.create_post(&token, "urn:li:person:abc", &content, None),
        );
        let results = [a, b, c];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|e| matches!(
            e,
            PublishError::RateLimit {
                quota: Some(QuotaKind::Posts),
                ..
            }
        )));
    }
}
