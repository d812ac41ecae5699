//! Request and response bodies of the platform's REST API

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const UPLOAD_MECHANISM_KEY: &str = "com.linkedin.digitalmedia.uploading.MediaUploadHttpRequest";
pub const FEEDSHARE_IMAGE_RECIPE: &str = "urn:li:digitalmediaRecipe:feedshare-image";
pub const OWNER_RELATIONSHIP: &str = "OWNER";
pub const UGC_IDENTIFIER: &str = "urn:li:userGeneratedContent";

/// `POST /oauth/v2/accessToken` response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub refresh_token_expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// `GET /v2/userinfo` response
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    pub sub: String,
    #[serde(default)]
    pub given_name: Option<String>,
    #[serde(default)]
    pub family_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterUploadRequest {
    pub register_upload_request: RegisterUploadBody,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterUploadBody {
    pub recipes: Vec<String>,
    pub owner: String,
    pub service_relationships: Vec<ServiceRelationship>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRelationship {
    pub relationship_type: String,
    pub identifier: String,
}

impl RegisterUploadRequest {
    /// Feed image upload owned by `owner`
    pub fn feed_image(owner: &str) -> Self {
        Self {
            register_upload_request: RegisterUploadBody {
                recipes: vec![FEEDSHARE_IMAGE_RECIPE.to_string()],
                owner: owner.to_string(),
                service_relationships: vec![ServiceRelationship {
                    relationship_type: OWNER_RELATIONSHIP.to_string(),
                    identifier: UGC_IDENTIFIER.to_string(),
                }],
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterUploadResponse {
    pub value: RegisterUploadValue,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterUploadValue {
    pub upload_mechanism: HashMap<String, UploadHttpRequest>,
    pub asset: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadHttpRequest {
    pub upload_url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// `POST /v2/ugcPosts` body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UgcPost {
    pub author: String,
    pub lifecycle_state: String,
    pub specific_content: SpecificContent,
    pub visibility: Visibility,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpecificContent {
    #[serde(rename = "com.linkedin.ugc.ShareContent")]
    pub share_content: ShareContent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareContent {
    pub share_commentary: Text,
    pub share_media_category: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<ShareMedia>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareMedia {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<Text>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<Text>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Text {
    pub text: String,
}

impl Text {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Visibility {
    #[serde(rename = "com.linkedin.ugc.MemberNetworkVisibility")]
    pub member_network_visibility: String,
}

/// What the post links to or carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostAttachment<'a> {
    /// Link preview of the content URL
    Article { url: &'a str, title: &'a str },
    /// An uploaded image asset
    Image {
        asset_urn: &'a str,
        title: &'a str,
        description: Option<&'a str>,
    },
}

impl UgcPost {
    pub fn public(author: &str, commentary: &str, attachment: PostAttachment<'_>) -> Self {
        let (category, media) = match attachment {
            PostAttachment::Article { url, title } => (
                "ARTICLE",
                ShareMedia {
                    status: "READY".to_string(),
                    description: None,
                    media: None,
                    original_url: Some(url.to_string()),
                    title: Some(Text::new(title)),
                },
            ),
            PostAttachment::Image {
                asset_urn,
                title,
                description,
            } => (
                "IMAGE",
                ShareMedia {
                    status: "READY".to_string(),
                    description: description.map(Text::new),
                    media: Some(asset_urn.to_string()),
                    original_url: None,
                    title: Some(Text::new(title)),
                },
            ),
        };

        Self {
            author: author.to_string(),
            lifecycle_state: "PUBLISHED".to_string(),
            specific_content: SpecificContent {
                share_content: ShareContent {
                    share_commentary: Text::new(commentary),
                    share_media_category: category.to_string(),
                    media: vec![media],
                },
            },
            visibility: Visibility {
                member_network_visibility: "PUBLIC".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePostResponse {
    #[serde(default)]
    pub id: Option<String>,
}
