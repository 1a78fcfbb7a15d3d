//! Google Classroom and Drive API client.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::api::{ClassroomApi, ContentSource, Download, DriveApi};
use crate::auth::AuthSession;
use crate::classifier::RemoteContent;
use crate::error::{MirrorError, Result};
use crate::models::{
    ApiErrorResponse, Course, CourseListResponse, CourseMaterial, DriveNode, FileListResponse,
    MaterialListResponse, Page, Topic, TopicListResponse,
};
use crate::rate_limiter::RateLimiter;

/// Base URL for Google Classroom API v1.
pub const CLASSROOM_API_BASE: &str = "https://classroom.googleapis.com/v1";

/// Base URL for Google Drive API v3.
pub const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";

/// Page size for Classroom listings.
const CLASSROOM_PAGE_SIZE: &str = "100";

/// Maximum results per page (Google Drive API limit).
const DRIVE_PAGE_SIZE: &str = "1000";

/// Fields requested for every Drive node.
const NODE_FIELDS: &str =
    "id, name, mimeType, size, parents, webViewLink, shortcutDetails(targetId, targetMimeType)";

/// Client for the Classroom and Drive REST APIs.
///
/// Every request waits on the shared rate limiter and carries a bearer token
/// from the shared [`AuthSession`]. A 401 invalidates that token and the
/// request is sent once more with a fresh one.
pub struct GoogleClient {
    auth: Arc<AuthSession>,
    limiter: Arc<RateLimiter>,
    http: Client,
    classroom_base: String,
    drive_base: String,
}

impl GoogleClient {
    pub fn new(auth: Arc<AuthSession>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            auth,
            limiter,
            http: Client::new(),
            classroom_base: CLASSROOM_API_BASE.to_string(),
            drive_base: DRIVE_API_BASE.to_string(),
        }
    }

    /// Point the client at different API hosts.
    pub fn with_base_urls(mut self, classroom: impl Into<String>, drive: impl Into<String>) -> Self {
        self.classroom_base = classroom.into();
        self.drive_base = drive.into();
        self
    }

    /// Send an authorized request, retrying once with a fresh token on 401.
    async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut rejected = false;
        loop {
            self.limiter.acquire().await;
            let token = self.auth.access_token().await?;
            let response = build(&self.http).bearer_auth(&token).send().await?;

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            if status == StatusCode::UNAUTHORIZED && !rejected {
                debug!("access token rejected, refreshing");
                self.auth.invalidate(&token).await;
                rejected = true;
                continue;
            }
            return Err(error_from_response(response).await);
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: String,
        query: &[(&str, &str)],
        page_token: Option<&str>,
    ) -> Result<T> {
        let response = self
            .send(|http| {
                let request = http.get(&url).query(query);
                match page_token {
                    Some(token) => request.query(&[("pageToken", token)]),
                    None => request,
                }
            })
            .await?;
        Ok(response.json().await?)
    }
}

/// Turn an error response into a [`MirrorError`], using Google's error body when present.
async fn error_from_response(response: Response) -> MirrorError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiErrorResponse>(&body) {
        Ok(api_error) => {
            let reason = api_error.error.reason().map(str::to_string);
            MirrorError::from_status(api_error.error.code, reason.as_deref(), api_error.error.message)
        }
        Err(_) => MirrorError::from_status(status, None, body),
    }
}

#[async_trait]
impl ClassroomApi for GoogleClient {
    #[instrument(skip(self))]
    async fn list_courses(&self, page_token: Option<&str>) -> Result<Page<Course>> {
        let response: CourseListResponse = self
            .get_json(
                format!("{}/courses", self.classroom_base),
                &[("pageSize", CLASSROOM_PAGE_SIZE)],
                page_token,
            )
            .await?;
        Ok(Page {
            items: response.courses,
            next_page_token: response.next_page_token,
        })
    }

    #[instrument(skip(self))]
    async fn list_topics(&self, course_id: &str, page_token: Option<&str>) -> Result<Page<Topic>> {
        let response: TopicListResponse = self
            .get_json(
                format!("{}/courses/{}/topics", self.classroom_base, course_id),
                &[("pageSize", CLASSROOM_PAGE_SIZE)],
                page_token,
            )
            .await?;
        Ok(Page {
            items: response.topic,
            next_page_token: response.next_page_token,
        })
    }

    #[instrument(skip(self))]
    async fn list_materials(
        &self,
        course_id: &str,
        page_token: Option<&str>,
    ) -> Result<Page<CourseMaterial>> {
        let response: MaterialListResponse = self
            .get_json(
                format!("{}/courses/{}/courseWorkMaterials", self.classroom_base, course_id),
                &[("pageSize", CLASSROOM_PAGE_SIZE)],
                page_token,
            )
            .await?;
        Ok(Page {
            items: response.course_work_material,
            next_page_token: response.next_page_token,
        })
    }
}

#[async_trait]
impl DriveApi for GoogleClient {
    #[instrument(skip(self))]
    async fn get_node(&self, id: &str) -> Result<DriveNode> {
        self.get_json(
            format!("{}/files/{}", self.drive_base, id),
            &[("supportsAllDrives", "true"), ("fields", NODE_FIELDS)],
            None,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn list_children(&self, folder_id: &str, page_token: Option<&str>) -> Result<Page<DriveNode>> {
        let query = format!("'{}' in parents and trashed = false", folder_id.replace('\'', "\\'"));
        let fields = format!("nextPageToken, files({})", NODE_FIELDS);
        let response: FileListResponse = self
            .get_json(
                format!("{}/files", self.drive_base),
                &[
                    ("q", query.as_str()),
                    ("fields", fields.as_str()),
                    ("pageSize", DRIVE_PAGE_SIZE),
                    ("orderBy", "folder,name"),
                    ("includeItemsFromAllDrives", "true"),
                    ("supportsAllDrives", "true"),
                ],
                page_token,
            )
            .await?;
        Ok(Page {
            items: response.files,
            next_page_token: response.next_page_token,
        })
    }
}

#[async_trait]
impl ContentSource for GoogleClient {
    #[instrument(skip(self))]
    async fn open(&self, content: &RemoteContent) -> Result<Download> {
        let response = match content {
            RemoteContent::Fetch { file_id } => {
                let url = format!("{}/files/{}", self.drive_base, file_id);
                self.send(|http| {
                    http.get(&url)
                        .query(&[("alt", "media"), ("supportsAllDrives", "true")])
                })
                .await?
            }
            RemoteContent::Export { file_id, mime_type } => {
                let url = format!("{}/files/{}/export", self.drive_base, file_id);
                self.send(|http| http.get(&url).query(&[("mimeType", mime_type.as_str())]))
                    .await?
            }
        };

        Ok(Download {
            content_length: response.content_length(),
            stream: response.bytes_stream().map_err(MirrorError::from).boxed(),
        })
    }
}
