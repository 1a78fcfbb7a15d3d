//! Remote service interfaces consumed by the mirroring engine.
//!
//! [`GoogleClient`](crate::client::GoogleClient) implements all three traits
//! over HTTP; tests substitute in-memory fakes.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::classifier::RemoteContent;
use crate::error::Result;
use crate::models::{Course, CourseMaterial, DriveNode, Page, Topic};

/// Body of a fetch or export, delivered in chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// An opened download.
pub struct Download {
    pub stream: ByteStream,
    pub content_length: Option<u64>,
}

/// Paginated Classroom listings.
#[async_trait]
pub trait ClassroomApi: Send + Sync {
    async fn list_courses(&self, page_token: Option<&str>) -> Result<Page<Course>>;

    async fn list_topics(&self, course_id: &str, page_token: Option<&str>) -> Result<Page<Topic>>;

    async fn list_materials(
        &self,
        course_id: &str,
        page_token: Option<&str>,
    ) -> Result<Page<CourseMaterial>>;
}

/// Drive metadata and folder listings.
#[async_trait]
pub trait DriveApi: Send + Sync {
    async fn get_node(&self, id: &str) -> Result<DriveNode>;

    async fn list_children(&self, folder_id: &str, page_token: Option<&str>) -> Result<Page<DriveNode>>;
}

/// Byte content of Drive files.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn open(&self, content: &RemoteContent) -> Result<Download>;
}
