//! Data models for Google Classroom and Drive API responses.

use serde::{Deserialize, Serialize};

/// MIME type Drive uses for folders.
pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// MIME type Drive uses for shortcuts.
pub const SHORTCUT_MIME: &str = "application/vnd.google-apps.shortcut";

/// Prefix shared by all Google-native (export-only) MIME types.
pub const NATIVE_MIME_PREFIX: &str = "application/vnd.google-apps.";

/// One page of a paginated listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_page_token: Option<String>,
}

impl<T> Page<T> {
    /// A page with no continuation.
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_page_token: None,
        }
    }

    /// The continuation token, treating an empty token as absent.
    pub fn continuation(&self) -> Option<&str> {
        self.next_page_token.as_deref().filter(|t| !t.is_empty())
    }
}

/// A Classroom course.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub course_state: Option<String>,
}

impl std::fmt::Display for Course {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.section.as_deref().filter(|s| !s.is_empty()) {
            Some(section) => write!(f, "{} ({})", self.name, section),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A topic within a course.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    pub topic_id: String,
    pub name: String,
}

/// A course work material: a titled post carrying attachments.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseMaterial {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub topic_id: Option<String>,
    #[serde(default)]
    pub alternate_link: Option<String>,
    #[serde(default)]
    pub materials: Vec<MaterialAttachment>,
}

/// A single attachment entry of a material. Exactly one field is normally set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterialAttachment {
    #[serde(default)]
    pub drive_file: Option<SharedDriveFile>,
    #[serde(default)]
    pub youtube_video: Option<YouTubeVideo>,
    #[serde(default)]
    pub link: Option<Link>,
    #[serde(default)]
    pub form: Option<Form>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedDriveFile {
    pub drive_file: DriveFileRef,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFileRef {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub alternate_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YouTubeVideo {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub alternate_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Link {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Form {
    pub form_url: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// Response from courses.list.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseListResponse {
    #[serde(default)]
    pub courses: Vec<Course>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Response from courses.topics.list.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicListResponse {
    #[serde(default)]
    pub topic: Vec<Topic>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Response from courses.courseWorkMaterials.list.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterialListResponse {
    #[serde(default)]
    pub course_work_material: Vec<CourseMaterial>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Kind of a Drive node, derived from its MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Folder,
    Shortcut,
}

/// Target of a Drive shortcut.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShortcutDetails {
    pub target_id: String,
    #[serde(default)]
    pub target_mime_type: Option<String>,
}

/// Metadata for a file, folder or shortcut in Google Drive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DriveNode {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub web_view_link: Option<String>,
    #[serde(default, deserialize_with = "deserialize_size")]
    pub size: Option<u64>,
    #[serde(default)]
    pub shortcut_details: Option<ShortcutDetails>,
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    match opt {
        Some(s) => s.parse::<u64>().map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

impl DriveNode {
    pub fn kind(&self) -> NodeKind {
        match self.mime_type.as_str() {
            FOLDER_MIME => NodeKind::Folder,
            SHORTCUT_MIME => NodeKind::Shortcut,
            _ => NodeKind::File,
        }
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parents.first().map(String::as_str)
    }

    /// Resolve a shortcut to the node it points at, keeping the shortcut's name
    /// and parent. Non-shortcuts are returned unchanged.
    pub fn resolve_shortcut(self) -> Self {
        match (self.kind(), self.shortcut_details.clone()) {
            (NodeKind::Shortcut, Some(details)) => DriveNode {
                id: details.target_id,
                mime_type: details.target_mime_type.unwrap_or_default(),
                size: None,
                shortcut_details: None,
                web_view_link: None,
                ..self
            },
            _ => self,
        }
    }
}

/// Human-readable byte count, binary units.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// Response from the Drive files.list endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileListResponse {
    #[serde(default)]
    pub files: Vec<DriveNode>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Google API error response.
#[derive(Debug, Deserialize)]
pub struct ApiErrorResponse {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorDetail {
    pub code: u16,
    pub message: String,
    #[serde(default)]
    pub errors: Vec<ApiErrorReason>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorReason {
    #[serde(default)]
    pub reason: Option<String>,
}

impl ApiErrorDetail {
    /// The first machine-readable reason, e.g. `rateLimitExceeded`.
    pub fn reason(&self) -> Option<&str> {
        self.errors.iter().find_map(|e| e.reason.as_deref())
    }
}

/// Service account credentials from JSON file.
#[derive(Debug, Deserialize)]
pub struct ServiceAccountCredentials {
    pub client_email: String,
    pub private_key: String,
    pub token_uri: Option<String>,
}

/// OAuth client id and secret of an installed or web application.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecret {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub token_uri: Option<String>,
}

/// The `credentials.json` file downloaded from the Cloud console.
#[derive(Debug, Deserialize)]
pub struct ClientSecretFile {
    #[serde(default)]
    pub installed: Option<ClientSecret>,
    #[serde(default)]
    pub web: Option<ClientSecret>,
}

impl ClientSecretFile {
    pub fn into_secret(self) -> Option<ClientSecret> {
        self.installed.or(self.web)
    }
}

/// OAuth2 token response.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
}
