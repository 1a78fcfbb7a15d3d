//! Attachment classification: which download strategy each remote reference
//! gets, and what extension its local file carries.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};
use crate::models::{CourseMaterial, DriveNode, MaterialAttachment, NATIVE_MIME_PREFIX};
use crate::sanitizer::{split_extension, with_extension};
use crate::url_parser::{extract_linked_ids, open_url};

/// Extension of link placeholder files.
pub const PLACEHOLDER_EXTENSION: &str = "url";

/// Google-native document kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NativeKind {
    Document,
    Spreadsheet,
    Presentation,
    Drawing,
    Script,
    Form,
    /// Sites, maps, Jamboards and anything newer: no export exists.
    Other(String),
}

impl NativeKind {
    /// Kind for a Google-native MIME type, `None` for ordinary files.
    pub fn from_mime(mime_type: &str) -> Option<Self> {
        let suffix = mime_type.strip_prefix(NATIVE_MIME_PREFIX)?;
        Some(match suffix {
            "document" => NativeKind::Document,
            "spreadsheet" => NativeKind::Spreadsheet,
            "presentation" => NativeKind::Presentation,
            "drawing" => NativeKind::Drawing,
            "script" => NativeKind::Script,
            "form" => NativeKind::Form,
            other => NativeKind::Other(other.to_string()),
        })
    }
}

/// A remote reference attached to a material or found in a Drive tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentRef {
    NativeDocument {
        id: String,
        kind: NativeKind,
        title: String,
    },
    BinaryFile {
        id: String,
        mime_type: Option<String>,
        title: String,
        size: Option<u64>,
    },
    Hyperlink {
        url: String,
        title: String,
    },
    Form {
        url: String,
        title: String,
    },
    Video {
        url: String,
        title: String,
    },
}

impl AttachmentRef {
    pub fn title(&self) -> &str {
        match self {
            AttachmentRef::NativeDocument { title, .. }
            | AttachmentRef::BinaryFile { title, .. }
            | AttachmentRef::Hyperlink { title, .. }
            | AttachmentRef::Form { title, .. }
            | AttachmentRef::Video { title, .. } => title,
        }
    }

    /// Reference for a Drive file node (folders are traversed, not attached).
    pub fn from_drive_node(node: &DriveNode) -> Self {
        match NativeKind::from_mime(&node.mime_type) {
            Some(NativeKind::Form) => AttachmentRef::Form {
                url: node.web_view_link.clone().unwrap_or_else(|| open_url(&node.id)),
                title: node.name.clone(),
            },
            Some(kind) => AttachmentRef::NativeDocument {
                id: node.id.clone(),
                kind,
                title: node.name.clone(),
            },
            None => AttachmentRef::BinaryFile {
                id: node.id.clone(),
                mime_type: Some(node.mime_type.clone()).filter(|m| !m.is_empty()),
                title: node.name.clone(),
                size: node.size,
            },
        }
    }
}

/// One downloadable item named by a material, before Drive metadata is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterialItem {
    /// A Drive file or folder; its MIME type must be looked up.
    Drive { id: String, title: Option<String> },
    Attachment(AttachmentRef),
}

/// Items a material contributes, in listing order.
///
/// A material with no attachments falls back to Drive links in its
/// description. Attachment entries of an unrecognised kind become hyperlink
/// placeholders pointing at the material itself.
pub fn material_items(material: &CourseMaterial) -> Vec<MaterialItem> {
    let fallback_title = material.title.clone().unwrap_or_else(|| material.id.clone());

    if material.materials.is_empty() {
        return material
            .description
            .as_deref()
            .map(extract_linked_ids)
            .unwrap_or_default()
            .into_iter()
            .map(|id| MaterialItem::Drive { id, title: None })
            .collect();
    }

    material
        .materials
        .iter()
        .map(|attachment| attachment_item(attachment, material, &fallback_title))
        .collect()
}

fn attachment_item(
    attachment: &MaterialAttachment,
    material: &CourseMaterial,
    fallback_title: &str,
) -> MaterialItem {
    if let Some(shared) = &attachment.drive_file {
        return MaterialItem::Drive {
            id: shared.drive_file.id.clone(),
            title: shared.drive_file.title.clone(),
        };
    }
    if let Some(video) = &attachment.youtube_video {
        return MaterialItem::Attachment(AttachmentRef::Video {
            url: video
                .alternate_link
                .clone()
                .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={}", video.id)),
            title: video.title.clone().unwrap_or_else(|| video.id.clone()),
        });
    }
    if let Some(link) = &attachment.link {
        return MaterialItem::Attachment(AttachmentRef::Hyperlink {
            url: link.url.clone(),
            title: link.title.clone().unwrap_or_else(|| link.url.clone()),
        });
    }
    if let Some(form) = &attachment.form {
        return MaterialItem::Attachment(AttachmentRef::Form {
            url: form.form_url.clone(),
            title: form.title.clone().unwrap_or_else(|| fallback_title.to_string()),
        });
    }
    MaterialItem::Attachment(AttachmentRef::Hyperlink {
        url: material.alternate_link.clone().unwrap_or_default(),
        title: fallback_title.to_string(),
    })
}

/// Concrete formats a native document can be exported to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Pdf,
    Docx,
    Odt,
    Rtf,
    Txt,
    Html,
    Epub,
    Xlsx,
    Ods,
    Csv,
    Tsv,
    Pptx,
    Odp,
    Png,
    Jpeg,
    Svg,
    Json,
}

impl ExportFormat {
    pub fn mime_type(self) -> &'static str {
        match self {
            ExportFormat::Pdf => "application/pdf",
            ExportFormat::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            ExportFormat::Odt => "application/vnd.oasis.opendocument.text",
            ExportFormat::Rtf => "application/rtf",
            ExportFormat::Txt => "text/plain",
            ExportFormat::Html => "application/zip",
            ExportFormat::Epub => "application/epub+zip",
            ExportFormat::Xlsx => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            ExportFormat::Ods => "application/vnd.oasis.opendocument.spreadsheet",
            ExportFormat::Csv => "text/csv",
            ExportFormat::Tsv => "text/tab-separated-values",
            ExportFormat::Pptx => {
                "application/vnd.openxmlformats-officedocument.presentationml.presentation"
            }
            ExportFormat::Odp => "application/vnd.oasis.opendocument.presentation",
            ExportFormat::Png => "image/png",
            ExportFormat::Jpeg => "image/jpeg",
            ExportFormat::Svg => "image/svg+xml",
            ExportFormat::Json => "application/vnd.google-apps.script+json",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Pdf => "pdf",
            ExportFormat::Docx => "docx",
            ExportFormat::Odt => "odt",
            ExportFormat::Rtf => "rtf",
            ExportFormat::Txt => "txt",
            // Drive exports documents as zipped HTML.
            ExportFormat::Html => "zip",
            ExportFormat::Epub => "epub",
            ExportFormat::Xlsx => "xlsx",
            ExportFormat::Ods => "ods",
            ExportFormat::Csv => "csv",
            ExportFormat::Tsv => "tsv",
            ExportFormat::Pptx => "pptx",
            ExportFormat::Odp => "odp",
            ExportFormat::Png => "png",
            ExportFormat::Jpeg => "jpg",
            ExportFormat::Svg => "svg",
            ExportFormat::Json => "json",
        }
    }

    /// Whether Drive can export `kind` to this format.
    pub fn supports(self, kind: &NativeKind) -> bool {
        use ExportFormat::*;
        match kind {
            NativeKind::Document => matches!(self, Pdf | Docx | Odt | Rtf | Txt | Html | Epub),
            NativeKind::Spreadsheet => matches!(self, Pdf | Xlsx | Ods | Csv | Tsv | Html),
            NativeKind::Presentation => matches!(self, Pdf | Pptx | Odp | Txt),
            NativeKind::Drawing => matches!(self, Pdf | Png | Jpeg | Svg),
            NativeKind::Script => matches!(self, Json),
            NativeKind::Form | NativeKind::Other(_) => false,
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Target format per native kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportPolicy {
    pub document: ExportFormat,
    pub spreadsheet: ExportFormat,
    pub presentation: ExportFormat,
    pub drawing: ExportFormat,
    pub script: ExportFormat,
}

impl Default for ExportPolicy {
    fn default() -> Self {
        Self {
            document: ExportFormat::Pdf,
            spreadsheet: ExportFormat::Xlsx,
            presentation: ExportFormat::Pdf,
            drawing: ExportFormat::Png,
            script: ExportFormat::Json,
        }
    }
}

impl ExportPolicy {
    /// Configured format for `kind`, `None` if the kind cannot be exported.
    pub fn format_for(&self, kind: &NativeKind) -> Option<ExportFormat> {
        match kind {
            NativeKind::Document => Some(self.document),
            NativeKind::Spreadsheet => Some(self.spreadsheet),
            NativeKind::Presentation => Some(self.presentation),
            NativeKind::Drawing => Some(self.drawing),
            NativeKind::Script => Some(self.script),
            NativeKind::Form | NativeKind::Other(_) => None,
        }
    }

    /// Reject combinations Drive cannot export.
    pub fn validate(&self) -> Result<()> {
        let pairs = [
            ("document", NativeKind::Document, self.document),
            ("spreadsheet", NativeKind::Spreadsheet, self.spreadsheet),
            ("presentation", NativeKind::Presentation, self.presentation),
            ("drawing", NativeKind::Drawing, self.drawing),
            ("script", NativeKind::Script, self.script),
        ];
        for (name, kind, format) in pairs {
            if !format.supports(&kind) {
                return Err(MirrorError::Config(format!(
                    "a {} cannot be exported as {}",
                    name, format
                )));
            }
        }
        Ok(())
    }
}

/// Content that has to come from Drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteContent {
    Fetch { file_id: String },
    Export { file_id: String, mime_type: String },
}

impl RemoteContent {
    pub fn file_id(&self) -> &str {
        match self {
            RemoteContent::Fetch { file_id } | RemoteContent::Export { file_id, .. } => file_id,
        }
    }
}

/// How an attachment is materialized locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    Remote(RemoteContent),
    Placeholder { url: String, title: String },
}

impl Strategy {
    /// Stable identity of the content, used to recognise completed work.
    pub fn source_key(&self) -> String {
        match self {
            Strategy::Remote(RemoteContent::Fetch { file_id }) => format!("drive:{}", file_id),
            Strategy::Remote(RemoteContent::Export { file_id, mime_type }) => {
                format!("drive:{}:{}", file_id, mime_type)
            }
            Strategy::Placeholder { url, .. } => format!("link:{}", url),
        }
    }
}

/// Strategy plus the extension the local file must carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub strategy: Strategy,
    pub extension: Option<String>,
}

impl Classification {
    /// Local file name for `title` under this classification.
    pub fn file_name(&self, title: &str) -> String {
        with_extension(title, self.extension.as_deref())
    }
}

/// Maps attachment references to strategies under an export policy.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    policy: ExportPolicy,
}

impl Classifier {
    pub fn new(policy: ExportPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ExportPolicy {
        &self.policy
    }

    pub fn classify(&self, attachment: &AttachmentRef) -> Classification {
        match attachment {
            AttachmentRef::NativeDocument { id, kind, title } => match self.policy.format_for(kind) {
                Some(format) => Classification {
                    strategy: Strategy::Remote(RemoteContent::Export {
                        file_id: id.clone(),
                        mime_type: format.mime_type().to_string(),
                    }),
                    extension: Some(format.extension().to_string()),
                },
                None => placeholder(open_url(id), title),
            },
            AttachmentRef::BinaryFile {
                id,
                mime_type,
                title,
                ..
            } => Classification {
                strategy: Strategy::Remote(RemoteContent::Fetch {
                    file_id: id.clone(),
                }),
                extension: binary_extension(title, mime_type.as_deref()),
            },
            AttachmentRef::Hyperlink { url, title }
            | AttachmentRef::Form { url, title }
            | AttachmentRef::Video { url, title } => placeholder(url.clone(), title),
        }
    }
}

fn placeholder(url: String, title: &str) -> Classification {
    Classification {
        strategy: Strategy::Placeholder {
            url,
            title: title.to_string(),
        },
        extension: Some(PLACEHOLDER_EXTENSION.to_string()),
    }
}

/// Keep the title's own extension; otherwise derive one from the MIME type.
fn binary_extension(title: &str, mime_type: Option<&str>) -> Option<String> {
    let (_, existing) = split_extension(title);
    if !existing.is_empty() {
        return None;
    }
    mime_type
        .and_then(mime_guess::get_mime_extensions_str)
        .and_then(|exts| exts.first())
        .map(|ext| ext.to_string())
}

/// Body of a link placeholder file, in Internet Shortcut format.
pub fn placeholder_body(url: &str, title: &str) -> String {
    let title = title.replace(&['\r', '\n'][..], " ");
    format!("[InternetShortcut]\r\nURL={}\r\nTitle={}\r\n", url, title)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DriveFileRef, Link, SharedDriveFile};

    fn classifier() -> Classifier {
        Classifier::default()
    }

    #[test]
    fn test_native_document_exports_per_policy() {
        let policy = ExportPolicy {
            spreadsheet: ExportFormat::Ods,
            ..ExportPolicy::default()
        };
        let c = Classifier::new(policy).classify(&AttachmentRef::NativeDocument {
            id: "s1".into(),
            kind: NativeKind::Spreadsheet,
            title: "Grades".into(),
        });
        assert_eq!(
            c.strategy,
            Strategy::Remote(RemoteContent::Export {
                file_id: "s1".into(),
                mime_type: "application/vnd.oasis.opendocument.spreadsheet".into(),
            })
        );
        assert_eq!(c.file_name("Grades"), "Grades.ods");
    }

    #[test]
    fn test_binary_keeps_original_extension() {
        let c = classifier().classify(&AttachmentRef::BinaryFile {
            id: "b1".into(),
            mime_type: Some("application/pdf".into()),
            title: "lab.PDF".into(),
            size: Some(10),
        });
        assert_eq!(
            c.strategy,
            Strategy::Remote(RemoteContent::Fetch { file_id: "b1".into() })
        );
        assert_eq!(c.file_name("lab.PDF"), "lab.PDF");
    }

    #[test]
    fn test_binary_without_extension_uses_mime() {
        let c = classifier().classify(&AttachmentRef::BinaryFile {
            id: "b2".into(),
            mime_type: Some("application/pdf".into()),
            title: "handout".into(),
            size: None,
        });
        assert_eq!(c.file_name("handout"), "handout.pdf");
    }

    #[test]
    fn test_non_drive_kinds_are_placeholders() {
        let refs = [
            AttachmentRef::Hyperlink {
                url: "https://a".into(),
                title: "A".into(),
            },
            AttachmentRef::Form {
                url: "https://f".into(),
                title: "F".into(),
            },
            AttachmentRef::Video {
                url: "https://v".into(),
                title: "V".into(),
            },
            AttachmentRef::NativeDocument {
                id: "site".into(),
                kind: NativeKind::Other("site".into()),
                title: "Class site".into(),
            },
        ];
        for r in &refs {
            let c = classifier().classify(r);
            assert!(matches!(c.strategy, Strategy::Placeholder { .. }), "{:?}", r);
            assert_eq!(c.extension.as_deref(), Some(PLACEHOLDER_EXTENSION));
        }
    }

    #[test]
    fn test_drive_node_mapping() {
        let node = |mime: &str| DriveNode {
            id: "n".into(),
            name: "N".into(),
            mime_type: mime.into(),
            parents: vec![],
            web_view_link: None,
            size: None,
            shortcut_details: None,
        };
        assert!(matches!(
            AttachmentRef::from_drive_node(&node("application/vnd.google-apps.document")),
            AttachmentRef::NativeDocument { kind: NativeKind::Document, .. }
        ));
        assert!(matches!(
            AttachmentRef::from_drive_node(&node("application/vnd.google-apps.form")),
            AttachmentRef::Form { .. }
        ));
        assert!(matches!(
            AttachmentRef::from_drive_node(&node("image/png")),
            AttachmentRef::BinaryFile { .. }
        ));
    }

    #[test]
    fn test_material_items_and_description_fallback() {
        let material = CourseMaterial {
            id: "m".into(),
            title: Some("Week 1".into()),
            description: None,
            topic_id: None,
            alternate_link: Some("https://classroom/m".into()),
            materials: vec![
                MaterialAttachment {
                    drive_file: Some(SharedDriveFile {
                        drive_file: DriveFileRef {
                            id: "d1".into(),
                            title: Some("notes.pdf".into()),
                            alternate_link: None,
                        },
                    }),
                    ..Default::default()
                },
                MaterialAttachment {
                    link: Some(Link {
                        url: "https://example.com".into(),
                        title: None,
                    }),
                    ..Default::default()
                },
                MaterialAttachment::default(),
            ],
        };
        let items = material_items(&material);
        assert_eq!(items.len(), 3);
        assert!(matches!(&items[0], MaterialItem::Drive { id, .. } if id == "d1"));
        assert!(matches!(&items[2],
            MaterialItem::Attachment(AttachmentRef::Hyperlink { url, title })
                if url == "https://classroom/m" && title == "Week 1"));

        let linked = CourseMaterial {
            materials: vec![],
            description: Some("see https://drive.google.com/file/d/1abcdefghijk/view".into()),
            ..material
        };
        assert_eq!(
            material_items(&linked),
            vec![MaterialItem::Drive {
                id: "1abcdefghijk".into(),
                title: None
            }]
        );
    }

    #[test]
    fn test_policy_validation() {
        assert!(ExportPolicy::default().validate().is_ok());
        let bad = ExportPolicy {
            spreadsheet: ExportFormat::Docx,
            ..ExportPolicy::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_placeholder_body() {
        let body = placeholder_body("https://x", "Two\nlines");
        assert!(body.starts_with("[InternetShortcut]"));
        assert!(body.contains("URL=https://x"));
        assert!(body.contains("Title=Two lines"));
    }
}
