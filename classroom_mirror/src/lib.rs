//! classroom_mirror - Mirror Google Classroom course materials to disk.
//!
//! This library provides functionality to:
//! - List Classroom courses, topics and course materials (fully paginated)
//! - Export native Google documents and fetch binary Drive files
//! - Walk shared Drive folders without looping on shortcut cycles
//! - Write link placeholders for videos, forms and web links
//! - Resume an interrupted run without downloading completed files again
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use classroom_mirror::{AuthSession, GoogleClient, MirrorOptions, Orchestrator, RateLimiter};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let auth = AuthSession::from_files("token.json", None)?;
//!     let client = Arc::new(GoogleClient::new(Arc::new(auth), Arc::new(RateLimiter::default())));
//!     let mirror = Orchestrator::new(
//!         client.clone(),
//!         client.clone(),
//!         client,
//!         MirrorOptions::new("classroom"),
//!         CancellationToken::new(),
//!     );
//!
//!     let courses = mirror.list_courses().await?;
//!     let summary = mirror.mirror_courses(&courses).await?;
//!     println!("{}", summary);
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod auth;
pub mod classifier;
pub mod client;
pub mod config;
pub mod downloader;
pub mod enumerator;
pub mod error;
pub mod ledger;
pub mod models;
pub mod orchestrator;
pub mod rate_limiter;
pub mod retry;
pub mod sanitizer;
pub mod selection;
pub mod traversal;
pub mod url_parser;

// Re-exports for convenience
pub use api::{ClassroomApi, ContentSource, Download, DriveApi};
pub use auth::{AuthSession, AuthState, AuthToken, TokenStore};
pub use classifier::{AttachmentRef, Classifier, ExportFormat, ExportPolicy, Strategy};
pub use client::GoogleClient;
pub use config::Config;
pub use downloader::{DownloadReport, DownloadTask, Downloader, FailureReason, TaskStatus};
pub use enumerator::HierarchyEnumerator;
pub use error::{MirrorError, Result};
pub use models::{Course, CourseMaterial, DriveNode, Page, Topic};
pub use orchestrator::{MirrorOptions, Orchestrator, RunSummary};
pub use rate_limiter::RateLimiter;
pub use retry::RetryPolicy;
pub use selection::Selection;
pub use traversal::{DriveTraversal, WalkEntry};
pub use url_parser::extract_id;
