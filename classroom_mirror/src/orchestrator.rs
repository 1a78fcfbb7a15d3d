//! Drives a whole mirroring run.
//!
//! Planning (listing courses, topics and materials, resolving Drive
//! attachments, walking folders) produces download tasks into a bounded
//! channel while the [`Downloader`] consumes them concurrently. Names are
//! allocated as tasks are planned, in listing order, so the same remote state
//! always yields the same local tree.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use tokio::fs;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::api::{ClassroomApi, ContentSource, DriveApi};
use crate::classifier::{
    material_items, AttachmentRef, Classifier, ExportPolicy, MaterialItem, RemoteContent, Strategy,
};
use crate::config::Config;
use crate::downloader::{
    DownloadReport, DownloadTask, Downloader, FailedItem, FailureReason, DEFAULT_CONCURRENCY,
};
use crate::enumerator::HierarchyEnumerator;
use crate::error::{MirrorError, Result};
use crate::models::{format_size, Course, CourseMaterial, DriveNode, NodeKind, Topic};
use crate::retry::RetryPolicy;
use crate::sanitizer::PathAllocator;
use crate::traversal::{DriveTraversal, WalkEntry};
use crate::url_parser::extract_id;

/// Directory for materials that belong to no topic.
pub const GENERAL_TOPIC: &str = "General";

/// Planned tasks buffered ahead of the downloader.
const QUEUE_DEPTH: usize = 64;

/// Settings for one run.
#[derive(Debug, Clone)]
pub struct MirrorOptions {
    pub root: PathBuf,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub max_depth: Option<usize>,
    pub export: ExportPolicy,
}

impl MirrorOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            max_depth: Some(32),
            export: ExportPolicy::default(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            root: config.download.root.clone(),
            concurrency: config.download.concurrency,
            retry: config.retry_policy(),
            max_depth: config.traversal.max_depth,
            export: config.export.clone(),
        }
    }
}

/// What a run did.
#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub courses: usize,
    pub topics: usize,
    pub directories: usize,
    pub empty_materials: usize,
    pub nodes_skipped: usize,
    pub download: DownloadReport,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        !self.download.failed.is_empty()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Courses:      {}", self.courses)?;
        writeln!(f, "Topics:       {}", self.topics)?;
        writeln!(f, "Directories:  {}", self.directories)?;
        writeln!(
            f,
            "Downloaded:   {} ({})",
            self.download.succeeded,
            format_size(self.download.bytes)
        )?;
        writeln!(f, "Skipped:      {}", self.download.skipped)?;
        writeln!(f, "Failed:       {}", self.download.failed.len())?;
        if self.download.not_started > 0 {
            writeln!(f, "Not started:  {}", self.download.not_started)?;
        }
        if self.nodes_skipped > 0 {
            writeln!(f, "Drive items skipped: {}", self.nodes_skipped)?;
        }
        if self.empty_materials > 0 {
            writeln!(f, "Empty materials: {}", self.empty_materials)?;
        }
        for failure in &self.download.failed {
            writeln!(f, "  {}: {}", failure.path.display(), failure.reason)?;
        }
        Ok(())
    }
}

enum Target<'a> {
    Courses(&'a [Course]),
    Drive(&'a [String]),
}

/// Mirrors courses or Drive references into a local directory.
pub struct Orchestrator {
    enumerator: HierarchyEnumerator,
    traversal: DriveTraversal,
    classifier: Classifier,
    content: Arc<dyn ContentSource>,
    options: MirrorOptions,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        classroom: Arc<dyn ClassroomApi>,
        drive: Arc<dyn DriveApi>,
        content: Arc<dyn ContentSource>,
        options: MirrorOptions,
        cancel: CancellationToken,
    ) -> Self {
        let enumerator = HierarchyEnumerator::new(classroom, drive, options.retry.clone(), cancel.clone());
        let classifier = Classifier::new(options.export.clone());
        let traversal = DriveTraversal::new(enumerator.clone(), classifier.clone(), options.max_depth);
        Self {
            enumerator,
            traversal,
            classifier,
            content,
            options,
            cancel,
        }
    }

    pub fn options(&self) -> &MirrorOptions {
        &self.options
    }

    /// Every course visible to the account, across all pages.
    pub async fn list_courses(&self) -> Result<Vec<Course>> {
        self.enumerator.list_courses().try_collect().await
    }

    /// Mirror each course into `<root>/<course>/<topic>/...`.
    pub async fn mirror_courses(&self, courses: &[Course]) -> Result<RunSummary> {
        self.run(Target::Courses(courses)).await
    }

    /// Mirror Drive folders or files given as URLs or ids into `<root>`.
    pub async fn mirror_drive(&self, references: &[String]) -> Result<RunSummary> {
        self.run(Target::Drive(references)).await
    }

    async fn run(&self, target: Target<'_>) -> Result<RunSummary> {
        fs::create_dir_all(&self.options.root).await?;

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let downloader = Downloader::new(
            self.options.root.clone(),
            self.content.clone(),
            self.options.retry.clone(),
            self.options.concurrency,
            self.cancel.clone(),
        );

        let mut planner = Planner::new(self, tx);
        let produce = async move {
            let result = match target {
                Target::Courses(courses) => planner.plan_courses(courses).await,
                Target::Drive(references) => planner.plan_drive(references).await,
            };
            if result.is_err() {
                self.cancel.cancel();
            }
            // Dropping the planner closes the queue.
            (planner.stats, result)
        };
        let consume = downloader.run(receiver_stream(rx));

        let ((stats, planned), downloaded) = tokio::join!(produce, consume);
        planned?;
        let mut download = downloaded?;
        download.failed.extend(stats.failures);

        Ok(RunSummary {
            courses: stats.courses,
            topics: stats.topics,
            directories: stats.directories,
            empty_materials: stats.empty_materials,
            nodes_skipped: stats.nodes_skipped,
            download,
        })
    }
}

fn receiver_stream(rx: mpsc::Receiver<DownloadTask>) -> BoxStream<'static, DownloadTask> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|task| (task, rx)) }).boxed()
}

#[derive(Debug, Default)]
struct PlanStats {
    courses: usize,
    topics: usize,
    directories: usize,
    empty_materials: usize,
    nodes_skipped: usize,
    failures: Vec<FailedItem>,
}

/// Turns listings into download tasks. Only fatal errors escape.
struct Planner<'a> {
    orch: &'a Orchestrator,
    tx: mpsc::Sender<DownloadTask>,
    names: PathAllocator,
    stats: PlanStats,
}

impl<'a> Planner<'a> {
    fn new(orch: &'a Orchestrator, tx: mpsc::Sender<DownloadTask>) -> Self {
        Self {
            orch,
            tx,
            names: PathAllocator::new(),
            stats: PlanStats::default(),
        }
    }

    fn cancelled(&self) -> bool {
        self.orch.cancel.is_cancelled()
    }

    async fn plan_courses(&mut self, courses: &[Course]) -> Result<()> {
        for course in courses {
            if self.cancelled() {
                break;
            }
            self.plan_course(course).await?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(course = %course.name))]
    async fn plan_course(&mut self, course: &Course) -> Result<()> {
        info!(id = %course.id, "mirroring course");
        let course_dir = self.names.allocate(Path::new(""), &course.name);
        if !self.create_dir(&course_dir).await {
            return Ok(());
        }
        self.stats.courses += 1;

        let topics: Vec<Topic> = match self.orch.enumerator.list_topics(&course.id).try_collect().await {
            Ok(topics) => topics,
            Err(e) => {
                self.listing_failed(&course_dir, e)?;
                Vec::new()
            }
        };
        let mut materials: Vec<CourseMaterial> =
            match self.orch.enumerator.list_materials(&course.id, None).try_collect().await {
                Ok(materials) => materials,
                Err(e) => return self.listing_failed(&course_dir, e),
            };
        // Oldest first, so earlier uploads keep the unsuffixed names.
        materials.reverse();
        debug!(topics = topics.len(), materials = materials.len(), "course listed");

        let mut topic_dirs: HashMap<Option<String>, PathBuf> = HashMap::new();
        for topic in &topics {
            let dir = self.names.allocate(&course_dir, &topic.name);
            if self.create_dir(&dir).await {
                self.stats.topics += 1;
                topic_dirs.insert(Some(topic.topic_id.clone()), dir);
            }
        }

        for material in &materials {
            if self.cancelled() {
                break;
            }
            let key = material
                .topic_id
                .clone()
                .filter(|id| topic_dirs.contains_key(&Some(id.clone())));
            let dir = match topic_dirs.get(&key) {
                Some(dir) => dir.clone(),
                None => {
                    let dir = self.names.allocate(&course_dir, GENERAL_TOPIC);
                    if !self.create_dir(&dir).await {
                        continue;
                    }
                    self.stats.topics += 1;
                    topic_dirs.insert(None, dir.clone());
                    dir
                }
            };
            self.plan_material(&dir, material).await?;
        }
        Ok(())
    }

    async fn plan_material(&mut self, dir: &Path, material: &CourseMaterial) -> Result<()> {
        let items = material_items(material);
        if items.is_empty() {
            warn!(
                material = material.title.as_deref().unwrap_or(&material.id),
                "material has no attachments or Drive links"
            );
            self.stats.empty_materials += 1;
            return Ok(());
        }
        for item in items {
            if self.cancelled() {
                break;
            }
            match item {
                MaterialItem::Attachment(attachment) => self.enqueue(dir, &attachment).await,
                MaterialItem::Drive { id, title } => self.plan_drive_item(dir, &id, title).await?,
            }
        }
        Ok(())
    }

    /// Resolve a Drive attachment; folders are walked, files become one task.
    async fn plan_drive_item(&mut self, dir: &Path, id: &str, title: Option<String>) -> Result<()> {
        match self.orch.enumerator.node(id).await {
            Ok(node) => self.plan_node(dir, node).await,
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(id, error = %e, "metadata lookup failed, fetching directly");
                let attachment = AttachmentRef::BinaryFile {
                    id: id.to_string(),
                    mime_type: None,
                    title: title.unwrap_or_else(|| id.to_string()),
                    size: None,
                };
                self.enqueue(dir, &attachment).await;
                Ok(())
            }
        }
    }

    async fn plan_node(&mut self, dir: &Path, node: DriveNode) -> Result<()> {
        let node = node.resolve_shortcut();
        match node.kind() {
            NodeKind::Folder => self.plan_folder(dir, node).await,
            NodeKind::File | NodeKind::Shortcut => {
                let attachment = AttachmentRef::from_drive_node(&node);
                self.enqueue(dir, &attachment).await;
                Ok(())
            }
        }
    }

    async fn plan_folder(&mut self, parent: &Path, node: DriveNode) -> Result<()> {
        let base = self.names.allocate(parent, &node.name);
        if !self.create_dir(&base).await {
            return Ok(());
        }
        info!(folder = %node.name, "walking Drive folder");

        let mut walk = self.orch.traversal.walk(&node.id);
        while let Some(entry) = walk.next().await {
            if self.cancelled() {
                break;
            }
            match entry {
                Ok(WalkEntry::Folder { path, .. }) => {
                    self.create_dir(&base.join(path)).await;
                }
                Ok(WalkEntry::File {
                    path,
                    node,
                    classification,
                }) => {
                    let expected = match &classification.strategy {
                        Strategy::Remote(RemoteContent::Fetch { .. }) => node.size,
                        _ => None,
                    };
                    self.send(DownloadTask::new(classification.strategy, base.join(path), expected))
                        .await;
                }
                Ok(WalkEntry::Skipped { .. }) => self.stats.nodes_skipped += 1,
                Err(e) => self.listing_failed(&base, e)?,
            }
        }
        Ok(())
    }

    async fn plan_drive(&mut self, references: &[String]) -> Result<()> {
        for reference in references {
            if self.cancelled() {
                break;
            }
            let id = match extract_id(reference) {
                Ok(id) => id,
                Err(e) => {
                    self.listing_failed(Path::new(reference), e)?;
                    continue;
                }
            };
            match self.orch.enumerator.node(&id).await {
                Ok(node) => self.plan_node(Path::new(""), node).await?,
                Err(e) => self.listing_failed(Path::new(reference), e)?,
            }
        }
        Ok(())
    }

    /// Plan a single file for `attachment` inside `dir`.
    async fn enqueue(&mut self, dir: &Path, attachment: &AttachmentRef) {
        let classification = self.orch.classifier.classify(attachment);
        let destination = self
            .names
            .allocate(dir, &classification.file_name(attachment.title()));
        let expected = match (&classification.strategy, attachment) {
            (Strategy::Remote(RemoteContent::Fetch { .. }), AttachmentRef::BinaryFile { size, .. }) => *size,
            _ => None,
        };
        self.send(DownloadTask::new(classification.strategy, destination, expected))
            .await;
    }

    async fn send(&mut self, task: DownloadTask) {
        if self.tx.send(task).await.is_err() {
            debug!("download queue closed");
        }
    }

    async fn create_dir(&mut self, relative: &Path) -> bool {
        match fs::create_dir_all(self.orch.options.root.join(relative)).await {
            Ok(()) => {
                self.stats.directories += 1;
                true
            }
            Err(e) => {
                warn!(path = %relative.display(), error = %e, "failed to create directory");
                self.stats.failures.push(FailedItem {
                    path: relative.to_path_buf(),
                    reason: FailureReason::Filesystem(e.to_string()),
                });
                false
            }
        }
    }

    /// Record a non-fatal planning error; fatal ones are returned.
    fn listing_failed(&mut self, path: &Path, error: MirrorError) -> Result<()> {
        if error.is_fatal() {
            return Err(error);
        }
        if matches!(error, MirrorError::Cancelled) {
            return Ok(());
        }
        warn!(path = %path.display(), error = %error, "listing failed");
        let attempts = self.orch.options.retry.max_attempts();
        self.stats.failures.push(FailedItem {
            path: path.to_path_buf(),
            reason: FailureReason::from_error(&error, attempts),
        });
        Ok(())
    }
}
