//! Breadth-first walk of a Drive folder tree.
//!
//! Folders can contain shortcuts to their own ancestors or to files already
//! seen elsewhere, so every walk keeps a visited set of resolved node ids and
//! emits each id at most once. The root counts as visited before the first
//! listing. Local names are allocated per directory as entries are
//! emitted; paths are relative to the root's directory.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};

use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, warn};

use crate::classifier::{AttachmentRef, Classification, Classifier};
use crate::enumerator::HierarchyEnumerator;
use crate::error::Result;
use crate::models::{DriveNode, NodeKind};
use crate::sanitizer::PathAllocator;

/// Why a node was not emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyVisited,
    DepthLimit,
}

/// One node discovered during a walk.
#[derive(Debug, Clone)]
pub enum WalkEntry {
    Folder {
        path: PathBuf,
        node: DriveNode,
        depth: usize,
    },
    File {
        path: PathBuf,
        node: DriveNode,
        classification: Classification,
    },
    Skipped {
        node: DriveNode,
        reason: SkipReason,
    },
}

/// State private to one walk.
#[derive(Debug, Default)]
pub struct TraversalContext {
    visited: HashSet<String>,
    names: PathAllocator,
}

impl TraversalContext {
    pub fn new(root_id: &str) -> Self {
        let mut ctx = Self::default();
        ctx.visited.insert(root_id.to_string());
        ctx
    }

    /// Mark `id` visited; false if it already was.
    pub fn visit(&mut self, id: &str) -> bool {
        self.visited.insert(id.to_string())
    }

    pub fn is_visited(&self, id: &str) -> bool {
        self.visited.contains(id)
    }
}

struct PendingFolder {
    id: String,
    path: PathBuf,
    depth: usize,
}

struct WalkState {
    enumerator: HierarchyEnumerator,
    classifier: Classifier,
    max_depth: Option<usize>,
    queue: VecDeque<PendingFolder>,
    ready: VecDeque<Result<WalkEntry>>,
    ctx: TraversalContext,
}

impl WalkState {
    async fn expand(&mut self, folder: PendingFolder) {
        debug!(folder = %folder.id, depth = folder.depth, "listing folder");
        let children: Vec<DriveNode> = match self.enumerator.list_children(&folder.id).try_collect().await {
            Ok(children) => children,
            Err(e) => {
                warn!(folder = %folder.id, error = %e, "failed to list folder");
                self.ready.push_back(Err(e));
                return;
            }
        };

        for child in children {
            let node = child.resolve_shortcut();
            match node.kind() {
                NodeKind::Folder => self.folder(&folder, node),
                // A shortcut with no resolvable target is fetched as a plain file.
                NodeKind::File | NodeKind::Shortcut => self.file(&folder.path, node),
            }
        }
    }

    fn folder(&mut self, parent: &PendingFolder, node: DriveNode) {
        let depth = parent.depth + 1;
        if self.max_depth.is_some_and(|max| depth > max) {
            warn!(folder = %node.name, id = %node.id, depth, "depth limit reached, not descending");
            self.ready.push_back(Ok(WalkEntry::Skipped {
                node,
                reason: SkipReason::DepthLimit,
            }));
            return;
        }
        if !self.ctx.visit(&node.id) {
            warn!(folder = %node.name, id = %node.id, "folder already visited, skipping cycle");
            self.ready.push_back(Ok(WalkEntry::Skipped {
                node,
                reason: SkipReason::AlreadyVisited,
            }));
            return;
        }

        let path = self.ctx.names.allocate(&parent.path, &node.name);
        self.queue.push_back(PendingFolder {
            id: node.id.clone(),
            path: path.clone(),
            depth,
        });
        self.ready.push_back(Ok(WalkEntry::Folder { path, node, depth }));
    }

    fn file(&mut self, dir: &Path, node: DriveNode) {
        if !self.ctx.visit(&node.id) {
            warn!(file = %node.name, id = %node.id, "file already visited, skipping");
            self.ready.push_back(Ok(WalkEntry::Skipped {
                node,
                reason: SkipReason::AlreadyVisited,
            }));
            return;
        }
        let classification = self.classifier.classify(&AttachmentRef::from_drive_node(&node));
        let path = self
            .ctx
            .names
            .allocate(dir, &classification.file_name(&node.name));
        self.ready.push_back(Ok(WalkEntry::File {
            path,
            node,
            classification,
        }));
    }
}

/// Walks Drive folders below a root.
#[derive(Clone)]
pub struct DriveTraversal {
    enumerator: HierarchyEnumerator,
    classifier: Classifier,
    max_depth: Option<usize>,
}

impl DriveTraversal {
    pub fn new(enumerator: HierarchyEnumerator, classifier: Classifier, max_depth: Option<usize>) -> Self {
        Self {
            enumerator,
            classifier,
            max_depth,
        }
    }

    /// Stream every node below `root_id`, breadth first.
    ///
    /// A folder that fails to list yields an error and the walk continues
    /// with its siblings.
    pub fn walk(&self, root_id: &str) -> BoxStream<'static, Result<WalkEntry>> {
        let mut queue = VecDeque::new();
        queue.push_back(PendingFolder {
            id: root_id.to_string(),
            path: PathBuf::new(),
            depth: 0,
        });
        let state = WalkState {
            enumerator: self.enumerator.clone(),
            classifier: self.classifier.clone(),
            max_depth: self.max_depth,
            queue,
            ready: VecDeque::new(),
            ctx: TraversalContext::new(root_id),
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(entry) = state.ready.pop_front() {
                    return Some((entry, state));
                }
                let folder = state.queue.pop_front()?;
                state.expand(folder).await;
            }
        })
        .boxed()
    }
}
