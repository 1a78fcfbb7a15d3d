//! Lazy, fully paginated listings of Classroom and Drive collections.
//!
//! Each listing is a stream that follows continuation tokens until the
//! service stops returning one. Every page request goes through the retry
//! policy, so a transient failure on page three does not restart pages one
//! and two.

use std::future::Future;
use std::sync::Arc;

use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::api::{ClassroomApi, DriveApi};
use crate::error::{MirrorError, Result};
use crate::models::{Course, CourseMaterial, DriveNode, Page, Topic};
use crate::retry::RetryPolicy;

enum Cursor {
    Start,
    Next(String),
    Done,
}

/// Flatten a paginated listing into a stream of items.
///
/// `fetch` receives the continuation token (`None` for the first page). The
/// stream ends after the last page, or after yielding the first error.
pub fn paginate<'a, T, F, Fut>(fetch: F) -> BoxStream<'a, Result<T>>
where
    T: Send + 'a,
    F: FnMut(Option<String>) -> Fut + Send + 'a,
    Fut: Future<Output = Result<Page<T>>> + Send + 'a,
{
    stream::try_unfold((Cursor::Start, fetch), |(cursor, mut fetch)| async move {
        let token = match cursor {
            Cursor::Start => None,
            Cursor::Next(token) => Some(token),
            Cursor::Done => return Ok::<_, MirrorError>(None),
        };

        let page = fetch(token.clone()).await?;
        let next = match page.continuation() {
            Some(next) if Some(next) == token.as_deref() => {
                warn!(token = next, "continuation token repeated, ending listing");
                Cursor::Done
            }
            Some(next) => Cursor::Next(next.to_string()),
            None => Cursor::Done,
        };
        Ok(Some((page.items, (next, fetch))))
    })
    .map_ok(|items| stream::iter(items.into_iter().map(Ok)))
    .try_flatten()
    .boxed()
}

/// Enumerates courses, topics, materials and folder children.
///
/// Listings are restartable: calling a method again issues a fresh set of
/// page requests.
#[derive(Clone)]
pub struct HierarchyEnumerator {
    classroom: Arc<dyn ClassroomApi>,
    drive: Arc<dyn DriveApi>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl HierarchyEnumerator {
    pub fn new(
        classroom: Arc<dyn ClassroomApi>,
        drive: Arc<dyn DriveApi>,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            classroom,
            drive,
            retry,
            cancel,
        }
    }

    pub fn list_courses(&self) -> BoxStream<'static, Result<Course>> {
        let api = self.classroom.clone();
        self.retried(move |token| {
            let api = api.clone();
            async move { api.list_courses(token.as_deref()).await }.boxed()
        })
    }

    pub fn list_topics(&self, course_id: &str) -> BoxStream<'static, Result<Topic>> {
        let api = self.classroom.clone();
        let course_id = course_id.to_string();
        self.retried(move |token| {
            let api = api.clone();
            let course_id = course_id.clone();
            async move { api.list_topics(&course_id, token.as_deref()).await }.boxed()
        })
    }

    /// Materials of a course, optionally restricted to one topic.
    pub fn list_materials(
        &self,
        course_id: &str,
        topic_id: Option<&str>,
    ) -> BoxStream<'static, Result<CourseMaterial>> {
        let api = self.classroom.clone();
        let course_id = course_id.to_string();
        let topic_id = topic_id.map(str::to_string);
        self.retried(move |token| {
            let api = api.clone();
            let course_id = course_id.clone();
            async move { api.list_materials(&course_id, token.as_deref()).await }.boxed()
        })
        .try_filter(move |material| {
            future::ready(match &topic_id {
                Some(topic) => material.topic_id.as_deref() == Some(topic.as_str()),
                None => true,
            })
        })
        .boxed()
    }

    pub fn list_children(&self, folder_id: &str) -> BoxStream<'static, Result<DriveNode>> {
        let api = self.drive.clone();
        let folder_id = folder_id.to_string();
        self.retried(move |token| {
            let api = api.clone();
            let folder_id = folder_id.clone();
            async move { api.list_children(&folder_id, token.as_deref()).await }.boxed()
        })
    }

    /// Metadata for a single Drive node.
    pub async fn node(&self, id: &str) -> Result<DriveNode> {
        self.retry
            .run(&self.cancel, |_| self.drive.get_node(id))
            .await
            .result
    }

    fn retried<T, F>(&self, call: F) -> BoxStream<'static, Result<T>>
    where
        T: Send + 'static,
        F: Fn(Option<String>) -> BoxFuture<'static, Result<Page<T>>> + Send + Sync + 'static,
    {
        let retry = self.retry.clone();
        let cancel = self.cancel.clone();
        let call = Arc::new(call);
        paginate(move |token: Option<String>| {
            let retry = retry.clone();
            let cancel = cancel.clone();
            let call = call.clone();
            async move { retry.run(&cancel, |_| call(token.clone())).await.result }
        })
    }
}
