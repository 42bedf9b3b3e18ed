//! Test doubles shared by the unit tests.

use crate::error::{AnalysisError, ModelError};
use crate::pipeline::llm::{ModelInvoker, ModelReply, ModelRequest, ModelTier, Role};
use crate::pipeline::render::{PageImage, Rasterizer};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// What the scripted invoker saw for one call.
#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub system: Option<String>,
    pub tier: ModelTier,
    pub turn_count: usize,
    pub last_user_text: String,
    pub image_pages: Vec<usize>,
}

/// Replays canned replies in order, one per physical call.
///
/// Primary and fast tiers have separate scripts. An exhausted script answers
/// with `fallback` if set, otherwise with a transport error.
pub(crate) struct ScriptedInvoker {
    primary: Mutex<VecDeque<Result<ModelReply, ModelError>>>,
    fast: Mutex<VecDeque<Result<ModelReply, ModelError>>>,
    fallback: Option<ModelReply>,
    delay: Option<Duration>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedInvoker {
    pub fn new(script: Vec<Result<ModelReply, ModelError>>) -> Self {
        Self {
            primary: Mutex::new(script.into()),
            fast: Mutex::new(VecDeque::new()),
            fallback: None,
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn repeating(reply: ModelReply) -> Self {
        let mut s = Self::new(Vec::new());
        s.fallback = Some(reply);
        s
    }

    pub fn with_fast(self, script: Vec<Result<ModelReply, ModelError>>) -> Self {
        *self.fast.lock().unwrap() = script.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn turn_counts(&self) -> Vec<usize> {
        self.requests().iter().map(|r| r.turn_count).collect()
    }
}

#[async_trait]
impl ModelInvoker for ScriptedInvoker {
    async fn invoke(&self, request: ModelRequest<'_>) -> Result<ModelReply, ModelError> {
        let last_user = request.turns.iter().rev().find(|t| t.role == Role::User);
        self.requests.lock().unwrap().push(RecordedRequest {
            system: request.system.map(str::to_string),
            tier: request.tier,
            turn_count: request.turns.len(),
            last_user_text: last_user.map(|t| t.text.clone()).unwrap_or_default(),
            image_pages: last_user
                .map(|t| t.images.iter().map(|(_, img)| img.page_num).collect())
                .unwrap_or_default(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let queue = match request.tier {
            ModelTier::Primary => &self.primary,
            ModelTier::Fast => &self.fast,
        };
        let next = queue.lock().unwrap().pop_front();
        match (next, &self.fallback) {
            (Some(r), _) => r,
            (None, Some(reply)) => Ok(reply.clone()),
            (None, None) => Err(ModelError::Transport("script exhausted".into())),
        }
    }
}

/// Produces `pages` tiny fake page images.
pub(crate) struct FakeRasterizer {
    pub pages: usize,
}

#[async_trait]
impl Rasterizer for FakeRasterizer {
    async fn rasterize(
        &self,
        _document: &[u8],
        page_limit: Option<usize>,
    ) -> Result<Vec<PageImage>, AnalysisError> {
        let n = page_limit.map_or(self.pages, |l| l.min(self.pages));
        Ok((1..=n).map(fake_page).collect())
    }

    async fn page_count(&self, _document: &[u8]) -> Result<usize, AnalysisError> {
        Ok(self.pages)
    }
}

pub(crate) fn fake_page(page_num: usize) -> PageImage {
    PageImage {
        page_num,
        data: "iVBORw0KGgo=".to_string(),
        mime_type: "image/png".to_string(),
    }
}

/// Model text for a batch where the model answered for every page in `pages`.
pub(crate) fn page_blocks(pages: impl IntoIterator<Item = usize>) -> String {
    pages
        .into_iter()
        .map(|p| {
            format!(
                "<thinking>page {p}</thinking>\n<output page=\"{p}\">\n  <page_type>Form {p}</page_type>\n  <page_content>content of page {p}</page_content>\n</output>\n"
            )
        })
        .collect()
}
