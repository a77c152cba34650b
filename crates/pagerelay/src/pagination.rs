//! Paginated aggregation engine.
//!
//! Drives one target through repeated worker calls, following the cursor
//! carried by the last item of each page until it runs out or a call fails.
//! A failure never discards the items already collected.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::broker::Broker;
use crate::error::CallError;
use crate::events::{EventBus, RelayEvent};
use crate::types::{Page, QueryTarget, TaggedItem, CURSOR_FIELD};

/// Something that answers one page request.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, api_name: &str, params: Value) -> Result<Value, CallError>;
}

/// A [`PageSource`] that calls one worker identity through the broker.
#[derive(Debug, Clone)]
pub struct BrokerPageSource {
    broker: Arc<Broker>,
    identity: String,
}

impl BrokerPageSource {
    pub fn new(broker: Arc<Broker>, identity: impl Into<String>) -> Self {
        Self {
            broker,
            identity: identity.into(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }
}

#[async_trait]
impl PageSource for BrokerPageSource {
    async fn fetch_page(&self, api_name: &str, params: Value) -> Result<Value, CallError> {
        self.broker.call(&self.identity, api_name, params).await
    }
}

/// How a target's pagination ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    Done,
    Failed(CallError),
}

/// Everything collected for one target.
#[derive(Debug, Clone)]
pub struct AggregationResult {
    pub target: QueryTarget,
    pub items: Vec<TaggedItem>,
    /// Number of requests issued, including a failed one.
    pub pages: u32,
    pub elapsed: Duration,
    pub termination: Termination,
}

impl AggregationResult {
    pub fn error(&self) -> Option<&CallError> {
        match &self.termination {
            Termination::Done => None,
            Termination::Failed(e) => Some(e),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error().is_some()
    }
}

/// Fetches every page for a target, one request at a time.
pub struct Paginator {
    source: Arc<dyn PageSource>,
    page_delay: Duration,
    events: Option<Arc<EventBus>>,
}

impl Paginator {
    pub fn new(source: Arc<dyn PageSource>, page_delay: Duration) -> Self {
        Self {
            source,
            page_delay,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Page through `target`, starting at `start_cursor` (or the first page).
    ///
    /// Each request carries `base_params` with `url` and `cursor` overridden.
    pub async fn run(
        &self,
        api_name: &str,
        base_params: &Map<String, Value>,
        target: &QueryTarget,
        start_cursor: Option<String>,
    ) -> AggregationResult {
        let started = Instant::now();
        let mut cursor = start_cursor.unwrap_or_default();
        let mut items = Vec::new();
        let mut pages = 0u32;

        let termination = loop {
            let mut params = base_params.clone();
            params.insert("url".to_string(), Value::String(target.url.clone()));
            params.insert(CURSOR_FIELD.to_string(), Value::String(cursor.clone()));

            pages += 1;
            let result = match self.source.fetch_page(api_name, Value::Object(params)).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!("Page {pages} of {} failed: {e}", target.url);
                    break Termination::Failed(e);
                }
            };

            let Some(page) = Page::from_result(result, target) else {
                tracing::warn!("Page {pages} of {} was not an item list", target.url);
                break Termination::Failed(CallError::ProtocolViolation(
                    "result is not an array".to_string(),
                ));
            };

            tracing::debug!("Page {pages} of {}: {} items", target.url, page.items.len());
            if let Some(events) = &self.events {
                events.emit(RelayEvent::PageFetched {
                    url: target.url.clone(),
                    page: pages,
                    items: page.items.len(),
                });
            }
            items.extend(page.items);

            match page.next_cursor {
                Some(next) => {
                    cursor = next;
                    tokio::time::sleep(self.page_delay).await;
                }
                None => break Termination::Done,
            }
        };

        AggregationResult {
            target: target.clone(),
            items,
            pages,
            elapsed: started.elapsed(),
            termination,
        }
    }
}
