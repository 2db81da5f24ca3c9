use async_trait::async_trait;
use tracing::debug;

use crate::engine::DocumentHandle;
use crate::error::EngineError;
use crate::PageNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageRef {
    /// Zero-based page index.
    Index(usize),
    Object { number: u32, generation: u16 },
}

/// A destination spelled out in place. `page: None` is an empty destination,
/// which is different from an outline entry carrying no destination at all.
#[derive(Debug, Clone, PartialEq)]
pub struct ExplicitDestination {
    pub page: Option<PageRef>,
}

impl ExplicitDestination {
    pub fn for_index(index: usize) -> Self {
        Self {
            page: Some(PageRef::Index(index)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Destination {
    Named(String),
    Explicit(ExplicitDestination),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JumpRequest<'a> {
    pub destination: Option<&'a Destination>,
    pub fallback_url: Option<&'a str>,
}

#[async_trait]
pub trait ResolveStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn resolve(
        &self,
        document: &dyn DocumentHandle,
        request: &JumpRequest<'_>,
    ) -> Result<Option<PageNumber>, EngineError>;
}

async fn page_for_explicit(
    document: &dyn DocumentHandle,
    destination: &ExplicitDestination,
) -> Result<Option<PageNumber>, EngineError> {
    match &destination.page {
        Some(page_ref) => {
            let index = document.page_index(page_ref).await?;
            Ok(Some(index + 1))
        }
        None => Ok(None),
    }
}

pub struct NamedDestinationStrategy;

#[async_trait]
impl ResolveStrategy for NamedDestinationStrategy {
    fn name(&self) -> &'static str {
        "named"
    }

    async fn resolve(
        &self,
        document: &dyn DocumentHandle,
        request: &JumpRequest<'_>,
    ) -> Result<Option<PageNumber>, EngineError> {
        let Some(Destination::Named(name)) = request.destination else {
            return Ok(None);
        };
        match document.destination(name).await? {
            Some(explicit) => page_for_explicit(document, &explicit).await,
            None => Ok(None),
        }
    }
}

pub struct ExplicitDestinationStrategy;

#[async_trait]
impl ResolveStrategy for ExplicitDestinationStrategy {
    fn name(&self) -> &'static str {
        "explicit"
    }

    async fn resolve(
        &self,
        document: &dyn DocumentHandle,
        request: &JumpRequest<'_>,
    ) -> Result<Option<PageNumber>, EngineError> {
        match request.destination {
            Some(Destination::Explicit(explicit)) => page_for_explicit(document, explicit).await,
            _ => Ok(None),
        }
    }
}

pub struct UrlFragmentStrategy;

#[async_trait]
impl ResolveStrategy for UrlFragmentStrategy {
    fn name(&self) -> &'static str {
        "url-fragment"
    }

    async fn resolve(
        &self,
        _document: &dyn DocumentHandle,
        request: &JumpRequest<'_>,
    ) -> Result<Option<PageNumber>, EngineError> {
        Ok(request.fallback_url.and_then(parse_page_fragment))
    }
}

/// Parses `N` out of `...#page=N`. Trailing characters after the digits are
/// ignored (`#page=12&zoom=80` is page 12); zero and non-numbers are rejected.
pub fn parse_page_fragment(url: &str) -> Option<PageNumber> {
    const MARKER: &str = "#page=";
    let (_, tail) = url.split_once(MARKER)?;
    let tail = tail.trim_start();
    let digits_end = tail
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(idx, _)| idx)
        .unwrap_or(tail.len());
    let page: PageNumber = tail[..digits_end].parse().ok()?;
    (page > 0).then_some(page)
}

/// Ordered chain of strategies; the first one producing a page wins.
pub struct DestinationResolver {
    strategies: Vec<Box<dyn ResolveStrategy>>,
}

impl Default for DestinationResolver {
    fn default() -> Self {
        Self::new(vec![
            Box::new(NamedDestinationStrategy),
            Box::new(ExplicitDestinationStrategy),
            Box::new(UrlFragmentStrategy),
        ])
    }
}

impl DestinationResolver {
    pub fn new(strategies: Vec<Box<dyn ResolveStrategy>>) -> Self {
        Self { strategies }
    }

    pub async fn resolve_page(
        &self,
        document: &dyn DocumentHandle,
        request: &JumpRequest<'_>,
    ) -> Option<PageNumber> {
        for strategy in &self.strategies {
            match strategy.resolve(document, request).await {
                Ok(Some(page)) if page > 0 => {
                    debug!(strategy = strategy.name(), page, "resolved destination");
                    return Some(page);
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(strategy = strategy.name(), %err, "destination strategy failed");
                }
            }
        }
        None
    }
}
