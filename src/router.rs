//! Maps responses to the handler registered for their origin.
//!
//! Lookup order for a target `host[:port]/path`:
//! 1. the longest pattern that prefixes the target at a boundary,
//! 2. a pattern equal to the bare host name,
//! 3. the `"*"` wildcard,
//! 4. [`NoOpHandler`].

use crate::error::SpiderError;
use crate::request::Request;
use crate::spider::{Handler, NoOpHandler};
use std::collections::HashMap;
use std::sync::Arc;

pub const WILDCARD: &str = "*";

pub struct ResponseRouter<I: Send + 'static> {
    handlers: HashMap<String, Arc<dyn Handler<I>>>,
    fallback: Arc<dyn Handler<I>>,
}

impl<I: Send + 'static> Default for ResponseRouter<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Send + 'static> ResponseRouter<I> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Arc::new(NoOpHandler),
        }
    }

    /// Registers `handler` for `pattern`. A pattern may be registered once.
    pub fn register(
        &mut self,
        pattern: impl Into<String>,
        handler: Arc<dyn Handler<I>>,
    ) -> Result<(), SpiderError> {
        let pattern = pattern.into();
        if pattern.is_empty() {
            return Err(SpiderError::ConfigurationError(
                "handler pattern must not be empty".to_string(),
            ));
        }
        if self.handlers.contains_key(&pattern) {
            return Err(SpiderError::DuplicateHandler(pattern));
        }
        self.handlers.insert(pattern, handler);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Returns the handler for `request` and the pattern that selected it
    /// (`None` when the no-op fallback was used).
    pub fn resolve(&self, request: &Request) -> (Arc<dyn Handler<I>>, Option<&str>) {
        let target = request.route_target();
        let host = request.url.host_str().unwrap_or_default();
        match self.match_pattern(&target, host) {
            Some((pattern, handler)) => (Arc::clone(handler), Some(pattern)),
            None => (Arc::clone(&self.fallback), None),
        }
    }

    fn match_pattern(&self, target: &str, host: &str) -> Option<(&str, &Arc<dyn Handler<I>>)> {
        let longest = self
            .handlers
            .iter()
            .filter(|(pattern, _)| pattern.as_str() != WILDCARD && prefix_at_boundary(target, pattern))
            .max_by_key(|(pattern, _)| pattern.len());
        if let Some((pattern, handler)) = longest {
            return Some((pattern.as_str(), handler));
        }

        self.handlers
            .get_key_value(host)
            .or_else(|| self.handlers.get_key_value(WILDCARD))
            .map(|(pattern, handler)| (pattern.as_str(), handler))
    }
}

fn prefix_at_boundary(target: &str, pattern: &str) -> bool {
    if !target.starts_with(pattern) {
        return false;
    }
    if pattern.ends_with('/') {
        return true;
    }
    matches!(
        target[pattern.len()..].chars().next(),
        None | Some('/') | Some(':') | Some('?')
    )
}
