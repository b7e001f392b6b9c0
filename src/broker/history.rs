//! Bounded in-memory message history.

use std::collections::VecDeque;

use super::message::Message;
use super::pattern::Pattern;

/// Filter for [`Broker::history`](super::Broker::history).
///
/// `message_type` accepts an exact type or a wildcard pattern. `since` and
/// `until` are inclusive millisecond timestamps. `limit` keeps the most
/// recent N matches.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub message_type: Option<String>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<usize>,
}

impl HistoryQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    pub fn since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: i64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug)]
pub(crate) struct History {
    limit: usize,
    messages: VecDeque<Message>,
}

impl History {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit,
            messages: VecDeque::with_capacity(limit.min(1024)),
        }
    }

    /// Append, evicting the oldest entries once over the limit.
    pub(crate) fn push(&mut self, message: Message) {
        self.messages.push_back(message);
        while self.messages.len() > self.limit {
            self.messages.pop_front();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }

    pub(crate) fn clear(&mut self) {
        self.messages.clear();
    }

    /// Matching messages, oldest first.
    pub(crate) fn query(&self, query: &HistoryQuery) -> Vec<Message> {
        let pattern = match query.message_type.as_deref().map(Pattern::compile) {
            Some(Ok(pattern)) => Some(pattern),
            Some(Err(_)) => return Vec::new(),
            None => None,
        };

        let mut matched: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| pattern.as_ref().is_none_or(|p| p.matches(&m.message_type)))
            .filter(|m| query.since.is_none_or(|since| m.timestamp >= since))
            .filter(|m| query.until.is_none_or(|until| m.timestamp <= until))
            .cloned()
            .collect();

        if let Some(limit) = query.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }

        matched
    }
}
