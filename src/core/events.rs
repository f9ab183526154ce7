//! Event index: contract events of the most recent ledgers.
//!
//! Events are decoded from each transaction's result meta when the ledger is
//! ingested and kept in a [`RetentionWindow`]. Queries walk the window with
//! `range` and a filter predicate; the index keeps no other state.

use crate::config::{
    DEFAULT_EVENT_RETENTION_WINDOW, DEFAULT_EVENTS_LIMIT, MAX_EVENTS_LIMIT, RpcCoreConfig,
};
use crate::core::window::{LedgerBucket, RetentionWindow, WindowRange, window_capacity};
use crate::types::{
    ContractId, EventType, Hash32, LedgerCloseMeta, TransactionHash, TransactionMeta, network_id,
    transaction_hash,
};
use crate::utils::error::{Result, RpcCoreError};
use std::fmt;
use std::str::FromStr;

/// Maximum number of filters in one query.
pub const MAX_FILTERS: usize = 5;
/// Maximum number of contract ids in one filter.
pub const MAX_CONTRACT_IDS_PER_FILTER: usize = 5;
/// Maximum number of topic filters in one filter.
pub const MAX_TOPIC_FILTERS_PER_FILTER: usize = 5;
/// Maximum number of segments in one topic filter.
pub const MAX_TOPIC_SEGMENTS: usize = 4;

/// One contract event together with its position in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub ledger_sequence: u32,
    /// Unix timestamp, seconds.
    pub ledger_close_time: i64,
    pub transaction_hash: TransactionHash,
    /// 1-based position of the emitting transaction in its ledger.
    pub application_order: u32,
    /// 0-based position of the event within its transaction.
    pub event_order: u32,
    pub event_type: EventType,
    pub contract_id: Option<ContractId>,
    pub topics: Vec<Vec<u8>>,
    pub data: Vec<u8>,
}

impl EventRecord {
    pub fn cursor(&self) -> EventCursor {
        EventCursor {
            ledger: self.ledger_sequence,
            application_order: self.application_order,
            event_order: self.event_order,
        }
    }
}

/// Position of an event in the canonical `(ledger, transaction, event)` order.
///
/// Rendered as `ledger-transaction-event`, e.g. `101-1-0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EventCursor {
    pub ledger: u32,
    pub application_order: u32,
    pub event_order: u32,
}

impl fmt::Display for EventCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.ledger, self.application_order, self.event_order
        )
    }
}

impl FromStr for EventCursor {
    type Err = RpcCoreError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || RpcCoreError::InvalidRequest(format!("invalid event cursor '{s}'"));
        let mut parts = s.split('-').map(|part| part.parse::<u32>().map_err(|_| invalid()));
        let cursor = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(ledger), Some(application_order), Some(event_order), None) => EventCursor {
                ledger: ledger?,
                application_order: application_order?,
                event_order: event_order?,
            },
            _ => return Err(invalid()),
        };
        Ok(cursor)
    }
}

/// Matcher for one topic position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentFilter {
    Exact(Vec<u8>),
    Wildcard,
}

impl SegmentFilter {
    fn matches(&self, topic: &[u8]) -> bool {
        match self {
            SegmentFilter::Exact(expected) => expected.as_slice() == topic,
            SegmentFilter::Wildcard => true,
        }
    }
}

/// Positional topic matcher; an event matches when it has exactly as many
/// topics as there are segments and every segment matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter(pub Vec<SegmentFilter>);

impl TopicFilter {
    pub fn matches(&self, topics: &[Vec<u8>]) -> bool {
        self.0.len() == topics.len()
            && self
                .0
                .iter()
                .zip(topics)
                .all(|(segment, topic)| segment.matches(topic))
    }
}

/// Conjunction of an optional event type, a contract id set and a topic
/// filter set. Empty sets match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub event_type: Option<EventType>,
    pub contract_ids: Vec<ContractId>,
    pub topics: Vec<TopicFilter>,
}

impl EventFilter {
    #[must_use]
    pub fn with_event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    #[must_use]
    pub fn with_contract(mut self, contract_id: ContractId) -> Self {
        self.contract_ids.push(contract_id);
        self
    }

    #[must_use]
    pub fn with_topics(mut self, segments: Vec<SegmentFilter>) -> Self {
        self.topics.push(TopicFilter(segments));
        self
    }

    pub fn matches(&self, event: &EventRecord) -> bool {
        if self.event_type.is_some_and(|t| t != event.event_type) {
            return false;
        }
        if !self.contract_ids.is_empty()
            && !event
                .contract_id
                .is_some_and(|id| self.contract_ids.contains(&id))
        {
            return false;
        }
        self.topics.is_empty() || self.topics.iter().any(|t| t.matches(&event.topics))
    }

    fn validate(&self) -> Result<()> {
        if self.contract_ids.len() > MAX_CONTRACT_IDS_PER_FILTER {
            return Err(RpcCoreError::InvalidRequest(format!(
                "maximum {MAX_CONTRACT_IDS_PER_FILTER} contract ids per filter"
            )));
        }
        if self.topics.len() > MAX_TOPIC_FILTERS_PER_FILTER {
            return Err(RpcCoreError::InvalidRequest(format!(
                "maximum {MAX_TOPIC_FILTERS_PER_FILTER} topic filters per filter"
            )));
        }
        for topic in &self.topics {
            if topic.0.is_empty() || topic.0.len() > MAX_TOPIC_SEGMENTS {
                return Err(RpcCoreError::InvalidRequest(format!(
                    "topic filters must have between 1 and {MAX_TOPIC_SEGMENTS} segments"
                )));
            }
        }
        Ok(())
    }
}

/// Parameters of [`EventIndex::get_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventQuery {
    pub start_ledger: u32,
    /// Inclusive.
    pub end_ledger: u32,
    /// Any filter may match; no filters match every event.
    pub filters: Vec<EventFilter>,
    /// Resume strictly after this event.
    pub cursor: Option<EventCursor>,
    /// `None` selects the index's default limit.
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn new(start_ledger: u32, end_ledger: u32) -> Self {
        Self {
            start_ledger,
            end_ledger,
            filters: Vec::new(),
            cursor: None,
            limit: None,
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: EventFilter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn with_cursor(mut self, cursor: EventCursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, event: &EventRecord) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|f| f.matches(event))
    }
}

/// Result of [`EventIndex::get_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPage {
    pub events: Vec<EventRecord>,
    /// Newest ledger in the index when the query ran.
    pub latest_ledger: Option<u32>,
    /// Cursor of the last returned event, for the next page.
    pub cursor: Option<EventCursor>,
}

/// Windowed index of contract events.
pub struct EventIndex {
    network_id: Hash32,
    window: RetentionWindow<Vec<EventRecord>>,
    default_limit: usize,
    max_limit: usize,
}

impl EventIndex {
    /// Creates an index retaining `retention_window` ledgers (`0` selects
    /// the default window).
    pub fn new(network_passphrase: &str, retention_window: u32) -> Self {
        Self {
            network_id: network_id(network_passphrase),
            window: RetentionWindow::new(window_capacity(
                retention_window,
                DEFAULT_EVENT_RETENTION_WINDOW,
            )),
            default_limit: DEFAULT_EVENTS_LIMIT,
            max_limit: MAX_EVENTS_LIMIT,
        }
    }

    pub fn from_config(config: &RpcCoreConfig) -> Self {
        Self::new(&config.network_passphrase, config.event_retention_window)
            .with_limits(config.default_events_limit, config.max_events_limit)
    }

    /// Overrides the default and maximum number of events per page.
    #[must_use]
    pub fn with_limits(mut self, default_limit: usize, max_limit: usize) -> Self {
        self.max_limit = max_limit.max(1);
        self.default_limit = default_limit.clamp(1, self.max_limit);
        self
    }

    /// Decodes every event of `meta` into a bucket without touching the window.
    ///
    /// Events of failed transactions are not indexed.
    ///
    /// # Errors
    ///
    /// Returns `RpcCoreError::Decode` if any transaction's result meta is
    /// malformed.
    pub fn prepare(&self, meta: &LedgerCloseMeta) -> Result<LedgerBucket<Vec<EventRecord>>> {
        let mut records = Vec::new();
        for (index, tx) in meta.transactions.iter().enumerate() {
            let tx_meta = TransactionMeta::decode(&tx.result_meta)?;
            if !tx_meta.successful {
                continue;
            }
            let application_order = position(index + 1)?;
            let hash = transaction_hash(&self.network_id, &tx.envelope);
            for (event_index, event) in tx_meta.events.into_iter().enumerate() {
                records.push(EventRecord {
                    ledger_sequence: meta.sequence,
                    ledger_close_time: meta.close_time,
                    transaction_hash: hash,
                    application_order,
                    event_order: position(event_index)?,
                    event_type: event.event_type,
                    contract_id: event.contract_id,
                    topics: event.topics,
                    data: event.data,
                });
            }
        }
        Ok(LedgerBucket::new(meta.sequence, meta.close_time, records))
    }

    /// Appends a bucket built by [`EventIndex::prepare`].
    ///
    /// # Errors
    ///
    /// Returns `RpcCoreError::OutOfOrder` if the bucket does not follow the tail.
    pub fn append(&self, bucket: LedgerBucket<Vec<EventRecord>>) -> Result<()> {
        self.window.append(bucket)
    }

    /// Decodes and appends one ledger; nothing is appended if decoding fails.
    pub fn ingest_ledger(&self, meta: &LedgerCloseMeta) -> Result<()> {
        let bucket = self.prepare(meta)?;
        self.append(bucket)
    }

    /// Events in `[start_ledger, end_ledger]` matching the query, in order.
    ///
    /// A range outside the window yields an empty page.
    ///
    /// # Errors
    ///
    /// Returns `RpcCoreError::InvalidRequest` for an inverted range or a
    /// filter set over the limits.
    pub fn get_events(&self, query: &EventQuery) -> Result<EventPage> {
        if query.start_ledger > query.end_ledger {
            return Err(RpcCoreError::InvalidRequest(format!(
                "start ledger {} is after end ledger {}",
                query.start_ledger, query.end_ledger
            )));
        }
        if query.filters.len() > MAX_FILTERS {
            return Err(RpcCoreError::InvalidRequest(format!(
                "maximum {MAX_FILTERS} filters per request"
            )));
        }
        for filter in &query.filters {
            filter.validate()?;
        }

        let limit = query
            .limit
            .filter(|l| *l > 0)
            .unwrap_or(self.default_limit)
            .min(self.max_limit);
        let start = query
            .cursor
            .map_or(query.start_ledger, |c| c.ledger.max(query.start_ledger));

        let range = self.window.range(start, query.end_ledger);
        let events: Vec<EventRecord> = range
            .iter()
            .flat_map(|bucket| bucket.content.iter())
            .filter(|event| query.cursor.is_none_or(|c| event.cursor() > c))
            .filter(|event| query.matches(event))
            .take(limit)
            .cloned()
            .collect();

        Ok(EventPage {
            cursor: events.last().map(EventRecord::cursor),
            events,
            latest_ledger: self.window.last_sequence(),
        })
    }

    /// Buckets with `start <= sequence <= end` that are still retained.
    pub fn range(&self, start: u32, end: u32) -> WindowRange<Vec<EventRecord>> {
        self.window.range(start, end)
    }

    /// Every retained bucket, oldest first.
    pub fn snapshot(&self) -> WindowRange<Vec<EventRecord>> {
        self.window.snapshot()
    }

    pub fn first_sequence(&self) -> Option<u32> {
        self.window.first_sequence()
    }

    pub fn latest_sequence(&self) -> Option<u32> {
        self.window.last_sequence()
    }

    pub fn retention_window(&self) -> u32 {
        self.window.capacity()
    }
}

fn position(index: usize) -> Result<u32> {
    u32::try_from(index)
        .map_err(|_| RpcCoreError::Decode(format!("position {index} does not fit in u32")))
}
