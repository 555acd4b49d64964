use std::collections::HashMap;

use crate::error::MonitorError;

/// Marker distinguishing key-fetch traffic from assistant chat on the
/// shared reply topic.
pub const KEY_FETCH_MARKER: &str = "__API_CALL__";

pub const ASSISTANT_ID_PREFIX: &str = "ai-req";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestPurpose {
    KeyFetch,
    Assistant,
}

impl RequestPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KeyFetch => "key-fetch",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub id: String,
    pub purpose: RequestPurpose,
    pub issued_at_ms: u64,
    pub timeout_ms: Option<u64>,
}

/// Returns true when a reply id belongs to the key-fetch flow. Peers are
/// only required to preserve the marker, not the exact id.
pub fn is_key_fetch_id(request_id: &str) -> bool {
    request_id.contains(KEY_FETCH_MARKER)
}

/// Tracks requests sent over the wire until their replies arrive or their
/// deadlines pass. At most one request per purpose may be in flight.
#[derive(Debug, Default)]
pub struct RequestCorrelator {
    pending: HashMap<String, PendingRequest>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_pending(&self, purpose: RequestPurpose) -> bool {
        self.pending.values().any(|p| p.purpose == purpose)
    }

    /// Registers a new request and returns its id. A second request of
    /// the same purpose is rejected before anything hits the wire.
    pub fn begin(
        &mut self,
        purpose: RequestPurpose,
        now_ms: u64,
        suffix: &str,
        timeout_ms: Option<u64>,
    ) -> Result<String, MonitorError> {
        if self.is_pending(purpose) {
            return Err(MonitorError::validation(format!(
                "a {} request is already in flight",
                purpose.as_str()
            )));
        }
        let prefix = match purpose {
            RequestPurpose::KeyFetch => KEY_FETCH_MARKER,
            RequestPurpose::Assistant => ASSISTANT_ID_PREFIX,
        };
        let id = format!("{prefix}-{now_ms}-{suffix}");
        self.pending.insert(
            id.clone(),
            PendingRequest {
                id: id.clone(),
                purpose,
                issued_at_ms: now_ms,
                timeout_ms,
            },
        );
        Ok(id)
    }

    /// Settles the request a reply belongs to. Exact id match wins; a
    /// key-fetch-marked reply with an unrecognized id still settles the
    /// one pending key fetch, since peers may mint their own reply ids.
    /// Unmatched replies return `None` and should be dropped.
    pub fn complete(&mut self, request_id: &str) -> Option<PendingRequest> {
        if let Some(request) = self.pending.remove(request_id) {
            return Some(request);
        }
        if is_key_fetch_id(request_id) {
            let key = self
                .pending
                .iter()
                .find(|(_, p)| p.purpose == RequestPurpose::KeyFetch)
                .map(|(id, _)| id.clone())?;
            return self.pending.remove(&key);
        }
        None
    }

    /// Withdraws a request whose deadline passed (or whose transport went
    /// away). Returns `None` when a reply already settled it.
    pub fn cancel(&mut self, request_id: &str) -> Option<PendingRequest> {
        self.pending.remove(request_id)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_embed_the_purpose_marker() {
        let mut correlator = RequestCorrelator::new();
        let fetch_id = correlator
            .begin(RequestPurpose::KeyFetch, 1_737_271_650_000, "x7k2m9p4q", Some(3_000))
            .unwrap();
        let chat_id = correlator
            .begin(RequestPurpose::Assistant, 1_737_271_650_001, "a1b2c3d4e", None)
            .unwrap();

        assert_eq!(fetch_id, "__API_CALL__-1737271650000-x7k2m9p4q");
        assert_eq!(chat_id, "ai-req-1737271650001-a1b2c3d4e");
        assert!(is_key_fetch_id(&fetch_id));
        assert!(!is_key_fetch_id(&chat_id));
    }

    #[test]
    fn duplicate_key_fetch_is_rejected_while_one_is_pending() {
        let mut correlator = RequestCorrelator::new();
        correlator
            .begin(RequestPurpose::KeyFetch, 1_000, "aaaaaaaaa", Some(3_000))
            .unwrap();

        let second = correlator.begin(RequestPurpose::KeyFetch, 1_001, "bbbbbbbbb", Some(3_000));
        assert!(second.is_err());
        assert_eq!(correlator.len(), 1);
    }

    #[test]
    fn reply_with_exact_id_settles_the_request() {
        let mut correlator = RequestCorrelator::new();
        let id = correlator
            .begin(RequestPurpose::KeyFetch, 1_000, "aaaaaaaaa", Some(3_000))
            .unwrap();

        let settled = correlator.complete(&id).unwrap();
        assert_eq!(settled.purpose, RequestPurpose::KeyFetch);
        assert!(correlator.is_empty());
    }

    #[test]
    fn marked_reply_with_foreign_id_settles_the_pending_fetch() {
        let mut correlator = RequestCorrelator::new();
        correlator
            .begin(RequestPurpose::KeyFetch, 1_000, "aaaaaaaaa", Some(3_000))
            .unwrap();

        let settled = correlator.complete("__API_CALL__-device-reply");
        assert!(settled.is_some());
        assert!(correlator.is_empty());
    }

    #[test]
    fn unmatched_replies_are_dropped() {
        let mut correlator = RequestCorrelator::new();
        correlator
            .begin(RequestPurpose::Assistant, 1_000, "aaaaaaaaa", None)
            .unwrap();

        assert!(correlator.complete("ai-req-999-zzzzzzzzz").is_none());
        assert_eq!(correlator.len(), 1);
    }

    #[test]
    fn assistant_reply_never_settles_a_key_fetch() {
        let mut correlator = RequestCorrelator::new();
        correlator
            .begin(RequestPurpose::KeyFetch, 1_000, "aaaaaaaaa", Some(3_000))
            .unwrap();

        assert!(correlator.complete("ai-req-1000-bbbbbbbbb").is_none());
        assert!(correlator.is_pending(RequestPurpose::KeyFetch));
    }

    #[test]
    fn timeout_cancel_races_cleanly_with_a_late_reply() {
        let mut correlator = RequestCorrelator::new();
        let id = correlator
            .begin(RequestPurpose::KeyFetch, 1_000, "aaaaaaaaa", Some(3_000))
            .unwrap();

        assert!(correlator.cancel(&id).is_some());
        // The reply lost the race; nothing left to settle.
        assert!(correlator.complete(&id).is_none());
        // A fresh fetch may start again after the timeout.
        assert!(correlator
            .begin(RequestPurpose::KeyFetch, 5_000, "ccccccccc", Some(3_000))
            .is_ok());
    }

    #[test]
    fn clear_drops_all_pending_requests() {
        let mut correlator = RequestCorrelator::new();
        correlator
            .begin(RequestPurpose::KeyFetch, 1_000, "aaaaaaaaa", Some(3_000))
            .unwrap();
        correlator
            .begin(RequestPurpose::Assistant, 1_001, "bbbbbbbbb", None)
            .unwrap();

        correlator.clear();
        assert!(correlator.is_empty());
    }
}
