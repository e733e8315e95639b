//! Reply buffer: holds responses until a waiting request claims them.
//!
//! A response is claimed only by a waiter whose request id matches AND whose
//! expected reply type ([`ReplyType`]) accepts the response body. Anything
//! else stays buffered for a later or different waiter. Entries that nobody
//! claims are evicted after a retention window, and the buffer never holds
//! more than a fixed number of entries.

use crate::message::{
    CustomResponse, KeyExchangeResponse, PingResponse, RequestId, Response, ResponseBody,
};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A response payload type that a request can wait for.
pub trait ReplyType: Sized + Send + 'static {
    /// Whether this body is of the expected type.
    fn matches(body: &ResponseBody) -> bool;
    /// Extract the typed reply. Returns `None` when [`matches`](Self::matches) is false.
    fn from_body(body: ResponseBody) -> Option<Self>;
}

macro_rules! reply_type {
    ($ty:ty, $variant:ident) => {
        impl ReplyType for $ty {
            fn matches(body: &ResponseBody) -> bool {
                matches!(body, ResponseBody::$variant(_))
            }

            fn from_body(body: ResponseBody) -> Option<Self> {
                match body {
                    ResponseBody::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

reply_type!(PingResponse, Ping);
reply_type!(KeyExchangeResponse, KeyExchange);
reply_type!(CustomResponse, Custom);

/// Accepts any response body.
impl ReplyType for ResponseBody {
    fn matches(_body: &ResponseBody) -> bool {
        true
    }

    fn from_body(body: ResponseBody) -> Option<Self> {
        Some(body)
    }
}

struct Buffered {
    response: Response,
    received_at: Instant,
}

/// Bounded buffer of unclaimed responses, oldest first.
pub struct ReplyBuffer {
    entries: VecDeque<Buffered>,
    retention: Duration,
    capacity: usize,
}

impl ReplyBuffer {
    pub fn new(retention: Duration, capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            retention,
            capacity: capacity.max(1),
        }
    }

    /// Buffer a response, evicting expired entries first.
    pub fn push(&mut self, response: Response) {
        self.push_at(response, Instant::now());
    }

    fn push_at(&mut self, response: Response, now: Instant) {
        self.evict_expired(now);
        if self.entries.len() >= self.capacity {
            if let Some(dropped) = self.entries.pop_front() {
                warn!(
                    request_id = %dropped.response.id,
                    capacity = self.capacity,
                    "Reply buffer full, dropping oldest unclaimed response"
                );
            }
        }
        self.entries.push_back(Buffered {
            response,
            received_at: now,
        });
    }

    /// Remove and return the reply for `id`, if one of type `R` is buffered.
    pub fn take<R: ReplyType>(&mut self, id: &RequestId) -> Option<R> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.response.id == *id && R::matches(&e.response.body))?;
        let entry = self.entries.remove(pos)?;
        R::from_body(entry.response.body)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(front.received_at) <= self.retention {
                break;
            }
            if let Some(expired) = self.entries.pop_front() {
                debug!(request_id = %expired.response.id, "Evicting unclaimed response");
            }
        }
    }
}
