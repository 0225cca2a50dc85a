use std::time::{Duration, Instant};

use agent_bridge_event_schema::{DomainEvent, SessionId};

use crate::decode::parse_event;
use crate::sse::SseDecoder;

pub const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_millis(33);

/// Per-session text-delta buffer, drained at most once per interval.
#[derive(Debug)]
pub struct DeltaThrottle {
    interval: Duration,
    last_flush: Instant,
    pending: Vec<(SessionId, String)>,
}

impl DeltaThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_flush: Instant::now(),
            pending: Vec::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn push(&mut self, session_id: &str, text: &str) {
        match self.pending.iter_mut().find(|(id, _)| id == session_id) {
            Some((_, buffer)) => buffer.push_str(text),
            None => self.pending.push((session_id.to_string(), text.to_string())),
        }
    }

    /// Drains buffers only if the interval has elapsed since the last flush.
    pub fn flush_due(&mut self, now: Instant) -> Vec<DomainEvent> {
        if self.pending.is_empty() || now.duration_since(self.last_flush) < self.interval {
            return Vec::new();
        }
        self.flush_at(now)
    }

    pub fn flush_all(&mut self) -> Vec<DomainEvent> {
        self.flush_at(Instant::now())
    }

    fn flush_at(&mut self, now: Instant) -> Vec<DomainEvent> {
        self.last_flush = now;
        self.pending
            .drain(..)
            .filter(|(_, text)| !text.is_empty())
            .map(|(session_id, text)| DomainEvent::TextDelta { session_id, text })
            .collect()
    }
}

/// Bytes in, ordered domain events out: framing, decoding and delta throttling.
/// Buffered deltas are always emitted ahead of the next non-delta event.
#[derive(Debug)]
pub struct EventPipeline {
    decoder: SseDecoder,
    throttle: DeltaThrottle,
    dropped_frames: u64,
}

impl EventPipeline {
    pub fn new(throttle_interval: Duration) -> Self {
        Self {
            decoder: SseDecoder::new(),
            throttle: DeltaThrottle::new(throttle_interval),
            dropped_frames: 0,
        }
    }

    pub fn throttle_interval(&self) -> Duration {
        self.throttle.interval()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<DomainEvent> {
        let mut out = Vec::new();
        for payload in self.decoder.push(chunk) {
            self.dispatch(&payload, &mut out);
        }
        out
    }

    pub fn tick(&mut self, now: Instant) -> Vec<DomainEvent> {
        self.throttle.flush_due(now)
    }

    /// Stream ended or failed: flush the partial frame and every buffer.
    pub fn finish(&mut self) -> Vec<DomainEvent> {
        let mut out = Vec::new();
        for payload in self.decoder.finish() {
            self.dispatch(&payload, &mut out);
        }
        out.extend(self.throttle.flush_all());
        out
    }

    fn dispatch(&mut self, payload: &str, out: &mut Vec<DomainEvent>) {
        match parse_event(payload) {
            Ok(Some(DomainEvent::TextDelta { session_id, text })) => {
                self.throttle.push(&session_id, &text);
            }
            Ok(Some(event)) => {
                out.extend(self.throttle.flush_all());
                out.push(event);
            }
            Ok(None) => {}
            Err(err) => {
                self.dropped_frames += 1;
                tracing::debug!(error = %err, payload_len = payload.len(), "dropping undecodable event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delta_frame(session: &str, text: &str) -> String {
        let payload = json!({
            "type": "message.part.updated",
            "properties": {
                "part": {"id": "p1", "sessionID": session, "type": "text"},
                "delta": text,
            }
        });
        format!("data: {payload}\n\n")
    }

    fn tool_frame(session: &str) -> String {
        let payload = json!({
            "type": "message.part.updated",
            "properties": {
                "part": {
                    "id": "p2", "sessionID": session, "type": "tool",
                    "callID": "call_1", "tool": "read",
                    "state": {"status": "running", "input": {"filePath": "src/main.rs"}},
                }
            }
        });
        format!("data: {payload}\n\n")
    }

    fn text_of(events: &[DomainEvent], session: &str) -> String {
        events
            .iter()
            .filter_map(|event| match event {
                DomainEvent::TextDelta { session_id, text } if session_id == session => {
                    Some(text.as_str())
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn deltas_flush_as_one_event_before_tool() {
        let mut pipeline = EventPipeline::new(DEFAULT_THROTTLE_INTERVAL);
        let chunk = format!(
            "{}{}{}{}",
            delta_frame("s1", "Lo"),
            delta_frame("s1", "ok"),
            delta_frame("s1", "ing"),
            tool_frame("s1")
        );
        let events = pipeline.feed(chunk.as_bytes());
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            DomainEvent::TextDelta {
                session_id: "s1".to_string(),
                text: "Looking".to_string()
            }
        );
        assert!(matches!(events[1], DomainEvent::ToolRunning { .. }));
    }

    #[test]
    fn tick_respects_interval() {
        let mut throttle = DeltaThrottle::new(Duration::from_millis(33));
        let start = throttle.last_flush;
        throttle.push("s1", "a");
        assert!(throttle.flush_due(start + Duration::from_millis(10)).is_empty());
        let flushed = throttle.flush_due(start + Duration::from_millis(40));
        assert_eq!(flushed.len(), 1);
        assert!(throttle.is_empty());
        throttle.push("s1", "b");
        assert!(throttle.flush_due(start + Duration::from_millis(50)).is_empty());
        assert_eq!(throttle.flush_due(start + Duration::from_millis(80)).len(), 1);
    }

    #[test]
    fn buffers_are_kept_per_session() {
        let mut throttle = DeltaThrottle::new(Duration::from_millis(33));
        throttle.push("s1", "one ");
        throttle.push("s2", "two");
        throttle.push("s1", "more");
        let events = throttle.flush_all();
        assert_eq!(text_of(&events, "s1"), "one more");
        assert_eq!(text_of(&events, "s2"), "two");
    }

    #[test]
    fn no_text_lost_or_duplicated_across_flush_timings() {
        let pieces = ["The ", "quick ", "brown ", "fox ", "jumps"];
        for split in 0..=pieces.len() {
            let mut pipeline = EventPipeline::new(Duration::from_millis(33));
            let mut events = Vec::new();
            for (index, piece) in pieces.iter().enumerate() {
                events.extend(pipeline.feed(delta_frame("s1", piece).as_bytes()));
                if index + 1 == split {
                    events.extend(pipeline.tick(Instant::now() + Duration::from_secs(1)));
                }
            }
            events.extend(pipeline.finish());
            assert_eq!(text_of(&events, "s1"), pieces.concat(), "split at {split}");
        }
    }

    #[test]
    fn malformed_frames_are_skipped() {
        let mut pipeline = EventPipeline::new(DEFAULT_THROTTLE_INTERVAL);
        let chunk = format!("data: {{broken\n\n{}", tool_frame("s1"));
        let events = pipeline.feed(chunk.as_bytes());
        assert_eq!(events.len(), 1);
        assert_eq!(pipeline.dropped_frames(), 1);
    }

    #[test]
    fn finish_flushes_pending_text() {
        let mut pipeline = EventPipeline::new(DEFAULT_THROTTLE_INTERVAL);
        assert!(pipeline.feed(delta_frame("s1", "tail").as_bytes()).is_empty());
        let events = pipeline.finish();
        assert_eq!(text_of(&events, "s1"), "tail");
    }
}
