//! Client side of the agent server's `/event` SSE stream.

mod backoff;
mod decode;
mod reader;
mod sse;
mod throttle;

pub use backoff::{Backoff, ReconnectPolicy};
pub use decode::{parse_event, summarize_input};
pub use reader::{EventStream, EventStreamReader};
pub use sse::SseDecoder;
pub use throttle::{DeltaThrottle, EventPipeline, DEFAULT_THROTTLE_INTERVAL};
