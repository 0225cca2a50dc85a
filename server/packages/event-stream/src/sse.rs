/// Line-oriented SSE framer.
///
/// Only `data:` lines carry payload. A payload is complete on a blank line or
/// when the next `data:` line arrives, so servers that omit the blank-line
/// terminator still frame correctly. `event:`, `id:` and comment lines are ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    partial_line: Vec<u8>,
    payload: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes and returns every payload completed by them.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial_line.extend_from_slice(chunk);
        let mut completed = Vec::new();
        while let Some(pos) = self.partial_line.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.partial_line.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            self.process_line(&String::from_utf8_lossy(&line), &mut completed);
        }
        completed
    }

    /// Flushes whatever is buffered when the stream ends.
    pub fn finish(&mut self) -> Vec<String> {
        let mut completed = Vec::new();
        if !self.partial_line.is_empty() {
            let line = std::mem::take(&mut self.partial_line);
            let line = String::from_utf8_lossy(&line);
            self.process_line(line.trim_end_matches('\r'), &mut completed);
        }
        if let Some(payload) = self.payload.take() {
            completed.push(payload);
        }
        completed
    }

    fn process_line(&mut self, line: &str, completed: &mut Vec<String>) {
        if line.is_empty() {
            if let Some(payload) = self.payload.take() {
                completed.push(payload);
            }
            return;
        }

        if let Some(data) = line.strip_prefix("data:") {
            let data = data.strip_prefix(' ').unwrap_or(data);
            if let Some(previous) = self.payload.replace(data.to_string()) {
                completed.push(previous);
            }
        }
    }
}
