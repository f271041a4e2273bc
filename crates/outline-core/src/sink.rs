use std::sync::Mutex;

/// Destination for a run's log lines. Implementations must keep lines in
/// the order `append` is called.
pub trait LogSink: Send + Sync {
    fn append(&self, line: String);
}

/// Format a log line attributed to a pipeline step or stage.
pub fn format_line(step: &str, text: &str) -> String {
    format!("[{step}] {text}")
}

/// Buffers lines in memory; used when a run is recorded only after the
/// pipeline has finished.
#[derive(Default)]
pub struct CollectingSink {
    lines: Mutex<Vec<String>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

impl LogSink for CollectingSink {
    fn append(&self, line: String) {
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_sink_keeps_order() {
        let sink = CollectingSink::new();
        sink.append(format_line("build", "one"));
        sink.append(format_line("build", "two"));
        sink.append(format_line("test", "three"));
        assert_eq!(
            sink.into_lines(),
            vec!["[build] one", "[build] two", "[test] three"]
        );
    }
}
