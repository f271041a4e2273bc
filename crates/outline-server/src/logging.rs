use std::{collections::VecDeque, sync::Arc};

use tokio::sync::broadcast;

pub(crate) const LOG_RING_CAPACITY: usize = 500;

/// Mirrors every tracing event into a bounded history ring and a broadcast
/// channel feeding `/api/logs`.
pub(crate) struct BroadcastLayer {
    pub tx: broadcast::Sender<String>,
    pub ring: Arc<std::sync::Mutex<VecDeque<String>>>,
}

#[derive(Default)]
struct EventVisitor {
    message: String,
    run_id: Option<u64>,
}

impl tracing::field::Visit for EventVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        if field.name() == "run_id" {
            self.run_id = Some(value);
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

fn category(target: &str) -> &'static str {
    if target.contains("poller") {
        "poller"
    } else if ["pipeline", "dispatch", "executor", "git", "registry"]
        .iter()
        .any(|m| target.contains(m))
    {
        "pipeline"
    } else {
        "system"
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for BroadcastLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let level = match *event.metadata().level() {
            tracing::Level::ERROR => "err",
            tracing::Level::WARN => "warn",
            tracing::Level::INFO => "info",
            tracing::Level::DEBUG => "debug",
            tracing::Level::TRACE => return,
        };

        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);

        let mut entry = serde_json::json!({
            "ts": chrono::Utc::now().timestamp(),
            "level": level,
            "message": visitor.message,
            "category": category(event.metadata().target()),
        });
        if let Some(run_id) = visitor.run_id {
            entry["run_id"] = run_id.into();
        }
        let json = entry.to_string();

        let _ = self.tx.send(json.clone());
        if let Ok(mut ring) = self.ring.lock() {
            ring.push_back(json);
            if ring.len() > LOG_RING_CAPACITY {
                ring.pop_front();
            }
        }
    }
}
