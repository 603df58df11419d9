//! Durable append-only observability log (spec.md §7: "errors are streamed
//! as error events and written to a durable log").
//!
//! JSONL file per run, one object per line for easy append and parsing.
//! Adapted from the teacher's `session_log.rs` `SessionLog`, generalized
//! from a single-market TP/SL/MARKET_CLOSE vocabulary to the multi-market
//! signal/fill/error events this engine emits, and re-scoped from a
//! session-summary tool to the crate's durable trade/error log.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;

use crate::events::ErrorKind;
use crate::types::Signal;

/// Append-only JSONL trade/error log. One file per process run.
pub struct TradeLog {
    file: Mutex<File>,
}

impl TradeLog {
    /// Create a new log in `dir` named `trades_<unix-seconds>.jsonl`,
    /// creating `dir` if needed.
    pub fn new(dir: &str, started_at: i64) -> Result<Self> {
        let path = Path::new(dir);
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        let filename = path.join(format!("trades_{started_at}.jsonl"));
        let file = OpenOptions::new().create(true).append(true).open(&filename)?;
        tracing::info!(path = %filename.display(), "trade log opened");
        Ok(Self { file: Mutex::new(file) })
    }

    fn write_line(&self, obj: &serde_json::Value) {
        let Ok(line) = serde_json::to_string(obj) else { return };
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{line}");
            let _ = file.flush();
        }
    }

    pub fn record_fill(&self, market_id: &str, signal: &Signal, order_id: Option<&str>, at: i64) {
        self.write_line(&serde_json::json!({
            "event": "fill",
            "market_id": market_id,
            "side": signal.side.to_string(),
            "action": signal.action,
            "size": signal.size.to_string(),
            "price": signal.price.to_string(),
            "reason": signal.reason,
            "dca_level": signal.dca_level,
            "order_id": order_id,
            "at": at,
        }));
    }

    pub fn record_close(&self, market_id: &str, signal: &Signal, order_id: Option<&str>, at: i64) {
        self.write_line(&serde_json::json!({
            "event": "close",
            "market_id": market_id,
            "side": signal.side.to_string(),
            "action": signal.action,
            "size": signal.size.to_string(),
            "price": signal.price.to_string(),
            "reason": signal.reason,
            "order_id": order_id,
            "at": at,
        }));
    }

    pub fn record_error(&self, market_id: Option<&str>, kind: ErrorKind, detail: &str, at: i64) {
        self.write_line(&serde_json::json!({
            "event": "error",
            "market_id": market_id,
            "kind": kind,
            "detail": detail,
            "at": at,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Side, SignalAction};
    use rust_decimal_macros::dec;
    use std::io::Read;

    #[test]
    fn record_fill_writes_one_jsonl_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = TradeLog::new(dir.path().to_str().unwrap(), 1).unwrap();
        let signal = Signal {
            action: SignalAction::EnterYes,
            side: Side::Yes,
            size: dec!(10),
            price: dec!(0.34),
            reason: "entry".into(),
            dca_level: 0,
        };
        log.record_fill("m1", &signal, Some("order-1"), 100);

        let mut contents = String::new();
        let path = dir.path().join("trades_1.jsonl");
        File::open(path).unwrap().read_to_string(&mut contents).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["event"], "fill");
        assert_eq!(parsed["market_id"], "m1");
        assert_eq!(parsed["order_id"], "order-1");
    }

    #[test]
    fn record_error_includes_message() {
        let dir = tempfile::tempdir().unwrap();
        let log = TradeLog::new(dir.path().to_str().unwrap(), 2).unwrap();
        log.record_error(Some("m1"), ErrorKind::TransientVenue, "venue timeout", 50);

        let mut contents = String::new();
        let path = dir.path().join("trades_2.jsonl");
        File::open(path).unwrap().read_to_string(&mut contents).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(parsed["detail"], "venue timeout");
        assert_eq!(parsed["kind"], "transient_venue");
    }
}
