use std::io::Write;
use std::sync::Mutex;

use chrono::Local;

/// Access-log mirror for the media pipeline. Writes one line per request
/// to stdout; enabling and disabling happens at runtime through the
/// `stdout-access` config parameter, so the logger itself stays cheap and
/// always constructed.
pub struct AccessLogger {
    writer: Mutex<std::io::Stdout>,
}

impl AccessLogger {
    pub fn new() -> Self {
        Self {
            writer: Mutex::new(std::io::stdout()),
        }
    }

    pub fn log_request(
        &self,
        client_ip: &str,
        method: &str,
        uri: &str,
        status: u16,
        duration_ms: u128,
    ) {
        let line = format!(
            "{} {} {} {} {} {}ms\n",
            format_access_time(),
            normalize_field(client_ip),
            normalize_field(method),
            normalize_field_replace(uri),
            status,
            duration_ms,
        );
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writer.write_all(line.as_bytes());
        }
    }
}

impl Default for AccessLogger {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_field(s: &str) -> &str {
    if s.is_empty() {
        "-"
    } else {
        s
    }
}

fn normalize_field_replace(s: &str) -> String {
    if s.is_empty() {
        "-".to_string()
    } else {
        s.replace(' ', "+")
    }
}

fn format_access_time() -> String {
    Local::now().format("[%d/%b/%Y:%H:%M:%S %z]").to_string()
}
