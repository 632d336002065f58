use chrono::Local;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Access-log status tokens, in the proxy log convention downstream parsers expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStatus {
    Denied,
    Miss,
}

impl LogStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Denied => "TCP_DENIED",
            Self::Miss => "TCP_MISS",
        }
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One access-log line. Lines start with the newline, matching existing logs.
pub fn format_line(client: IpAddr, status: LogStatus, qname: &str) -> String {
    let now = Local::now().format("%Y-%m-%d %H:%M");
    format!("\n{} {} {} 0 {} {}", now, client, status, qname, client)
}

/// Async access logger using a background writer.
#[derive(Clone)]
pub struct AccessLogger {
    sender: mpsc::UnboundedSender<String>,
}

impl AccessLogger {
    /// Append to `path`. Spawns a background task for non-blocking file I/O.
    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        let (logger, mut receiver) = Self::channel();
        let path = path.into();

        tokio::spawn(async move {
            use tokio::fs::OpenOptions;
            use tokio::io::AsyncWriteExt;

            // Ensure parent directory exists
            if let Some(parent) = path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }

            let mut file = match OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(f) => f,
                Err(e) => {
                    error!("Failed to open access log {}: {}", path.display(), e);
                    return;
                }
            };

            while let Some(line) = receiver.recv().await {
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    error!("Failed to write to access log: {}", e);
                }
            }
            let _ = file.flush().await;
        });

        logger
    }

    /// Logger whose lines are delivered to the returned receiver.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn log(&self, client: IpAddr, status: LogStatus, qname: &str) {
        if self.sender.send(format_line(client, status, qname)).is_err() {
            debug!("Access log channel closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_line_format() {
        let ip: IpAddr = "192.168.1.20".parse().unwrap();
        let line = format_line(ip, LogStatus::Denied, "ads.example.com.");

        assert!(line.starts_with('\n'));
        let fields: Vec<&str> = line.trim_start().split(' ').collect();
        assert_eq!(fields.len(), 7);
        assert_eq!(fields[0].len(), "2024-01-31".len());
        assert_eq!(fields[1].len(), "12:34".len());
        assert_eq!(
            &fields[2..],
            &["192.168.1.20", "TCP_DENIED", "0", "ads.example.com.", "192.168.1.20"]
        );
    }

    #[tokio::test]
    async fn test_channel_logger() {
        let (logger, mut rx) = AccessLogger::channel();
        logger.log("10.0.0.1".parse().unwrap(), LogStatus::Miss, "example.com.");

        let line = rx.recv().await.unwrap();
        assert!(line.ends_with(" 10.0.0.1 TCP_MISS 0 example.com. 10.0.0.1"));
    }

    #[tokio::test]
    async fn test_file_logger_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log").join("log.txt");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "existing").unwrap();

        let logger = AccessLogger::to_file(&path);
        logger.log("10.0.0.1".parse().unwrap(), LogStatus::Denied, "a.test.");
        logger.log("10.0.0.2".parse().unwrap(), LogStatus::Miss, "b.test.");

        let mut content = String::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            content = std::fs::read_to_string(&path).unwrap();
            if content.lines().count() == 3 {
                break;
            }
        }
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "existing");
        assert!(lines[1].contains(" TCP_DENIED 0 a.test. "));
        assert!(lines[2].contains(" TCP_MISS 0 b.test. "));
    }
}
