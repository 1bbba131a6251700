use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// A shared append-only log file for one step. Container output from the
/// primary and any service containers is interleaved here, each line tagged
/// with the container it came from.
#[derive(Debug, Clone)]
pub struct StepLog {
    inner: Arc<Mutex<File>>,
}

impl StepLog {
    pub async fn create(path: &Path) -> std::io::Result<StepLog> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(path).await?;
        Ok(StepLog {
            inner: Arc::new(Mutex::new(file)),
        })
    }

    pub async fn write_line(&self, line: &str) {
        let mut file = self.inner.lock().await;
        let _ = file.write_all(line.as_bytes()).await;
        let _ = file.write_all(b"\n").await;
    }

    pub async fn write_raw(&self, bytes: &[u8]) {
        let mut file = self.inner.lock().await;
        let _ = file.write_all(bytes).await;
    }

    /// Tagged output for a named container within the step's workload.
    pub async fn write_container(&self, name: &str, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        let mut file = self.inner.lock().await;
        for line in text.lines() {
            let _ = file.write_all(format!("[{name}] {line}\n").as_bytes()).await;
        }
    }

    pub async fn flush(&self) {
        let mut file = self.inner.lock().await;
        let _ = file.flush().await;
    }
}
