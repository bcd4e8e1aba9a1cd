use dataiku_iac::{InMemoryLiveClient, Settings, Workspace};
use dataiku_iac_config::RetrySettings;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub const DEMO_KDL: &str = r#"
workspace "demo"

project "DEMO" {
    name "Demo project"
    dataset "TEST_DATA" {
        type "Filesystem"
    }
}
"#;

pub struct TestProject {
    pub root: TempDir,
    pub live: Arc<InMemoryLiveClient>,
}

impl TestProject {
    pub fn new(kdl: &str) -> Self {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("dataiku.kdl"), kdl).unwrap();
        Self {
            root,
            live: Arc::new(InMemoryLiveClient::new()),
        }
    }

    #[allow(dead_code)]
    pub fn write(&self, rel: &str, content: &str) {
        let path = self.root.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    pub fn path(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }

    pub fn workspace(&self) -> Workspace {
        Workspace::with_live_client(self.path(), settings(), self.live.clone())
    }
}

/// Defaults with near-instant retries
pub fn settings() -> Settings {
    Settings {
        retry: RetrySettings {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            multiplier: 2.0,
        },
        ..Settings::default()
    }
}
