//! Artifact-backed handler execution.
//!
//! Handlers registered with a `mvn:` URI resolve to a jar in the local
//! cache (downloaded on first use, with a per-coordinate mutex so
//! concurrent claims never download the same artifact twice) and run as a
//! subprocess. The subprocess receives the step id and the store
//! connection through its environment, reads its inputs and writes its
//! return attributes through the persistence API, and exits; the agent
//! then reads the returns back and continues the step.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::process::Command;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use agentflow_core::{HandlerRegistration, RuntimeError};

use crate::config::ArtifactConfig;

/// Parsed `mvn:groupId:artifactId:version[:classifier]` coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactCoordinates {
    pub group_id: String,
    pub artifact_id: String,
    pub version: String,
    pub classifier: String,
}

impl ArtifactCoordinates {
    /// Parse a `mvn:` URI.
    pub fn parse(uri: &str) -> Result<Self, RuntimeError> {
        let Some(rest) = uri.strip_prefix("mvn:") else {
            return Err(RuntimeError::Resolution(format!(
                "invalid artifact URI scheme: {uri}"
            )));
        };
        let parts: Vec<&str> = rest.split(':').collect();
        if !(3..=4).contains(&parts.len()) {
            return Err(RuntimeError::Resolution(format!(
                "invalid artifact URI (expected mvn:groupId:artifactId:version[:classifier]): {uri}"
            )));
        }
        if parts[..3].iter().any(|p| p.is_empty()) {
            return Err(RuntimeError::Resolution(format!(
                "invalid artifact URI (empty component): {uri}"
            )));
        }
        Ok(Self {
            group_id: parts[0].to_string(),
            artifact_id: parts[1].to_string(),
            version: parts[2].to_string(),
            classifier: parts.get(3).unwrap_or(&"").to_string(),
        })
    }

    fn jar_name(&self) -> String {
        if self.classifier.is_empty() {
            format!("{}-{}.jar", self.artifact_id, self.version)
        } else {
            format!("{}-{}-{}.jar", self.artifact_id, self.version, self.classifier)
        }
    }

    fn cache_path(&self, cache_dir: &Path) -> PathBuf {
        let mut path = cache_dir.to_path_buf();
        for part in self.group_id.split('.') {
            path.push(part);
        }
        path.push(&self.artifact_id);
        path.push(&self.version);
        path.push(self.jar_name());
        path
    }

    fn url(&self, repository_url: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            repository_url.trim_end_matches('/'),
            self.group_id.replace('.', "/"),
            self.artifact_id,
            self.version,
            self.jar_name()
        )
    }

    fn lock_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.group_id, self.artifact_id, self.version, self.classifier
        )
    }
}

/// Resolves artifact handlers and runs them as subprocesses.
pub struct ArtifactExecutor {
    config: ArtifactConfig,
    http: reqwest::Client,
    download_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl ArtifactExecutor {
    pub fn new(config: ArtifactConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            download_locks: DashMap::new(),
        }
    }

    /// Whether this executor can run a registration's module URI.
    pub fn supports(module_uri: &str) -> bool {
        module_uri.starts_with("mvn:") || module_uri.starts_with("file://")
    }

    /// Resolve a registration to a local jar path, downloading if needed.
    ///
    /// When the registration carries a checksum, the resolved file must
    /// match it (hex-encoded SHA-256).
    pub async fn resolve(&self, registration: &HandlerRegistration) -> Result<PathBuf, RuntimeError> {
        if let Some(path) = registration.module_uri.strip_prefix("file://") {
            let path = PathBuf::from(path);
            if !path.exists() {
                return Err(RuntimeError::Resolution(format!(
                    "artifact file not found: {}",
                    path.display()
                )));
            }
            verify_checksum(&path, &registration.checksum).await?;
            return Ok(path);
        }

        let coords = ArtifactCoordinates::parse(&registration.module_uri)?;
        let jar_path = coords.cache_path(&self.config.cache_dir);
        if !is_cached(&jar_path).await {
            self.download(&coords, &jar_path).await?;
        }
        verify_checksum(&jar_path, &registration.checksum).await?;
        Ok(jar_path)
    }

    async fn download(
        &self,
        coords: &ArtifactCoordinates,
        jar_path: &Path,
    ) -> Result<(), RuntimeError> {
        let lock = self
            .download_locks
            .entry(coords.lock_key())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another claimant may have finished the download while we waited.
        if is_cached(jar_path).await {
            return Ok(());
        }

        let url = coords.url(&self.config.repository_url);
        info!(coords = %coords.lock_key(), %url, "downloading artifact");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| RuntimeError::Resolution(format!("download failed: {e}")))?;
        if !response.status().is_success() {
            return Err(RuntimeError::Resolution(format!(
                "download failed for '{}': HTTP {}",
                coords.lock_key(),
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RuntimeError::Resolution(format!("download failed: {e}")))?;

        if let Some(parent) = jar_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RuntimeError::Resolution(format!("cache write failed: {e}")))?;
        }
        tokio::fs::write(jar_path, &bytes)
            .await
            .map_err(|e| RuntimeError::Resolution(format!("cache write failed: {e}")))?;

        info!(
            coords = %coords.lock_key(),
            bytes = bytes.len(),
            path = %jar_path.display(),
            "artifact cached"
        );
        Ok(())
    }

    /// Run an artifact handler subprocess for a step.
    ///
    /// The subprocess writes its results through the persistence API; this
    /// call only enforces launch, environment and timeout.
    #[instrument(skip(self, registration), fields(facet = %registration.facet_name, step_id = %step_id))]
    pub async fn execute(
        &self,
        registration: &HandlerRegistration,
        step_id: Uuid,
    ) -> Result<(), RuntimeError> {
        let jar_path = self.resolve(registration).await?;

        let jvm_args: Vec<String> = registration
            .metadata
            .get("jvm_args")
            .and_then(|v| v.as_array())
            .map(|args| {
                args.iter()
                    .filter_map(|a| a.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let mut cmd = Command::new(&self.config.java_command);
        cmd.args(&jvm_args);
        if registration.entrypoint.is_empty() {
            cmd.arg("-jar").arg(&jar_path);
        } else {
            cmd.arg("-cp").arg(&jar_path).arg(&registration.entrypoint);
        }
        cmd.arg(step_id.to_string());

        cmd.env("AGENTFLOW_STEP_ID", step_id.to_string());
        if let Some(url) = &self.config.database_url {
            cmd.env("AGENTFLOW_DATABASE_URL", url);
        }
        if let Some(name) = &self.config.database_name {
            cmd.env("AGENTFLOW_DATABASE", name);
        }

        let timeout = if registration.timeout_ms > 0 {
            Duration::from_millis(registration.timeout_ms)
        } else {
            self.config.default_timeout
        };

        debug!(jar = %jar_path.display(), ?timeout, "launching subprocess");
        run_command(cmd, timeout).await
    }
}

async fn is_cached(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len() > 0)
        .unwrap_or(false)
}

/// Verify a resolved artifact against a registration checksum
/// (hex-encoded SHA-256). Empty checksums skip verification.
async fn verify_checksum(path: &Path, expected: &str) -> Result<(), RuntimeError> {
    if expected.is_empty() {
        return Ok(());
    }
    use sha2::{Digest, Sha256};

    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| RuntimeError::Resolution(format!("checksum read failed: {e}")))?;
    let actual = hex::encode(Sha256::digest(&bytes));
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(RuntimeError::Resolution(format!(
            "checksum mismatch for {}: expected {expected}, got {actual}",
            path.display()
        )));
    }
    Ok(())
}

/// Run a command to completion under a timeout.
///
/// A timed-out subprocess is killed; a non-zero exit propagates the
/// captured stderr.
pub(crate) async fn run_command(mut cmd: Command, timeout: Duration) -> Result<(), RuntimeError> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let child = cmd
        .output();
    let output = match tokio::time::timeout(timeout, child).await {
        Ok(result) => {
            result.map_err(|e| RuntimeError::Handler(format!("subprocess launch failed: {e}")))?
        }
        Err(_) => {
            return Err(RuntimeError::Timeout(timeout.as_millis() as u64));
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(RuntimeError::Handler(format!(
            "subprocess failed (exit {}): {stderr}",
            output.status.code().unwrap_or(-1)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_maven_uri() {
        let coords = ArtifactCoordinates::parse("mvn:com.example:data-processor:1.0.0").unwrap();
        assert_eq!(coords.group_id, "com.example");
        assert_eq!(coords.artifact_id, "data-processor");
        assert_eq!(coords.version, "1.0.0");
        assert!(coords.classifier.is_empty());

        let coords =
            ArtifactCoordinates::parse("mvn:com.example:proc:2.1:jar-with-dependencies").unwrap();
        assert_eq!(coords.classifier, "jar-with-dependencies");
    }

    #[test]
    fn test_parse_rejects_malformed_uris() {
        assert!(ArtifactCoordinates::parse("http://example.com/x.jar").is_err());
        assert!(ArtifactCoordinates::parse("mvn:only:two").is_err());
        assert!(ArtifactCoordinates::parse("mvn:a:b:c:d:e").is_err());
        assert!(ArtifactCoordinates::parse("mvn::missing:1.0").is_err());
    }

    #[test]
    fn test_cache_path_and_url() {
        let coords = ArtifactCoordinates::parse("mvn:com.example:proc:1.0.0").unwrap();
        let path = coords.cache_path(Path::new("/cache"));
        assert_eq!(
            path,
            PathBuf::from("/cache/com/example/proc/1.0.0/proc-1.0.0.jar")
        );
        assert_eq!(
            coords.url("https://repo1.maven.org/maven2"),
            "https://repo1.maven.org/maven2/com/example/proc/1.0.0/proc-1.0.0.jar"
        );
    }

    #[tokio::test]
    async fn test_run_command_success() {
        let mut cmd = Command::new("true");
        cmd.arg("");
        run_command(cmd, Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_command_captures_failure() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo broken >&2; exit 3");
        let err = run_command(cmd, Duration::from_secs(5)).await.unwrap_err();
        match err {
            RuntimeError::Handler(message) => {
                assert!(message.contains("exit 3"));
                assert!(message.contains("broken"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_command_timeout() {
        let mut cmd = Command::new("sleep");
        cmd.arg("2");
        let err = run_command(cmd, Duration::from_millis(100)).await.unwrap_err();
        assert_eq!(err, RuntimeError::Timeout(100));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_resolve_missing_file_uri() {
        let executor = ArtifactExecutor::new(ArtifactConfig {
            cache_dir: PathBuf::from("/tmp/agentflow-test-cache"),
            repository_url: "https://repo1.maven.org/maven2".to_string(),
            java_command: "java".to_string(),
            default_timeout: Duration::from_secs(1),
            database_url: None,
            database_name: None,
        });
        let registration = HandlerRegistration::new(
            "ns.Missing",
            "file:///definitely/not/here/handler.jar",
        );
        let err = executor.resolve(&registration).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Resolution(_)));
    }

    #[test]
    fn test_supports_schemes() {
        assert!(ArtifactExecutor::supports("mvn:a:b:1"));
        assert!(ArtifactExecutor::supports("file:///x.jar"));
        assert!(!ArtifactExecutor::supports("logical:inline"));
    }

    #[tokio::test]
    async fn test_checksum_verification() {
        let path = std::env::temp_dir().join(format!("afl-checksum-{}.jar", Uuid::now_v7()));
        tokio::fs::write(&path, b"artifact bytes").await.unwrap();

        // SHA-256 of "artifact bytes"
        use sha2::{Digest, Sha256};
        let good = hex::encode(Sha256::digest(b"artifact bytes"));

        verify_checksum(&path, "").await.unwrap();
        verify_checksum(&path, &good).await.unwrap();

        let err = verify_checksum(&path, "deadbeef").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Resolution(_)));
        assert!(err.to_string().contains("checksum mismatch"));

        tokio::fs::remove_file(&path).await.ok();
    }
}
