//! Bulk-load file output, bulk-load invocation and the workflow status API client.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use pubmed2gene_core::{Association, BULK_ROW_DELIMITER};
use reqwest::{StatusCode, Url};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pubmed2gene-storage";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenBulkFile {
    pub path: PathBuf,
    pub rows: usize,
    pub byte_size: usize,
    pub sha256: String,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn render_bulk_file(rows: &[Association]) -> String {
    let mut out = String::new();
    for row in rows {
        out.push_str(&row.to_bulk_line());
        out.push_str(BULK_ROW_DELIMITER);
    }
    out
}

/// Replace the bulk-load file via a temp file in the same directory and an atomic rename.
pub async fn write_bulk_file(path: &Path, rows: &[Association]) -> anyhow::Result<WrittenBulkFile> {
    let body = render_bulk_file(rows);
    let bytes = body.as_bytes();

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating bulk file directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp bulk file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp bulk file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp bulk file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming temp bulk file {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    Ok(WrittenBulkFile {
        path: path.to_path_buf(),
        rows: rows.len(),
        byte_size: bytes.len(),
        sha256: sha256_hex(bytes),
    })
}

#[derive(Debug, Error)]
pub enum BulkLoadError {
    #[error("spawning bulk load `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("bulk load `{command}` exited with {code:?}: {stderr}")]
    ExitStatus {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Invocation of the external `bcpin.csh` bulk-load utility.
#[derive(Debug, Clone)]
pub struct BulkLoadCommand {
    pub script: PathBuf,
    pub server: String,
    pub database: String,
    pub table: String,
    pub schema: String,
}

impl BulkLoadCommand {
    /// The script lives at `<PG_DBUTILS>/bin/bcpin.csh`.
    pub fn from_dbutils(
        dbutils: impl AsRef<Path>,
        server: impl Into<String>,
        database: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            script: dbutils.as_ref().join("bin").join("bcpin.csh"),
            server: server.into(),
            database: database.into(),
            table: table.into(),
            schema: "mgd".to_string(),
        }
    }

    /// Positional arguments; the delimiters are passed in the escaped form the script expects.
    pub fn args(&self, output_dir: &Path, file_name: &str) -> Vec<String> {
        vec![
            self.server.clone(),
            self.database.clone(),
            self.table.clone(),
            output_dir.display().to_string(),
            file_name.to_string(),
            "\\|".to_string(),
            "\\n".to_string(),
            self.schema.clone(),
        ]
    }

    pub fn command_line(&self, output_dir: &Path, file_name: &str) -> String {
        let mut parts = vec![self.script.display().to_string()];
        parts.extend(
            self.args(output_dir, file_name)
                .into_iter()
                .map(|arg| if arg.starts_with('\\') { format!("\"{arg}\"") } else { arg }),
        );
        parts.join(" ")
    }

    pub async fn run(&self, output_dir: &Path, file_name: &str) -> Result<(), BulkLoadError> {
        let command_line = self.command_line(output_dir, file_name);
        info!(command = %command_line, "executing bulk load");

        let output = Command::new(&self.script)
            .args(self.args(output_dir, file_name))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| BulkLoadError::Spawn {
                command: command_line.clone(),
                source,
            })?;

        debug!(
            stdout = %String::from_utf8_lossy(&output.stdout),
            "bulk load finished"
        );
        if !output.status.success() {
            return Err(BulkLoadError::ExitStatus {
                command: command_line,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StatusApiConfig {
    pub base_url: String,
    pub access_token: String,
    pub username: String,
    pub group: String,
    pub status: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StatusApiResponse {
    pub status: StatusCode,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum StatusUpdateError {
    #[error("invalid status API url {url}: {message}")]
    Url { url: String, message: String },
    #[error("status update request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
}

/// Client for the `reference/statusUpdate` endpoint of the curation API.
#[derive(Debug)]
pub struct StatusApiClient {
    client: reqwest::Client,
    config: StatusApiConfig,
}

impl StatusApiClient {
    pub fn new(config: StatusApiConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &StatusApiConfig {
        &self.config
    }

    pub fn status_update_url(&self, ref_ids: &[String]) -> Result<Url, StatusUpdateError> {
        let raw = format!(
            "{}/reference/statusUpdate",
            self.config.base_url.trim_end_matches('/')
        );
        let mut url = Url::parse(&raw).map_err(|err| StatusUpdateError::Url {
            message: err.to_string(),
            url: raw.clone(),
        })?;
        url.query_pairs_mut()
            .append_pair("accid", &ref_ids.join(","))
            .append_pair("group", &self.config.group)
            .append_pair("status", &self.config.status);
        Ok(url)
    }

    /// One PUT per batch; any non-success status is an error.
    pub async fn update_batch(&self, ref_ids: &[String]) -> Result<StatusApiResponse, StatusUpdateError> {
        let url = self.status_update_url(ref_ids)?;
        let span = info_span!("status_update", batch_size = ref_ids.len(), group = %self.config.group);
        self.send(url).instrument(span).await
    }

    async fn send(&self, url: Url) -> Result<StatusApiResponse, StatusUpdateError> {
        let resp = self
            .client
            .put(url.clone())
            .header("accept", "application/json")
            .header("api_access_token", &self.config.access_token)
            .header("username", &self.config.username)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        debug!(%status, %body, "status update response");

        if !status.is_success() {
            return Err(StatusUpdateError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
                body,
            });
        }
        Ok(StatusApiResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn api_config(base_url: impl Into<String>) -> StatusApiConfig {
        StatusApiConfig {
            base_url: base_url.into(),
            access_token: "secret".into(),
            username: "pm2geneload".into(),
            group: "GO".into(),
            status: "Indexed".into(),
            timeout: Duration::from_secs(5),
        }
    }

    fn assoc(key: i64, refs_key: i64, marker_key: i64) -> Association {
        let date = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();
        Association {
            assoc_key: key,
            refs_key,
            marker_key,
            mgi_type_key: 2,
            ref_assoc_type_key: 1018,
            created_by_key: 1571,
            modified_by_key: 1571,
            creation_date: date,
            modification_date: date,
        }
    }

    #[test]
    fn bulk_file_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn bulk_file_is_replaced_atomically() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out").join("MGI_Reference_Assoc.bcp");

        let first = write_bulk_file(&path, &[assoc(1, 500, 700), assoc(2, 500, 701)])
            .await
            .expect("first write");
        assert_eq!(first.rows, 2);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "1|500|700|2|1018|1571|1571|10/17/2026|10/17/2026\n2|500|701|2|1018|1571|1571|10/17/2026|10/17/2026\n"
        );
        assert_eq!(first.sha256, sha256_hex(text.as_bytes()));

        let second = write_bulk_file(&path, &[]).await.expect("second write");
        assert_eq!(second.rows, 0);
        assert_eq!(second.byte_size, 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");

        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn bulk_load_arguments_are_positional() {
        let cmd = BulkLoadCommand::from_dbutils("/opt/pgdbutils", "db-host", "mgd", "MGI_Reference_Assoc");
        assert_eq!(cmd.script, PathBuf::from("/opt/pgdbutils/bin/bcpin.csh"));
        assert_eq!(
            cmd.args(Path::new("/data/output"), "MGI_Reference_Assoc.bcp"),
            vec![
                "db-host",
                "mgd",
                "MGI_Reference_Assoc",
                "/data/output",
                "MGI_Reference_Assoc.bcp",
                "\\|",
                "\\n",
                "mgd",
            ]
        );
        assert_eq!(
            cmd.command_line(Path::new("/data/output"), "x.bcp"),
            "/opt/pgdbutils/bin/bcpin.csh db-host mgd MGI_Reference_Assoc /data/output x.bcp \"\\|\" \"\\n\" mgd"
        );
    }

    #[tokio::test]
    async fn missing_bulk_load_script_is_a_spawn_error() {
        let dir = tempdir().expect("tempdir");
        let cmd = BulkLoadCommand::from_dbutils(dir.path(), "h", "d", "t");
        let err = cmd.run(dir.path(), "f.bcp").await.unwrap_err();
        assert!(matches!(err, BulkLoadError::Spawn { .. }));
    }

    #[tokio::test]
    async fn failing_bulk_load_script_reports_exit_code() {
        let dir = tempdir().expect("tempdir");
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let script = bin.join("bcpin.csh");
        std::fs::write(&script, "#!/bin/sh\necho boom >&2\nexit 3\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let cmd = BulkLoadCommand::from_dbutils(dir.path(), "h", "d", "t");
        let err = cmd.run(dir.path(), "f.bcp").await.unwrap_err();
        match err {
            BulkLoadError::ExitStatus { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected exit status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_error_is_an_http_status_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(
                    b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 4\r\nconnection: close\r\n\r\nboom",
                )
                .await
                .unwrap();
            String::from_utf8_lossy(&request).to_ascii_lowercase()
        });

        let client = StatusApiClient::new(api_config(format!("http://{addr}/api"))).unwrap();
        let err = client
            .update_batch(&["MGI:1".to_string(), "MGI:2".to_string()])
            .await
            .unwrap_err();
        match err {
            StatusUpdateError::HttpStatus { status, body, .. } => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("expected http status error, got {other:?}"),
        }

        let request = server.await.unwrap();
        assert!(request.starts_with("put /api/reference/statusupdate?"));
        assert!(request.contains("api_access_token: secret"));
        assert!(request.contains("username: pm2geneload"));
    }

    #[test]
    fn status_url_carries_comma_joined_batch() {
        let client = StatusApiClient::new(api_config("http://api.example.org/api/")).unwrap();
        let url = client
            .status_update_url(&["MGI:1".to_string(), "MGI:2".to_string()])
            .unwrap();
        assert_eq!(url.path(), "/api/reference/statusUpdate");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("accid".to_string(), "MGI:1,MGI:2".to_string()),
                ("group".to_string(), "GO".to_string()),
                ("status".to_string(), "Indexed".to_string()),
            ]
        );
    }
}
