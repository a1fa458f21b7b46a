//! Command execution inside member pods
//!
//! Both the database admin client and the backup agent client drive their
//! processes by running a CLI in a container of the member pod.

use k8s_openapi::api::core::v1::Pod;
use kube::api::AttachParams;
use kube::{Api, Client};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// Errors from running a command in a pod
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("command in {pod}/{container} failed: {message}")]
    Failed {
        pod: String,
        container: String,
        message: String,
    },

    #[error("command output is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Runs commands in a fixed container of pods in one namespace
#[derive(Clone)]
pub struct PodExec {
    client: Client,
    container: &'static str,
}

impl PodExec {
    pub fn new(client: Client, container: &'static str) -> Self {
        Self { client, container }
    }

    /// Execute a command and return its stdout. A non-success exit status is an error
    /// carrying whatever the command printed on stderr.
    pub async fn run(&self, namespace: &str, pod: &str, command: &[&str]) -> Result<String, ExecError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        let attach_params = AttachParams {
            container: Some(self.container.to_string()),
            stdin: false,
            stdout: true,
            stderr: true,
            tty: false,
            ..Default::default()
        };

        let command_strings: Vec<String> = command.iter().map(|s| s.to_string()).collect();
        let mut attached = pods.exec(pod, command_strings, &attach_params).await?;

        let (stdout, stderr) = tokio::join!(read_all(attached.stdout()), read_all(attached.stderr()));
        let stdout = stdout.map_err(|e| self.failed(pod, e.to_string()))?;
        let stderr = stderr.map_err(|e| self.failed(pod, e.to_string()))?;

        if let Some(status_channel) = attached.take_status()
            && let Some(result) = status_channel.await
            && let Some(status) = result.status
            && status != "Success"
        {
            let message = String::from_utf8_lossy(&stderr).trim().to_string();
            debug!(pod, status, "Command exited with non-success status");
            return Err(self.failed(
                pod,
                if message.is_empty() {
                    result.message.unwrap_or(status)
                } else {
                    message
                },
            ));
        }

        Ok(String::from_utf8(stdout)?)
    }

    fn failed(&self, pod: &str, message: String) -> ExecError {
        ExecError::Failed {
            pod: pod.to_string(),
            container: self.container.to_string(),
            message,
        }
    }
}

async fn read_all(reader: Option<impl AsyncRead + Unpin>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}
