//! Runs vendor CLIs on the host or inside the driver pod.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::AttachParams;
use kube::api::ListParams;
use kube::Api;
use kube::Client;
use kube::ResourceExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::error::DeviceError;
use crate::error::DeviceResult;

/// Raw result of a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub success: bool,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: Vec::new(),
            success: true,
        }
    }

    pub fn failed(stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: stderr.into(),
            success: false,
        }
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Both streams, for matching diagnostics that vendors print on either.
    pub fn combined(&self) -> String {
        format!(
            "{}{}",
            String::from_utf8_lossy(&self.stdout),
            String::from_utf8_lossy(&self.stderr)
        )
    }
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs `program` with `args`. A non-zero exit is reported through
    /// [`CommandOutput::success`]; only spawn, exec and timeout failures are
    /// errors.
    async fn execute(&self, program: &str, args: &[String]) -> DeviceResult<CommandOutput>;
}

/// Runs a command and returns its stdout, failing on a non-zero exit.
pub async fn run_checked(
    executor: &dyn CommandExecutor,
    program: &str,
    args: &[String],
) -> DeviceResult<String> {
    let output = executor.execute(program, args).await?;
    if !output.success {
        return Err(Report::new(DeviceError::command(format!(
            "{program} {} exited with failure: {}",
            args.join(" "),
            output.combined().trim()
        ))));
    }
    Ok(output.stdout_str())
}

/// Executes in the local process namespace, optionally chrooted into the
/// host filesystem.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    host_root: Option<PathBuf>,
    timeout: Duration,
}

impl LocalExecutor {
    pub fn new(host_root: Option<PathBuf>, timeout: Duration) -> Self {
        Self { host_root, timeout }
    }

    fn command(&self, program: &str, args: &[String]) -> Command {
        let mut cmd = match &self.host_root {
            Some(root) => {
                let mut cmd = Command::new("chroot");
                cmd.arg(root).arg(program);
                cmd
            }
            None => Command::new(program),
        };
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CommandExecutor for LocalExecutor {
    async fn execute(&self, program: &str, args: &[String]) -> DeviceResult<CommandOutput> {
        debug!(program, ?args, "executing local command");
        let output = timeout(self.timeout, self.command(program, args).output())
            .await
            .map_err(|_| {
                Report::new(DeviceError::command(format!(
                    "{program} timed out after {:?}",
                    self.timeout
                )))
            })?
            .change_context(DeviceError::command(format!("failed to spawn {program}")))?;

        Ok(CommandOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            success: output.status.success(),
        })
    }
}

/// Executes inside the vendor driver pod running on this node.
#[derive(Clone)]
pub struct RemotePodExecutor {
    pods: Api<Pod>,
    selector: String,
    node_name: String,
    container: Option<String>,
    timeout: Duration,
}

impl RemotePodExecutor {
    pub fn new(
        client: Client,
        namespace: &str,
        selector: impl Into<String>,
        node_name: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
            selector: selector.into(),
            node_name: node_name.into(),
            container: None,
            timeout,
        }
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    async fn driver_pod(&self) -> DeviceResult<String> {
        let params = ListParams::default()
            .labels(&self.selector)
            .fields(&format!("spec.nodeName={}", self.node_name));
        let pods = self
            .pods
            .list(&params)
            .await
            .change_context(DeviceError::Kubernetes {
                message: format!("failed to list driver pods with {}", self.selector),
            })?;

        pods.items
            .into_iter()
            .find(|pod| {
                pod.status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .is_some_and(|phase| phase == "Running")
            })
            .map(|pod| pod.name_any())
            .ok_or_else(|| {
                Report::new(DeviceError::not_found(format!(
                    "running driver pod ({}) on node {}",
                    self.selector, self.node_name
                )))
            })
    }

    async fn exec(&self, pod: &str, command: Vec<String>) -> DeviceResult<CommandOutput> {
        let mut params = AttachParams::default().stdin(false).stdout(true).stderr(true);
        if let Some(container) = &self.container {
            params = params.container(container.clone());
        }

        let mut attached = self
            .pods
            .exec(pod, command, &params)
            .await
            .change_context(DeviceError::command(format!("exec into pod {pod} failed")))?;

        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let (stdout, stderr) = tokio::join!(read_all(stdout), read_all(stderr));
        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };
        attached
            .join()
            .await
            .change_context(DeviceError::command(format!("exec session in {pod} failed")))?;

        let success = status
            .and_then(|s| s.status)
            .is_some_and(|s| s == "Success");
        Ok(CommandOutput {
            stdout: stdout?,
            stderr: stderr?,
            success,
        })
    }
}

async fn read_all(reader: Option<impl AsyncRead + Unpin>) -> DeviceResult<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader
            .read_to_end(&mut buf)
            .await
            .change_context(DeviceError::command("failed to read exec output"))?;
    }
    Ok(buf)
}

#[async_trait]
impl CommandExecutor for RemotePodExecutor {
    async fn execute(&self, program: &str, args: &[String]) -> DeviceResult<CommandOutput> {
        let pod = self.driver_pod().await?;
        debug!(pod, program, ?args, "executing in driver pod");

        let command = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect();
        timeout(self.timeout, self.exec(&pod, command))
            .await
            .map_err(|_| {
                Report::new(DeviceError::command(format!(
                    "{program} in pod {pod} timed out after {:?}",
                    self.timeout
                )))
            })?
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[tokio::test]
    async fn local_executor_captures_output() {
        let executor = LocalExecutor::new(None, Duration::from_secs(5));
        let output = executor
            .execute("sh", &["-c".to_string(), "echo out; echo err >&2; exit 3".to_string()])
            .await
            .expect("spawn");
        assert_eq!(output.stdout_str(), "out\n");
        assert_eq!(String::from_utf8_lossy(&output.stderr), "err\n");
        assert!(!output.success);
    }

    #[tokio::test]
    async fn local_executor_times_out() {
        let executor = LocalExecutor::new(None, Duration::from_millis(50));
        let err = executor
            .execute("sleep", &["5".to_string()])
            .await
            .expect_err("should time out");
        assert!(matches!(err.current_context(), DeviceError::Command { .. }));
    }

    #[tokio::test]
    async fn run_checked_rejects_failure() {
        let executor = LocalExecutor::new(None, Duration::from_secs(5));
        let err = run_checked(&executor, "false", &[])
            .await
            .expect_err("false fails");
        assert!(matches!(err.current_context(), DeviceError::Command { .. }));
        let out = run_checked(&executor, "echo", &["hi".to_string()])
            .await
            .expect("echo");
        assert_eq!(out, "hi\n");
    }
}
