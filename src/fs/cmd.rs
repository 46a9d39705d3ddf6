use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::{io::AsyncWriteExt as _, process::Command};

/// Run an external command, fail with full context (argv, exit code, both
/// output streams) on anything but the expected status.
#[async_trait]
pub trait CheckCommandOutput {
    async fn run(&mut self) -> Result<Vec<u8>>;

    async fn run_with_input(&mut self, input: &[u8]) -> Result<Vec<u8>>;

    async fn run_with_status_checker<R>(
        &mut self,
        f: impl Fn(i32, Vec<u8>, Vec<u8>) -> Result<R> + Send + Sync,
    ) -> Result<R>;

    async fn run_with_input_and_status_checker<R>(
        &mut self,
        input: Option<&[u8]>,
        f: impl Fn(i32, Vec<u8>, Vec<u8>) -> Result<R> + Send + Sync,
    ) -> Result<R>;
}

fn expect_success(code: i32, stdout: Vec<u8>, _stderr: Vec<u8>) -> Result<Vec<u8>> {
    if code != 0 {
        bail!("Bad exit code")
    }
    Ok(stdout)
}

#[async_trait]
impl CheckCommandOutput for Command {
    async fn run(&mut self) -> Result<Vec<u8>> {
        self.run_with_input_and_status_checker(None, expect_success)
            .await
    }

    async fn run_with_input(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        self.run_with_input_and_status_checker(Some(input), expect_success)
            .await
    }

    async fn run_with_status_checker<R>(
        &mut self,
        f: impl Fn(i32, Vec<u8>, Vec<u8>) -> Result<R> + Send + Sync,
    ) -> Result<R> {
        self.run_with_input_and_status_checker(None, f).await
    }

    async fn run_with_input_and_status_checker<R>(
        &mut self,
        input: Option<&[u8]>,
        f: impl Fn(i32, Vec<u8>, Vec<u8>) -> Result<R> + Send + Sync,
    ) -> Result<R> {
        // reset all locale settings for this command
        self.env("LC_ALL", "C");

        tracing::trace!(cmd = ?self.as_std(), "run external cmd");

        let output = async {
            if input.is_some() {
                self.stdin(Stdio::piped());
            } else {
                self.stdin(Stdio::null());
            }
            self.stdout(Stdio::piped());
            self.stderr(Stdio::piped());

            let mut child = self.kill_on_drop(true).spawn()?;

            if let Some(input) = input {
                let mut stdin = child.stdin.take().context("No stdin")?;
                stdin.write_all(input).await?;
                stdin.shutdown().await?;
            }

            child.wait_with_output().await.map_err(anyhow::Error::from)
        }
        .await
        .with_context(|| format!("Failed to spawn {:?}", self.as_std()))?;

        let code = output
            .status
            .code()
            .ok_or_else(|| anyhow!("{:?} killed by signal", self.as_std()))?;

        f(code, output.stdout.clone(), output.stderr.clone()).with_context(|| {
            format!(
                "\ncmd: {:?}\nexit code: {code}\nstdout: {}\nstderr: {}",
                self.as_std(),
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr),
            )
        })
    }
}
