//! Cloud glue: S3 sync of the output directory and EC2 self-termination.
//!
//! Both shell out to the `aws` CLI, which must be on `PATH` with credentials
//! configured for the instance.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::Context;
use cyclegan::training::run::{Archiver, Terminator};

/// Link-local instance metadata endpoint.
pub const IMDS_BASE_URL: &str = "http://169.254.169.254";

const IMDS_TOKEN_TTL_SECS: u32 = 21_600;

/// `s3://bucket/prefix` for `aws s3 sync`.
pub fn s3_uri(bucket: &str, prefix: &str) -> String {
    format!("s3://{bucket}/{}", prefix.trim_matches('/'))
}

fn run_aws(args: &[&str]) -> anyhow::Result<()> {
    tracing::info!(?args, "Running aws CLI");
    let status = Command::new("aws")
        .args(args)
        .status()
        .context("Failed to spawn `aws` (is the AWS CLI installed?)")?;
    anyhow::ensure!(status.success(), "`aws {}` exited with {status}", args.join(" "));
    Ok(())
}

/// Mirrors the output directory to `s3://<bucket>/<prefix>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct S3Archiver;

impl Archiver for S3Archiver {
    fn archive(&self, bucket: &str, prefix: &str, dir: &Path) -> anyhow::Result<()> {
        let uri = s3_uri(bucket, prefix);
        let local = dir.to_string_lossy();
        run_aws(&["s3", "sync", &local, &uri])?;
        tracing::info!(dir = %dir.display(), uri, "Archived outputs");
        Ok(())
    }
}

/// Terminates the EC2 instance this process runs on.
pub struct Ec2Terminator {
    client: reqwest::blocking::Client,
    metadata_url: String,
}

impl Ec2Terminator {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_metadata_url(IMDS_BASE_URL)
    }

    pub fn with_metadata_url(url: &str) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            metadata_url: url.trim_end_matches('/').to_string(),
        })
    }

    /// Look up the instance id through IMDSv2 (session token, then metadata GET).
    pub fn instance_id(&self) -> anyhow::Result<String> {
        let token = self
            .client
            .put(format!("{}/latest/api/token", self.metadata_url))
            .header("X-aws-ec2-metadata-token-ttl-seconds", IMDS_TOKEN_TTL_SECS.to_string())
            .send()
            .context("Failed to request IMDSv2 token")?
            .error_for_status()?
            .text()?;

        let id = self
            .client
            .get(format!("{}/latest/meta-data/instance-id", self.metadata_url))
            .header("X-aws-ec2-metadata-token", token.trim())
            .send()
            .context("Failed to query instance id")?
            .error_for_status()?
            .text()?;
        let id = id.trim().to_string();
        anyhow::ensure!(!id.is_empty(), "Instance metadata returned an empty instance id");
        Ok(id)
    }
}

impl Terminator for Ec2Terminator {
    fn terminate(&self) -> anyhow::Result<()> {
        let id = self.instance_id()?;
        tracing::warn!(instance_id = id, "Terminating EC2 instance");
        run_aws(&["ec2", "terminate-instances", "--instance-ids", &id])
    }
}
