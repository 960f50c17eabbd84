use thiserror::Error;

/// Per-component error enums (spec.md §7's taxonomy), one variant family
/// per failure mode named in the table. Internal plumbing (`command`,
/// `git`, `database`, `docker`) still propagates plain `anyhow::Error`;
/// these typed errors sit at each component's public boundary so callers
/// can match on them instead of string-sniffing, following the teacher's
/// split between `anyhow` internals and `thiserror` boundary types (e.g.
/// `komodo_client`'s typed API errors).
#[derive(Debug, Error)]
pub enum PortError {
  #[error("no free port in range {start}-{end}")]
  Exhausted { start: u16, end: u16 },
  #[error(transparent)]
  Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ProxyError {
  #[error("failed to ensure proxy container: {0}")]
  EnsureFailed(String),
  #[error(transparent)]
  Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ContainerError {
  #[error("container {0} not found")]
  NotFound(String),
  #[error("docker port bind failed after {attempts} attempts: {message}")]
  PortBindExhausted { attempts: u32, message: String },
  #[error(transparent)]
  Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum BuildError {
  #[error("build step '{stage}' failed: {message}")]
  StepFailed { stage: String, message: String },
  #[error("a build is already running for this deployment")]
  AlreadyBuilding,
  #[error(transparent)]
  Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum BucketError {
  #[error("invalid subdomain: {0}")]
  InvalidSubdomain(String),
  #[error("bucket name already in use for this user")]
  DuplicateName,
  #[error("public URL slug already in use")]
  DuplicateSlug,
  #[error(transparent)]
  Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SecretError {
  #[error("secret payload is malformed")]
  Malformed,
  #[error(transparent)]
  Other(#[from] anyhow::Error),
}

/// Top-level error aggregator for the few places (HTTP handlers) that need
/// to map any of the above into a single response type, mirroring the
/// teacher's top-level `serror`-formatted API error.
#[derive(Debug, Error)]
pub enum CoreError {
  #[error(transparent)]
  Port(#[from] PortError),
  #[error(transparent)]
  Proxy(#[from] ProxyError),
  #[error(transparent)]
  Container(#[from] ContainerError),
  #[error(transparent)]
  Build(#[from] BuildError),
  #[error(transparent)]
  Bucket(#[from] BucketError),
  #[error(transparent)]
  Secret(#[from] SecretError),
  #[error(transparent)]
  Other(#[from] anyhow::Error),
}
