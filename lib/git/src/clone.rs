use command::run_kalpana_command;
use kalpana_client::entities::log::Log;

/// Everything needed to clone a repo: the remote, the branch to check
/// out, and an optional token for private repos (spec §3 Workspace's
/// `cloneSource`, Deployment's `github` source).
#[derive(Debug, Clone)]
pub struct CloneArgs {
  pub repo: String,
  pub branch: Option<String>,
  pub token: Option<String>,
}

impl CloneArgs {
  pub fn new(repo: impl Into<String>) -> Self {
    Self { repo: repo.into(), branch: None, token: None }
  }

  pub fn branch(mut self, branch: impl Into<String>) -> Self {
    self.branch = Some(branch.into());
    self
  }

  pub fn token(mut self, token: impl Into<String>) -> Self {
    self.token = Some(token.into());
    self
  }

  /// `https://{token}@github.com/{repo}.git`, or a bare `https://` URL
  /// when no token is set. `repo` is expected in `owner/name` form, per
  /// spec §4.4's literal clone URL format.
  pub fn remote_url(&self) -> String {
    match &self.token {
      Some(token) => format!("https://{token}@github.com/{}.git", self.repo),
      None => format!("https://github.com/{}.git", self.repo),
    }
  }

  /// The shell command run inside the build/workspace container to
  /// perform the clone (spec §4.4 step 3: "clone ... into `/app/repo`
  /// with depth 1"). `dest` is the destination directory; it must not
  /// already exist or must be empty.
  pub fn clone_command(&self, dest: &str) -> String {
    let branch_arg = self
      .branch
      .as_deref()
      .map(|b| format!(" --branch {b}"))
      .unwrap_or_default();
    format!(
      "git clone --depth 1{branch_arg} {} {dest}",
      self.remote_url()
    )
  }
}

/// Host-side `git ls-remote` reachability check, so the deployment
/// builder can fail fast with a descriptive error before ever spinning up
/// a build container for a repo/token combination that won't clone.
pub async fn validate_remote_accessible(args: &CloneArgs) -> Log {
  run_kalpana_command(
    "Validate Remote",
    None,
    format!("git ls-remote {}", args.remote_url()),
  )
  .await
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn remote_url_with_token() {
    let args = CloneArgs::new("o/r").token("ghp_abc");
    assert_eq!(args.remote_url(), "https://ghp_abc@github.com/o/r.git");
  }

  #[test]
  fn remote_url_without_token() {
    let args = CloneArgs::new("o/r");
    assert_eq!(args.remote_url(), "https://github.com/o/r.git");
  }

  #[test]
  fn clone_command_includes_branch_and_depth() {
    let args = CloneArgs::new("o/r").branch("main").token("tok");
    let cmd = args.clone_command("/app/repo");
    assert_eq!(
      cmd,
      "git clone --depth 1 --branch main https://tok@github.com/o/r.git /app/repo"
    );
  }

  #[test]
  fn clone_command_without_branch() {
    let args = CloneArgs::new("o/r");
    assert_eq!(
      args.clone_command("/app/repo"),
      "git clone --depth 1 https://github.com/o/r.git /app/repo"
    );
  }
}
