//! Git helpers for the deployment builder (spec §4.4) and, by extension,
//! any future host-side repo inspection. Unlike the teacher's `lib/git`
//! (which drives `git clone`/`pull`/`commit` directly on the host against
//! resource-config repos checked out alongside a stack), this design's
//! cloning always happens *inside* a container via `exec` - the workspace
//! container clones its own `/workspace` on first boot from
//! `GITHUB_REPO`/`GITHUB_TOKEN`, and the standalone deployment builder
//! clones inside its ephemeral build container (spec §4.4 step 3). This
//! crate therefore only builds the shell commands those in-container
//! clones run, plus a host-side reachability check the deployment builder
//! can use to fail fast before ever creating a build container.

mod clone;

pub use clone::*;
