//! Recipe tree synchronisation via git.

use camino::Utf8Path;
use eyre::{eyre, Result};
use tracing::info;

/// Clone `repo` into `dir`, or fast-forward an existing checkout.
pub async fn sync_recipes(repo: &str, dir: &Utf8Path) -> Result<()> {
    if dir.join(".git").exists() {
        info!(%dir, "updating recipe checkout");
        run_git(&["-C", dir.as_str(), "fetch", "--depth", "1", "origin"]).await?;
        run_git(&["-C", dir.as_str(), "reset", "--hard", "origin/HEAD"]).await
    } else {
        info!(%repo, %dir, "cloning recipe tree");
        run_git(&["clone", "--depth", "1", repo, dir.as_str()]).await
    }
}

async fn run_git(args: &[&str]) -> Result<()> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .output()
        .await?;
    if !output.status.success() {
        return Err(eyre!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}
