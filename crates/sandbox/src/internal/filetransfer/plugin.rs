use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use tokio::process::Command;

use crate::Map;
use crate::internal::filetransfer::items::url_scheme;

/// Maps URL schemes to external transfer programs.
///
/// A plugin is invoked as `<plugin> <source> <destination>` and must exit with
/// status zero on success. `file://` URLs are handled in-process.
#[derive(Debug, Clone, Default)]
pub struct PluginRegistry {
    plugins: Map<String, PathBuf>,
}

impl PluginRegistry {
    pub fn register(&mut self, scheme: &str, program: PathBuf) {
        self.plugins.insert(scheme.to_ascii_lowercase(), program);
    }

    /// Registers a plugin program found in `PATH`.
    pub fn register_from_path(&mut self, scheme: &str, program: &str) -> anyhow::Result<()> {
        let path = which::which(program)
            .with_context(|| format!("transfer plugin {program} for {scheme}:// not found"))?;
        self.register(scheme, path);
        Ok(())
    }

    pub fn supports(&self, url: &str) -> bool {
        match url_scheme(url) {
            Some(scheme) => scheme == "file" || self.plugins.contains_key(scheme),
            None => false,
        }
    }

    fn plugin_for(&self, url: &str) -> anyhow::Result<Option<&Path>> {
        let Some(scheme) = url_scheme(url) else {
            bail!("{url} is not a URL");
        };
        if scheme == "file" {
            return Ok(None);
        }
        match self.plugins.get(scheme) {
            Some(path) => Ok(Some(path.as_path())),
            None => bail!("no transfer plugin registered for {scheme}://"),
        }
    }

    /// Fetches `url` into `dest`, returning the number of bytes written.
    pub async fn download(&self, url: &str, dest: &Path) -> anyhow::Result<u64> {
        match self.plugin_for(url)? {
            None => {
                let source = file_url_path(url);
                tokio::fs::copy(source, dest)
                    .await
                    .with_context(|| format!("cannot copy {source} to {}", dest.display()))
            }
            Some(plugin) => {
                run_plugin(plugin, url, &dest.display().to_string()).await?;
                Ok(tokio::fs::metadata(dest).await?.len())
            }
        }
    }

    /// Delivers the local file `source` to `url`.
    pub async fn upload(&self, source: &Path, url: &str) -> anyhow::Result<u64> {
        match self.plugin_for(url)? {
            None => {
                let dest = file_url_path(url);
                tokio::fs::copy(source, dest)
                    .await
                    .with_context(|| format!("cannot copy {} to {dest}", source.display()))
            }
            Some(plugin) => {
                run_plugin(plugin, &source.display().to_string(), url).await?;
                Ok(tokio::fs::metadata(source).await?.len())
            }
        }
    }
}

fn file_url_path(url: &str) -> &str {
    url.strip_prefix("file://").unwrap_or(url)
}

async fn run_plugin(plugin: &Path, source: &str, dest: &str) -> anyhow::Result<()> {
    log::debug!("Running transfer plugin {} {source} {dest}", plugin.display());
    let output = Command::new(plugin)
        .arg(source)
        .arg(dest)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("cannot start transfer plugin {}", plugin.display()))?;
    if !output.status.success() {
        bail!(
            "transfer plugin {} failed ({}): {}",
            plugin.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
