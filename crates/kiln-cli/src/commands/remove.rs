//! `kiln remove`.

use anyhow::Context;
use kiln_plugins::{PluginHost, PluginId};

use crate::theme::Theme;

pub(crate) async fn remove_plugin(host: &PluginHost, name: &str) -> anyhow::Result<()> {
    let id = PluginId::new(name).context("invalid plugin ID")?;
    println!("{}", Theme::step(&format!("Removing plugin: {id}")));

    let removed = host
        .remove(id.as_str())
        .await
        .with_context(|| format!("failed to remove '{id}'"))?;

    println!(
        "{}",
        Theme::success(&format!(
            "Plugin '{id}' v{} removed, memory purged",
            removed.manifest.plugin.version
        ))
    );
    Ok(())
}
