//! `kiln install`.

use anyhow::Context;
use kiln_plugins::{InstallOptions, PluginHost};

use crate::theme::Theme;

pub(crate) async fn install_plugin(
    host: &PluginHost,
    source: &str,
    options: &InstallOptions,
) -> anyhow::Result<()> {
    println!("{}", Theme::step(&format!("Installing from {source}")));

    let report = host
        .install(source, options)
        .await
        .with_context(|| format!("failed to install '{source}'"))?;
    let plugin = &report.plugin;

    let verb = if report.replaced { "Reinstalled" } else { "Installed" };
    println!(
        "{}",
        Theme::success(&format!(
            "{verb} {} v{}",
            plugin.id, plugin.manifest.plugin.version
        ))
    );
    println!("{}", Theme::kv("Location", &plugin.path.display().to_string()));
    println!("{}", Theme::kv("Source", &plugin.source.to_string()));

    println!(
        "{}",
        Theme::kv(
            "Checksum",
            &Theme::checksum(plugin.checksum.as_deref(), report.checksum_verified)
        )
    );
    if let Some(stages) = Theme::build_stages(report.transformed, report.bundled) {
        println!("{}", Theme::kv("Build", &stages));
    }

    let tools = plugin.manifest.tools.definitions.len();
    let skills = plugin.manifest.skills.definitions.len();
    println!(
        "{}",
        Theme::dimmed(&format!("{tools} tool(s), {skills} skill(s)"))
    );
    Ok(())
}
