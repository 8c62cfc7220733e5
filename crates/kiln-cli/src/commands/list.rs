//! `kiln list`.

use std::path::Path;

use kiln_plugins::PluginHost;

use crate::theme::Theme;

pub(crate) async fn list_plugins(host: &PluginHost, root: &Path, verify: bool) -> anyhow::Result<()> {
    let plugins = host.list().await?;

    if plugins.is_empty() {
        println!("{}", Theme::dimmed("No plugins installed"));
        println!("{}", Theme::dimmed(&format!("Plugin directory: {}", root.display())));
    } else {
        println!("{}", Theme::header("Installed Plugins"));
        println!(
            "{}",
            Theme::table_head(&format!(
                "{:<28} {:<10} {:>5} {:>6}  SOURCE",
                "ID", "VERSION", "TOOLS", "SKILLS"
            ))
        );
        for p in &plugins {
            println!(
                "{}",
                Theme::plugin_row(
                    p.id.as_str(),
                    &p.manifest.plugin.version,
                    p.manifest.tools.definitions.len(),
                    p.manifest.skills.definitions.len(),
                    &p.source.to_string(),
                )
            );
        }
        println!("\n{}", Theme::dimmed(&format!("{} plugin(s)", plugins.len())));
    }

    if verify {
        let violations = host.verify().await?;
        if violations.is_empty() {
            println!("{}", Theme::success("Lockfile matches installed plugins"));
        } else {
            for v in &violations {
                println!("{}", Theme::warning(&v.to_string()));
            }
            anyhow::bail!("{} integrity violation(s)", violations.len());
        }
    }

    Ok(())
}
