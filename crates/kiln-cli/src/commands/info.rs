//! `kiln info`.

use kiln_plugins::PluginHost;

use crate::theme::Theme;

pub(crate) async fn plugin_info(host: &PluginHost, name: &str) -> anyhow::Result<()> {
    let plugin = host.get(name).await?;
    let meta = &plugin.manifest.plugin;

    println!("{}", Theme::header(&format!("Plugin: {}", plugin.id)));
    println!("{}", Theme::kv("Version", &meta.version));
    println!("{}", Theme::kv("Description", &meta.description));
    println!("{}", Theme::kv("Author", &meta.author));
    if !meta.license.is_empty() {
        println!("{}", Theme::kv("License", &meta.license));
    }
    if let Some(homepage) = &meta.homepage {
        println!("{}", Theme::kv("Homepage", homepage));
    }
    println!("{}", Theme::kv("Location", &plugin.path.display().to_string()));
    println!("{}", Theme::kv("Source", &plugin.source.to_string()));
    println!("{}", Theme::kv("Installed", &plugin.installed_at.to_rfc3339()));
    println!("{}", Theme::kv("Artifact", &plugin.artifact_hash));
    if let Some(sum) = &plugin.checksum {
        println!("{}", Theme::kv("Checksum", &Theme::checksum(Some(sum), false)));
    }

    let perms = &plugin.manifest.permissions;
    println!("\n{}", Theme::header("Permissions"));
    if perms.is_empty() {
        println!("  {}", Theme::dimmed("none"));
    } else {
        println!("  {}", Theme::grant("network", &perms.network));
        println!("  {}", Theme::grant("file_read", &perms.file_read));
        println!(
            "  {}",
            Theme::kv("file_write", if perms.file_write { "yes" } else { "no" })
        );
        println!("  {}", Theme::grant("env_vars", &perms.env_vars));
    }

    let tools = &plugin.manifest.tools.definitions;
    if !tools.is_empty() {
        println!("\n{}", Theme::header(&format!("Tools ({})", tools.len())));
        for tool in tools {
            println!("  {:<20} {}", tool.name, Theme::dimmed(&tool.description));
        }
    }

    let skills = &plugin.manifest.skills.definitions;
    if !skills.is_empty() {
        println!("\n{}", Theme::header(&format!("Skills ({})", skills.len())));
        for skill in skills {
            println!("  {:<20} {}", skill.name, Theme::dimmed(&skill.description));
            println!("  {:<20} {}", "", Theme::dimmed(&skill.patterns.join(" | ")));
        }
    }

    Ok(())
}
