//! `kiln search`.

use kiln_plugins::PluginHost;

use crate::theme::Theme;

pub(crate) async fn search_registry(host: &PluginHost, query: &str, limit: usize) -> anyhow::Result<()> {
    let results = host.search(query, limit).await?;
    if results.is_empty() {
        println!("{}", Theme::dimmed(&format!("No plugins match '{query}'")));
        return Ok(());
    }

    println!("{}", Theme::header(&format!("Registry results for '{query}'")));
    println!(
        "{}",
        Theme::table_head(&format!(
            "{:<28} {:<10} {:>9}  DESCRIPTION",
            "NAME", "VERSION", "DOWNLOADS"
        ))
    );
    for r in &results {
        println!(
            "  {:<28} {:<10} {:>9}  {}",
            r.name,
            r.version,
            r.downloads,
            Theme::dimmed(&r.description)
        );
    }
    Ok(())
}
