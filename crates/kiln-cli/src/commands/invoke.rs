//! `kiln invoke` and `kiln skill`.
//!
//! Results are printed to stdout as JSON so they can be piped; a handler
//! that reports failure makes the command exit non-zero.

use anyhow::Context;
use kiln_plugins::{ExecutionContext, PluginHost};
use serde_json::Value;

pub(crate) async fn invoke_tool(
    host: &PluginHost,
    name: &str,
    tool: &str,
    args: Option<&str>,
) -> anyhow::Result<()> {
    let args: Value = match args {
        Some(raw) => serde_json::from_str(raw).context("--args is not valid JSON")?,
        None => Value::Object(serde_json::Map::new()),
    };
    if !args.is_object() {
        anyhow::bail!("--args must be a JSON object");
    }

    let result = host
        .invoke_tool(name, tool, args, &ExecutionContext::cli())
        .await
        .with_context(|| format!("failed to invoke {name}/{tool}"))?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        anyhow::bail!("tool '{tool}' reported failure");
    }
    Ok(())
}

pub(crate) async fn invoke_skill(
    host: &PluginHost,
    name: &str,
    query: &str,
    skill: Option<&str>,
) -> anyhow::Result<()> {
    let context = ExecutionContext::cli();
    let (skill, result) = match skill {
        Some(skill) => (
            skill.to_string(),
            host.invoke_skill(name, skill, query, &context).await,
        ),
        None => match host.invoke_skill_query(name, query, &context).await {
            Ok((skill, result)) => (skill, Ok(result)),
            Err(e) => (String::from("<no match>"), Err(e)),
        },
    };
    let result = result.with_context(|| format!("failed to run skill {name}/{skill}"))?;

    let output = serde_json::json!({ "skill": skill, "result": result });
    println!("{}", serde_json::to_string_pretty(&output)?);
    if !result.success {
        anyhow::bail!("skill '{skill}' reported failure");
    }
    Ok(())
}
