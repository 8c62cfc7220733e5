//! Capability gates and quotas against installed plugins.

mod common;

use std::time::Duration;

use common::{TestHost, write_plugin};
use kiln_plugins::{
    ExecutionContext, InstallOptions, PluginError, PluginId, ResourceKind, SandboxLimits,
};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const FETCHER_MANIFEST: &str = r#"
[plugin]
name = "fetcher"
version = "0.1.0"
description = "Fetches forecasts"
author = "Kiln Team"

[runtime]
entry = "index.js"

[permissions]
network = ["api.example.com", "127.0.0.1"]

[[tools.definitions]]
name = "get"
description = "GET a URL"
parameters = { type = "object", properties = { url = { type = "string" } }, required = ["url"] }
"#;

const FETCHER_SOURCE: &str = r#"
globalThis.__tool_get = async ({ url }) => {
    const res = await fetch(url);
    const body = await res.json();
    return `${res.status}:${body.forecast}`;
};
"#;

#[tokio::test(flavor = "multi_thread")]
async fn network_allowlist_is_enforced() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/forecast"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "forecast": "rain" })))
        .mount(&server)
        .await;

    let t = TestHost::new();
    let src = write_plugin(&t.scratch("fetcher"), FETCHER_MANIFEST, "index.js", FETCHER_SOURCE);
    t.host.install(&src, &InstallOptions::default()).await.unwrap();
    let ctx = ExecutionContext::cli();

    let denied = t
        .host
        .invoke_tool("fetcher", "get", json!({ "url": "https://other.example.com/x" }), &ctx)
        .await
        .unwrap();
    assert!(!denied.success);
    assert!(denied.output.is_none());
    assert!(
        denied.error.as_deref().unwrap().contains("PermissionDenied"),
        "{denied:?}"
    );

    // Same server, but `localhost` is not on the list: the request must
    // never leave the sandbox.
    let port = server.address().port();
    let sneaky = t
        .host
        .invoke_tool(
            "fetcher",
            "get",
            json!({ "url": format!("http://localhost:{port}/forecast") }),
            &ctx,
        )
        .await
        .unwrap();
    assert!(!sneaky.success);
    assert!(server.received_requests().await.unwrap().is_empty());

    let allowed = t
        .host
        .invoke_tool(
            "fetcher",
            "get",
            json!({ "url": format!("{}/forecast", server.uri()) }),
            &ctx,
        )
        .await
        .unwrap();
    assert_eq!(allowed.output.as_deref(), Some("200:rain"), "{allowed:?}");
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn busy_loop_times_out_and_next_call_recovers() {
    let limits = SandboxLimits {
        timeout: Duration::from_millis(300),
        ..SandboxLimits::default()
    };
    let t = TestHost::with(limits, "https://registry.invalid");
    let manifest = r#"
[plugin]
name = "spinner"
version = "0.1.0"
description = "Never returns"
author = "Kiln Team"

[runtime]
entry = "index.js"

[[tools.definitions]]
name = "spin"
description = "Loop forever"
parameters = { type = "object" }

[[tools.definitions]]
name = "ping"
description = "Answer pong"
parameters = { type = "object" }
"#;
    let code = r#"
globalThis.__tool_spin = () => { for (;;) {} };
globalThis.__tool_ping = () => "pong";
"#;
    let src = write_plugin(&t.scratch("spinner"), manifest, "index.js", code);
    t.host.install(&src, &InstallOptions::default()).await.unwrap();
    let ctx = ExecutionContext::cli();
    let id = PluginId::new("spinner").unwrap();

    let err = t
        .host
        .invoke_tool("spinner", "spin", json!({}), &ctx)
        .await
        .unwrap_err();
    assert!(
        matches!(err, PluginError::ResourceExceeded(ResourceKind::Timeout)),
        "{err}"
    );
    assert_eq!(t.host.engine().idle_instances(&id).await, 0);

    let ok = t
        .host
        .invoke_tool("spinner", "ping", json!({}), &ctx)
        .await
        .unwrap();
    assert_eq!(ok.output.as_deref(), Some("pong"));
    assert_eq!(t.host.engine().idle_instances(&id).await, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn skills_route_by_pattern() {
    let t = TestHost::new();
    let manifest = r#"
[plugin]
name = "umbrella"
version = "0.1.0"
description = "Rain advice"
author = "Kiln Team"

[runtime]
entry = "index.js"

[[skills.definitions]]
name = "rain"
description = "Rain forecasts"
patterns = ["will it rain*"]
examples = ["will it rain today?"]

[[skills.definitions]]
name = "fallback"
description = "Anything else"
patterns = ["*"]
examples = ["anything"]
"#;
    let code = r#"
globalThis.__skill_rain = ({ query, context }) => ({
    success: true,
    response: `maybe (${context.channel})`,
    actions: [{ action_type: "remind", data: { query } }],
});
globalThis.__skill_fallback = () => "no idea";
"#;
    let src = write_plugin(&t.scratch("umbrella"), manifest, "index.js", code);
    t.host.install(&src, &InstallOptions::default()).await.unwrap();
    let ctx = ExecutionContext::cli();

    let (skill, result) = t
        .host
        .invoke_skill_query("umbrella", "Will it RAIN tomorrow?", &ctx)
        .await
        .unwrap();
    assert_eq!(skill, "rain");
    assert_eq!(result.response.as_deref(), Some("maybe (cli)"));
    assert_eq!(result.actions.len(), 1);
    assert_eq!(result.actions[0].action_type, "remind");

    let (skill, result) = t
        .host
        .invoke_skill_query("umbrella", "tell me a joke", &ctx)
        .await
        .unwrap();
    assert_eq!(skill, "fallback");
    assert_eq!(result.response.as_deref(), Some("no idea"));
}
