//! Install pipeline end to end: local and registry sources, removal,
//! concurrent reinstalls and registry search.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use common::{HELLO_MANIFEST, HELLO_SOURCE, TestHost, sha256, tarball, write_plugin, zipball};
use kiln_plugins::{
    ExecutionContext, InstallOptions, PluginError, PluginId, Provenance, SandboxLimits,
};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test(flavor = "multi_thread")]
async fn hello_plugin_greets() {
    let t = TestHost::new();
    let src = write_plugin(&t.scratch("hello"), HELLO_MANIFEST, "index.ts", HELLO_SOURCE);

    let report = t.host.install(&src, &InstallOptions::default()).await.unwrap();
    assert_eq!(report.plugin.id.as_str(), "hello");
    assert!(report.transformed);
    assert!(!report.bundled);
    assert!(matches!(report.plugin.source, Provenance::Local { .. }));

    let installed = t.root().join("hello");
    assert!(installed.join("plugin.toml").is_file());
    assert!(installed.join("index.js").is_file());
    assert!(installed.join(".kiln-install.toml").is_file());
    assert!(installed.join("index.js.map").is_file());
    assert!(t.host.load("hello").await.unwrap().source_map.is_some());

    let result = t
        .host
        .invoke_tool("hello", "greet", json!({ "name": "World" }), &ExecutionContext::cli())
        .await
        .unwrap();
    assert_eq!(
        serde_json::to_value(&result).unwrap(),
        json!({ "success": true, "output": "Hello, World!", "error": null })
    );

    assert!(t.host.engine().source_maps().has_map(&report.plugin.id));

    let listed = t.host.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(t.host.verify().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn remove_purges_memory() {
    let t = TestHost::new();
    let manifest = r#"
[plugin]
name = "notes"
version = "0.1.0"
description = "Keeps notes"
author = "Kiln Team"

[runtime]
entry = "index.js"

[[tools.definitions]]
name = "remember"
description = "Store two notes"
parameters = { type = "object" }
"#;
    let code = r#"
globalThis.__tool_remember = async (args) => {
    await memory.set("a", { text: "first" });
    await memory.set("b", [1, 2, 3]);
    return "stored";
};
"#;
    let src = write_plugin(&t.scratch("notes"), manifest, "index.js", code);
    t.host.install(&src, &InstallOptions::default()).await.unwrap();

    let result = t
        .host
        .invoke_tool("notes", "remember", json!({}), &ExecutionContext::cli())
        .await
        .unwrap();
    assert!(result.success, "{result:?}");

    let namespace = PluginId::new("notes").unwrap().memory_namespace();
    assert_eq!(t.memory.list_keys(&namespace).await.unwrap().len(), 2);

    t.host.remove("notes").await.unwrap();
    assert!(t.memory.list_keys(&namespace).await.unwrap().is_empty());
    assert!(!t.root().join("notes").exists());
    assert!(matches!(
        t.host.get("notes").await.unwrap_err(),
        PluginError::PluginNotFound(_)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn removal_mid_invocation_leaves_memory_empty() {
    let t = Arc::new(TestHost::new());
    let manifest = r#"
[plugin]
name = "lingerer"
version = "0.1.0"
description = "Writes memory slowly"
author = "Kiln Team"

[runtime]
entry = "index.js"

[[tools.definitions]]
name = "slow"
description = "Write, spin, write again"
parameters = { type = "object" }
"#;
    let code = r#"
globalThis.__tool_slow = () => {
    memory.set("early", 1);
    const until = Date.now() + 800;
    while (Date.now() < until) {}
    memory.set("late", 2);
    return "done";
};
"#;
    let src = write_plugin(&t.scratch("lingerer"), manifest, "index.js", code);
    t.host.install(&src, &InstallOptions::default()).await.unwrap();
    let namespace = PluginId::new("lingerer").unwrap().memory_namespace();

    let running = {
        let t = Arc::clone(&t);
        tokio::spawn(async move {
            t.host
                .invoke_tool("lingerer", "slow", json!({}), &ExecutionContext::cli())
                .await
        })
    };
    while !t.memory.exists(&namespace, "early").await.unwrap() {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    t.host.remove("lingerer").await.unwrap();
    let result = running.await.unwrap().unwrap();
    assert!(!result.success, "{result:?}");
    assert!(result.error.unwrap().contains("plugin has been removed"));
    assert!(t.memory.list_keys(&namespace).await.unwrap().is_empty());

    t.host.install(&src, &InstallOptions::default()).await.unwrap();
    let result = t
        .host
        .invoke_tool("lingerer", "slow", json!({}), &ExecutionContext::cli())
        .await
        .unwrap();
    assert_eq!(result.output.as_deref(), Some("done"));
    assert_eq!(t.memory.list_keys(&namespace).await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_reinstalls_never_expose_zero_or_two_copies() {
    let t = Arc::new(TestHost::new());
    let manifest = |v: &str| {
        format!(
            "[plugin]\nname = \"racer\"\nversion = \"{v}\"\ndescription = \"d\"\nauthor = \"a\"\n\
             [runtime]\nentry = \"index.js\"\n\
             [[tools.definitions]]\nname = \"version\"\ndescription = \"Report the version\"\n\
             parameters = {{ type = \"object\" }}\n"
        )
    };
    let sources: Vec<String> = (0..4)
        .map(|i| {
            write_plugin(
                &t.scratch(&format!("racer-{i}")),
                &manifest(&format!("1.0.{i}")),
                "index.js",
                &format!("globalThis.__tool_version = () => \"1.0.{i}\";"),
            )
        })
        .collect();

    t.host
        .install(&sources[0], &InstallOptions::default())
        .await
        .unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let watch = |check: fn(Arc<TestHost>) -> futures::future::BoxFuture<'static, ()>| {
        let t = Arc::clone(&t);
        let done = Arc::clone(&done);
        tokio::spawn(async move {
            let mut observations = 0u32;
            while !done.load(Ordering::SeqCst) {
                check(Arc::clone(&t)).await;
                observations += 1;
                tokio::task::yield_now().await;
            }
            observations
        })
    };
    let watchers = [
        watch(|t| {
            Box::pin(async move {
                let listed = t.host.list().await.unwrap();
                let copies = listed.iter().filter(|p| p.id.as_str() == "racer").count();
                assert_eq!(copies, 1, "list saw {copies} copies");
            })
        }),
        watch(|t| {
            Box::pin(async move {
                let got = t.host.get("racer").await.unwrap();
                assert!(got.manifest.plugin.version.starts_with("1.0."));
            })
        }),
        watch(|t| {
            Box::pin(async move {
                let loaded = t.host.load("racer").await.unwrap();
                assert!(
                    loaded.artifact.contains(&loaded.manifest.plugin.version),
                    "manifest {} paired with another artifact",
                    loaded.manifest.plugin.version
                );
            })
        }),
        watch(|t| {
            Box::pin(async move {
                let result = t
                    .host
                    .invoke_tool("racer", "version", json!({}), &ExecutionContext::cli())
                    .await
                    .unwrap();
                assert!(result.success, "{result:?}");
                assert!(result.output.unwrap_or_default().starts_with("1.0."));
            })
        }),
    ];

    let mut installs = Vec::new();
    for round in 0..3 {
        for src in &sources {
            let t = Arc::clone(&t);
            let src = src.clone();
            installs.push(tokio::spawn(async move {
                t.host
                    .install(&src, &InstallOptions::default())
                    .await
                    .map(|r| (round, r.plugin.manifest.plugin.version))
            }));
        }
    }
    for install in installs {
        install.await.unwrap().unwrap();
    }
    done.store(true, Ordering::SeqCst);
    for watcher in watchers {
        assert!(watcher.await.unwrap() > 0);
    }

    let listed = t.host.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(t.host.verify().await.unwrap().is_empty());

    let leftovers: Vec<_> = std::fs::read_dir(t.root())
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with(".staging-") || n.starts_with(".trash-"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

async fn mount_weather(server: &MockServer, bundle: &[u8], published_sha: &str) {
    Mock::given(method("GET"))
        .and(path("/api/v1/plugins/weather"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "weather",
            "version": "2.1.0",
            "description": "Forecasts",
            "download_url": "/bundles/weather-2.1.0.tgz",
            "sha256": published_sha,
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/bundles/weather-2.1.0.tgz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(bundle.to_vec()))
        .mount(server)
        .await;
}

const WEATHER_FILES: [(&str, &str); 2] = [
    (
        "plugin.toml",
        "[plugin]\nname = \"weather\"\nversion = \"2.1.0\"\ndescription = \"d\"\nauthor = \"a\"\n[runtime]\nentry = \"index.js\"\n\
         [[tools.definitions]]\nname = \"forecast\"\ndescription = \"forecast\"\nparameters = { type = \"object\" }\n",
    ),
    ("index.js", "globalThis.__tool_forecast = () => 'sunny';"),
];

fn weather_bundle() -> Vec<u8> {
    tarball(&WEATHER_FILES)
}

#[tokio::test(flavor = "multi_thread")]
async fn zipped_registry_bundles_install() {
    let server = MockServer::start().await;
    let bundle = zipball(&WEATHER_FILES);
    mount_weather(&server, &bundle, &sha256(&bundle)).await;

    let t = TestHost::with(SandboxLimits::default(), &server.uri());
    let report = t.host.install("weather", &InstallOptions::default()).await.unwrap();
    assert!(report.checksum_verified);

    let result = t
        .host
        .invoke_tool("weather", "forecast", json!({}), &ExecutionContext::cli())
        .await
        .unwrap();
    assert_eq!(result.output.as_deref(), Some("sunny"));
}

#[tokio::test(flavor = "multi_thread")]
async fn registry_install_verifies_checksum() {
    let server = MockServer::start().await;
    let bundle = weather_bundle();
    mount_weather(&server, &bundle, &sha256(&bundle)).await;

    let t = TestHost::with(SandboxLimits::default(), &server.uri());
    let report = t.host.install("weather", &InstallOptions::default()).await.unwrap();
    assert!(report.checksum_verified);
    assert_eq!(report.plugin.checksum.as_deref(), Some(sha256(&bundle).as_str()));
    assert_eq!(
        report.plugin.source,
        Provenance::Registry {
            name: "weather".into(),
            version: "2.1.0".into()
        }
    );

    let result = t
        .host
        .invoke_tool("weather", "forecast", json!({}), &ExecutionContext::cli())
        .await
        .unwrap();
    assert_eq!(result.output.as_deref(), Some("sunny"));
}

#[tokio::test(flavor = "multi_thread")]
async fn corrupted_download_is_rejected_before_build() {
    let server = MockServer::start().await;
    let bundle = weather_bundle();
    let published = sha256(&bundle);
    let mut corrupted = bundle.clone();
    let last = corrupted.len() - 1;
    corrupted[last] ^= 0xff;
    mount_weather(&server, &corrupted, &published).await;

    let t = TestHost::with(SandboxLimits::default(), &server.uri());
    let err = t
        .host
        .install("weather", &InstallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::ChecksumMismatch { .. }), "{err}");
    assert!(t.host.list().await.unwrap().is_empty());
    assert!(!t.root().join("weather").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn search_respects_limit_and_order() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/plugins/search"))
        .and(query_param("q", "weather"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                { "name": "weather", "version": "2.1.0", "score": 0.9 },
                { "name": "@acme/weather-radar", "version": "0.3.0", "score": 0.7 },
                { "name": "weather-alerts", "version": "1.0.0", "score": 0.5 },
            ]
        })))
        .mount(&server)
        .await;

    let t = TestHost::with(SandboxLimits::default(), &server.uri());
    let results = t.host.search("weather", 2).await.unwrap();
    let names: Vec<_> = results.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["weather", "@acme/weather-radar"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn scoped_plugins_nest_under_scope_dir() {
    let t = TestHost::new();
    let manifest = "[plugin]\nname = \"@acme/tools\"\nversion = \"0.1.0\"\ndescription = \"d\"\nauthor = \"a\"\n[runtime]\nentry = \"index.js\"\n";
    let src = write_plugin(&t.scratch("acme-tools"), manifest, "index.js", "");
    t.host.install(&src, &InstallOptions::default()).await.unwrap();

    assert!(t.root().join("@acme/tools/plugin.toml").is_file());
    let got = t.host.get("@acme/tools").await.unwrap();
    assert_eq!(got.id.scope(), Some("acme"));

    t.host.remove("@acme/tools").await.unwrap();
    assert!(!t.root().join("@acme").exists());
}
