//! Shared fixtures for the plugin host integration tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kiln_plugins::{
    BuildOptions, Fetcher, PluginHost, PluginStore, RegistryClient, SandboxEngine, SandboxLimits,
};
use kiln_storage::{KvStore, MemoryKvStore};
use tempfile::TempDir;

/// A host over a throwaway plugin root.
#[allow(dead_code)]
pub struct TestHost {
    /// The host under test.
    pub host: PluginHost,
    /// The shared memory store, for asserting on plugin writes.
    pub memory: Arc<dyn KvStore>,
    dir: TempDir,
}

#[allow(dead_code)]
impl TestHost {
    /// Host with default limits and an unreachable registry.
    pub fn new() -> Self {
        Self::with(SandboxLimits::default(), "https://registry.invalid")
    }

    /// Host with custom limits talking to `registry_url`.
    pub fn with(limits: SandboxLimits, registry_url: &str) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let memory: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let engine = SandboxEngine::new(limits, Arc::clone(&memory)).expect("engine");
        let registry = RegistryClient::new(registry_url, Duration::from_secs(5), 1024 * 1024)
            .expect("registry client");
        let host = PluginHost::new(
            PluginStore::new(dir.path().join("plugins")),
            Fetcher::new(registry),
            BuildOptions::default(),
            engine,
            Arc::clone(&memory),
        );
        Self { host, memory, dir }
    }

    /// Scratch directory outside the plugin root.
    pub fn scratch(&self, name: &str) -> PathBuf {
        self.dir.path().join("scratch").join(name)
    }

    /// The writable plugin root.
    pub fn root(&self) -> &Path {
        self.host.store().root()
    }
}

/// Write a plugin source directory and return it as an install source string.
pub fn write_plugin(dir: &Path, manifest: &str, entry_name: &str, code: &str) -> String {
    std::fs::create_dir_all(dir).expect("create plugin dir");
    std::fs::write(dir.join("plugin.toml"), manifest).expect("write manifest");
    std::fs::write(dir.join(entry_name), code).expect("write entry");
    dir.to_str().expect("utf-8 path").to_string()
}

/// `hello` with one tool greeting `args.name`.
pub const HELLO_MANIFEST: &str = r#"
[plugin]
name = "hello"
version = "1.0.0"
description = "Greets people"
author = "Kiln Team"

[runtime]
entry = "index.ts"

[[tools.definitions]]
name = "greet"
description = "Say hello"
parameters = { type = "object", properties = { name = { type = "string" } }, required = ["name"] }
"#;

/// TypeScript source for [`HELLO_MANIFEST`].
pub const HELLO_SOURCE: &str = r#"
interface GreetArgs { name: string }

function greet(args: GreetArgs): string {
    return `Hello, ${args.name}!`;
}

(globalThis as any).__tool_greet = greet;
"#;

/// Gzip tarball with every file under a `package/` prefix.
pub fn tarball(files: &[(&str, &str)]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, body) in files {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("package/{name}"), body.as_bytes())
            .expect("append tar entry");
    }
    builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish gzip")
}

/// Zip archive with every file under a `package/` prefix.
#[allow(dead_code)]
pub fn zipball(files: &[(&str, &str)]) -> Vec<u8> {
    use std::io::Write;

    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, body) in files {
        writer
            .start_file(
                format!("package/{name}"),
                zip::write::SimpleFileOptions::default(),
            )
            .expect("start zip entry");
        writer.write_all(body.as_bytes()).expect("write zip entry");
    }
    writer.finish().expect("finish zip").into_inner()
}

/// Lowercase hex SHA-256, as published by the registry.
pub fn sha256(data: &[u8]) -> String {
    kiln_plugins::integrity::sha256_hex(data)
}
