//! Source maps for built artifacts.
//!
//! A transformed plugin ships `index.js.map` next to its artifact. The
//! registry keeps one parsed map per plugin, tagged with the artifact
//! digest it belongs to, and rewrites interpreter stack frames that point
//! into the artifact so they name the plugin's own source file, line and
//! column instead.

use std::sync::LazyLock;

use dashmap::DashMap;
use oxc_sourcemap::SourceMap;
use regex::{Captures, Regex};

use crate::build::ARTIFACT_FILE_NAME;
use crate::error::{PluginError, PluginResult};
use crate::plugin::PluginId;

/// File name the interpreter gives frames of the evaluated artifact.
const ARTIFACT_FRAME_FILE: &str = "eval_script";

static ARTIFACT_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    let file = regex::escape(ARTIFACT_FRAME_FILE);
    Regex::new(&format!(r"{file}:(\d+)(?::(\d+))?")).expect("invalid regex")
});

struct Registered {
    generation: String,
    map: SourceMap,
}

/// Parsed source maps keyed by plugin.
#[derive(Default)]
pub struct SourceMapRegistry {
    maps: DashMap<PluginId, Registered>,
}

impl std::fmt::Debug for SourceMapRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceMapRegistry")
            .field("plugins", &self.maps.len())
            .finish()
    }
}

impl SourceMapRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `json` and make it the map for `id` at artifact `generation`,
    /// replacing any earlier one.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Sandbox`] if `json` is not a valid source map.
    pub fn register(&self, id: &PluginId, generation: &str, json: &str) -> PluginResult<()> {
        let map = SourceMap::from_json_string(json).map_err(|e| PluginError::Sandbox {
            plugin: id.to_string(),
            message: format!("unreadable source map: {e:?}"),
        })?;
        self.maps.insert(
            id.clone(),
            Registered {
                generation: generation.to_string(),
                map,
            },
        );
        Ok(())
    }

    /// Whether the map held for `id` belongs to artifact `generation`.
    #[must_use]
    pub fn is_current(&self, id: &PluginId, generation: &str) -> bool {
        self.maps
            .get(id)
            .is_some_and(|entry| entry.generation == generation)
    }

    /// Whether any map is held for `id`.
    #[must_use]
    pub fn has_map(&self, id: &PluginId) -> bool {
        self.maps.contains_key(id)
    }

    /// Forget the map for `id`.
    pub fn unregister(&self, id: &PluginId) {
        self.maps.remove(id);
    }

    /// Rewrite artifact frames in `stack` through the map for `id`.
    ///
    /// Frames with no mapping, or every frame when no map is held, keep
    /// their generated position under the artifact's file name.
    #[must_use]
    pub fn remap_stack(&self, id: &PluginId, stack: &str) -> String {
        let entry = self.maps.get(id);
        let map = entry.as_ref().map(|entry| &entry.map);
        let table = map.map(SourceMap::generate_lookup_table);

        ARTIFACT_FRAME
            .replace_all(stack, |caps: &Captures<'_>| {
                let line = caps[1].parse::<u32>().unwrap_or(0);
                let col = caps.get(2).and_then(|c| c.as_str().parse::<u32>().ok());
                let original = map.zip(table.as_deref()).and_then(|(map, table)| {
                    original_position(map, table, line, col.unwrap_or(1))
                });
                match (original, col) {
                    (Some((source, line, col)), _) => format!("{source}:{line}:{col}"),
                    (None, Some(col)) => format!("{ARTIFACT_FILE_NAME}:{line}:{col}"),
                    (None, None) => format!("{ARTIFACT_FILE_NAME}:{line}"),
                }
            })
            .into_owned()
    }
}

/// 1-based generated position to a 1-based original one.
fn original_position(
    map: &SourceMap,
    table: &[&[oxc_sourcemap::Token]],
    line: u32,
    col: u32,
) -> Option<(String, u32, u32)> {
    let (line, col) = (line.checked_sub(1)?, col.saturating_sub(1));
    // A column before the first mapped token still belongs to that line.
    let token = map
        .lookup_token(table, line, col)
        .or_else(|| map.lookup_token(table, line, u32::MAX))?;
    let source = map.get_source(token.get_source_id()?)?;
    Some((
        source.to_string(),
        token.get_src_line() + 1,
        token.get_src_col() + 1,
    ))
}
