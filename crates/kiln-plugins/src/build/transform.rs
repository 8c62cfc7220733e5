//! OXC-based TypeScript stripping and export flattening.
//!
//! 1. Parse with OXC (TS or JS by file extension)
//! 2. Collect runtime imports, which only a bundle can satisfy
//! 3. Strip types with `oxc_transformer`
//! 4. Generate JS and a source map with `oxc_codegen`
//! 5. Rewrite top-level ESM exports into `globalThis` assignments so the
//!    artifact runs as a plain script and handlers are reachable by name.
//!    The rewrite never adds or removes lines before the trailing
//!    assignments, so the map's line numbers stay valid.

use std::path::Path;

use oxc::ast::ast::{Program, Statement};
use oxc::codegen::{Codegen, CodegenOptions};
use oxc::parser::Parser;
use oxc::semantic::SemanticBuilder;
use oxc::span::SourceType;
use oxc::transformer::{TransformOptions, Transformer};

use crate::error::{PluginError, PluginResult};

/// Output of [`transform`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transformed {
    /// Script-ready JavaScript.
    pub code: String,
    /// Module specifiers of non-type imports and re-exports.
    pub imports: Vec<String>,
    /// Source map (JSON) from `code` back to the input file.
    pub source_map: Option<String>,
}

/// Transform `source` (the contents of `file`) into a script.
///
/// # Errors
///
/// Returns [`PluginError::TransformFailed`] with the parser or transformer
/// diagnostics.
pub fn transform(source: &str, file: &Path) -> PluginResult<Transformed> {
    let failed = |stage: &str, errors: Vec<String>| PluginError::TransformFailed {
        file: file.to_path_buf(),
        diagnostics: format!("{stage} errors:\n{}", errors.join("\n")),
    };

    let allocator = oxc_allocator::Allocator::default();
    let source_type = SourceType::from_path(file).unwrap_or_else(|_| SourceType::mjs());

    let parsed = Parser::new(&allocator, source, source_type).parse();
    if parsed.panicked || !parsed.errors.is_empty() {
        return Err(failed(
            "parse",
            parsed.errors.iter().map(ToString::to_string).collect(),
        ));
    }
    let mut program = parsed.program;

    let imports = runtime_imports(&program);

    let scoping = SemanticBuilder::new()
        .with_excess_capacity(2.0)
        .build(&program)
        .semantic
        .into_scoping();

    let options = TransformOptions::default();
    let transformed =
        Transformer::new(&allocator, file, &options).build_with_scoping(scoping, &mut program);
    if !transformed.errors.is_empty() {
        return Err(failed(
            "transform",
            transformed.errors.iter().map(ToString::to_string).collect(),
        ));
    }

    let generated = Codegen::new()
        .with_options(CodegenOptions {
            source_map_path: Some(file.to_path_buf()),
            ..CodegenOptions::default()
        })
        .build(&program);
    Ok(Transformed {
        code: expose_exports(&generated.code),
        imports,
        source_map: generated.map.map(|map| map.to_json_string()),
    })
}

fn runtime_imports(program: &Program<'_>) -> Vec<String> {
    let mut found = Vec::new();
    for stmt in &program.body {
        match stmt {
            Statement::ImportDeclaration(decl) if !decl.import_kind.is_type() => {
                found.push(decl.source.value.to_string());
            },
            Statement::ExportAllDeclaration(decl) if !decl.export_kind.is_type() => {
                found.push(decl.source.value.to_string());
            },
            Statement::ExportNamedDeclaration(decl) if !decl.export_kind.is_type() => {
                if let Some(source) = &decl.source {
                    found.push(source.value.to_string());
                }
            },
            _ => {},
        }
    }
    found
}

/// Turn top-level `export` forms into declarations plus trailing
/// `globalThis.<name> = <name>;` lines. Works on codegen output, which
/// puts each top-level export on its own line.
pub(crate) fn expose_exports(js: &str) -> String {
    let mut lines = Vec::new();
    let mut exposed: Vec<String> = Vec::new();

    for line in js.lines() {
        // Only top-level statements: codegen indents nested code.
        if line.starts_with(char::is_whitespace) {
            lines.push(line.to_string());
            continue;
        }

        if let Some(rest) = line.strip_prefix("export default ") {
            lines.push(format!("globalThis.__kiln_default = {rest}"));
            continue;
        }

        if let Some((keyword, rest)) = [
            "async function ",
            "function ",
            "class ",
            "const ",
            "let ",
            "var ",
        ]
        .iter()
        .find_map(|kw| {
            line.strip_prefix("export ")
                .and_then(|l| l.strip_prefix(kw))
                .map(|rest| (*kw, rest))
        }) {
            let name_end = rest
                .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '$'))
                .unwrap_or(rest.len());
            let name = &rest[..name_end];
            lines.push(format!("{keyword}{rest}"));
            if !name.is_empty() {
                exposed.push(format!("globalThis.{name} = {name};"));
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("export {") {
            if let Some(end) = rest.find('}') {
                for spec in rest[..end].split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    match spec.split_once(" as ") {
                        Some((local, exported)) => exposed.push(format!(
                            "globalThis.{} = {};",
                            exported.trim(),
                            local.trim()
                        )),
                        None => exposed.push(format!("globalThis.{spec} = {spec};")),
                    }
                }
            }
            lines.push(String::new());
            continue;
        }

        lines.push(line.to_string());
    }

    if !exposed.is_empty() {
        lines.push(String::new());
        lines.extend(exposed);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_types() {
        let src = "function greet(name: string): string { return `Hello, ${name}!`; }\n\
                   interface Args { name: string }\n\
                   function __tool_hello(args: Args) { return greet(args.name); }\n";
        let out = transform(src, Path::new("index.ts")).unwrap();
        assert!(!out.code.contains(": string"));
        assert!(!out.code.contains("interface"));
        assert!(out.code.contains("function __tool_hello(args)"));
        assert!(out.imports.is_empty());
    }

    #[test]
    fn exports_become_globals() {
        let src = "export function __tool_a(x: number) { return x; }\n\
                   export const __skill_b = (q: any) => 'ok';\n\
                   const c = 1;\nexport { c as renamed };\n";
        let out = transform(src, Path::new("index.ts")).unwrap();
        assert!(!out.code.contains("export "));
        assert!(out.code.contains("globalThis.__tool_a = __tool_a;"));
        assert!(out.code.contains("globalThis.__skill_b = __skill_b;"));
        assert!(out.code.contains("globalThis.renamed = c;"));
    }

    #[test]
    fn type_imports_are_not_runtime_imports() {
        let src = "import type { Foo } from './types';\nimport { bar } from 'lodash';\n\
                   export * from './more';\nconst x: Foo = bar();\n";
        let out = transform(src, Path::new("index.ts")).unwrap();
        assert_eq!(out.imports, vec!["lodash".to_string(), "./more".to_string()]);
    }

    #[test]
    fn syntax_error_reports_diagnostics() {
        let err = transform("function (:", Path::new("index.ts")).unwrap_err();
        match err {
            PluginError::TransformFailed { diagnostics, file } => {
                assert!(diagnostics.starts_with("parse errors:"));
                assert_eq!(file, Path::new("index.ts"));
            },
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn deterministic() {
        let src = "export const f = (a: number): number => a * 2;\n";
        let a = transform(src, Path::new("x.ts")).unwrap();
        let b = transform(src, Path::new("x.ts")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn source_map_points_back_to_typescript_lines() {
        let src = "type Id = string;\n\
                   export { check };\n\
                   function check(id: Id): void {\n\
                   \x20   throw new Error(`bad ${id}`);\n\
                   }\n";
        let out = transform(src, Path::new("index.ts")).unwrap();
        let map = oxc_sourcemap::SourceMap::from_json_string(out.source_map.as_deref().unwrap())
            .unwrap();
        let table = map.generate_lookup_table();

        let throw_line = out.code.lines().position(|l| l.contains("throw")).unwrap();
        let col = out.code.lines().nth(throw_line).unwrap().find("throw").unwrap();
        let token = map
            .lookup_token(&table, u32::try_from(throw_line).unwrap(), u32::try_from(col).unwrap())
            .unwrap();
        assert_eq!(token.get_src_line(), 3);
    }

    #[test]
    fn export_lists_keep_line_numbers() {
        let out = expose_exports("const a = 1;\nexport { a };\nfoo();\n");
        assert_eq!(out.lines().nth(2), Some("foo();"));
        assert!(out.contains("globalThis.a = a;"));
    }

    #[test]
    fn nested_exports_are_left_alone() {
        let js = "export function a() {\n\tconst export_x = 1;\n}\n";
        let out = expose_exports(js);
        assert!(out.starts_with("function a() {"));
        assert!(out.contains("\tconst export_x = 1;"));
    }
}
