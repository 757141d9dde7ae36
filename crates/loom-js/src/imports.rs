//! Import Scanner
//!
//! Lists the specifiers a module requests through `import` and
//! `export ... from` declarations, so the host can start loading them
//! before the engine links the module. Also locates `import(...)` calls,
//! which the realm reroutes to its own loader.

use swc_common::{BytePos, FileName, SourceMap, sync::Lrc};
use swc_ecma_ast::{CallExpr, Callee, ModuleDecl, ModuleItem, Program};
use swc_ecma_parser::{Parser, StringInput, Syntax, lexer::Lexer};
use swc_ecma_visit::{Visit, VisitWith};

const IMPORT_KEYWORD: &str = "import";

/// Scanner failure. The engine's own parser reports syntax errors to script.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Failed to scan imports of {url}: {message}")]
pub struct ScanError {
    pub url: String,
    pub message: String,
}

/// Imports found in a module source
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleScan {
    /// Statically requested specifiers, in declaration order, without duplicates
    pub requested: Vec<String>,
    /// Byte offsets of the `import` keyword of every `import(...)` call
    pub dynamic_imports: Vec<usize>,
}

/// Specifiers requested by `source`, in declaration order, without duplicates
pub fn requested_modules(url: &str, source: &str) -> Result<Vec<String>, ScanError> {
    scan_module(url, source).map(|scan| scan.requested)
}

/// Scan a module source for static and dynamic imports
pub fn scan_module(url: &str, source: &str) -> Result<ModuleScan, ScanError> {
    let (program, start) = parse(url, source, true)?;

    let mut requested: Vec<String> = Vec::new();
    if let Program::Module(module) = &program {
        for item in &module.body {
            let ModuleItem::ModuleDecl(decl) = item else {
                continue;
            };
            let specifier = match decl {
                ModuleDecl::Import(import) => import.src.value.to_string_lossy().into_owned(),
                ModuleDecl::ExportAll(all) => all.src.value.to_string_lossy().into_owned(),
                ModuleDecl::ExportNamed(named) => match &named.src {
                    Some(src) => src.value.to_string_lossy().into_owned(),
                    None => continue,
                },
                _ => continue,
            };
            if !requested.contains(&specifier) {
                requested.push(specifier);
            }
        }
    }

    Ok(ModuleScan {
        requested,
        dynamic_imports: dynamic_imports(&program, source, start),
    })
}

/// Byte offsets of the `import(...)` calls in a classic script
pub fn scan_script(url: &str, source: &str) -> Result<Vec<usize>, ScanError> {
    let (program, start) = parse(url, source, false)?;
    Ok(dynamic_imports(&program, source, start))
}

/// Replace the `import` keyword at each of `offsets` with `callee`
pub fn rewrite_dynamic_imports(source: &str, offsets: &[usize], callee: &str) -> String {
    let mut rewritten = String::with_capacity(source.len() + offsets.len() * callee.len());
    let mut copied = 0;
    for &offset in offsets {
        if offset < copied || !is_import_call(source, offset) {
            continue;
        }
        rewritten.push_str(&source[copied..offset]);
        rewritten.push_str(callee);
        copied = offset + IMPORT_KEYWORD.len();
    }
    rewritten.push_str(&source[copied..]);
    rewritten
}

fn parse(url: &str, source: &str, module: bool) -> Result<(Program, BytePos), ScanError> {
    let cm: Lrc<SourceMap> = Default::default();
    let fm = cm.new_source_file(FileName::Custom(url.to_string()).into(), source.to_string());
    let lexer = Lexer::new(
        Syntax::Es(Default::default()),
        Default::default(),
        StringInput::from(&*fm),
        None,
    );

    let mut parser = Parser::new_from(lexer);
    let program = if module {
        parser.parse_module().map(Program::Module)
    } else {
        parser.parse_script().map(Program::Script)
    };
    let program = program.map_err(|e| ScanError {
        url: url.to_string(),
        message: e.kind().msg().to_string(),
    })?;
    Ok((program, fm.start_pos))
}

fn dynamic_imports(program: &Program, source: &str, start: BytePos) -> Vec<usize> {
    let mut finder = DynamicImports {
        source,
        start,
        offsets: Vec::new(),
    };
    program.visit_with(&mut finder);
    finder.offsets.sort_unstable();
    finder.offsets.dedup();
    finder.offsets
}

/// `import` keyword at `offset`, followed by an argument list
fn is_import_call(source: &str, offset: usize) -> bool {
    source
        .get(offset..)
        .and_then(|rest| rest.strip_prefix(IMPORT_KEYWORD))
        .is_some_and(|rest| rest.trim_start().starts_with('('))
}

struct DynamicImports<'s> {
    source: &'s str,
    start: BytePos,
    offsets: Vec<usize>,
}

impl Visit for DynamicImports<'_> {
    fn visit_call_expr(&mut self, call: &CallExpr) {
        if let Callee::Import(import) = &call.callee {
            // `import.source(...)` and friends share the callee but are left alone
            let offset = import.span.lo.0.checked_sub(self.start.0).map(|offset| offset as usize);
            if let Some(offset) = offset.filter(|&offset| is_import_call(self.source, offset)) {
                self.offsets.push(offset);
            }
        }
        call.visit_children_with(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_forms() {
        let source = r#"
            import a from "./a.js";
            import { b } from './b.js';
            import * as c from "./c.js";
            import "./side-effect.js";
            export { d } from "./d.js";
            export * from "./e.js";
            export const local = 1;
        "#;
        let found = requested_modules("file:///main.js", source).unwrap();
        assert_eq!(
            found,
            vec!["./a.js", "./b.js", "./c.js", "./side-effect.js", "./d.js", "./e.js"]
        );
    }

    #[test]
    fn test_duplicates_collapse() {
        let source = "import { a } from './a.js';\nimport { b } from './a.js';";
        let found = requested_modules("file:///main.js", source).unwrap();
        assert_eq!(found, vec!["./a.js"]);
    }

    #[test]
    fn test_dynamic_import_is_not_a_static_request() {
        let source = "export async function load() { return import('./lazy.js'); }";
        let scan = scan_module("file:///main.js", source).unwrap();
        assert!(scan.requested.is_empty());
        assert_eq!(scan.dynamic_imports, vec![source.find("import(").unwrap()]);
    }

    #[test]
    fn test_dynamic_imports_in_nested_code() {
        let source = "import './a.js';\n\
                      const lazy = { get: () => import(\n'./b.js') };\n\
                      async function f() { await import ('./c.js'); }\n\
                      const url = import.meta.url;\n\
                      const text = 'import(\"./not-code.js\")';";
        let scan = scan_module("file:///main.js", source).unwrap();
        assert_eq!(scan.requested, vec!["./a.js"]);
        assert_eq!(scan.dynamic_imports.len(), 2);
        for offset in &scan.dynamic_imports {
            assert!(source[*offset..].starts_with("import"));
        }
    }

    #[test]
    fn test_script_dynamic_imports() {
        let source = "globalThis.ready = import('./a.js').then((ns) => ns.value);";
        let offsets = scan_script("file:///main.js", source).unwrap();
        assert_eq!(offsets, vec![source.find("import").unwrap()]);
    }

    #[test]
    fn test_rewrite_replaces_keyword_only() {
        let source = "const a = import('./a.js'); const b = import ( './b.js' );";
        let offsets = scan_script("file:///main.js", source).unwrap();
        let rewritten = rewrite_dynamic_imports(source, &offsets, "load");
        assert_eq!(rewritten, "const a = load('./a.js'); const b = load ( './b.js' );");
    }

    #[test]
    fn test_rewrite_skips_offsets_that_are_not_calls() {
        let source = "const url = import.meta.url;";
        assert_eq!(rewrite_dynamic_imports(source, &[12], "load"), source);
    }

    #[test]
    fn test_no_imports() {
        assert!(requested_modules("file:///empty.js", "").unwrap().is_empty());
    }

    #[test]
    fn test_syntax_error() {
        let error = requested_modules("file:///bad.js", "import {").unwrap_err();
        assert_eq!(error.url, "file:///bad.js");
        assert!(!error.message.is_empty());
    }
}
