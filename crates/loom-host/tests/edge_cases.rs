//! Edge case tests for loom-host
//!
//! Whole programs run from temporary directories with captured output.

use std::path::{Path, PathBuf};

use loom_host::{CapturedOutput, HostConfig, Output, RunReport};

struct Program {
    dir: PathBuf,
}

impl Program {
    fn new(name: &str, files: &[(&str, &str)]) -> Self {
        let dir = std::env::temp_dir().join(format!("loom-host-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_dir_all(&dir);
        for (path, source) in files {
            let path = dir.join(path);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, source).unwrap();
        }
        Self { dir }
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    fn run(&self, config: HostConfig) -> (RunReport, CapturedOutput) {
        let (output, captured) = Output::capture();
        let report = loom_host::run_with_output(&config, output).unwrap();
        (report, captured)
    }

    fn run_main(&self) -> (RunReport, CapturedOutput) {
        self.run(HostConfig::new(self.path("main.js")))
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn file_url(path: &Path) -> String {
    loom_js::Url::from_file_path(path).unwrap().to_string()
}

// ============================================================================
// Program lifecycle
// ============================================================================

#[test]
fn test_hello_world() {
    let program = Program::new("hello", &[("main.js", "export function main(sys) { print('hello', 1 + 1); }")]);
    let (report, output) = program.run_main();
    assert_eq!(output.stdout(), "hello 2\n");
    assert_eq!(output.stderr(), "");
    assert_eq!(report.exit_code(), 0);
}

#[test]
fn test_entry_without_main_export() {
    let program = Program::new("no-main", &[("main.js", "print('top level');")]);
    let (report, output) = program.run_main();
    assert_eq!(output.stdout(), "top level\n");
    assert!(report.is_success());
}

#[test]
fn test_async_main_is_awaited() {
    let program = Program::new(
        "async-main",
        &[(
            "main.js",
            "export async function main() { await null; print('after await'); throw new Error('late failure'); }",
        )],
    );
    let (report, output) = program.run_main();
    assert_eq!(output.stdout(), "after await\n");
    assert!(output.stderr().contains("Uncaught (in promise) Error: late failure"));
    assert_eq!(report.exit_code(), 1);
}

#[test]
fn test_script_args() {
    let program = Program::new("args", &[("main.js", "export function main(sys) { print(sys.args.slice(1).join(',')); }")]);
    let config = HostConfig::new(program.path("main.js")).with_args(vec!["a".to_string(), "b c".to_string()]);
    let (_, output) = program.run(config);
    assert_eq!(output.stdout(), "a,b c\n");
}

// ============================================================================
// Modules
// ============================================================================

#[test]
fn test_static_imports_resolve_relative_to_importer() {
    let program = Program::new(
        "static-imports",
        &[
            ("main.js", "import { greet } from './lib/greet.js';\nexport function main() { print(greet('loom')); }"),
            ("lib/greet.js", "import { suffix } from '../util.js';\nexport const greet = (name) => 'hi ' + name + suffix;"),
            ("util.js", "export const suffix = '!';"),
        ],
    );
    let (report, output) = program.run_main();
    assert_eq!(output.stdout(), "hi loom!\n");
    assert!(report.is_success());
}

#[test]
fn test_import_meta_url() {
    let program = Program::new("meta-url", &[("main.js", "print(import.meta.url);")]);
    let (_, output) = program.run_main();
    assert_eq!(output.stdout().trim_end(), file_url(&program.path("main.js")));
}

#[test]
fn test_dynamic_import_from_module() {
    let program = Program::new(
        "dynamic-import",
        &[
            (
                "main.js",
                "import './shared.js';\n\
                 export async function main(sys) {\n\
                   const again = await import('./shared.js');\n\
                   const later = await sys.importModule('./later.js', import.meta.url);\n\
                   const lazy = await import('./lib/' + 'lazy.js');\n\
                   print(again.name, later.value, lazy.value);\n\
                   try { await import('./missing.js'); } catch (e) { print(e.code); }\n\
                 }",
            ),
            ("shared.js", "export const name = 'shared';"),
            ("later.js", "export const value = 'loaded later';"),
            ("lib/lazy.js", "import { name } from '../shared.js';\nexport const value = 'lazy ' + name;"),
        ],
    );
    let (report, output) = program.run_main();
    assert_eq!(output.stdout(), "shared loaded later lazy shared\nENOENT\n");
    assert!(report.is_success());
}

#[test]
fn test_missing_entry_reports_enoent() {
    let program = Program::new("missing-entry", &[]);
    let (report, output) = program.run_main();
    assert_eq!(report.exit_code(), 1);
    assert!(output.stderr().contains("ENOENT"));
    assert_eq!(report.unhandled_rejections.len() + report.errors.len(), 1);
}

#[test]
fn test_syntax_error_in_dependency() {
    let program = Program::new(
        "syntax-error",
        &[("main.js", "import './broken.js';\nprint('unreachable');"), ("broken.js", "export const = ;")],
    );
    let (report, output) = program.run_main();
    assert_eq!(output.stdout(), "");
    assert!(output.stderr().contains("SyntaxError"));
    assert_eq!(report.exit_code(), 1);
}

#[test]
fn test_uncaught_error_shows_source_excerpt() {
    let program = Program::new(
        "excerpt",
        &[("main.js", "export function main() {\n  null.boom();\n}\n")],
    );
    let (report, output) = program.run_main();
    let stderr = output.stderr();
    assert!(stderr.contains("TypeError"), "{stderr}");
    assert!(stderr.contains("2 |   null.boom();"), "{stderr}");
    assert_eq!(report.exit_code(), 1);
}

// ============================================================================
// Files and directories
// ============================================================================

#[test]
fn test_read_text_file_callback() {
    let program = Program::new(
        "read-file",
        &[
            (
                "main.js",
                "export function main(sys) {\n\
                 const url = sys.resolveURL('./data.txt', import.meta.url);\n\
                 sys.readTextFile(url, (err, text) => {\n\
                   print(err, text);\n\
                   sys.readTextFile(url + '.missing', (err) => print(err.code));\n\
                 });\n\
                 print(sys.readTextFileSync(url));\n\
                 }",
            ),
            ("data.txt", "payload"),
        ],
    );
    let (report, output) = program.run_main();
    assert_eq!(output.stdout(), "payload\nnull payload\nENOENT\n");
    assert!(report.is_success());
}

#[test]
fn test_read_text_file_sync_throws_coded_error() {
    let program = Program::new(
        "read-sync-error",
        &[(
            "main.js",
            "export function main(sys) {\n\
             try { sys.readTextFileSync(sys.resolveURL('./nope.txt', import.meta.url)); }\n\
             catch (e) { print(e instanceof Error, e.code); }\n\
             }",
        )],
    );
    let (_, output) = program.run_main();
    assert_eq!(output.stdout(), "true ENOENT\n");
}

#[test]
fn test_directory_listing() {
    let program = Program::new(
        "directory",
        &[
            (
                "main.js",
                "const call = (fn, ...args) => new Promise((resolve, reject) =>\n\
                   fn(...args, (err, result) => err ? reject(err) : resolve(result)));\n\
                 export async function main(sys) {\n\
                   const dir = await call(sys.openDirectory, sys.resolveURL('./files/', import.meta.url));\n\
                   const names = await call(sys.readDirectory, dir, 100);\n\
                   await call(sys.closeDirectory, dir);\n\
                   print(names.sort().join(','));\n\
                   try { sys.readDirectory(dir, 1, () => {}); } catch (e) { print(e.code); }\n\
                 }",
            ),
            ("files/a.txt", "a"),
            ("files/b.txt", "b"),
        ],
    );
    let (report, output) = program.run_main();
    assert_eq!(output.stdout(), "a.txt,b.txt\nERR_INVALID_HANDLE\n");
    assert!(report.is_success());
}

#[test]
fn test_path_helpers() {
    let program = Program::new(
        "paths",
        &[(
            "main.js",
            "export function main(sys) {\n\
             print(sys.cwd().endsWith('/'));\n\
             print(sys.resolveFilePath('sub/x.js', 'file:///base/'));\n\
             print(sys.resolveURL('../y.js', 'file:///base/dir/z.js'));\n\
             try { sys.resolveURL('relative.js'); } catch (e) { print(e.name, e.code); }\n\
             }",
        )],
    );
    let (_, output) = program.run_main();
    assert_eq!(
        output.stdout(),
        "true\nfile:///base/sub/x.js\nfile:///base/y.js\nTypeError ERR_INVALID_URL\n"
    );
}

// ============================================================================
// Timers
// ============================================================================

#[test]
fn test_timers_order_by_deadline() {
    let program = Program::new(
        "timers",
        &[(
            "main.js",
            "export function main(sys) {\n\
             sys.startTimer(30, 0, () => print('late'));\n\
             sys.startTimer(1, 0, () => print('early'));\n\
             Promise.resolve().then(() => print('microtask'));\n\
             }",
        )],
    );
    let (_, output) = program.run_main();
    assert_eq!(output.stdout(), "microtask\nearly\nlate\n");
}

#[test]
fn test_stop_timer() {
    let program = Program::new(
        "stop-timer",
        &[(
            "main.js",
            "export function main(sys) {\n\
             const id = sys.startTimer(1, 0, () => print('never'));\n\
             sys.stopTimer(id);\n\
             let ticks = 0;\n\
             const repeating = sys.startTimer(0, 1, () => {\n\
               ticks += 1;\n\
               if (ticks === 3) { sys.stopTimer(repeating); print('ticks', ticks); }\n\
             });\n\
             }",
        )],
    );
    let (report, output) = program.run_main();
    assert_eq!(output.stdout(), "ticks 3\n");
    assert!(report.is_success());
}

#[test]
fn test_error_in_timer_stops_loop() {
    let program = Program::new(
        "timer-error",
        &[(
            "main.js",
            "export function main(sys) {\n\
             sys.startTimer(1, 0, () => { throw new Error('timer failed'); });\n\
             sys.startTimer(200, 0, () => print('still running'));\n\
             }",
        )],
    );
    let (report, output) = program.run_main();
    assert_eq!(output.stdout(), "");
    assert!(output.stderr().contains("Uncaught Error: timer failed"));
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.exit_code(), 1);
}

#[test]
fn test_keep_alive_on_error() {
    let program = Program::new(
        "keep-alive",
        &[(
            "main.js",
            "export function main(sys) {\n\
             sys.startTimer(1, 0, () => { throw new Error('timer failed'); });\n\
             sys.startTimer(20, 0, () => print('still running'));\n\
             }",
        )],
    );
    let config = HostConfig::new(program.path("main.js")).with_keep_alive_on_error(true);
    let (report, output) = program.run(config);
    assert_eq!(output.stdout(), "still running\n");
    assert_eq!(report.exit_code(), 1);
}

// ============================================================================
// Rejections and processes
// ============================================================================

#[test]
fn test_rejection_handled_later_in_same_turn_is_silent() {
    let program = Program::new(
        "handled-rejection",
        &[(
            "main.js",
            "export function main() {\n\
             const p = Promise.reject(new Error('handled'));\n\
             Promise.resolve().then(() => p.catch(() => print('caught')));\n\
             }",
        )],
    );
    let (report, output) = program.run_main();
    assert_eq!(output.stdout(), "caught\n");
    assert_eq!(output.stderr(), "");
    assert!(report.is_success());
}

#[test]
fn test_unhandled_rejection_reported_once() {
    let program = Program::new(
        "unhandled-rejection",
        &[("main.js", "export function main() { Promise.reject(new RangeError('nobody listens')); }")],
    );
    let (report, output) = program.run_main();
    let stderr = output.stderr();
    let headings: Vec<&str> = stderr.lines().filter(|line| line.starts_with("Uncaught")).collect();
    assert_eq!(headings, vec!["Uncaught (in promise) RangeError: nobody listens"]);
    assert_eq!(report.unhandled_rejections.len(), 1);
    assert_eq!(report.exit_code(), 1);
}

#[cfg(unix)]
#[test]
fn test_spawn_process_reports_exit_code() {
    let program = Program::new(
        "spawn",
        &[(
            "main.js",
            "export function main(sys) {\n\
             const pid = sys.spawnProcess('sh', ['-c', 'exit 3'], (err, code) => print(err, code));\n\
             print(typeof pid === 'number' && pid > 0);\n\
             sys.spawnProcess('/definitely/not/here', [], (err) => print(err.code));\n\
             }",
        )],
    );
    let (_, output) = program.run_main();
    let stdout = output.stdout();
    assert!(stdout.starts_with("true\n"), "{stdout}");
    assert!(stdout.contains("null 3\n"), "{stdout}");
    assert!(stdout.contains("ENOENT\n"), "{stdout}");
}
