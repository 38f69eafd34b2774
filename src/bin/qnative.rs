use qnative::logging::{self, debug, error, info};
use qnative::{ClassSummary, Runtime, RuntimeConfig};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug)]
struct Args {
    config: Option<PathBuf>,
    json: bool,
    libraries: Vec<String>,
}

impl Args {
    fn from_env() -> Result<Self, String> {
        let args: Vec<String> = std::env::args().collect();
        let prog = args.first().map(String::as_str).unwrap_or("qnative");

        let mut config = None;
        let mut json = false;
        let mut libraries = Vec::new();

        let mut iter = args.iter().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--help" | "-h" => return Err(Self::usage(prog)),
                "--json" => json = true,
                "--config" => match iter.next() {
                    Some(path) => config = Some(PathBuf::from(path)),
                    None => return Err(format!("--config needs a path\n\n{}", Self::usage(prog))),
                },
                path if !path.starts_with("--") => libraries.push(path.to_string()),
                opt => return Err(format!("Unknown option: {}\n\n{}", opt, Self::usage(prog))),
            }
        }

        Ok(Self {
            config,
            json,
            libraries,
        })
    }

    fn usage(prog: &str) -> String {
        format!(
            "qnative - inspect classes exported by native script libraries\n\n\
            USAGE:\n    {} [OPTIONS] <library-path>...\n\n\
            OPTIONS:\n    \
            -h, --help         Print help information\n    \
            --config <path>    Use this qnative.toml instead of discovering one\n    \
            --json             Print classes as JSON\n\n\
            Without library paths, every library listed in the config is inspected.",
            prog
        )
    }
}

#[derive(Serialize)]
struct LibraryReport {
    path: String,
    state: String,
    classes: Vec<ClassSummary>,
}

fn inspect(runtime: &Arc<Runtime>, path: &str) -> Result<LibraryReport, qnative::ScriptError> {
    let library = runtime.open_library(path)?;
    runtime.init_library(&library)?;

    let classes = runtime
        .class_names(library.id())
        .iter()
        .filter_map(|name| runtime.find_descriptor(library.id(), name))
        .map(|class| class.summary(&**runtime))
        .collect();

    Ok(LibraryReport {
        path: path.to_string(),
        state: format!("{:?}", library.state()),
        classes,
    })
}

fn print_report(report: &LibraryReport) {
    println!("{} ({})", report.path, report.state);
    for class in &report.classes {
        let tool = if class.is_tool { " [tool]" } else { "" };
        println!("  class {} extends {} ({}){}", class.name, class.base, class.base_native_type, tool);
        for method in &class.methods {
            println!("    fn {}({} args)", method.name, method.args.len());
        }
        for property in &class.properties {
            println!("    var {}: {}", property.name, property.ty);
        }
        for signal in &class.signals {
            println!("    signal {}", signal.name);
        }
    }
}

fn main() {
    let args = match Args::from_env() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{}", message);
            std::process::exit(1);
        }
    };

    let config = match &args.config {
        Some(path) => match RuntimeConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        },
        None => RuntimeConfig::discover(),
    };
    logging::init_with_config(config.log_config());
    debug!(?args, "arguments parsed");

    let paths: Vec<String> = if args.libraries.is_empty() {
        config.libraries.iter().map(|lib| lib.path.clone()).collect()
    } else {
        args.libraries.clone()
    };
    if paths.is_empty() {
        eprintln!("No libraries specified\n\n{}", Args::usage("qnative"));
        std::process::exit(1);
    }

    let runtime = Runtime::new(config);
    let mut reports = Vec::new();
    let mut failures = 0;

    for path in &paths {
        info!(path = %path, "inspecting library");
        match inspect(&runtime, path) {
            Ok(report) => reports.push(report),
            Err(e) => {
                error!(path = %path, error = %e, "failed to inspect library");
                eprintln!("Error in {}: {}", path, e);
                failures += 1;
            }
        }
    }

    if args.json {
        match serde_json::to_string_pretty(&reports) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Error: {}", e),
        }
    } else {
        for report in &reports {
            print_report(report);
        }
    }

    if let Err(e) = runtime.finish() {
        error!(error = %e, "runtime shutdown failed");
    }

    if failures > 0 {
        std::process::exit(1);
    }
}
