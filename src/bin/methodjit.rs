//! Method JIT command line driver
//!
//! Loads a JSON method bundle and compiles every method in it, either into
//! executable memory or into an object file, reporting which methods were
//! compiled and which fell back.

use methodjit::codegen::runtime::RuntimeHooks;
use methodjit::{AotBackend, JitBackend, LoweringConfig, MethodBundle, MethodOutcome};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

/// Command line arguments
#[derive(Debug)]
struct Args {
    /// Input method bundle (JSON)
    input_file: PathBuf,
    /// Lowering configuration (JSON)
    config_file: Option<PathBuf>,
    /// Emit an object file instead of compiling in memory
    aot_output: Option<PathBuf>,
    /// Print generated Cranelift IR
    dump: bool,
    verbose: bool,
}

impl Args {
    fn parse() -> Result<Self, String> {
        let args: Vec<String> = env::args().collect();

        if args.len() < 2 {
            return Err("Input bundle required".to_string());
        }

        let input_file = PathBuf::from(&args[1]);
        if !input_file.exists() {
            return Err(format!("Input file does not exist: {}", input_file.display()));
        }

        let mut config_file = None;
        let mut aot_output = None;
        let mut dump = false;
        let mut verbose = false;

        let mut rest = args.iter().skip(2);
        while let Some(arg) = rest.next() {
            match arg.as_str() {
                "-v" | "--verbose" => verbose = true,
                "-d" | "--dump" => dump = true,
                "-c" | "--config" => {
                    let path = rest.next().ok_or("--config needs a path")?;
                    config_file = Some(PathBuf::from(path));
                }
                "--aot" => {
                    let path = rest.next().ok_or("--aot needs an output path")?;
                    aot_output = Some(PathBuf::from(path));
                }
                other => return Err(format!("Unknown argument: {}", other)),
            }
        }

        Ok(Args {
            input_file,
            config_file,
            aot_output,
            dump,
            verbose,
        })
    }
}

fn main() {
    env_logger::init();

    let args = match Args::parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_usage();
            process::exit(1);
        }
    };

    let start_time = Instant::now();
    match run(&args) {
        Ok((compiled, fallbacks)) => {
            println!(
                "{} compiled, {} fell back in {:?}",
                compiled,
                fallbacks,
                start_time.elapsed()
            );
        }
        Err(e) => {
            eprintln!("Compilation failed: {}", e);
            process::exit(1);
        }
    }
}

fn load_config(args: &Args) -> Result<LoweringConfig, String> {
    let config = match &args.config_file {
        Some(path) => LoweringConfig::from_file(path).map_err(|e| e.to_string())?,
        None => LoweringConfig::default(),
    };
    let mut config = config.with_env_overrides().map_err(|e| e.to_string())?;
    if args.dump {
        config.dump_ir = true;
    }
    Ok(config)
}

fn report<T>(outcome: &MethodOutcome<T>, name: &str, detail: impl FnOnce(&T) -> String) -> bool {
    match outcome {
        MethodOutcome::Compiled(value) => {
            println!("  ok    {} {}", name, detail(value));
            true
        }
        MethodOutcome::NotLowerable(fallback) => {
            println!("  skip  {} ({})", name, fallback.reason);
            false
        }
    }
}

fn run(args: &Args) -> Result<(usize, usize), String> {
    let source = fs::read_to_string(&args.input_file)
        .map_err(|e| format!("Failed to read input file: {}", e))?;
    let bundle: MethodBundle =
        serde_json::from_str(&source).map_err(|e| format!("Invalid method bundle: {}", e))?;
    let config = load_config(args)?;

    if args.verbose {
        println!("Method JIT");
        println!("   Input: {}", args.input_file.display());
        println!("   Methods: {}", bundle.methods.len());
        println!("   Mode: {}", if args.aot_output.is_some() { "AOT" } else { "JIT" });
        println!("   Optimization: {}", config.opt_level.as_setting());
    }

    let mut compiled = 0;
    let mut fallbacks = 0;
    match &args.aot_output {
        Some(output) => {
            let backend = AotBackend::new(config, "methodjit_bundle").map_err(|e| e.to_string())?;
            for method in &bundle.methods {
                let outcome = backend.compile(method, &bundle.types).map_err(|e| e.to_string())?;
                if report(&outcome, &method.name, |m| format!("{} bytes", m.size)) {
                    compiled += 1;
                } else {
                    fallbacks += 1;
                }
            }
            let artifact = backend.finish().map_err(|e| e.to_string())?;
            artifact.write_to(output).map_err(|e| e.to_string())?;
            if args.verbose {
                println!("   Object file: {} ({} bytes)", output.display(), artifact.object.len());
                for stub in &artifact.stubs {
                    println!("   stub {} -> {}", stub.stub, stub.target);
                }
            }
        }
        None => {
            let backend = JitBackend::new(config, &RuntimeHooks::default()).map_err(|e| e.to_string())?;
            for method in &bundle.methods {
                let outcome = backend.compile(method, &bundle.types).map_err(|e| e.to_string())?;
                let shown = report(&outcome, &method.name, |m| {
                    format!("{} bytes at {:p}, {} regions", m.size, m.code, m.unwind.regions.len())
                });
                if shown {
                    compiled += 1;
                } else {
                    fallbacks += 1;
                }
            }
        }
    }
    Ok((compiled, fallbacks))
}

fn print_usage() {
    eprintln!("Usage: methodjit <bundle.json> [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --config <file>   Lowering configuration (JSON)");
    eprintln!("      --aot <file.o>    Emit an object file instead of compiling in memory");
    eprintln!("  -d, --dump            Log generated Cranelift IR (with RUST_LOG=debug)");
    eprintln!("  -v, --verbose         Verbose output");
}
