//! Nelua Compiler CLI
//!
//! The `nelua` command is the entry point for the compiler. Exit codes:
//! 0 on success, 1 on a compilation error, 2 when the external C toolchain
//! fails.

use clap::{Parser, Subcommand};
use nelua::config::{Config, LinkKind, Profile};
use nelua::{analyzer, cgen, lexer, parser, toolchain, Context};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "nelua")]
#[command(version = nelua::VERSION)]
#[command(about = "The Nelua Compiler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a source file to a native binary
    Compile {
        /// Input file to compile
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// C compiler to invoke
        #[arg(long)]
        cc: Option<String>,

        /// Extra flags for the C compiler
        #[arg(long)]
        cflags: Option<String>,

        /// Keep the generated C file at this path
        #[arg(long, value_name = "FILE")]
        cfile: Option<PathBuf>,

        /// Produce a shared library
        #[arg(long)]
        shared: bool,

        /// Produce an object file
        #[arg(long = "static")]
        static_: bool,

        /// Optimized build
        #[arg(long)]
        release: bool,

        /// Most aggressive optimization flags
        #[arg(long)]
        maximum_performance: bool,

        /// Ignore any cached artifact
        #[arg(long)]
        no_cache: bool,

        /// Print toolchain invocations
        #[arg(long)]
        verbose: bool,

        /// Output file
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Tokenize a file and print the tokens
    Tokenize {
        #[arg(value_name = "FILE")]
        input: PathBuf,
    },

    /// Parse a file and print the AST shape
    Parse {
        #[arg(value_name = "FILE")]
        input: PathBuf,
    },

    /// Analyze a file and report diagnostics without emitting C
    Check {
        #[arg(value_name = "FILE")]
        input: PathBuf,
    },

    /// Emit the generated C to stdout
    EmitC {
        #[arg(value_name = "FILE")]
        input: PathBuf,
    },
}

fn read_source(input: &Path) -> miette::Result<String> {
    fs::read_to_string(input)
        .map_err(|e| miette::miette!("failed to read {}: {}", input.display(), e))
}

fn fail_compile(filename: &str, source: &str, errors: &[nelua::CompileError]) -> ! {
    for err in errors {
        eprintln!("{}", err.render(filename, source));
    }
    std::process::exit(1);
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Compile {
            input,
            cc,
            cflags,
            cfile,
            shared,
            static_,
            release,
            maximum_performance,
            no_cache,
            verbose,
            output,
        } => {
            let source = read_source(&input)?;
            let filename = input.display().to_string();

            let profile = if maximum_performance {
                Profile::MaximumPerformance
            } else if release {
                Profile::Release
            } else {
                Profile::Debug
            };
            let link = if shared {
                LinkKind::Shared
            } else if static_ {
                LinkKind::Static
            } else {
                LinkKind::Executable
            };
            let project_root = input
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."))
                .to_path_buf();
            let config = Config::resolve(&project_root, cc, cflags, profile, link, no_cache, verbose);

            let signature = toolchain::compiler_signature(&config.cc);
            let hash = toolchain::cache_hash(&source, &signature, &config.cflags);

            let c_path = cfile.unwrap_or_else(|| {
                let _ = fs::create_dir_all(&config.cache_dir);
                config.cache_dir.join(format!(
                    "{}.c",
                    input.file_stem().unwrap_or_default().to_string_lossy()
                ))
            });
            let out_path = output.unwrap_or_else(|| match link {
                LinkKind::Executable => input.with_extension(""),
                LinkKind::Shared => input.with_extension("so"),
                LinkKind::Static => input.with_extension("o"),
            });

            // reuse the cached artifact when the hash still matches
            if !config.no_cache && out_path.exists() && toolchain::cache_valid(&c_path, &hash) {
                if config.verbose {
                    eprintln!("cache hit, reusing {}", out_path.display());
                }
                return Ok(());
            }

            let c_source = match nelua::compile_unit(&filename, &source, &hash) {
                Ok(c) => c,
                Err(errors) => fail_compile(&filename, &source, &errors),
            };
            fs::write(&c_path, &c_source)
                .map_err(|e| miette::miette!("failed to write {}: {}", c_path.display(), e))?;

            match toolchain::compile(&config, &c_path, &out_path) {
                Ok(artifact) => {
                    if config.verbose {
                        eprintln!(
                            "produced {} (executable: {})",
                            artifact.path.display(),
                            artifact.executable
                        );
                    }
                    Ok(())
                }
                Err(err) => {
                    eprintln!("{}", err);
                    std::process::exit(2);
                }
            }
        }

        Commands::Tokenize { input } => {
            let source = read_source(&input)?;
            let (tokens, errors) = lexer::lex(&source);
            for token in &tokens {
                println!(
                    "{:>4}..{:<4} {:20} {:?}",
                    token.span.start,
                    token.span.end,
                    format!("{:?}", token.kind),
                    token.text(&source)
                );
            }
            if !errors.is_empty() {
                for (err, span) in errors {
                    eprintln!("lex error at {}: {}", span.location(&source), err);
                }
                std::process::exit(1);
            }
            Ok(())
        }

        Commands::Parse { input } => {
            let source = read_source(&input)?;
            let filename = input.display().to_string();
            let mut ctx = Context::new(&filename, source.clone());
            match parser::parse(&mut ctx) {
                Ok(root) => {
                    println!("{}", ctx.ast.canonical(root));
                    Ok(())
                }
                Err(err) => fail_compile(&filename, &source, &[err]),
            }
        }

        Commands::Check { input } => {
            let source = read_source(&input)?;
            let filename = input.display().to_string();
            let mut ctx = Context::new(&filename, source.clone());
            let root = match parser::parse(&mut ctx) {
                Ok(root) => root,
                Err(err) => fail_compile(&filename, &source, &[err]),
            };
            if let Err(err) = analyzer::analyze(&mut ctx, root) {
                fail_compile(&filename, &source, &[err]);
            }
            if !ctx.errors.is_empty() {
                let errors = std::mem::take(&mut ctx.errors);
                fail_compile(&filename, &source, &errors);
            }
            println!("no errors found");
            Ok(())
        }

        Commands::EmitC { input } => {
            let source = read_source(&input)?;
            let filename = input.display().to_string();
            let mut ctx = Context::new(&filename, source.clone());
            let root = match parser::parse(&mut ctx) {
                Ok(root) => root,
                Err(err) => fail_compile(&filename, &source, &[err]),
            };
            let analysis = match analyzer::analyze(&mut ctx, root) {
                Ok(analysis) => analysis,
                Err(err) => fail_compile(&filename, &source, &[err]),
            };
            if !ctx.errors.is_empty() {
                let errors = std::mem::take(&mut ctx.errors);
                fail_compile(&filename, &source, &errors);
            }
            match cgen::generate(&ctx, &analysis, root, "none") {
                Ok(c) => {
                    println!("{}", c);
                    Ok(())
                }
                Err(err) => fail_compile(&filename, &source, &[err]),
            }
        }
    }
}
