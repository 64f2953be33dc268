use clap::{Parser, Subcommand};
use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use conscript::compiler;
use conscript::debugger::spawn_server;
use conscript::vm::bytecode;
use conscript::{CodeBlock, ConsoleError, ConsoleHandle, RuntimeConfig, VM};

#[derive(Parser)]
#[command(name = "conscript")]
#[command(about = "Console script compiler, interpreter and debugger", long_about = None)]
struct Cli {
    /// Runtime configuration file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script file
    Run {
        /// The script to run, using its DSO when that is up to date
        file: Option<PathBuf>,

        /// Execute code directly from command line
        #[arg(short = 'c', long)]
        code: Option<String>,

        /// Do not write a DSO next to the script
        #[arg(long)]
        no_dso: bool,

        /// Log every executed instruction (needs CONSCRIPT_LOG=trace)
        #[arg(long)]
        trace_exec: bool,
    },
    /// Compile a script to a DSO without running it
    Compile {
        file: PathBuf,

        /// Output path (defaults to the script path plus the DSO extension)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// Recompile even when the DSO is up to date
        #[arg(long)]
        force: bool,
    },
    /// Disassemble a script or a DSO
    Disasm {
        file: PathBuf,

        /// Print JSON instead of a listing
        #[arg(long)]
        json: bool,
    },
    /// Run a script with the telnet debugger listening
    Debug {
        file: PathBuf,

        #[arg(long)]
        port: Option<u16>,

        #[arg(long)]
        password: Option<String>,

        /// Hold execution until a client connects and sends CONTINUE
        #[arg(long)]
        wait: bool,
    },
    /// Evaluate stdin line by line
    Console,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("CONSCRIPT_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => match RuntimeConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
        },
        None => RuntimeConfig::default(),
    };

    let result = match cli.command {
        Commands::Run {
            file,
            code,
            no_dso,
            trace_exec,
        } => {
            if no_dso {
                config.write_dso = false;
            }
            config.trace_exec |= trace_exec;
            run(config, file, code)
        }
        Commands::Compile { file, output, force } => compile(&config, &file, output, force),
        Commands::Disasm { file, json } => disasm(&config, &file, json),
        Commands::Debug {
            file,
            port,
            password,
            wait,
        } => {
            if let Some(port) = port {
                config.debugger.port = port;
            }
            if let Some(password) = password {
                config.debugger.password = password;
            }
            config.debugger.wait_for_client |= wait;
            debug_session(config, &file)
        }
        Commands::Console => console(config, None),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(config: RuntimeConfig, file: Option<PathBuf>, code: Option<String>) -> Result<(), ConsoleError> {
    let mut vm = VM::with_config(config, Box::new(io::stdout()));
    let result = match (code, file) {
        (Some(source), _) => vm.compile_exec("<code>", &source),
        (None, Some(path)) => vm.exec_file(&path),
        (None, None) => vm.eval(&io::read_to_string(io::stdin()).map_err(|source| ConsoleError::Io {
            path: PathBuf::from("<stdin>"),
            source,
        })?),
    };
    vm.flush();
    debug!(instructions = vm.stats().instructions, calls = vm.stats().calls, "run finished");
    result.map(|_| ())
}

fn compile(config: &RuntimeConfig, file: &Path, output: Option<PathBuf>, force: bool) -> Result<(), ConsoleError> {
    let dso = output.unwrap_or_else(|| compiler::dso_path(file, &config.dso_extension));
    if !force && compiler::dso_is_current(file, &dso) && file.exists() {
        println!("{} is up to date", dso.display());
        return Ok(());
    }
    let unit = compiler::compile_file(file, &dso)?;
    println!("{} ({} words)", dso.display(), unit.code.len());
    Ok(())
}

fn disasm(config: &RuntimeConfig, file: &Path, json: bool) -> Result<(), ConsoleError> {
    let name = file.to_string_lossy().into_owned();
    let mut symbols = conscript::vm::SymbolTable::new();
    let is_dso = file
        .extension()
        .is_some_and(|ext| ext.to_string_lossy() == config.dso_extension.trim_start_matches('.'));
    let block = if is_dso {
        let bytes = fs::read(file).map_err(|source| ConsoleError::Io {
            path: file.to_path_buf(),
            source,
        })?;
        bytecode::read_dso(&mut Cursor::new(bytes), &name, &mut symbols)?
    } else {
        let source = fs::read_to_string(file).map_err(|source| ConsoleError::Io {
            path: file.to_path_buf(),
            source,
        })?;
        CodeBlock::new(name.as_str(), compiler::compile_resolved(&name, &source, &mut symbols)?)
    };

    let listing = compiler::disassemble(&block, &symbols).map_err(conscript::ExecError::from)?;
    if json {
        match serde_json::to_string_pretty(&listing) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("error: failed to encode listing: {}", e),
        }
    } else {
        print!("{}", listing.to_text());
    }
    Ok(())
}

fn debug_session(config: RuntimeConfig, file: &Path) -> Result<(), ConsoleError> {
    let (link, server) = spawn_server(config.debugger.port).map_err(|source| ConsoleError::Io {
        path: PathBuf::from(format!("tcp port {}", config.debugger.port)),
        source,
    })?;
    info!("debugger on {}", server.local_addr());
    let console_handle = ConsoleHandle::spawn_with(config, Box::new(|| -> Box<dyn io::Write> { Box::new(io::stdout()) }), Some(link))
        .map_err(|source| ConsoleError::Io {
            path: PathBuf::from("<console thread>"),
            source,
        })?;
    if let Err(e) = console_handle.exec_blocking(file) {
        eprintln!("{}", e);
    }
    console(RuntimeConfig::default(), Some(console_handle))
}

/// Read stdin lines and evaluate each on the console thread.
fn console(config: RuntimeConfig, handle: Option<ConsoleHandle>) -> Result<(), ConsoleError> {
    let handle = match handle {
        Some(handle) => handle,
        None => ConsoleHandle::spawn(config).map_err(|source| ConsoleError::Io {
            path: PathBuf::from("<console thread>"),
            source,
        })?,
    };
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .map_err(|source| ConsoleError::Io {
            path: PathBuf::from("<runtime>"),
            source,
        })?;
    runtime.block_on(async {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match handle.eval(&line).await {
                Ok(result) if !result.is_empty() => println!("{}", result),
                Ok(_) => {}
                Err(ConsoleError::Disconnected) => break,
                Err(e) => eprintln!("{}", e),
            }
        }
    });
    handle.shutdown();
    Ok(())
}
