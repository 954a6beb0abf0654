//! ruletun - a rule-based network tunnel

use std::path::PathBuf;
use std::process::ExitCode;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use ruletun::app::Runtime;
use ruletun::config::Config;

/// Launcher exit codes: 0 normal, 1 config error, 2 listener bind failure
const EXIT_CONFIG: u8 = 1;
const EXIT_BIND: u8 = 2;

fn main() -> ExitCode {
    let args = Args::parse();

    if args.version {
        print_version();
        return ExitCode::SUCCESS;
    }

    if args.gen_config {
        let config = Config::default_client();
        println!(
            "{}",
            serde_json::to_string_pretty(&config).expect("default config serializes")
        );
        return ExitCode::SUCCESS;
    }

    // Load configuration before anything else; a broken file is exit 1
    let (config, config_path) = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => (config, Some(path.clone())),
            Err(e) => {
                eprintln!("{}", e);
                return ExitCode::from(EXIT_CONFIG);
            }
        },
        None => (Config::default_client(), None),
    };

    init_logging(&config);
    info!("ruletun v{} starting", env!("CARGO_PKG_VERSION"));

    let runtime = match Runtime::from_config(config, config_path) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    rt.block_on(async {
        if let Err(e) = runtime.bind_inbounds().await {
            eprintln!("{}", e);
            return ExitCode::from(EXIT_BIND);
        }
        match runtime.run().await {
            Ok(()) => {
                info!("goodbye");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}", e);
                ExitCode::from(EXIT_CONFIG)
            }
        }
    })
}

fn init_logging(config: &Config) {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .or_else(|| match config.log.level.as_str() {
            "debug" => Some(Level::DEBUG),
            "info" => Some(Level::INFO),
            "warning" => Some(Level::WARN),
            "error" => Some(Level::ERROR),
            _ => None,
        })
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("set tracing subscriber");
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    gen_config: bool,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut gen_config = false;
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--gen-config" => gen_config = true,
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && config.is_none() => {
                    config = Some(PathBuf::from(arg));
                }
                _ => {}
            }
            i += 1;
        }

        Self {
            config,
            gen_config,
            version,
        }
    }
}

fn print_help() {
    println!(
        r#"ruletun - a rule-based network tunnel

USAGE:
    ruletun [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    --gen-config            Print an example configuration
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    ruletun -c config.json
    ruletun --gen-config > config.json

CONTROL PLANE:
    GET  /version            Version info
    GET  /traffic            Streaming up/down rates
    GET  /logs?level=        Streaming log events
    GET  /proxies            Outbounds and groups
    PUT  /proxies/{{name}}     Switch a selector
    GET  /rules              Rule list
    GET  /connections        Streaming connection snapshots
    DELETE /connections/{{id}} Force-close one connection
"#
    );
}

fn print_version() {
    println!("ruletun v{}", env!("CARGO_PKG_VERSION"));
}
