use clap::{Parser, Subcommand};
use console::style;
use periph_config::{ConfigLoader, PeriphConfig, WarningSeverity};
use periph_core::{DeviceClass, PeriphError, ToolExecutor};
use periph_device::DeviceTools;
use std::path::PathBuf;
use std::time::Duration;

mod call;
pub mod serve;

/// periph: one tool surface over cameras, audio, displays, printers and storage
#[derive(Parser)]
#[command(name = "periph", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to periph.toml config file
    #[arg(short, long, global = true, env = "PERIPH_CONFIG")]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer newline-delimited JSON tool calls on stdin, results on stdout
    Serve,
    /// List the tools advertised for the enabled device classes
    Tools {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List devices of the enabled classes
    Devices {
        /// Only this class: camera, audio, screen, printer, storage
        #[arg(long)]
        class: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a single tool call and print its result
    Call {
        /// Tool name, e.g. list_cameras
        tool: String,
        /// Arguments as a JSON object
        arguments: Option<String>,
        /// Wait for a started session to finish (Ctrl-C stops it)
        #[arg(short, long)]
        follow: bool,
    },
    /// Show current configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate configuration and check external programs
    Doctor,
    /// Show version and build info
    Version,
}

impl Cli {
    pub async fn run(self) -> periph_core::Result<()> {
        // Load config first so we can use it for log format
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();
        self.init_tracing(&config);

        match self.command {
            Commands::Serve => serve::cmd_serve(config).await,
            Commands::Tools { json } => Self::cmd_tools(config, json),
            Commands::Devices { class, json } => Self::cmd_devices(config, class, json).await,
            Commands::Call {
                tool,
                arguments,
                follow,
            } => call::cmd_call(config, tool, arguments, follow).await,
            Commands::Config { json } => Self::cmd_config(config, json),
            Commands::Doctor => Self::cmd_doctor(config).await,
            Commands::Version => Self::cmd_version(),
        }
    }

    /// RUST_LOG wins, then --verbose / --quiet / --log-level, then `logging.level`.
    /// Logs always go to stderr; stdout belongs to tool results.
    fn init_tracing(&self, config: &PeriphConfig) {
        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            self.log_level.as_deref().unwrap_or(&config.logging.level)
        };
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

        match config.logging.format.as_str() {
            "json" => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .json()
                .with_target(true)
                .init(),
            "compact" => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .compact()
                .with_target(false)
                .init(),
            _ => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init(),
        }
    }

    fn cmd_tools(config: PeriphConfig, json: bool) -> periph_core::Result<()> {
        let tools = DeviceTools::from_config(config).tools();
        if json {
            println!("{}", serde_json::to_string_pretty(&tools)?);
            return Ok(());
        }

        println!("{} ({} tools)", style("Tools").bold(), tools.len());
        for tool in &tools {
            let class = tool.class.map(|c| c.as_str()).unwrap_or("device");
            let marker = if tool.is_mutating { "*" } else { " " };
            println!(
                "  {marker} {:<24} {:<8} {}",
                style(&tool.name).cyan(),
                style(class).dim(),
                tool.description
            );
        }
        println!();
        println!("  {}", style("* changes device or session state").dim());
        Ok(())
    }

    async fn cmd_devices(
        config: PeriphConfig,
        class: Option<String>,
        json: bool,
    ) -> periph_core::Result<()> {
        let classes = match class {
            Some(raw) => vec![parse_class(&raw)?],
            None => DeviceClass::ALL.to_vec(),
        };
        let tools = DeviceTools::from_config(config);
        let catalog = tools.engine().catalog();

        let mut listed = Vec::new();
        for class in classes {
            if !catalog.is_enabled(class) {
                listed.push((class, None));
                continue;
            }
            let devices = match catalog.list(class).await {
                Ok(devices) => Ok(devices),
                Err(e) => Err(e.to_string()),
            };
            listed.push((class, Some(devices)));
        }

        if json {
            let mut out = serde_json::Map::new();
            for (class, devices) in listed {
                let value = match devices {
                    None => serde_json::json!({ "enabled": false }),
                    Some(Ok(devices)) => serde_json::json!({ "enabled": true, "devices": devices }),
                    Some(Err(e)) => serde_json::json!({ "enabled": true, "error": e }),
                };
                out.insert(class.as_str().to_string(), value);
            }
            println!("{}", serde_json::to_string_pretty(&out)?);
            return Ok(());
        }

        for (class, devices) in listed {
            match devices {
                None => println!("{} {}", style(class).bold(), style("(disabled)").dim()),
                Some(Err(e)) => println!("{} {}", style(class).bold(), style(e).red()),
                Some(Ok(devices)) if devices.is_empty() => {
                    println!("{} {}", style(class).bold(), style("(none found)").dim())
                }
                Some(Ok(devices)) => {
                    println!("{}", style(class).bold());
                    for d in devices {
                        let caps: Vec<String> = d
                            .capabilities
                            .iter()
                            .filter_map(|c| serde_json::to_value(c).ok())
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect();
                        println!(
                            "  {:<16} {:<32} {}",
                            style(&d.id).cyan(),
                            d.name,
                            style(caps.join(",")).dim()
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn cmd_config(config: PeriphConfig, json: bool) -> periph_core::Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(&config)?);
        } else {
            println!(
                "{}",
                toml::to_string_pretty(&config).map_err(|e| PeriphError::Config(e.to_string()))?
            );
        }
        Ok(())
    }

    async fn cmd_doctor(config: PeriphConfig) -> periph_core::Result<()> {
        println!("{}", style("periph doctor").bold());
        println!();

        let warnings = match config.validate() {
            Ok(w) => w,
            Err(e) => {
                println!("{}", style(e).red());
                return Ok(());
            }
        };

        let mut warn_count = 0;
        let mut info_count = 0;
        for w in &warnings {
            match w.severity {
                WarningSeverity::Warning => {
                    warn_count += 1;
                    println!("  {}", style(w).yellow());
                }
                WarningSeverity::Info => {
                    info_count += 1;
                    println!("  {}", style(w).dim());
                }
                WarningSeverity::Error => println!("  {}", style(w).red()),
            }
        }

        let devices = &config.devices;
        let mut probes: Vec<(&str, Vec<String>)> = Vec::new();
        if [DeviceClass::Camera, DeviceClass::Audio, DeviceClass::Screen]
            .into_iter()
            .any(|c| devices.is_enabled(c))
        {
            probes.push((config.capture.ffmpeg_path.as_str(), vec!["-version".into()]));
        }
        if devices.is_enabled(DeviceClass::Printer) {
            probes.push((config.printer.lpstat_path.as_str(), vec!["-r".into()]));
        }

        let mut ok_count = 0;
        for (program, args) in probes {
            match periph_device::process::run_output(program, &args, Duration::from_secs(5)).await {
                Ok(output) => {
                    let text = String::from_utf8_lossy(&output.stdout);
                    let first = text.lines().next().unwrap_or("").trim();
                    ok_count += 1;
                    println!("  {} {program}: {first}", style("ok").green());
                }
                Err(e) => {
                    warn_count += 1;
                    println!("  {} {program}: {e}", style("missing").yellow());
                }
            }
        }

        let output_dir = config.capture.resolved_output_dir();
        if output_dir.is_dir() {
            ok_count += 1;
            println!("  {} output dir: {}", style("ok").green(), output_dir.display());
        } else {
            info_count += 1;
            println!(
                "  {} output dir {} does not exist yet; it is created on first capture",
                style("info").dim(),
                output_dir.display()
            );
        }

        println!();
        println!("  {ok_count} checks passed, {warn_count} warnings, {info_count} notes");
        Ok(())
    }

    fn cmd_version() -> periph_core::Result<()> {
        println!("periph v{}", env!("CARGO_PKG_VERSION"));
        println!("   Target: {}", std::env::consts::ARCH);
        println!("   OS: {}", std::env::consts::OS);
        #[cfg(debug_assertions)]
        println!("   Profile: debug");
        #[cfg(not(debug_assertions))]
        println!("   Profile: release");
        Ok(())
    }
}

fn parse_class(raw: &str) -> periph_core::Result<DeviceClass> {
    DeviceClass::ALL
        .into_iter()
        .find(|c| c.as_str() == raw)
        .ok_or_else(|| PeriphError::InvalidArgument {
            tool: "devices".into(),
            reason: format!("unknown device class '{raw}'"),
        })
}
