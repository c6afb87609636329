use std::process;
use std::time::Duration;

use avdpool::{
    BakeApksOptions, CloneOptions, Env, InitBaseOptions, KillAllOptions, Manager, PrewarmOptions,
    RunOptions, SaveGoldenOptions,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "avdpool",
    about = "Golden-image and clone lifecycle for disposable Android emulators",
    version
)]
struct Cli {
    /// Correlation id attached to every log event and span.
    #[arg(long, global = true, env = "AVDPOOL_CORRELATION_ID")]
    correlation_id: Option<String>,
    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a base AVD, installing the system image when missing.
    InitBase {
        name: String,
        #[arg(
            long,
            default_value = "system-images;android-35;google_apis_playstore;x86_64"
        )]
        image: String,
        #[arg(long, default_value = "pixel_6")]
        device: String,
    },
    /// List AVDs under the AVD home.
    List,
    /// List running emulators (adb listing unioned with a process scan).
    Ps,
    /// Export an AVD's writable images to a golden directory.
    SaveGolden {
        name: String,
        #[arg(long)]
        dest: Option<String>,
    },
    /// Clone a base AVD from a golden directory.
    Clone {
        base: String,
        name: String,
        #[arg(long)]
        golden: String,
    },
    /// Start an emulator headless and wait for its serial.
    Run {
        name: String,
        /// Fixed even console port; allocated dynamically when omitted.
        #[arg(long)]
        port: Option<u16>,
        /// Extra emulator flags appended after the canonical set.
        #[arg(long = "emulator-arg")]
        emulator_args: Vec<String>,
    },
    /// Stop an emulator by serial (e.g. emulator-5580).
    Stop { serial: String },
    /// Stop an emulator by AVD name; not running is success.
    StopName { name: String },
    /// Show the running emulator behind an AVD name.
    Status { name: String },
    /// Force-stop every emulator process on the host.
    KillAll {
        #[arg(long, default_value_t = 5)]
        max_passes: u32,
        #[arg(long, default_value_t = 500)]
        delay_ms: u64,
    },
    /// Delete an AVD (directory and pointer file).
    Delete { name: String },
    /// Boot an AVD once, settle, and save it as a golden directory.
    Prewarm {
        name: String,
        #[arg(long)]
        dest: Option<String>,
        #[arg(long, default_value_t = 30)]
        settle_secs: u64,
        #[arg(long, default_value_t = 180)]
        boot_timeout_secs: u64,
    },
    /// Clone from a golden, install APKs, and report the baked userdata.
    Bake {
        base: String,
        name: String,
        #[arg(long)]
        golden: String,
        #[arg(long = "apk", required = true)]
        apks: Vec<String>,
        #[arg(long, default_value_t = 180)]
        boot_timeout_secs: u64,
    },
    /// Wait until an emulator finishes booting Android.
    WaitBoot {
        serial: String,
        #[arg(long, default_value_t = 180)]
        timeout_secs: u64,
    },
    /// Detect (and with --force, remove) orphaned emulators and clones.
    Cleanup {
        #[arg(long)]
        force: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Manual golden customization session.
    #[command(subcommand)]
    Customize(CustomizeCommands),
}

#[derive(Debug, Subcommand)]
enum CustomizeCommands {
    /// Sanitize the config and start a windowed emulator.
    Start { name: String },
    /// Stop the session and save the result as a golden.
    Finish {
        name: String,
        #[arg(long)]
        dest: Option<String>,
    },
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    if let Err(err) = run() {
        eprintln!("error: {err}");
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            eprintln!("  caused by: {cause}");
            source = cause.source();
        }
        process::exit(1);
    }
}

fn run() -> avdpool::Result<()> {
    let cli = Cli::parse();

    let mut env = Env::detect();
    if cli.correlation_id.is_some() {
        env.correlation_id = cli.correlation_id.clone();
    }
    let manager = Manager::with_env(env);
    let json = cli.json;

    match cli.command {
        Commands::InitBase {
            name,
            image,
            device,
        } => {
            let info = manager.init_base(&InitBaseOptions {
                name,
                system_image: image,
                device,
            })?;
            emit(json, &info, |info| {
                println!("{}\t{}", info.name, info.path.display());
            });
        }
        Commands::List => {
            let avds = manager.list()?;
            emit(json, &avds, |avds| {
                for avd in avds {
                    println!(
                        "{}\t{}\t{} bytes",
                        avd.name,
                        avd.userdata.display(),
                        avd.size_bytes
                    );
                }
            });
        }
        Commands::Ps => {
            let running = manager.list_running()?;
            emit(json, &running, |running| {
                for process in running {
                    println!(
                        "{}\t{}\tpid={}\tbooted={}",
                        process.serial, process.name, process.pid, process.booted
                    );
                }
            });
        }
        Commands::SaveGolden { name, dest } => {
            let golden = manager.save_golden(&SaveGoldenOptions {
                name,
                destination: dest,
            })?;
            emit(json, &golden, |golden| {
                println!("{}\t{} bytes", golden.path.display(), golden.size_bytes);
            });
        }
        Commands::Clone { base, name, golden } => {
            let info = manager.clone(&CloneOptions {
                base_name: base,
                clone_name: name,
                golden_path: golden,
            })?;
            emit(json, &info, |info| {
                println!(
                    "{}\t{}\t{} bytes",
                    info.name,
                    info.userdata.display(),
                    info.size_bytes
                );
            });
        }
        Commands::Run {
            name,
            port,
            emulator_args,
        } => {
            let started = manager.run(&RunOptions {
                name,
                port,
                extra_args: emulator_args,
            })?;
            emit(json, &started, |started| {
                println!(
                    "{}\tport={}\tlog={}",
                    started.serial,
                    started.port,
                    started.log_path.display()
                );
            });
        }
        Commands::Stop { serial } => {
            manager.stop(&serial)?;
            if !json {
                println!("stopped {serial}");
            }
        }
        Commands::StopName { name } => {
            manager.stop_by_name(&name)?;
            if !json {
                println!("stopped {name}");
            }
        }
        Commands::Status { name } => {
            let process = manager.status(&name)?;
            emit(json, &process, |process| {
                println!(
                    "{}\t{}\tpid={}\tbooted={}",
                    process.serial, process.name, process.pid, process.booted
                );
            });
        }
        Commands::KillAll {
            max_passes,
            delay_ms,
        } => {
            let report = manager.kill_all(KillAllOptions {
                max_passes,
                delay: Duration::from_millis(delay_ms),
            })?;
            emit(json, &report, |report| {
                println!(
                    "{} passes, killed {:?}, {} remaining",
                    report.passes, report.killed_pids, report.remaining
                );
            });
        }
        Commands::Delete { name } => {
            manager.delete(&name)?;
            if !json {
                println!("deleted {name}");
            }
        }
        Commands::Prewarm {
            name,
            dest,
            settle_secs,
            boot_timeout_secs,
        } => {
            let golden = manager.prewarm(&PrewarmOptions {
                name,
                destination: dest,
                extra_settle: Some(Duration::from_secs(settle_secs)),
                boot_timeout: Some(Duration::from_secs(boot_timeout_secs)),
            })?;
            emit(json, &golden, |golden| {
                println!("{}\t{} bytes", golden.path.display(), golden.size_bytes);
            });
        }
        Commands::Bake {
            base,
            name,
            golden,
            apks,
            boot_timeout_secs,
        } => {
            let (userdata, size_bytes) = manager.bake_apks(&BakeApksOptions {
                base_name: base,
                clone_name: name,
                golden_path: golden,
                apk_paths: apks,
                boot_timeout: Some(Duration::from_secs(boot_timeout_secs)),
            })?;
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "userdata": userdata, "size_bytes": size_bytes })
                );
            } else {
                println!("{}\t{size_bytes} bytes", userdata.display());
            }
        }
        Commands::WaitBoot {
            serial,
            timeout_secs,
        } => {
            manager.wait_for_boot_with_progress(
                &serial,
                Duration::from_secs(timeout_secs),
                |stage, elapsed| {
                    eprintln!("[{:>4}s] {}", elapsed.as_secs(), stage.as_str());
                },
            )?;
            if !json {
                println!("{serial} booted");
            }
        }
        Commands::Cleanup { force, dry_run } => {
            let force = force && !dry_run;
            let report = manager.cleanup_orphans(force)?;
            emit(json, &report, |report| {
                if report.orphaned_processes.is_empty() && report.orphaned_avds.is_empty() {
                    println!("no orphans found");
                    return;
                }
                for process in &report.orphaned_processes {
                    println!("orphan process\t{}\tpid={}", process.serial, process.pid);
                }
                for avd in &report.orphaned_avds {
                    println!("orphan avd\t{}\t{}", avd.name, avd.path.display());
                }
                if !force {
                    println!("dry run; pass --force to clean");
                }
            });
        }
        Commands::Customize(CustomizeCommands::Start { name }) => {
            let log_path = manager.customize_start(&name)?;
            if !json {
                println!("customizing {name}; emulator log: {}", log_path.display());
            }
        }
        Commands::Customize(CustomizeCommands::Finish { name, dest }) => {
            let golden = manager.customize_finish(&name, dest.as_deref())?;
            emit(json, &golden, |golden| {
                println!("{}\t{} bytes", golden.path.display(), golden.size_bytes);
            });
        }
    }
    Ok(())
}

fn emit<T: Serialize>(json: bool, value: &T, plain: impl FnOnce(&T)) {
    if json {
        match serde_json::to_string_pretty(value) {
            Ok(rendered) => println!("{rendered}"),
            Err(err) => eprintln!("error: rendering JSON: {err}"),
        }
    } else {
        plain(value);
    }
}
