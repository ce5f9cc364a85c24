use anyhow::{anyhow, Context};
use chapter_downloader::config;
use chapter_downloader::core::engine::Engine;
use chapter_downloader::core::events::SessionEvent;
use chapter_downloader::core::handoff::BackgroundHost;
use chapter_downloader::core::model::{ChapterRange, ExportFormat, LoadedFile, SessionId, StartOptions};
use chapter_downloader::logging;
use chapter_downloader::plugins::registry::{PluginRegistry, ServiceContext};
use clap::{Arg, ArgAction, ArgMatches, Command};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

fn build_cli() -> Command {
    let download = Command::new("download")
        .about("Download a title into an FB2, EPUB or PDF file")
        .arg(
            Arg::new("target")
                .help("Title URL, or a slug together with --service")
                .required(true)
                .num_args(1),
        )
        .arg(
            Arg::new("service")
                .long("service")
                .help("Service key (ranobelib, mangalib)")
                .num_args(1),
        )
        .arg(
            Arg::new("format")
                .long("format")
                .help("Output format: fb2, epub or pdf")
                .num_args(1),
        )
        .arg(
            Arg::new("from")
                .long("from")
                .help("First chapter position to download (1-based)")
                .value_parser(clap::value_parser!(usize))
                .num_args(1),
        )
        .arg(
            Arg::new("to")
                .long("to")
                .help("Last chapter position to download (inclusive)")
                .value_parser(clap::value_parser!(usize))
                .num_args(1),
        )
        .arg(
            Arg::new("update")
                .long("update")
                .help("Previously exported file to bring up to date")
                .num_args(1),
        )
        .arg(
            Arg::new("handoff_after")
                .long("handoff-after")
                .help("Move the session to a background engine after N chapters")
                .value_parser(clap::value_parser!(usize))
                .num_args(1),
        );

    Command::new("chapter-downloader")
        .about("Web novel and manga downloader with FB2/EPUB/PDF export")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .help("TOML config file")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("out_dir")
                .long("out-dir")
                .help("Output directory (overrides the config file)")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Debug logging")
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .subcommand(download)
        .subcommand(Command::new("services").about("List supported services"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = build_cli().get_matches();
    logging::init_logging(matches.get_flag("verbose"));

    let mut cfg = config::load(matches.get_one::<String>("config").map(Path::new))?;
    if let Some(dir) = matches.get_one::<String>("out_dir") {
        cfg.engine.out_dir = PathBuf::from(dir);
    }
    let service_ctx = ServiceContext::from(&cfg.service);

    match matches.subcommand() {
        Some(("download", m)) => {
            let options = start_options(m)?;
            let registry = PluginRegistry::with_defaults(service_ctx.clone())?;
            let engine = Engine::new(registry, cfg.engine.clone()).await?;

            let mut rx = engine.subscribe();
            let id = engine.spawn(options).await?;
            println!("Session started: {}", id);

            let pb = progress_bar();
            let handoff_after = m.get_one::<usize>("handoff_after").copied();
            let mut last = follow(&engine, &mut rx, id, &pb, handoff_after).await;

            if let Followed::Reached = last {
                let registry = PluginRegistry::with_defaults(service_ctx)?;
                let host = BackgroundHost::spawn(Engine::new(registry, cfg.engine.clone()).await?);
                let mut host_rx = host.engine().subscribe();
                match engine.hand_off(id, &host.transport()).await {
                    Ok(new_id) => {
                        pb.println(format!("[INFO] continuing in background as {}", new_id));
                        last = follow(host.engine(), &mut host_rx, new_id, &pb, None).await;
                    }
                    Err(e) => {
                        pb.println(format!("[WARN] hand-off failed, continuing here: {}", e));
                        last = follow(&engine, &mut rx, id, &pb, None).await;
                    }
                }
                host.shutdown();
            }

            report(last, &pb)?;
        }
        Some(("services", _)) => {
            let registry = PluginRegistry::with_defaults(service_ctx)?;
            for key in registry.service_keys() {
                println!("{}", key);
            }
        }
        _ => {}
    }

    Ok(())
}

fn start_options(m: &ArgMatches) -> anyhow::Result<StartOptions> {
    let target = m
        .get_one::<String>("target")
        .ok_or_else(|| anyhow!("missing target"))?
        .trim()
        .to_string();
    let mut options = StartOptions {
        service_key: m.get_one::<String>("service").cloned(),
        ..Default::default()
    };
    if target.starts_with("http://") || target.starts_with("https://") {
        options.url = Some(target);
    } else {
        options.slug = Some(target);
    }

    if let Some(raw) = m.get_one::<String>("format") {
        let format = ExportFormat::parse(raw).with_context(|| format!("unknown format '{}'", raw))?;
        options.format = Some(format);
    }

    let from = m.get_one::<usize>("from").copied();
    let to = m.get_one::<usize>("to").copied();
    if from.is_some() || to.is_some() {
        options.range = Some(ChapterRange { from: from.unwrap_or(1), to: to.unwrap_or(usize::MAX) });
    }

    if let Some(path) = m.get_one::<String>("update") {
        options.loaded_file = Some(LoadedFile { path: PathBuf::from(path) });
    }
    Ok(options)
}

fn progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(100);
    if let Ok(style) = ProgressStyle::with_template("{spinner:.green} {bar:40.cyan/blue} {pos:>3}% {wide_msg}") {
        pb.set_style(style.tick_chars("|/-\\ "));
    }
    pb.enable_steady_tick(std::time::Duration::from_millis(120));
    pb
}

enum Followed {
    /// `handoff_after` chapters are done and the session is still running.
    Reached,
    Terminal(SessionEvent),
    Lost,
}

/// Renders events for `id` until it ends. Ctrl-C stops the session; what
/// was gathered is still exported.
async fn follow(
    engine: &Engine,
    rx: &mut broadcast::Receiver<SessionEvent>,
    id: SessionId,
    pb: &ProgressBar,
    handoff_after: Option<usize>,
) -> Followed {
    loop {
        let evt = tokio::select! {
            evt = rx.recv() => evt,
            _ = tokio::signal::ctrl_c() => {
                pb.println("[INFO] stopping, saving what was downloaded...");
                engine.stop(id).await;
                continue;
            }
        };
        let evt = match evt {
            Ok(e) => e,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return Followed::Lost,
        };

        if let SessionEvent::Info { scope, message } = &evt {
            pb.println(format!("[INFO] {}: {}", scope, message));
            continue;
        }
        if evt.session_id() != Some(id) {
            continue;
        }

        match &evt {
            SessionEvent::Started { slug, service, .. } => pb.set_message(format!("{} on {}", slug, service)),
            SessionEvent::StepChanged { step, .. } => pb.set_message(format!("{:?}", step)),
            SessionEvent::Progress { status, percent, .. } => {
                pb.set_position((*percent).clamp(0, 100) as u64);
                pb.set_message(status.clone());
            }
            SessionEvent::ChapterDone { index, total, failed, .. } => {
                if *failed {
                    pb.println(format!("[WARN] chapter {}/{} failed, kept as placeholder", index + 1, total));
                }
                if handoff_after == Some(index + 1) && index + 1 < *total {
                    return Followed::Reached;
                }
            }
            SessionEvent::PartSaved { path, part, parts, .. } => {
                pb.println(format!("[SAVED] part {}/{} -> {}", part, parts, path.display()));
            }
            _ => {}
        }

        if evt.is_terminal() {
            return Followed::Terminal(evt);
        }
    }
}

fn report(last: Followed, pb: &ProgressBar) -> anyhow::Result<()> {
    match last {
        Followed::Terminal(SessionEvent::Completed { files, .. }) => {
            pb.finish_with_message("done");
            for f in files {
                println!("- {}", f.display());
            }
        }
        Followed::Terminal(SessionEvent::Stopped { files, .. }) => {
            pb.abandon_with_message("stopped");
            for f in files {
                println!("- {}", f.display());
            }
        }
        Followed::Terminal(SessionEvent::NothingToDo { .. }) => {
            pb.finish_with_message("file is already up to date");
        }
        Followed::Terminal(SessionEvent::Failed { error, .. }) => {
            pb.abandon_with_message("failed");
            return Err(anyhow!(error));
        }
        Followed::Terminal(_) | Followed::Reached => pb.finish_and_clear(),
        Followed::Lost => {
            pb.abandon();
            return Err(anyhow!("engine went away before the session finished"));
        }
    }
    Ok(())
}
