use std::{
    collections::HashMap,
    io::{stderr, IsTerminal},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use common::Status;
use futures_util::pin_mut;
use indicatif::{ProgressBar, ProgressStyle};
use kdam::{
    term::{self, Colorizer},
    tqdm, BarExt, Column, RichProgress, Spinner,
};
use log::{info, warn};
use morphoview::{
    api::HttpBackend,
    config::{Args, Command},
    intake::upload_batch,
    persistence::{load_store, MetadataPort, RemoteMetadata},
    scheduler::ScanQueue,
    store::{now_ms, scanning, SlideStore, Snapshot},
    views::{Dashboard, QueueView, ReviewGrid, SlideViewer},
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    select, spawn,
    sync::watch,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

async fn upload(
    backend: &HttpBackend,
    metadata: &dyn MetadataPort,
    store: &SlideStore,
    files: &[PathBuf],
    tty: bool,
) -> Result<()> {
    let bar = if tty {
        ProgressBar::new(files.len() as u64)
    } else {
        ProgressBar::hidden()
    };
    bar.set_style(
        ProgressStyle::with_template("{spinner} uploading [{bar:30}] {pos}/{len}")?
            .progress_chars("=> "),
    );
    let report = upload_batch(backend, store, files, |done, _| bar.set_position(done as u64)).await;
    bar.finish_and_clear();

    metadata.save(&report.uploaded).await;
    for record in &report.uploaded {
        eprintln!("{} -> {}", record.filename, record.file_id);
    }
    for (path, e) in &report.failed {
        eprintln!("{}: {e}", path.display());
    }
    if report.uploaded.is_empty() && !report.failed.is_empty() {
        bail!("no slide could be uploaded");
    }
    Ok(())
}

fn scan_bar(filename: &str) -> RichProgress {
    RichProgress::new(
        tqdm!(total = 100, unit = "%"),
        vec![
            Column::Spinner(Spinner::new(
                &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"],
                80.0,
                1.0,
            )),
            Column::Text(format!("[bold blue]{filename}")),
            Column::Animation,
            Column::Percentage(1),
            Column::Text("•".to_owned()),
            Column::ElapsedTime,
        ],
    )
}

/// Follows the store until `token` fires: one bar for the scanning slide on
/// a terminal, plus a line whenever a slide changes status.
async fn render_progress(mut slides: watch::Receiver<Snapshot>, token: CancellationToken, tty: bool) {
    let mut timer = interval(Duration::from_millis(100));
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut bar: Option<(String, RichProgress)> = None;
    let mut prev: HashMap<String, Status> = HashMap::new();
    loop {
        select! {
            _ = timer.tick() => {
                let snapshot = slides.borrow_and_update().clone();
                for slide in snapshot.iter() {
                    let status = slide.status();
                    if prev.get(&slide.file_id) == Some(&status) {
                        continue;
                    }
                    let line = format!("{} entered status {status}.", slide.filename);
                    match bar.as_mut() {
                        Some((_, bar)) => {
                            let _ = bar.write(line.colorize("green"));
                        }
                        None => eprintln!("{line}"),
                    }
                }
                prev = snapshot.iter().map(|s| (s.file_id.clone(), s.status())).collect();

                if !tty {
                    continue;
                }
                match scanning(&snapshot) {
                    Some(slide) => {
                        if bar.as_ref().map_or(true, |(id, _)| *id != slide.file_id) {
                            if let Some((_, mut old)) = bar.take() {
                                let _ = old.clear();
                            }
                            bar = Some((slide.file_id.clone(), scan_bar(&slide.filename)));
                        }
                        if let Some((_, bar)) = bar.as_mut() {
                            let _ = bar.update_to(slide.progress().unwrap_or(0).into());
                        }
                    }
                    None => {
                        if let Some((_, mut old)) = bar.take() {
                            let _ = old.clear();
                        }
                    }
                }
            }
            _ = token.cancelled() => {
                if let Some((_, mut old)) = bar.take() {
                    let _ = old.clear();
                }
                return;
            }
        }
    }
}

/// One line typed while the queue runs. Returns false to stop.
async fn handle_command(queue: &ScanQueue, line: &str) -> bool {
    let mut words = line.split_whitespace();
    let result = match (words.next(), words.next()) {
        (None, _) => return true,
        (Some("q" | "quit"), _) => return false,
        (Some("p"), Some(id)) => queue
            .prioritise(id)
            .await
            .map(|r| format!("{} is now high priority", r.filename)),
        (Some("c"), Some(id)) => queue.cancel(id).map(|r| format!("cancelled {}", r.filename)),
        (Some("d"), Some(id)) => queue.delete(id).await.map(|r| format!("deleted {}", r.filename)),
        (Some("l"), _) => Ok(QueueView::new(&queue.store().snapshot()).to_string()),
        _ => Ok("commands: p <id>, c <id>, d <id>, l, q".to_string()),
    };
    match result {
        Ok(message) => eprintln!("{message}"),
        Err(e) => eprintln!("{}", e.to_string().colorize("red")),
    }
    true
}

async fn run(queue: ScanQueue, keep_going: bool, tty: bool) -> Result<()> {
    let shutdown = CancellationToken::new();
    let runner = spawn({
        let queue = queue.clone();
        let shutdown = shutdown.clone();
        async move { queue.run(shutdown).await }
    });
    let renderer = spawn(render_progress(queue.store().subscribe(), shutdown.clone(), tty));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut idle_check = interval(Duration::from_millis(500));
    let ctrl_c = tokio::signal::ctrl_c();
    pin_mut!(ctrl_c);
    loop {
        select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !handle_command(&queue, &line).await {
                        break;
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("stdin: {e}");
                    stdin_open = false;
                }
            },
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
            _ = idle_check.tick() => {
                if !keep_going && queue.is_idle() {
                    break;
                }
            }
        }
    }

    shutdown.cancel();
    runner.await?;
    renderer.await?;
    print!("{}", QueueView::new(&queue.store().snapshot()));
    Ok(())
}

async fn open_queue(
    backend: &Arc<HttpBackend>,
    metadata: &Arc<dyn MetadataPort>,
    args: &Args,
) -> ScanQueue {
    let store = load_store(backend.as_ref(), metadata.as_ref(), now_ms()).await;
    ScanQueue::new(store, backend.clone(), metadata.clone(), args.scan_settings())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let is_tty = stderr().is_terminal();
    term::init(is_tty);
    let args = Args::parse();

    let backend = Arc::new(
        HttpBackend::new(args.base_url.clone(), args.retry_policy())
            .context("could not set up the HTTP client")?,
    );
    let metadata: Arc<dyn MetadataPort> = Arc::new(RemoteMetadata::new(backend.clone()));

    match args.command.clone() {
        Command::Upload { files } => {
            upload(&backend, metadata.as_ref(), &SlideStore::default(), &files, is_tty).await?;
        }
        Command::List { json } => {
            let queue = open_queue(&backend, &metadata, &args).await;
            let snapshot = queue.store().snapshot();
            if json {
                println!("{}", serde_json::to_string_pretty(&*snapshot)?);
            } else {
                print!("{}", QueueView::new(&snapshot));
            }
        }
        Command::Review => {
            let queue = open_queue(&backend, &metadata, &args).await;
            print!("{}", ReviewGrid::new(&queue.store().snapshot()));
        }
        Command::Show { file_id } => {
            let queue = open_queue(&backend, &metadata, &args).await;
            let Some(record) = queue.store().get(&file_id) else {
                bail!("no slide with id {file_id}");
            };
            print!("{}", SlideViewer::open(record, &backend)?);
        }
        Command::Dashboard => {
            let queue = open_queue(&backend, &metadata, &args).await;
            let snapshot = queue.store().snapshot();
            print!("{}", Dashboard::from_records(&snapshot));
            println!();
            print!("{}", QueueView::new(&snapshot));
        }
        Command::Prioritise { file_id } => {
            let queue = open_queue(&backend, &metadata, &args).await;
            let record = queue.prioritise(&file_id).await?;
            println!("{} ({}) is now {}", record.filename, record.file_id, record.priority);
        }
        Command::Delete { file_id } => {
            let queue = open_queue(&backend, &metadata, &args).await;
            let record = queue.delete(&file_id).await?;
            println!("deleted {} ({})", record.filename, record.file_id);
        }
        Command::Run { files, keep_going } => {
            let queue = open_queue(&backend, &metadata, &args).await;
            if !files.is_empty() {
                upload(&backend, metadata.as_ref(), queue.store(), &files, is_tty).await?;
            }
            run(queue, keep_going, is_tty).await?;
        }
    }
    Ok(())
}
