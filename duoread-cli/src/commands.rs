//! Subcommand handlers. Each returns `Ok(false)` when the job ran but failed.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use duoread_core::{
    AlignmentJob, AppState, Config, FsPageStore, JobEvent, PageStore, Settings,
};
use futures::StreamExt;

use crate::cli::{AlignArgs, Args, Command};
use crate::inputs;

pub async fn execute(args: Args) -> anyhow::Result<bool> {
    let config = match args.data_dir {
        Some(dir) => Config::with_data_dir(dir),
        None => Config::load_or_default(),
    };
    config
        .ensure_dirs()
        .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;
    tracing::debug!("Data directory: {:?}", config.data_dir);

    match args.command {
        Command::Align(align_args) => align(config, align_args).await,
        Command::Import { name, orig, transl } => {
            import(config, &name, &orig, transl.as_deref()).await
        }
        Command::List => {
            list(&AppState::new(config)?);
            Ok(true)
        }
        Command::Delete { name } => {
            let state = AppState::new(config)?;
            state.client.delete_collection(&name).await?;
            println!("Deleted '{}'", name);
            Ok(true)
        }
        Command::Status => {
            status(&AppState::new(config)?)?;
            Ok(true)
        }
    }
}

fn open_state(config: Config, settings: Settings) -> AppState {
    let store: Arc<dyn PageStore> = Arc::new(FsPageStore::new(&config.pages_dir));
    let state = AppState::with_store(config, settings, store);
    if let Some(name) = state.gate.orphaned() {
        tracing::warn!(
            "Alignment of '{}' was interrupted earlier; its pages may be incomplete",
            name
        );
    }
    state
}

async fn align(config: Config, args: AlignArgs) -> anyhow::Result<bool> {
    let settings = args.apply(Settings::load(&config.settings_path));

    let orig_imgs = inputs::read_images(&args.orig, args.orig_order.as_deref())?;
    let transl_imgs = match &args.transl {
        Some(dir) => inputs::read_images(dir, args.transl_order.as_deref())?,
        None => Vec::new(),
    };
    if orig_imgs.is_empty() && transl_imgs.is_empty() {
        anyhow::bail!("No images found in {}", args.orig.display());
    }

    let job = AlignmentJob {
        name: args.name.clone(),
        orig_imgs,
        orig_settings: settings.orig.clone(),
        transl_imgs,
        transl_settings: settings.transl.clone(),
    };

    let state = open_state(config, settings);
    let mut events = std::pin::pin!(state.client.events());
    let mut ready = state.client.ready();

    state.client.start(job).await?;

    let mut announced = false;
    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else {
                    anyhow::bail!("Event stream closed before the job finished");
                };
                print_event(&event, args.json)?;
                match event {
                    JobEvent::Done { .. } => return Ok(true),
                    JobEvent::Failed { .. } => return Ok(false),
                    _ => {}
                }
            }

            changed = ready.changed(), if !announced => {
                // The signal is cleared when the job starts; wait for a name
                let name = ready.borrow_and_update().clone();
                match (changed, name) {
                    (Ok(()), Some(name)) => {
                        announced = true;
                        tracing::info!("First pages of '{}' are ready to read", name);
                    }
                    (Ok(()), None) => {}
                    (Err(_), _) => announced = true,
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Interrupted, stopping alignment");
                state.client.shutdown().await;
                return Ok(false);
            }
        }
    }
}

async fn import(
    config: Config,
    name: &str,
    orig: &Path,
    transl: Option<&Path>,
) -> anyhow::Result<bool> {
    let orig_imgs = inputs::read_pages(orig)?;
    let transl_imgs = match transl {
        Some(dir) => inputs::read_pages(dir)?,
        None => Vec::new(),
    };

    let settings = Settings::load(&config.settings_path);
    let state = open_state(config, settings);
    let mut events = std::pin::pin!(state.client.events());

    state
        .client
        .direct_import(name, orig_imgs, transl_imgs)
        .await?;

    while let Some(event) = events.next().await {
        print_event(&event, false)?;
        match event {
            JobEvent::Done { .. } => return Ok(true),
            JobEvent::Failed { .. } => return Ok(false),
            _ => {}
        }
    }
    anyhow::bail!("Event stream closed before the import finished")
}

fn print_event(event: &JobEvent, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    match event {
        JobEvent::OrigWritten(p) | JobEvent::TranslWritten(p) => {
            let stream = match event {
                JobEvent::OrigWritten(_) => "orig",
                _ => "transl",
            };
            println!(
                "{:<6} {:>4}/{:<4} {} page(s) stored, new: {:?}",
                stream,
                p.progress_index,
                p.progress_max,
                p.count,
                p.new_indexes
            );
        }
        JobEvent::Done { collection_name } => println!("Done: {}", collection_name),
        JobEvent::Failed {
            collection_name,
            stream,
            index,
            error,
            ..
        } => match (stream, index) {
            (Some(stream), Some(index)) => println!(
                "Failed: {} ({} image {}): {}",
                collection_name, stream, index, error
            ),
            _ => println!("Failed: {}: {}", collection_name, error),
        },
    }
    Ok(())
}

fn list(state: &AppState) {
    let names = state.client.collections();
    if names.is_empty() {
        println!("No collections");
        return;
    }
    for name in names {
        let pages = state.markers.page_count(&name).unwrap_or(0);
        match state.markers.position(&name) {
            Some(position) => println!(
                "{}  {} pages, at page {} ({:.0}%)",
                name,
                pages,
                position.page,
                position.percentage * 100.0
            ),
            None => println!("{}  {} pages", name, pages),
        }
    }
}

fn status(state: &AppState) -> anyhow::Result<()> {
    println!("Data directory: {}", state.config.data_dir.display());
    match state.gate.orphaned() {
        Some(name) => println!("Interrupted alignment: {}", name),
        None => println!("No interrupted alignment"),
    }
    println!("{}", serde_json::to_string_pretty(&state.settings)?);
    Ok(())
}
