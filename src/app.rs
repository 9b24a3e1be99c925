use crate::commands::{self, Command};
use color_eyre::{eyre::eyre, Report, Result};
use orgsync::cache::{CacheStorage, NoopStorage, SqliteStorage};
use orgsync::config::Config;
use orgsync::resource::HttpBackend;
use orgsync::{Patch, ResourceFacade, ResourceKind, SyncError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Command-line front end over one resource facade
pub struct App {
  facade: ResourceFacade,
}

/// Render a sync error as the structured view error.
fn report(error: SyncError) -> Report {
  let view = error.to_view();
  match serde_json::to_string_pretty(&view) {
    Ok(json) => eyre!("{}", json),
    Err(_) => eyre!("{}", error),
  }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

impl App {
  pub async fn new(config: Config, kind: Option<String>) -> Result<Self> {
    let backend = HttpBackend::from_config(&config)?;

    let storage: Arc<dyn CacheStorage> = if config.cache.enabled {
      Arc::new(SqliteStorage::open(config.cache.path.as_deref())?)
    } else {
      Arc::new(NoopStorage)
    };

    let kind = ResourceKind::new(kind.unwrap_or_else(|| config.backend.resource.clone()));
    let facade = ResourceFacade::new(
      kind,
      Arc::new(backend),
      storage,
      config.sync.facade_options(),
    );

    for id in facade.unsaved_ids() {
      warn!(id = %id, "unsaved changes from an earlier session");
    }

    Ok(Self { facade })
  }

  pub async fn run(&mut self, command: Command) -> Result<()> {
    match command {
      Command::Get { id, force } => {
        let result = self.facade.fetch(&id, force).await.map_err(report)?;
        if self.facade.has_unsaved_changes(&id) {
          eprintln!("{} has unsaved changes; `orgsync edit {}` saves them", id, id);
        }
        print_json(&result.data)
      }
      Command::Create { data } => {
        let payload = commands::parse_object(&data)?;
        let resource = self.facade.create(payload).await.map_err(report)?;
        print_json(&resource)
      }
      Command::Update { id, set, data } => {
        let patch = commands::patch_from(&set, data.as_deref())?;
        let resource = self.facade.update(&id, patch).await.map_err(report)?;
        print_json(&resource)
      }
      Command::Archive { id } => match self.facade.archive(&id).await.map_err(report)? {
        Some(resource) => print_json(&resource),
        None => {
          println!("Archived {}", id);
          Ok(())
        }
      },
      Command::Delete { id } => {
        self.facade.delete(&id).await.map_err(report)?;
        println!("Deleted {}", id);
        Ok(())
      }
      Command::Watch { id, interval_ms } => self.watch(&id, interval_ms.map(Duration::from_millis)).await,
      Command::Edit { id } => self.edit(&id).await,
    }
  }

  /// Print every state change of `id` until Ctrl-C.
  async fn watch(&self, id: &str, interval: Option<Duration>) -> Result<()> {
    let mut query = self.facade.query(id);
    if let Err(error) = query.refresh(true).await {
      // Shown through the state below; keep watching
      warn!(id, %error, "initial fetch failed");
    }
    query.start_polling(interval);
    print_json(&query.state())?;

    loop {
      tokio::select! {
        _ = tokio::signal::ctrl_c() => break,
        state = query.changed() => match state {
          Some(state) => print_json(&state)?,
          None => break,
        },
      }
    }

    query.close();
    Ok(())
  }

  /// Apply `FIELD=VALUE` lines from stdin through the debounced path.
  async fn edit(&self, id: &str) -> Result<()> {
    self.facade.get(id).await.map_err(report)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
      let line = line.trim();
      if line.is_empty() || line.starts_with('#') {
        continue;
      }
      match commands::parse_assignment(line) {
        Ok((field, value)) => {
          self.facade.edit(id, Patch::new().set(field, value));
        }
        Err(e) => eprintln!("Skipping line: {}", e),
      }
    }

    if let Some(saved) = self.facade.save(id).await.map_err(report)? {
      info!(id, "saved edits");
      print_json(&saved)?;
    }
    Ok(())
  }

  /// Cancel anything still scheduled or in flight.
  pub fn shutdown(&self) {
    self.facade.shutdown();
  }
}
