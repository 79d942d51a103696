mod app;
mod config;
mod controller;
mod error;
mod events;
mod gateway;
mod logging;
mod selections;
mod sse;
mod steps;
mod stream;
mod ui;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use crossterm::event::{DisableMouseCapture, EnableMouseCapture, Event, EventStream};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use futures::StreamExt;
use ratatui::{DefaultTerminal, Terminal};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app::App;
use crate::config::LoadedConfig;
use crate::controller::GenerationUpdate;
use crate::gateway::HttpGateway;
use crate::ui::draw_ui;

/// Redraw interval while nothing else happens, drives the spinner.
const TICK: Duration = Duration::from_millis(100);

/// Design a character portrait, then stream a backstory for it.
#[derive(Parser)]
#[command(name = "character-designer", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();

    // Configuration first: it carries the log level
    let loaded_config = config::load_config(cli.config);

    let (session_id, log_directory, _guard) = match logging::init(&loaded_config.config.logging.level)
    {
        Ok(ctx) => (Some(ctx.session_id), Some(ctx.log_directory), Some(ctx._guard)),
        Err(e) => {
            eprintln!("Warning: Failed to initialize logging: {}", e);
            (None, None, None)
        }
    };
    if let Some(dir) = &log_directory {
        logging::cleanup_old_logs(dir);
    }

    debug!(
        config_path = %loaded_config.config_path.display(),
        status = ?loaded_config.status,
        "config_loaded"
    );

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let terminal = Terminal::new(ratatui::backend::CrosstermBackend::new(stdout))?;

    let result = run_app(
        terminal,
        session_id.clone().unwrap_or_else(|| "------".to_string()),
        log_directory,
        loaded_config,
    )
    .await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(io::stdout(), LeaveAlternateScreen, DisableMouseCapture)?;

    if let Some(sid) = session_id {
        info!(
            session_id = %sid,
            duration_secs = start_time.elapsed().as_secs_f64(),
            "session_end"
        );
    }

    result
}

async fn run_app(
    mut terminal: DefaultTerminal,
    session_id: String,
    log_directory: Option<PathBuf>,
    loaded_config: LoadedConfig,
) -> Result<()> {
    let gateway = Arc::new(HttpGateway::new(&loaded_config.config));
    let (updates_tx, mut updates_rx) = mpsc::unbounded_channel::<GenerationUpdate>();
    let mut app = App::new(session_id, log_directory, loaded_config, gateway, updates_tx);

    let mut events = EventStream::new();
    let mut tick = tokio::time::interval(TICK);

    loop {
        terminal.draw(|f| draw_ui(f, &mut app))?;

        tokio::select! {
            maybe_event = events.next() => match maybe_event {
                Some(Ok(Event::Key(key))) => app.handle_key(key),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "terminal_event_failed");
                    return Err(e.into());
                }
                None => return Ok(()),
            },
            Some(update) = updates_rx.recv() => app.handle_update(update),
            _ = tick.tick() => {}
        }

        if app.should_quit {
            app.go_home();
            return Ok(());
        }
    }
}
