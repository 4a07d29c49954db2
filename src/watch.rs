//! Foreground watcher
//!
//! Keeps a session open in the terminal. Terminal focus stands in for page
//! visibility: regaining focus re-validates the session. Every state change
//! is printed together with what the route guard shows for the watched path.

use anyhow::{Context, Result};
use crossterm::event::{
    DisableFocusChange, EnableFocusChange, Event, EventStream, KeyCode, KeyEventKind, KeyModifiers,
};
use crossterm::{execute, terminal};
use futures::StreamExt;
use tokio_stream::wrappers::WatchStream;

use crate::session::guard::RouteGuard;
use crate::session::{SessionContext, SessionState, Visibility};

#[derive(Debug, PartialEq, Eq)]
enum Action {
    Visibility(Visibility),
    Quit,
    Ignore,
}

fn action_for(event: &Event) -> Action {
    match event {
        Event::FocusGained => Action::Visibility(Visibility::Visible),
        Event::FocusLost => Action::Visibility(Visibility::Hidden),
        Event::Key(key) if key.kind == KeyEventKind::Press => match key.code {
            KeyCode::Char('q') | KeyCode::Esc => Action::Quit,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Action::Quit,
            _ => Action::Ignore,
        },
        _ => Action::Ignore,
    }
}

/// Raw mode with focus reporting, restored on drop.
struct RawTerminal;

impl RawTerminal {
    fn enable() -> Result<Self> {
        terminal::enable_raw_mode().context("Failed to enable raw mode")?;
        if let Err(e) = execute!(std::io::stdout(), EnableFocusChange) {
            let _ = terminal::disable_raw_mode();
            return Err(e).context("Failed to enable focus reporting");
        }
        Ok(Self)
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        let _ = execute!(std::io::stdout(), DisableFocusChange);
        let _ = terminal::disable_raw_mode();
    }
}

fn describe(guard: &mut RouteGuard, state: &SessionState, path: &str) -> String {
    let who = state
        .user
        .as_ref()
        .map(|u| if u.email.is_empty() { u.subject.as_str() } else { u.email.as_str() })
        .unwrap_or("-");
    let view = guard.render(state, path);
    format!("{:?} (user: {}) {} -> {:?}", state.status, who, path, view)
}

/// Run until `q`, Esc or Ctrl-C.
pub async fn run(ctx: SessionContext, mut guard: RouteGuard, path: &str) -> Result<()> {
    let mut states = WatchStream::new(ctx.subscribe());
    let mut events = EventStream::new();
    let _raw = RawTerminal::enable()?;

    print!("Watching session for {} (q to quit)\r\n", path);
    loop {
        tokio::select! {
            Some(state) = states.next() => {
                print!("{}\r\n", describe(&mut guard, &state, path));
            }
            event = events.next() => match event {
                Some(Ok(event)) => match action_for(&event) {
                    Action::Visibility(visibility) => {
                        tracing::debug!("Terminal focus: {:?}", visibility);
                        ctx.on_visibility_change(visibility).await;
                    }
                    Action::Quit => break,
                    Action::Ignore => {}
                },
                Some(Err(e)) => return Err(e).context("Failed to read terminal events"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    ctx.shutdown();
    Ok(())
}
