//! Raw-mode terminal menu.

use std::io::{self, Write};
use std::time::Duration;

use console::style;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use devroute_protocol::Simulator;
use tokio::sync::watch;

use super::{PickRequest, server_label};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuKey {
    Char(char),
    Enter,
    Backspace,
    Escape,
    CtrlC,
}

impl MenuKey {
    pub fn from_key_event(key: &KeyEvent) -> Option<Self> {
        match key.code {
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                Some(Self::CtrlC)
            }
            KeyCode::Char(c) => Some(Self::Char(c)),
            KeyCode::Enter => Some(Self::Enter),
            KeyCode::Backspace => Some(Self::Backspace),
            KeyCode::Esc => Some(Self::Escape),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuAction {
    Select { index: usize, remember: bool },
    Cancel,
    /// Input that names no candidate; the menu keeps reading.
    Invalid(String),
}

/// Keystroke buffer for the menu.
///
/// A single digit `1`-`9` selects immediately, as does `r` followed by a
/// digit (remember). Longer numbers are confirmed with Enter.
#[derive(Debug, Default)]
pub struct MenuInput {
    buffer: String,
}

impl MenuInput {
    pub fn feed(&mut self, key: MenuKey, count: usize) -> Option<MenuAction> {
        match key {
            MenuKey::CtrlC | MenuKey::Escape => {
                self.buffer.clear();
                Some(MenuAction::Cancel)
            }
            MenuKey::Backspace => {
                self.buffer.pop();
                None
            }
            MenuKey::Enter => {
                let input = std::mem::take(&mut self.buffer);
                if input.is_empty() {
                    None
                } else {
                    Some(process(&input, count))
                }
            }
            MenuKey::Char(c) => {
                self.buffer.push(c);
                if self.buffer.eq_ignore_ascii_case("c") {
                    self.buffer.clear();
                    return Some(MenuAction::Cancel);
                }
                if is_immediate(&self.buffer) {
                    let input = std::mem::take(&mut self.buffer);
                    return Some(process(&input, count));
                }
                None
            }
        }
    }
}

fn is_immediate(buffer: &str) -> bool {
    let bytes = buffer.as_bytes();
    match bytes {
        [d] => matches!(d, b'1'..=b'9'),
        [r, d] => matches!(r, b'r' | b'R') && matches!(d, b'1'..=b'9'),
        _ => false,
    }
}

fn process(input: &str, count: usize) -> MenuAction {
    let trimmed = input.trim();
    let (digits, remember) = match trimmed.strip_prefix(['r', 'R']) {
        Some(rest) => (rest, true),
        None => (trimmed, false),
    };
    match digits.parse::<usize>() {
        Ok(n) if (1..=count).contains(&n) => MenuAction::Select {
            index: n - 1,
            remember,
        },
        _ => MenuAction::Invalid(input.to_string()),
    }
}

pub fn print_menu(request: &PickRequest, simulators: &[Simulator]) {
    let rule = style("─".repeat(50)).dim();
    eprintln!();
    eprintln!("{rule}");
    eprintln!(
        "{} {}",
        style("Multiple servers for").bold(),
        style(&request.bundle_id).cyan().bold()
    );

    if !simulators.is_empty() {
        eprintln!();
        eprintln!("{}", style("Running simulators:").dim());
        for sim in simulators {
            let short: String = sim.udid.chars().take(8).collect();
            eprintln!("  • {} {}", sim.name, style(format!("({short}…)")).dim());
        }
    }

    eprintln!();
    eprintln!("Select project:");
    for (i, server) in request.servers.iter().enumerate() {
        eprintln!("  {} {}", style(format!("[{}]", i + 1)).cyan(), server_label(server));
    }
    eprintln!();
    eprintln!(
        "{}",
        style(format!("Press 1-{} to select", request.servers.len())).dim()
    );
    eprintln!("{}", style("Or 'r' + number to remember (e.g., 'r1')").dim());
    eprintln!("{}", style("Press 'c' to cancel").dim());
    eprintln!("{rule}");
}

/// Raw-mode switches for the terminal the menu reads from.
pub struct TerminalMode {
    pub enable: fn() -> io::Result<()>,
    pub disable: fn() -> io::Result<()>,
}

pub const CROSSTERM_MODE: TerminalMode = TerminalMode {
    enable: terminal::enable_raw_mode,
    disable: terminal::disable_raw_mode,
};

/// One menu owns the terminal at a time.
static TERMINAL: parking_lot::Mutex<()> = parking_lot::const_mutex(());

/// Exclusive ownership of the terminal. Raw mode, once entered, is switched
/// off before the next owner can claim it.
pub struct TerminalLease<'a> {
    mode: &'a TerminalMode,
    raw: bool,
    _owner: parking_lot::MutexGuard<'static, ()>,
}

impl<'a> TerminalLease<'a> {
    /// Block until no other menu owns the terminal.
    pub fn claim(mode: &'a TerminalMode) -> Self {
        Self {
            mode,
            raw: false,
            _owner: TERMINAL.lock(),
        }
    }

    pub fn enter_raw(&mut self) -> io::Result<()> {
        if !self.raw {
            (self.mode.enable)()?;
            self.raw = true;
        }
        Ok(())
    }
}

impl Drop for TerminalLease<'_> {
    fn drop(&mut self) {
        if self.raw {
            let _ = (self.mode.disable)();
        }
    }
}

/// Show the menu and read a selection once this menu owns the terminal.
/// Returns `None` when `stop` flips first. Blocking; run it on a blocking
/// thread.
pub fn run_menu(
    request: &PickRequest,
    simulators: &[Simulator],
    stop: &watch::Receiver<bool>,
) -> io::Result<Option<MenuAction>> {
    let mut lease = TerminalLease::claim(&CROSSTERM_MODE);
    if *stop.borrow() {
        return Ok(None);
    }
    print_menu(request, simulators);
    lease.enter_raw()?;
    read_selection(request.servers.len(), stop)
}

fn read_selection(count: usize, stop: &watch::Receiver<bool>) -> io::Result<Option<MenuAction>> {
    let mut input = MenuInput::default();

    while !*stop.borrow() {
        if !event::poll(POLL_INTERVAL)? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind == KeyEventKind::Release {
            continue;
        }
        let Some(key) = MenuKey::from_key_event(&key) else {
            continue;
        };

        match input.feed(key, count) {
            Some(MenuAction::Invalid(raw)) => {
                let mut stderr = io::stderr();
                write!(stderr, "Invalid selection: {raw}\r\n")?;
                stderr.flush()?;
            }
            Some(action) => return Ok(Some(action)),
            None => {}
        }
    }
    Ok(None)
}
