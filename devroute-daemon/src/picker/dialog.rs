//! Native chooser on macOS via `osascript`.

use std::io;

use devroute_protocol::{ServerRegistration, Simulator};
use tokio::process::Command;

use super::{PickOutcome, PickRequest, Selection, server_label};

const REMEMBER_BUTTON: &str = "Remember";
const ONCE_BUTTON: &str = "Just once";
const CANCEL_OUTPUT: &str = "cancel";
/// AppleScript "User canceled."
const USER_CANCELED: &str = "-128";

/// Show the chooser and wait for an answer. The child is killed when the
/// returned future is dropped.
pub async fn choose(request: &PickRequest, simulators: &[Simulator]) -> io::Result<PickOutcome> {
    let script = build_script(request, simulators);
    let out = Command::new("osascript")
        .arg("-e")
        .arg(script)
        .kill_on_drop(true)
        .output()
        .await?;

    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        if stderr.contains(USER_CANCELED) {
            return Ok(PickOutcome::Cancelled);
        }
        return Err(io::Error::other(format!(
            "osascript failed: {}",
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&out.stdout);
    parse_output(&stdout, &request.servers).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unrecognized dialog output: {}", stdout.trim()),
        )
    })
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

pub fn build_script(request: &PickRequest, simulators: &[Simulator]) -> String {
    let items: Vec<String> = request
        .servers
        .iter()
        .enumerate()
        .map(|(i, s)| quote(&format!("[{}] {}", i + 1, server_label(s))))
        .collect();

    let mut prompt = format!("Multiple servers for {}.", request.bundle_id);
    if !simulators.is_empty() {
        let names: Vec<&str> = simulators.iter().map(|s| s.name.as_str()).collect();
        prompt.push_str(&format!("\nSimulators: {}", names.join(", ")));
    }
    prompt.push_str("\nSelect project:");

    let title = quote("devroute");
    let remember_prompt = quote(&format!("Remember this choice for {}?", request.bundle_id));

    format!(
        "set choices to {{{items}}}\n\
         set picked to choose from list choices with title {title} with prompt {prompt} default items {{item 1 of choices}}\n\
         if picked is false then return {cancel}\n\
         set answer to button returned of (display dialog {remember_prompt} buttons {{{once}, {remember}}} default button {once} with title {title})\n\
         return (item 1 of picked) & linefeed & answer",
        items = items.join(", "),
        prompt = quote(&prompt),
        cancel = quote(CANCEL_OUTPUT),
        once = quote(ONCE_BUTTON),
        remember = quote(REMEMBER_BUTTON),
    )
}

/// Interpret the script's stdout: `cancel`, or the chosen item followed by
/// the remember button on the next line.
pub fn parse_output(stdout: &str, servers: &[ServerRegistration]) -> Option<PickOutcome> {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let first = lines.next()?;
    if first == CANCEL_OUTPUT {
        return Some(PickOutcome::Cancelled);
    }

    let number = first.strip_prefix('[')?.split_once(']')?.0;
    let index = number.parse::<usize>().ok()?.checked_sub(1)?;
    let server = servers.get(index)?.clone();
    let remember = lines.next() == Some(REMEMBER_BUTTON);
    Some(PickOutcome::Selected(Selection { server, remember }))
}
