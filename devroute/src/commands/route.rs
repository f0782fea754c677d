use std::path::{Path, PathBuf};

use devroute_daemon::paths::{expand_home, shorten_home};
use devroute_daemon::registry::sort_by_registration;
use devroute_protocol::ServerRegistration;

use crate::commands::running_client;
use crate::output;

/// Which of an app's servers to pin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// 1-based, in registration order.
    Slot(usize),
    Project(PathBuf),
}

pub async fn run(app: &str, target: Target) -> Result<(), Box<dyn std::error::Error>> {
    let client = running_client().await?;
    let snapshot = client.status().await?;
    let cwd = std::env::current_dir()?;
    let server = select_server(snapshot.servers, app, &target, &cwd)?;

    client.set_route(app, &server.id).await?;
    output::success(&format!(
        "Routing {app} to {} (port {})",
        shorten_home(&server.root),
        server.port
    ));
    Ok(())
}

pub async fn clear(app: &str) -> Result<(), Box<dyn std::error::Error>> {
    let client = running_client().await?;
    client.clear_route(app).await?;
    output::success(&format!("Cleared route for {app}"));
    Ok(())
}

fn select_server(
    mut servers: Vec<ServerRegistration>,
    app: &str,
    target: &Target,
    cwd: &Path,
) -> Result<ServerRegistration, String> {
    servers.retain(|s| s.bundle_id == app);
    if servers.is_empty() {
        return Err(format!("No servers registered for app: {app}"));
    }
    sort_by_registration(&mut servers);

    match target {
        Target::Slot(slot) => {
            let count = servers.len();
            slot.checked_sub(1)
                .and_then(|i| servers.into_iter().nth(i))
                .ok_or_else(|| {
                    format!("Slot {slot} is out of range for {app} (1-{count})")
                })
        }
        Target::Project(project) => {
            let wanted = normalize_root(project, cwd);
            servers
                .into_iter()
                .find(|s| normalize_root(Path::new(&s.root), cwd) == wanted)
                .ok_or_else(|| {
                    format!(
                        "No server for {app} runs from {}",
                        shorten_home(&wanted.to_string_lossy())
                    )
                })
        }
    }
}

/// Absolute form of a project path: `~` expanded, relative paths joined to
/// `cwd`, trailing separators dropped.
fn normalize_root(path: &Path, cwd: &Path) -> PathBuf {
    let expanded = PathBuf::from(expand_home(&path.to_string_lossy()));
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        cwd.join(expanded)
    };
    absolute.components().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(seq: u64, bundle: &str, root: &str, registered_at: u64) -> ServerRegistration {
        ServerRegistration {
            id: format!("server-{seq}"),
            port: 3000 + seq as u16,
            bundle_id: bundle.to_string(),
            root: root.to_string(),
            registered_at,
            last_active_at: None,
            pid: None,
        }
    }

    fn servers() -> Vec<ServerRegistration> {
        vec![
            server(3, "com.app", "/work/three", 30),
            server(1, "com.app", "/work/one", 10),
            server(2, "com.other", "/work/two", 20),
            server(4, "com.app", "/work/four/", 30),
        ]
    }

    #[test]
    fn slots_count_from_one_in_registration_order() {
        let cwd = Path::new("/");
        let pick = |n| select_server(servers(), "com.app", &Target::Slot(n), cwd).map(|s| s.id);
        assert_eq!(pick(1).unwrap(), "server-1");
        assert_eq!(pick(2).unwrap(), "server-3");
        assert_eq!(pick(3).unwrap(), "server-4");
    }

    #[test]
    fn slot_out_of_range_is_an_error() {
        let cwd = Path::new("/");
        for slot in [0, 4] {
            let err = select_server(servers(), "com.app", &Target::Slot(slot), cwd).unwrap_err();
            assert!(err.contains("out of range"), "{err}");
        }
    }

    #[test]
    fn unknown_app_is_an_error() {
        let err =
            select_server(servers(), "com.none", &Target::Slot(1), Path::new("/")).unwrap_err();
        assert_eq!(err, "No servers registered for app: com.none");
    }

    #[test]
    fn project_matches_root_ignoring_trailing_slash() {
        let target = Target::Project(PathBuf::from("/work/four"));
        let found = select_server(servers(), "com.app", &target, Path::new("/")).unwrap();
        assert_eq!(found.id, "server-4");
    }

    #[test]
    fn relative_project_resolves_against_cwd() {
        let target = Target::Project(PathBuf::from("three"));
        let found = select_server(servers(), "com.app", &target, Path::new("/work")).unwrap();
        assert_eq!(found.id, "server-3");
    }

    #[test]
    fn project_of_another_app_is_not_selected() {
        let target = Target::Project(PathBuf::from("/work/two"));
        let err = select_server(servers(), "com.app", &target, Path::new("/")).unwrap_err();
        assert!(err.starts_with("No server for com.app runs from"), "{err}");
    }
}
