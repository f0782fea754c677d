use std::path::{Path, PathBuf};

const SOCKET_FILENAME: &str = "daemon.sock";
const SERVERS_FILENAME: &str = "servers.json";

/// Get the per-user daemon directory.
///
/// `DEVROUTE_HOME` wins when set; otherwise `~/.devroute`.
pub fn devroute_home_dir() -> Result<PathBuf, std::io::Error> {
    if let Ok(v) = std::env::var("DEVROUTE_HOME")
        && !v.trim().is_empty()
    {
        return Ok(PathBuf::from(v));
    }

    let home = dirs::home_dir().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Could not determine home directory",
        )
    })?;

    Ok(home.join(".devroute"))
}

pub fn socket_path(home: &Path) -> PathBuf {
    home.join(SOCKET_FILENAME)
}

pub fn servers_file_path(home: &Path) -> PathBuf {
    home.join(SERVERS_FILENAME)
}

/// Replace a leading home directory with `~` for display.
pub fn shorten_home(path: &str) -> String {
    match dirs::home_dir() {
        Some(home) => shorten_with_home(path, &home),
        None => path.to_string(),
    }
}

fn shorten_with_home(path: &str, home: &Path) -> String {
    let home = home.to_string_lossy();
    let home = home.trim_end_matches('/');
    if home.is_empty() {
        return path.to_string();
    }
    match path.strip_prefix(home) {
        Some("") => "~".to_string(),
        Some(rest) if rest.starts_with('/') => format!("~{rest}"),
        _ => path.to_string(),
    }
}

/// Expand a leading `~` using the current home directory.
pub fn expand_home(path: &str) -> String {
    let Some(rest) = path.strip_prefix('~') else {
        return path.to_string();
    };
    if !(rest.is_empty() || rest.starts_with('/')) {
        return path.to_string();
    }
    match dirs::home_dir() {
        Some(home) => format!("{}{}", home.to_string_lossy().trim_end_matches('/'), rest),
        None => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn socket_and_servers_file_live_under_home() {
        let home = PathBuf::from("/tmp/devroute-home");
        assert_eq!(
            socket_path(&home),
            PathBuf::from("/tmp/devroute-home/daemon.sock")
        );
        assert_eq!(
            servers_file_path(&home),
            PathBuf::from("/tmp/devroute-home/servers.json")
        );
    }

    #[test]
    fn shorten_replaces_home_prefix_only_on_component_boundary() {
        let home = Path::new("/Users/me");
        assert_eq!(shorten_with_home("/Users/me/proj/a", home), "~/proj/a");
        assert_eq!(shorten_with_home("/Users/me", home), "~");
        assert_eq!(shorten_with_home("/Users/meow/proj", home), "/Users/meow/proj");
        assert_eq!(shorten_with_home("/opt/proj", home), "/opt/proj");
    }

    #[test]
    fn expand_home_leaves_other_paths_alone() {
        assert_eq!(expand_home("/abs/path"), "/abs/path");
        assert_eq!(expand_home("~user/x"), "~user/x");
    }

    #[test]
    fn home_dir_respects_env_override() {
        let temp = TempDir::new().unwrap();
        unsafe {
            std::env::set_var("DEVROUTE_HOME", temp.path());
        }
        let got = devroute_home_dir().unwrap();
        unsafe {
            std::env::remove_var("DEVROUTE_HOME");
        }
        assert_eq!(got, temp.path());
    }
}
