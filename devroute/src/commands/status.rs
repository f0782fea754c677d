use devroute_daemon::paths::shorten_home;
use devroute_daemon::registry::sort_by_registration;
use devroute_protocol::{RouteBinding, ServerRegistration};

use crate::commands::running_client;
use crate::output::{self, brand_accent, brand_muted};

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let client = running_client().await?;
    let mut snapshot = client.status().await?;
    sort_by_registration(&mut snapshot.servers);
    snapshot.routes.sort_by(|a, b| a.key.cmp(&b.key));

    output::section("Servers");
    if snapshot.servers.is_empty() {
        output::muted("  No servers registered");
    }
    for line in server_lines(&snapshot.servers) {
        println!("{line}");
    }

    output::section("Routes");
    if snapshot.routes.is_empty() {
        output::muted("  No sticky routes");
    }
    for route in &snapshot.routes {
        println!("  {}", route_line(route, &snapshot.servers));
    }
    Ok(())
}

/// One line per server, grouped by app and numbered the way `route --slot`
/// counts them.
fn server_lines(servers: &[ServerRegistration]) -> Vec<String> {
    let mut apps: Vec<&str> = servers.iter().map(|s| s.bundle_id.as_str()).collect();
    apps.sort_unstable();
    apps.dedup();

    let mut lines = Vec::new();
    for app in apps {
        lines.push(format!("  {}", brand_accent(app)));
        let slots = servers.iter().filter(|s| s.bundle_id == app);
        for (i, server) in slots.enumerate() {
            lines.push(format!(
                "    [{}] {} (port {}) {}",
                i + 1,
                shorten_home(&server.root),
                server.port,
                brand_muted(&server.id)
            ));
        }
    }
    lines
}

fn route_line(route: &RouteBinding, servers: &[ServerRegistration]) -> String {
    match servers.iter().find(|s| s.id == route.server_id) {
        Some(server) => format!(
            "{} → {} (port {})",
            brand_accent(&route.key),
            shorten_home(&server.root),
            server.port
        ),
        None => format!(
            "{} → {} {}",
            brand_accent(&route.key),
            route.server_id,
            brand_muted("(not registered)")
        ),
    }
}
