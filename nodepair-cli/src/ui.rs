use std::time::Duration;

/// Formats a duration as whole minutes and seconds (`15m 00s`).
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

/// Shortens a peer id or room id for display.
pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

/// Prints the relay startup banner.
pub fn print_relay_banner(listen_addr: &str, retention: Duration) {
    println!();
    println!("╔══════════════════════════════════════════════════════╗");
    println!("║               🔗  nodepair  relay  🔗                ║");
    println!("╠══════════════════════════════════════════════════════╣");
    println!("║  Listen    : {listen_addr:<39} ║");
    println!("║  Retention : {:<39} ║", format_duration(retention));
    println!("╚══════════════════════════════════════════════════════╝");
    println!();
    println!("  Press Ctrl-C to stop.");
}

/// Prints instructions for the other side after a token was generated.
pub fn print_token_hint(token: &str) {
    eprintln!();
    eprintln!("  Share this token with both sides, then run:");
    eprintln!("    nodepair receive --token {token}");
    eprintln!("    nodepair send --token {token} --payload '<json>'");
}
