use colored::*;
use std::io::Write;
use std::net::TcpStream;
use std::time::Duration;

/// Shared CLI implementation for the `coach` binary.
pub fn run(args: Vec<String>) -> anyhow::Result<()> {
    let bin = args
        .first()
        .map(|s| s.as_str())
        .unwrap_or("coach")
        .to_string();

    if args.len() < 2 {
        print_usage(&bin);
        return Ok(());
    }

    let command = &args[1];

    match command.as_str() {
        "send" => {
            if args.len() < 4 {
                eprintln!("{}", format!("Usage: {} send <peer_id> <message>", bin).yellow());
                return Ok(());
            }
            let peer_id = args[2].parse::<i64>().ok();
            if peer_id.is_none() {
                eprintln!("{}", "peer_id must be a number".yellow());
                return Ok(());
            }
            let message = args[3..].join(" ");
            send_message(peer_id, message)?;
        }
        "history" => {
            let peer_id = args.get(2).and_then(|s| s.parse::<i64>().ok());
            let limit = args.get(3).and_then(|s| s.parse::<usize>().ok());
            show_history(peer_id, limit)?;
        }
        "threads" => {
            list_threads()?;
        }
        "status" => {
            show_status()?;
        }
        _ => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), command.red());
            print_usage(&bin);
        }
    }

    Ok(())
}

fn print_usage(bin: &str) {
    println!("{}", "💬 CoachLink CLI".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!("  {} <command> [args]", bin.cyan());
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!(
        "  {} <peer_id> <message>     Send a message to a client or trainer",
        "send".cyan()
    );
    println!(
        "  {} [peer_id] [limit]    Show conversation history",
        "history".cyan()
    );
    println!(
        "  {}                     List client threads (trainer mode)",
        "threads".cyan()
    );
    println!("  {}                      Show client status", "status".cyan());
}

fn get_api_port() -> u16 {
    if let Ok(port) = std::env::var("COACHLINK_API_PORT") {
        if let Ok(p) = port.parse::<u16>() {
            return p;
        }
    }
    // Probe the local range around the default port
    for port in 7330..=7360 {
        match TcpStream::connect(format!("127.0.0.1:{}", port)) {
            Ok(_) => {
                eprintln!(
                    "{} Connected to API on port {}",
                    "✓".green(),
                    port.to_string().cyan()
                );
                return port;
            }
            Err(_) => continue,
        }
    }
    eprintln!(
        "{}",
        "✗ Error: Could not find a running CoachLink client".red().bold()
    );
    eprintln!("  Make sure the client is running and try:");
    eprintln!(
        "  {} {}",
        "-".dimmed(),
        "COACHLINK_API_PORT=7340 cargo run --bin coach -- status".yellow()
    );
    std::process::exit(1);
}

fn request(body: serde_json::Value) -> anyhow::Result<serde_json::Value> {
    let api_port = get_api_port();
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", api_port))?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;

    writeln!(stream, "{}", body)?;

    let mut response = String::new();
    use std::io::BufRead;
    std::io::BufReader::new(&stream).read_line(&mut response)?;

    Ok(serde_json::from_str(&response)?)
}

fn fail(resp: &serde_json::Value) -> ! {
    let error = resp["error"].as_str().unwrap_or("Unknown error");
    eprintln!("{} Error: {}", "✗".red().bold(), error.red());
    std::process::exit(1);
}

fn send_message(peer_id: Option<i64>, message: String) -> anyhow::Result<()> {
    let resp = request(serde_json::json!({
        "command": "send",
        "peer_id": peer_id,
        "message": message
    }))?;

    if resp["success"].as_bool().unwrap_or(false) {
        println!("{} Message sent!", "✓".green().bold());
    } else {
        fail(&resp);
    }

    Ok(())
}

fn show_history(peer_id: Option<i64>, limit: Option<usize>) -> anyhow::Result<()> {
    let resp = request(serde_json::json!({
        "command": "history",
        "peer_id": peer_id,
        "limit": limit
    }))?;

    if resp["success"].as_bool().unwrap_or(false) {
        let empty = Vec::new();
        let messages = resp["data"]["messages"].as_array().unwrap_or(&empty);
        if messages.is_empty() {
            println!("{}", "No messages yet".yellow());
            return Ok(());
        }
        println!(
            "{}",
            format!("Messages ({})", messages.len()).bright_cyan().bold()
        );
        println!("{}", "─".repeat(60).dimmed());
        for msg in messages {
            let sender = msg["sender_id"].as_i64().unwrap_or(0);
            let text = msg["text"].as_str().unwrap_or("?");
            let time = msg["timestamp"].as_str().unwrap_or("?");
            let delivery = msg["delivery"].as_str().unwrap_or("sent");
            let marker = match delivery {
                "sending" => "…".yellow(),
                "failed" => "✗".red(),
                _ => "✓".green(),
            };
            println!(
                "  {} {} {}: {}",
                marker,
                time.dimmed(),
                sender.to_string().cyan(),
                text
            );
        }
    } else {
        fail(&resp);
    }

    Ok(())
}

fn list_threads() -> anyhow::Result<()> {
    let resp = request(serde_json::json!({ "command": "threads" }))?;

    if resp["success"].as_bool().unwrap_or(false) {
        let empty = Vec::new();
        let threads = resp["data"]["threads"].as_array().unwrap_or(&empty);
        if threads.is_empty() {
            println!("{}", "No client threads yet".yellow());
            return Ok(());
        }
        println!(
            "{}",
            format!("Client threads ({})", threads.len())
                .bright_cyan()
                .bold()
        );
        println!("{}", "─".repeat(60).dimmed());
        for thread in threads {
            let peer = thread["peer_id"].as_i64().unwrap_or(0);
            let preview = thread["last_preview"].as_str().unwrap_or("");
            let unread = thread["unread"].as_u64().unwrap_or(0);
            let badge = if unread > 0 {
                format!("[{} unread]", unread).yellow().bold()
            } else {
                "".normal()
            };
            println!("  {} {}  {}", peer.to_string().cyan(), badge, preview);
        }
    } else {
        fail(&resp);
    }

    Ok(())
}

fn show_status() -> anyhow::Result<()> {
    let resp = request(serde_json::json!({ "command": "status" }))?;

    if resp["success"].as_bool().unwrap_or(false) {
        if let Some(data) = resp["data"].as_object() {
            println!(
                "{}",
                "╭─ CoachLink Client Status ─────────────────────────────────────╮".bright_cyan()
            );
            let role = data["role"].as_str().unwrap_or("?");
            println!(
                "{} {}",
                "│".bright_cyan(),
                format!("Role:      {}", role.cyan()).bright_white()
            );
            if let Some(threads) = data["threads"].as_u64() {
                println!(
                    "{} {}",
                    "│".bright_cyan(),
                    format!("Threads:   {}", threads.to_string().green()).bright_white()
                );
            }
            if let Some(messages) = data["messages"].as_u64() {
                println!(
                    "{} {}",
                    "│".bright_cyan(),
                    format!("Messages:  {}", messages.to_string().green()).bright_white()
                );
            }
            if let Some(watermark) = data["watermark"].as_str() {
                println!(
                    "{} {}",
                    "│".bright_cyan(),
                    format!("Watermark: {}", watermark.dimmed()).bright_white()
                );
            }
            println!(
                "{}",
                "╰───────────────────────────────────────────────────────────────╯".bright_cyan()
            );
        }
    } else {
        fail(&resp);
    }

    Ok(())
}
