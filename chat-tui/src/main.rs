/// Live conversation monitor
/// Renders the CoachLink client's event feed in the terminal
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Terminal,
};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

const DEFAULT_MONITOR_PORT: u16 = 7399;
const FEED_CAPACITY: usize = 200;

#[derive(Debug, Clone, PartialEq)]
enum LineKind {
    Message,
    Delivered,
    Failed,
    PollFailed,
}

#[derive(Debug, Clone)]
struct FeedLine {
    kind: LineKind,
    peer: Option<i64>,
    text: String,
    received_at: Instant,
}

#[derive(Debug, Clone, Default)]
struct ThreadStats {
    messages: u64,
    failed: u64,
}

#[derive(Debug)]
struct Feed {
    lines: VecDeque<FeedLine>,
    threads: BTreeMap<i64, ThreadStats>,
    delivered: u64,
    poll_failures: u64,
    last_event: Option<String>,
}

impl Feed {
    fn new() -> Self {
        Self {
            lines: VecDeque::new(),
            threads: BTreeMap::new(),
            delivered: 0,
            poll_failures: 0,
            last_event: None,
        }
    }

    fn push(&mut self, line: FeedLine) {
        if self.lines.len() >= FEED_CAPACITY {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn apply(&mut self, msg: &str) {
        self.last_event = Some(msg.to_string());
        let v: serde_json::Value = match serde_json::from_str(msg) {
            Ok(v) => v,
            Err(_) => return,
        };
        let kind = v.get("type").and_then(|x| x.as_str()).unwrap_or("");
        let peer = v.get("peer_id").and_then(|x| x.as_i64());

        match kind {
            "new_message" => {
                let sender = v
                    .pointer("/message/sender_id")
                    .and_then(|x| x.as_i64())
                    .unwrap_or(0);
                let text = v
                    .pointer("/message/text")
                    .and_then(|x| x.as_str())
                    .unwrap_or("")
                    .to_string();
                let delivery = v
                    .pointer("/message/delivery")
                    .and_then(|x| x.as_str())
                    .unwrap_or("sent");
                if let Some(peer) = peer {
                    self.threads.entry(peer).or_default().messages += 1;
                }
                let marker = if delivery == "sending" { "…" } else { "•" };
                self.push(FeedLine {
                    kind: LineKind::Message,
                    peer,
                    text: format!("{} {}: {}", marker, sender, text),
                    received_at: Instant::now(),
                });
            }
            "message_delivered" => {
                self.delivered += 1;
                let id = v.get("id").and_then(|x| x.as_i64()).unwrap_or(0);
                self.push(FeedLine {
                    kind: LineKind::Delivered,
                    peer,
                    text: format!("✓ delivered #{}", id),
                    received_at: Instant::now(),
                });
            }
            "send_failed" => {
                if let Some(peer) = peer {
                    self.threads.entry(peer).or_default().failed += 1;
                }
                let text = v.get("text").and_then(|x| x.as_str()).unwrap_or("");
                self.push(FeedLine {
                    kind: LineKind::Failed,
                    peer,
                    text: format!("✗ send failed: {}", text),
                    received_at: Instant::now(),
                });
            }
            "poll_failed" => {
                self.poll_failures += 1;
                let reason = v.get("reason").and_then(|x| x.as_str()).unwrap_or("?");
                self.push(FeedLine {
                    kind: LineKind::PollFailed,
                    peer: None,
                    text: format!("⚠ poll failed: {}", reason),
                    received_at: Instant::now(),
                });
            }
            _ => {}
        }
    }
}

fn monitor_port() -> u16 {
    std::env::var("COACHLINK_MONITOR_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(DEFAULT_MONITOR_PORT)
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // UDP listener for the client's event datagrams
    let port = monitor_port();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let sock = UdpSocket::bind(("127.0.0.1", port))
            .await
            .expect("bind monitor port");
        let mut buf = vec![0u8; 4096];
        loop {
            if let Ok((n, _)) = sock.recv_from(&mut buf).await {
                if let Ok(s) = std::str::from_utf8(&buf[..n]) {
                    let _ = tx.send(s.to_string());
                }
            }
        }
    });

    // TUI setup
    enable_raw_mode()?;
    let mut stdout = std::io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    let res = run_app(&mut terminal, &mut rx);
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    if let Err(e) = res {
        eprintln!("TUI error: {e}");
    }
    Ok(())
}

fn run_app<B: ratatui::backend::Backend>(
    terminal: &mut Terminal<B>,
    rx: &mut mpsc::UnboundedReceiver<String>,
) -> std::io::Result<()> {
    let mut feed = Feed::new();
    let mut last_redraw = Instant::now();

    loop {
        // Process events
        while let Ok(msg) = rx.try_recv() {
            feed.apply(&msg);
        }

        // Handle keys
        if crossterm::event::poll(Duration::from_millis(5))? {
            if let Event::Key(key) = event::read()? {
                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                    _ => {}
                }
            }
        }

        // Redraw
        if last_redraw.elapsed() >= Duration::from_millis(50) {
            terminal.draw(|f| {
                let rows = Layout::default()
                    .direction(Direction::Vertical)
                    .constraints([Constraint::Min(0), Constraint::Length(3)].as_ref())
                    .split(f.size());
                let cols = Layout::default()
                    .direction(Direction::Horizontal)
                    .constraints([Constraint::Length(26), Constraint::Min(0)].as_ref())
                    .split(rows[0]);

                // Thread sidebar
                let mut thread_lines = Vec::new();
                for (peer, stats) in &feed.threads {
                    let mut spans = vec![
                        Span::styled(
                            format!("{:>6}", peer),
                            Style::default()
                                .fg(Color::Cyan)
                                .add_modifier(Modifier::BOLD),
                        ),
                        Span::raw(format!("  {:>4} msg", stats.messages)),
                    ];
                    if stats.failed > 0 {
                        spans.push(Span::styled(
                            format!("  {} failed", stats.failed),
                            Style::default().fg(Color::Red),
                        ));
                    }
                    thread_lines.push(Line::from(spans));
                }
                if thread_lines.is_empty() {
                    thread_lines.push(Line::from(Span::styled(
                        "no threads yet",
                        Style::default().fg(Color::DarkGray),
                    )));
                }
                let threads = Paragraph::new(thread_lines).block(
                    Block::default()
                        .title(" THREADS ")
                        .borders(Borders::ALL)
                        .border_style(Style::default().fg(Color::Cyan)),
                );
                f.render_widget(threads, cols[0]);

                // Message feed, newest at the bottom
                let visible = rows[0].height.saturating_sub(2) as usize;
                let start = feed.lines.len().saturating_sub(visible);
                let mut feed_lines = Vec::new();
                for line in feed.lines.iter().skip(start) {
                    let fresh = line.received_at.elapsed() < Duration::from_secs(2);
                    let base = match line.kind {
                        LineKind::Message => Color::White,
                        LineKind::Delivered => Color::Green,
                        LineKind::Failed => Color::Red,
                        LineKind::PollFailed => Color::Yellow,
                    };
                    let style = if fresh {
                        Style::default().fg(base).add_modifier(Modifier::BOLD)
                    } else {
                        Style::default().fg(base)
                    };
                    let prefix = match line.peer {
                        Some(peer) => format!("[{}] ", peer),
                        None => String::new(),
                    };
                    feed_lines.push(Line::from(Span::styled(
                        format!("{}{}", prefix, line.text),
                        style,
                    )));
                }
                let messages = Paragraph::new(feed_lines).block(
                    Block::default()
                        .title(" COACHLINK LIVE FEED ")
                        .title_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
                        .borders(Borders::ALL)
                        .border_style(Style::default().fg(Color::Cyan)),
                );
                f.render_widget(messages, cols[1]);

                // Status bar
                let info = format!(
                    " Threads: {} | Delivered: {} | Poll failures: {} | Press 'q' to quit ",
                    feed.threads.len(),
                    feed.delivered,
                    feed.poll_failures
                );
                let info_para = Paragraph::new(info)
                    .style(Style::default().fg(Color::Cyan))
                    .block(
                        Block::default()
                            .borders(Borders::ALL)
                            .border_style(Style::default().fg(Color::Cyan)),
                    );
                f.render_widget(info_para, rows[1]);
            })?;
            last_redraw = Instant::now();
        }

        std::thread::sleep(Duration::from_millis(8));
    }
}
