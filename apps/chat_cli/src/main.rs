use std::{collections::HashSet, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use chat_client::{
    config::load_settings_from, load_settings, ChatEvent, ChatSession, ChatTransport,
    HttpChatApi, MessageTimeline, MissingTransport, SendOutcome, SessionOptions, TimelineRow,
    WsTransport,
};
use chrono::{Local, NaiveDate};
use clap::Parser;
use shared::{
    domain::{ClientKey, LocalUser, MessageId, ProductId, UserId},
    protocol::ChatMessage,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Terminal chat with the seller of a marketplace product")]
struct Args {
    #[arg(long)]
    product_id: String,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    user_name: Option<String>,
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    ws_url: Option<String>,
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Prints each message once, with a separator whenever the local day changes.
/// A confirmed copy of an optimistic message is not printed again.
#[derive(Default)]
struct Printer {
    seen_ids: HashSet<MessageId>,
    seen_keys: HashSet<ClientKey>,
    last_day: Option<NaiveDate>,
}

impl Printer {
    fn print_new(&mut self, timeline: &MessageTimeline) {
        let mut day = None;
        for row in timeline.rows(&Local) {
            match row {
                TimelineRow::DaySeparator(date) => day = Some(date),
                TimelineRow::Message(message) => {
                    if !self.mark_seen(message) {
                        continue;
                    }
                    if let Some(date) = day.filter(|date| self.last_day != Some(*date)) {
                        println!("---- {} ----", date.format("%a %d %b %Y"));
                        self.last_day = Some(date);
                    }
                    println!("{}", render(message));
                }
            }
        }
    }

    fn mark_seen(&mut self, message: &ChatMessage) -> bool {
        let fresh_id = self.seen_ids.insert(message.id.clone());
        let fresh_key = match &message.client_key {
            Some(key) => self.seen_keys.insert(key.clone()),
            None => true,
        };
        fresh_id && fresh_key
    }
}

fn render(message: &ChatMessage) -> String {
    let time = message.created_at.with_timezone(&Local).format("%H:%M");
    let pending = if message.is_optimistic() { " (pending)" } else { "" };
    match &message.sender_company {
        Some(company) => format!(
            "[{time}] {} ({company}): {}{pending}",
            message.sender_name, message.message
        ),
        None => format!("[{time}] {}: {}{pending}", message.sender_name, message.message),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => load_settings_from(path, |key| std::env::var(key).ok()),
        None => load_settings(),
    };
    if let Some(api_url) = args.api_url {
        settings.api_base_url = api_url;
    }
    if let Some(ws_url) = args.ws_url {
        settings.ws_url = Some(ws_url);
    }
    if args.token.is_some() {
        settings.bearer_token = args.token;
    }

    let transport: Arc<dyn ChatTransport> = match settings.websocket_url() {
        Some(url) => Arc::new(WsTransport::new(url)),
        None => {
            warn!(api_url = %settings.api_base_url, "no websocket endpoint; running offline");
            Arc::new(MissingTransport::new())
        }
    };
    let api = Arc::new(
        HttpChatApi::new(settings.api_base_url.clone())
            .with_bearer_token(settings.bearer_token.clone()),
    );
    let user = LocalUser {
        user_id: UserId::new(args.user_id.clone()),
        name: args.user_name.unwrap_or(args.user_id),
        company: None,
        avatar: None,
    };

    let session = ChatSession::new(
        ProductId::new(args.product_id),
        Some(user),
        api,
        transport,
        SessionOptions::from(&settings),
    );
    let events = session.subscribe_events();
    session
        .open()
        .await
        .with_context(|| format!("failed to open chat for product {}", session.product_id()))?;

    let snapshot = session.snapshot();
    if let Some(partner) = &snapshot.partner {
        println!(
            "Chatting with {} about {}",
            partner.seller.name, partner.product.name
        );
    }
    let mut printer = Printer::default();
    printer.print_new(&snapshot.timeline);

    let watcher = {
        let session = Arc::downgrade(&session);
        tokio::spawn(async move {
            let mut events = BroadcastStream::new(events);
            while let Some(event) = events.next().await {
                let Ok(event) = event else { continue };
                let Some(session) = session.upgrade() else { break };
                match event {
                    ChatEvent::TimelineUpdated { .. } => {
                        printer.print_new(&session.snapshot().timeline);
                    }
                    ChatEvent::ConnectionChanged(state) => println!("* {}", state.label()),
                    ChatEvent::PresenceChanged(presence) => println!("* seller is {presence:?}"),
                    ChatEvent::CounterpartyTyping(true) => println!("* seller is typing..."),
                    ChatEvent::Advisory(text) => println!("! {text}"),
                    ChatEvent::Error(failure) => eprintln!("! {failure}"),
                    ChatEvent::CounterpartyTyping(false) | ChatEvent::SurfaceChanged(_) => {}
                }
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        match line.trim() {
            "/quit" => break,
            "/retry" => session.retry_connection(),
            _ => {
                session.set_draft(line);
                match session.send_draft().await {
                    Ok(SendOutcome::Skipped(reason)) => println!("* not sent: {reason:?}"),
                    Ok(_) => {}
                    Err(failure) => eprintln!("! {failure}"),
                }
            }
        }
    }

    watcher.abort();
    session.close();
    info!("chat closed");
    Ok(())
}
