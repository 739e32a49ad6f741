//! `mailgraph` - Microsoft Graph from the command line
//!
//! Signs in with the device-code flow and calls Graph on the user's behalf.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod graph;
mod settings;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use clap::{Parser, Subcommand};
use mailgraph_auth::{AuthSettings, DeviceCodeAuthenticator, DeviceCodePrompt};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use graph::{GraphClient, NewEvent};
use settings::Settings;

#[derive(Parser)]
#[command(name = "mailgraph")]
#[command(about = "Read and send mail through Microsoft Graph")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to <config dir>/mailgraph/settings.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Open the verification page in the browser when signing in
    #[arg(long, global = true)]
    open: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in and print the access token
    Token,

    /// Show the signed-in user
    Whoami,

    /// List the newest inbox messages
    Inbox {
        /// Number of messages
        #[arg(long, default_value_t = 25)]
        top: u32,
    },

    /// Send a plain-text message
    Send {
        /// Recipient address
        #[arg(long)]
        to: String,
        /// Subject line
        #[arg(long)]
        subject: String,
        /// Message body
        #[arg(long)]
        body: String,
    },

    /// Create a calendar event
    Event {
        /// Title
        #[arg(long)]
        subject: String,
        /// Start, e.g. 2024-03-04T09:00:00
        #[arg(long)]
        start: NaiveDateTime,
        /// End, e.g. 2024-03-04T09:30:00
        #[arg(long)]
        end: NaiveDateTime,
        /// Time zone for start and end
        #[arg(long, default_value = "UTC")]
        time_zone: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailgraph=info,mailgraph_auth=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref())
        .await?
        .with_env_overrides();
    let config = settings.client_config()?;
    info!(
        client_id = config.client_id(),
        tenant = config.tenant_id(),
        scopes = %config.scope_param(),
        "Starting mailgraph"
    );

    let open_browser = cli.open;
    let auth = DeviceCodeAuthenticator::with_reqwest(AuthSettings::default())?;
    auth.initialize(config, move |prompt: &DeviceCodePrompt| {
        show_prompt(prompt, open_browser);
    })?;

    let outcome = tokio::select! {
        result = run(cli.command, &auth) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling sign-in");
            auth.shutdown();
            Ok(())
        }
    };
    auth.shutdown();
    outcome
}

async fn run(command: Command, auth: &DeviceCodeAuthenticator) -> Result<()> {
    match command {
        Command::Token => {
            let token = auth.get_token().await.context("sign-in failed")?;
            eprintln!(
                "Token expires {}",
                token.expires_at().with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
            );
            println!("{}", token.secret());
        }
        Command::Whoami => {
            let user = GraphClient::new(auth.clone())?.me().await?;
            println!(
                "Hello, {}!",
                user.display_name.as_deref().unwrap_or("unknown user")
            );
            println!("Email: {}", user.email());
        }
        Command::Inbox { top } => {
            let messages = GraphClient::new(auth.clone())?.inbox(top).await?;
            for message in &messages {
                println!("Message: {}", message.subject.as_deref().unwrap_or("NONE"));
                println!("  From: {}", message.sender());
                println!("  Status: {}", if message.is_read { "Read" } else { "Unread" });
                println!(
                    "  Received: {}",
                    message
                        .received_date_time
                        .with_timezone(&Local)
                        .format("%Y-%m-%d %H:%M")
                );
            }
            if messages.is_empty() {
                println!("Inbox is empty.");
            }
        }
        Command::Send { to, subject, body } => {
            GraphClient::new(auth.clone())?
                .send_mail(&to, &subject, &body)
                .await?;
            println!("Mail sent to {to}.");
        }
        Command::Event {
            subject,
            start,
            end,
            time_zone,
        } => {
            anyhow::ensure!(end > start, "event must end after it starts");
            let event = NewEvent {
                subject,
                start,
                end,
                time_zone,
            };
            let created = GraphClient::new(auth.clone())?.create_event(&event).await?;
            println!(
                "Created event {} ({})",
                created.subject.as_deref().unwrap_or(&event.subject),
                created.id
            );
            if let Some(link) = created.web_link {
                println!("  {link}");
            }
        }
    }
    Ok(())
}

/// Prints sign-in instructions, optionally opening the browser.
fn show_prompt(prompt: &DeviceCodePrompt, open_browser: bool) {
    eprintln!("{}", prompt.instructions());

    if open_browser {
        let target = prompt
            .verification_uri_complete
            .as_deref()
            .unwrap_or(&prompt.verification_uri);
        if let Err(e) = opener::open(target) {
            warn!(?e, "Could not open browser");
        }
    }
}
