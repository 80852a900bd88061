/// Command line STOMP client
use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use stompkit_client::{
    protocol::{AckMode, Frame, HeartBeat},
    Session, SessionConfig, SessionError,
};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod tcp;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Broker to connect to
    #[arg(short, long, default_value = "localhost:61613")]
    addr: String,

    /// Virtual host named in the CONNECT frame
    #[arg(long, default_value = "localhost")]
    host: String,

    #[arg(short, long)]
    login: Option<String>,

    #[arg(short, long, requires = "login")]
    passcode: Option<String>,

    /// Heart-beat to offer, as "send,receive" in milliseconds
    #[arg(long, default_value = "0,0")]
    heart_beat: HeartBeat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send one message, then disconnect
    Send {
        #[arg(short, long)]
        destination: String,

        #[arg(short, long)]
        body: String,

        #[arg(long, default_value = "text/plain")]
        content_type: String,
    },
    /// Print messages from a destination until Ctrl-C
    Subscribe {
        #[arg(short, long)]
        destination: String,

        /// auto, client or client-individual
        #[arg(long, default_value = "auto")]
        ack: AckMode,
    },
}

/// Session callbacks, forwarded to the main task
#[derive(Debug)]
enum Event {
    Connected,
    Message(Frame),
    Error(SessionError),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let mut config = SessionConfig::new(&args.host)
        .with_heart_beat(args.heart_beat.send_ms, args.heart_beat.receive_ms);
    if let Some(login) = &args.login {
        config = config.with_credentials(login, args.passcode.as_deref().unwrap_or_default());
    }

    let session = Session::new(tcp::TcpChannel::new(&args.addr), config);
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let connected_tx = events_tx.clone();
    let error_tx = events_tx.clone();
    session.connect(
        move |_| {
            let _ = connected_tx.send(Event::Connected);
        },
        move |error| {
            let _ = error_tx.send(Event::Error(error));
        },
    )?;
    wait_for_connected(&mut events).await?;

    match args.command {
        Command::Send {
            destination,
            body,
            content_type,
        } => {
            session.send(&destination, body, &content_type)?;
            session.disconnect().await?;
        }
        Command::Subscribe { destination, ack } => {
            let message_tx = events_tx.clone();
            session.subscribe(&destination, ack, move |frame| {
                let _ = message_tx.send(Event::Message(frame));
            })?;
            tracing::info!(%destination, "subscribed, press Ctrl-C to stop");
            print_messages(&session, ack, &mut events).await?;
            session.disconnect().await?;
        }
    }
    Ok(())
}

async fn wait_for_connected(events: &mut UnboundedReceiver<Event>) -> Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            Event::Connected => return Ok(()),
            Event::Error(e) if e.is_fatal() => bail!(e),
            Event::Error(e) => tracing::warn!(error = %e, "while connecting"),
            Event::Message(_) => {}
        }
    }
    bail!("session closed before connecting")
}

async fn print_messages(
    session: &Session,
    ack: AckMode,
    events: &mut UnboundedReceiver<Event>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            maybe_event = events.recv() => match maybe_event {
                Some(Event::Message(frame)) => {
                    println!("{}", frame.body_text().unwrap_or("<binary>"));
                    if ack != AckMode::Auto {
                        session.ack(&frame)?;
                    }
                }
                Some(Event::Error(e)) if e.is_fatal() => bail!(e),
                Some(Event::Error(e)) => tracing::warn!(error = %e, "session error"),
                Some(Event::Connected) => {}
                None => bail!("session closed"),
            },
        }
    }
}
