mod cleanmap;
mod clock;
mod config;
mod emulation;
mod mapper;
mod proxy;
mod remote_edit;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wayfinder_map::World;
use wayfinder_protocol::telnet::{GA, IAC};
use wayfinder_protocol::OutputFormat;

use crate::config::Config;
use crate::mapper::{Mapper, MapperEvent, MapperOptions, WriteMessage};
use crate::proxy::{GameStream, Session, SessionChannels};

/// Touched while the proxy is listening so launchers can tell it is ready.
const LISTENING_STATUS_FILE: &str = "mapper_ready.ignore";

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, ValueEnum)]
enum Format {
    #[default]
    Normal,
    Raw,
    Tintin,
}

impl From<Format> for OutputFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Normal => OutputFormat::Normal,
            Format::Raw => OutputFormat::Raw,
            Format::Tintin => OutputFormat::Tintin,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, ValueEnum)]
enum Interface {
    #[default]
    Text,
    Hc,
    Sighted,
}

/// The accessible MUME mapper proxy.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Start in offline emulation mode, without a game connection.
    #[arg(short, long)]
    emulation: bool,

    /// Select a user interface. Graphical interfaces are provided by
    /// external viewers; the proxy itself is text only.
    #[arg(short, long, value_enum, default_value_t)]
    interface: Interface,

    /// How game output is transformed before being sent to the client.
    #[arg(short, long, value_enum, default_value_t)]
    format: Format,

    /// The local host address to bind to.
    #[arg(long, default_value = "127.0.0.1")]
    local_host: String,

    /// The local port to bind to.
    #[arg(long, default_value_t = 4000)]
    local_port: u16,

    /// The remote host address to connect to.
    #[arg(long, default_value = "mume.org")]
    remote_host: String,

    /// The remote port to connect to.
    #[arg(long, default_value_t = 4242)]
    remote_port: u16,

    /// Disable encrypted communication with the remote host.
    #[arg(long)]
    no_ssl: bool,

    /// Terminate game prompts with CR LF instead of IAC GA.
    #[arg(long)]
    prompt_terminator_lf: bool,

    /// Gag emulated prompts.
    #[arg(long)]
    gag_prompts: bool,

    /// Format string for find-command output. Accepts {attribute},
    /// {direction}, {clockPosition}, {distance}, {name}, and {vnum}.
    #[arg(long, default_value = "{vnum}, {name}, {attribute}")]
    find_format: String,

    /// Directory holding the map and label databases.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if cli.interface != Interface::Text {
        warn!("graphical interfaces are external; falling back to text");
    }
    let output_format = OutputFormat::from(cli.format);
    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(config::default_data_dir);

    let listener = TcpListener::bind((cli.local_host.as_str(), cli.local_port))
        .await
        .with_context(|| format!("binding {}:{}", cli.local_host, cli.local_port))?;
    info!(
        "Waiting for connections on {}:{}",
        cli.local_host, cli.local_port
    );
    std::fs::write(LISTENING_STATUS_FILE, b"")?;

    let result = serve_one_session(&cli, output_format, &data_dir, &listener).await;

    if let Err(error) = std::fs::remove_file(LISTENING_STATUS_FILE) {
        warn!(%error, "failed to remove the listening status file");
    }
    result
}

async fn serve_one_session(
    cli: &Cli,
    output_format: OutputFormat,
    data_dir: &std::path::Path,
    listener: &TcpListener,
) -> anyhow::Result<()> {
    let (player, player_addr) = listener.accept().await?;
    info!(%player_addr, "accepted player connection");
    if let Err(error) = player.set_nodelay(true) {
        warn!(%error, "failed to set TCP_NODELAY");
    }

    let game = if cli.emulation {
        None
    } else {
        Some(connect_game(cli).await?)
    };

    let world = Arc::new(RwLock::new(World::new()));
    let load_messages = world.write().load(data_dir);

    let (player_tx, player_rx) = flume::unbounded::<WriteMessage>();
    let (game_tx, game_rx) = flume::unbounded::<WriteMessage>();
    let (events_tx, events_rx) = flume::unbounded::<MapperEvent>();

    let options = MapperOptions {
        output_format,
        find_format: cli.find_format.clone(),
        gag_prompts: cli.gag_prompts,
        is_emulating_offline: cli.emulation,
        data_dir: data_dir.to_owned(),
    };
    let mut mapper = Mapper::new(
        world.clone(),
        Config::load(),
        options,
        player_tx.clone(),
        game_tx.clone(),
    );
    for message in load_messages {
        mapper.send_player(&message);
    }
    let mapper_thread = tokio::task::spawn_blocking(move || mapper.run(&events_rx));

    let session = Session {
        output_format,
        prompt_terminator: if output_format == OutputFormat::Raw || !cli.prompt_terminator_lf {
            vec![IAC, GA]
        } else {
            b"\r\n".to_vec()
        },
        is_emulating_offline: cli.emulation,
        mapper_commands: mapper::mapper_command_names(),
    };
    let channels = SessionChannels {
        player_tx,
        player_rx,
        game_tx,
        game_rx,
        events_tx,
    };
    session.run(player, game, channels).await?;
    mapper_thread.await?;
    info!("session finished");
    Ok(())
}

/// Connects upstream, with TLS unless disabled.
async fn connect_game(cli: &Cli) -> anyhow::Result<GameStream> {
    let stream = TcpStream::connect((cli.remote_host.as_str(), cli.remote_port))
        .await
        .with_context(|| format!("connecting to {}:{}", cli.remote_host, cli.remote_port))?;
    if let Err(error) = stream.set_nodelay(true) {
        warn!(%error, "failed to set TCP_NODELAY on the game socket");
    }
    if cli.no_ssl {
        return Ok(GameStream::Plain(stream));
    }
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = ServerName::try_from(cli.remote_host.clone())
        .with_context(|| format!("invalid server name '{}'", cli.remote_host))?;
    let tls = connector
        .connect(server_name, stream)
        .await
        .context("TLS handshake with the game server")?;
    Ok(GameStream::Tls(Box::new(tls)))
}
