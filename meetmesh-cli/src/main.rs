//! Meetmesh CLI
//!
//! Runs a whole meeting in one process over the in-memory store: a host,
//! members and guests join, the host admits them, media and chat flow, and
//! the host ends the meeting.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use meetmesh_core::prelude::*;
use meetmesh_core::testing::MockNetwork;
use meetmesh_core::{
    factory_builder, ConnectionFactory, FactoryBuilder, LocalTokenIssuer, MeetingSessionBuilder,
    Uid,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-process meeting end to end
    Demo(DemoArgs),

    /// Print a fresh meeting id
    NewId,
}

#[derive(clap::Args, Debug)]
struct DemoArgs {
    /// JSON file with `session` and `meeting` sections
    #[arg(long, env = "MEETMESH_CONFIG")]
    config: Option<PathBuf>,

    /// Host display name
    #[arg(long, env = "MEETMESH_HOST_NAME", default_value = "Host")]
    host_name: String,

    /// Signed-in members joining after the host
    #[arg(long, default_value_t = 2)]
    members: usize,

    /// Guests joining after the members
    #[arg(long, default_value_t = 1)]
    guests: usize,

    /// Let everyone in without the waiting room
    #[arg(long)]
    open: bool,

    /// Share the host's screen for a moment
    #[arg(long)]
    screen_share: bool,

    /// ICE servers, overriding the configuration
    #[arg(long = "ice-server", env = "MEETMESH_ICE_SERVERS", value_delimiter = ',')]
    ice_servers: Vec<String>,

    /// Hosted media server; when set, media bypasses the peer mesh
    #[arg(long, env = "MEETMESH_MEDIA_URL")]
    media_url: Option<String>,

    /// Connection backend
    #[arg(long, value_enum, default_value = "loopback")]
    backend: Backend,

    /// Seconds to wait for the mesh to connect
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// In-process connections, no network
    Loopback,
    /// Real peer connections over the `webrtc` crate
    Webrtc,
}

/// Configuration file layout
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DemoConfig {
    session: SessionConfig,
    meeting: MeetingSettings,
}

impl DemoConfig {
    fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("meetmesh=info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Demo(args) => run_demo(args).await,
        Commands::NewId => {
            let id = MeetingId::generate();
            println!("{} ({})", id, id.formatted());
            Ok(())
        }
    }
}

struct Demo {
    store: Arc<MemoryStore>,
    meeting_id: MeetingId,
    config: SessionConfig,
    factory: FactoryBuilder,
    media_url: Option<String>,
}

impl Demo {
    async fn session(&self, identity: Option<Identity>) -> Result<Arc<MeetingSession>> {
        let mut builder: MeetingSessionBuilder =
            MeetingSession::builder(self.store.clone(), self.meeting_id.clone())
                .with_config(self.config.clone())
                .with_factory_builder(self.factory.clone());
        if let Some(identity) = identity {
            builder = builder.with_identity(identity);
        }
        if let Some(url) = &self.media_url {
            builder = builder.with_token_issuer(Arc::new(LocalTokenIssuer::new(Some(url.clone()))));
        }
        let session = builder.build().await?;
        session.wait_for_stage(|s| s != Stage::Loading).await;
        spawn_event_log(&session);
        Ok(session)
    }
}

fn backend_factory(backend: Backend) -> FactoryBuilder {
    match backend {
        Backend::Loopback => {
            let network = MockNetwork::new();
            factory_builder(move |local, _| {
                Ok(Arc::new(network.factory(local)) as Arc<dyn ConnectionFactory>)
            })
        }
        Backend::Webrtc => factory_builder(|local, config| {
            let factory = meetmesh_core::WebRtcConnectionFactory::new(
                local,
                config.ice_servers.clone(),
            )?;
            Ok(Arc::new(factory) as Arc<dyn ConnectionFactory>)
        }),
    }
}

fn spawn_event_log(session: &Arc<MeetingSession>) {
    let mut events = session.subscribe();
    let who = session
        .identity()
        .map(|i| i.name().to_string())
        .unwrap_or_else(|| "guest".to_string());
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::StageChanged(t) => {
                    tracing::info!(who = %who, old_state = %t.from, new_state = %t.to, "Stage changed");
                }
                SessionEvent::Failure(reason) => tracing::warn!(who = %who, %reason, "Failure"),
                other => tracing::debug!(who = %who, event = ?other, "Session event"),
            }
        }
    });
}

async fn run_demo(args: DemoArgs) -> Result<()> {
    let mut file = DemoConfig::load(args.config.as_deref())?;
    if !args.ice_servers.is_empty() {
        file.session.peer.ice_servers = args.ice_servers.clone();
    }
    if args.open {
        file.meeting.require_approval = false;
    }

    let store = Arc::new(MemoryStore::new());
    let host = Identity::member(Uid::parse("host")?, args.host_name.clone());
    let meeting =
        MeetingSession::create_meeting(store.clone(), &host, "Demo meeting", file.meeting.clone())
            .await?;
    println!("📅 Meeting {} created by {}", meeting.id.formatted(), meeting.host_name);

    let demo = Demo {
        store,
        meeting_id: meeting.id.clone(),
        config: file.session,
        factory: backend_factory(args.backend),
        media_url: args.media_url.clone(),
    };

    let host_session = demo.session(Some(host)).await?;
    host_session.join("", true, true).await?;
    println!("✅ Host joined");

    let mut sessions = Vec::new();
    for i in 0..args.members {
        let uid = Uid::parse(&format!("member-{i}"))?;
        let session = demo
            .session(Some(Identity::member(uid, format!("Member {i}"))))
            .await?;
        sessions.push(session);
    }
    for _ in 0..args.guests {
        sessions.push(demo.session(None).await?);
    }

    for (i, session) in sessions.iter().enumerate() {
        let name = format!("Guest {i}");
        match session.join(&name, true, i % 2 == 0).await {
            Ok(stage) => println!("🚪 {} -> {stage}", display_name(session, &name)),
            Err(e) => println!("⛔ {} could not join: {e}", display_name(session, &name)),
        }
    }

    admit_everyone(&host_session, &sessions).await?;

    let expected = 1 + sessions.iter().filter(|s| s.stage() == Stage::InMeeting).count();
    let everyone: Vec<&Arc<MeetingSession>> =
        std::iter::once(&host_session).chain(sessions.iter()).collect();
    if host_session.transport().await.is_some_and(|t| t.is_mesh()) {
        let deadline = Duration::from_secs(args.connect_timeout);
        match tokio::time::timeout(deadline, wait_for_mesh(&everyone, expected - 1)).await {
            Ok(()) => println!("🔗 Full mesh of {expected} participants connected"),
            Err(_) => println!("⚠️  Mesh incomplete after {}s", args.connect_timeout),
        }
    }

    if args.screen_share {
        host_session.start_screen_share().await?;
        println!("🖥️  Host is presenting");
        tokio::time::sleep(Duration::from_millis(200)).await;
        host_session.stop_screen_share().await?;
        println!("📷 Host is back on camera");
    }

    if let Some(first) = sessions.iter().find(|s| s.stage() == Stage::InMeeting) {
        first.toggle_hand().await?;
        first.send_chat("Hello from the demo").await?;
    }
    host_session.send_chat("Welcome everyone").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    print_summary(&host_session).await;

    host_session.leave().await?;
    for session in &sessions {
        let stage = tokio::time::timeout(
            Duration::from_secs(2),
            session.wait_for_stage(|s| s.is_terminal()),
        )
        .await
        .unwrap_or_else(|_| session.stage());
        println!(
            "👋 {} -> {stage}",
            display_name(session, "guest")
        );
    }

    for session in everyone {
        session.close().await;
    }
    println!("📴 Meeting ended");
    Ok(())
}

async fn admit_everyone(host: &MeetingSession, sessions: &[Arc<MeetingSession>]) -> Result<()> {
    for session in sessions {
        if session.stage() != Stage::Waiting {
            continue;
        }
        let Some(uid) = session.identity().map(|i| i.uid().clone()) else {
            continue;
        };
        host.sync()
            .wait_for(|s| s.is_waiting(&uid))
            .await
            .context("meeting state closed")?;
        host.admit(&uid).await?;
        session
            .wait_for_stage(|s| s != Stage::Waiting)
            .await;
        println!("🎟️  Admitted {}", display_name(session, uid.as_str()));
    }
    Ok(())
}

async fn wait_for_mesh(sessions: &[&Arc<MeetingSession>], peers: usize) {
    loop {
        let mut connected = true;
        for session in sessions {
            if session.stage() != Stage::InMeeting {
                continue;
            }
            let count = match session.peers().await {
                Some(manager) => manager.connected_peers().await.len(),
                None => 0,
            };
            connected &= count >= peers;
        }
        if connected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn print_summary(host: &MeetingSession) {
    let snapshot = host.snapshot();
    println!("👥 Roster:");
    for participant in &snapshot.participants {
        let d = participant.devices;
        println!(
            "   {:<12} {:?} video:{} mic:{} presenting:{} hand:{}",
            participant.name, participant.role, d.is_video_on, d.is_mic_on, d.is_presenting,
            d.has_raised_hand
        );
    }
    if let Some(status) = host.media_status().await {
        println!(
            "🎛️  Host media: video {} | mic {} | {}",
            status.video_on, status.mic_on, status.profile
        );
    }
    for stream in host.remote_streams().await {
        println!("   ⬇️  {} ({} tracks)", stream.remote, stream.tracks.len());
    }
    println!("💬 Chat:");
    for message in host.chat().messages() {
        println!("   {}: {}", message.sender_name, message.text);
    }
}

fn display_name(session: &MeetingSession, fallback: &str) -> String {
    session
        .identity()
        .map(|i| i.name().to_string())
        .unwrap_or_else(|| fallback.to_string())
}
