//! Tank Duel
//!
//! Command-line peer. `host` prints an offer blob and waits for the answer on
//! stdin; `join` reads the offer from stdin and prints the answer. Once the
//! match is live a scripted driver steers the local tank until a winner is
//! decided.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tank_duel::{
    VERSION,
    config::DuelConfig,
    core::{Quat, Vec3},
    game::{
        ControllerCommand, ControllerEvent, ControllerHandle, MatchController, MatchEvent,
        MatchPhase, ScriptedCutscene,
    },
    replication::{
        coordinator::slot_for,
        map::spawn_point,
        MatchMode, PlayerProfile, PlayerSlot, TankPose,
    },
    session::{webrtc::WebRtcTransportFactory, Role, SessionEvent},
};

#[derive(Debug, Parser)]
#[command(name = "tank-duel", author, version, about = "Serverless two-player tank duel")]
struct Cli {
    /// Display name (3-12 letters or digits).
    #[arg(long, env = "DUEL_USERNAME")]
    username: String,

    /// Tank color: red, blue, green, yellow, purple or orange.
    #[arg(long, env = "DUEL_COLOR", default_value = "red")]
    color: String,

    /// Pose replication rate, overriding DUEL_TICK_RATE_HZ.
    #[arg(long)]
    tick_rate: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Host a match and print the offer blob.
    Host {
        /// bo3, bo5 or infinite.
        #[arg(long, default_value = "bo3")]
        mode: MatchMode,

        /// Arena seed; random when omitted.
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Join a match from a pasted offer blob.
    Join,
}

fn init_tracing() {
    let default_level = if cfg!(feature = "debug-tracing") { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let profile = match PlayerProfile::new(&cli.username, &cli.color) {
        Ok(profile) => profile,
        Err(e) => bail!("invalid {}: {}", e.field(), e),
    };

    let mut config = DuelConfig::from_env();
    if let Some(hz) = cli.tick_rate {
        config.tick_rate_hz = hz.max(1);
    }
    info!("Tank Duel v{}", VERSION);
    info!("Tick Rate: {} Hz", config.tick_rate_hz);

    let (role, first_command, seed) = match cli.command {
        Command::Host { mode, seed } => (Role::Initiator, ControllerCommand::Host { mode }, seed),
        Command::Join => (Role::Responder, ControllerCommand::Join, None),
    };

    let mut controller = MatchController::new(
        config,
        profile,
        Arc::new(WebRtcTransportFactory::new()),
        Box::new(ScriptedCutscene::default()),
    );
    if let Some(seed) = seed {
        controller = controller.with_map_seed(seed);
    }

    let (handle, task) = controller.spawn();
    let mut events = handle.subscribe();
    handle.send(first_command).await?;

    if role == Role::Responder {
        eprintln!("Paste the host's offer and press enter:");
    }

    let result = session_loop(&handle, &mut events, role).await;

    let _ = handle.send(ControllerCommand::Shutdown).await;
    task.await.context("controller task panicked")?;
    result
}

async fn session_loop(
    handle: &ControllerHandle,
    events: &mut tokio::sync::broadcast::Receiver<ControllerEvent>,
    role: Role,
) -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut driver = Driver::new(slot_for(role));
    let mut frame = interval(Duration::from_millis(16));
    frame.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut played = false;
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ControllerEvent::Session(SessionEvent::LocalDescriptionReady(blob))) => {
                    let prompt = match role {
                        Role::Initiator => "Send this offer to your opponent, then paste their answer:",
                        Role::Responder => "Send this answer back to the host:",
                    };
                    eprintln!("{prompt}");
                    println!("{}", blob.encode()?);
                }
                Ok(ControllerEvent::Match(MatchEvent::PhaseChanged { to, .. })) => {
                    info!("Phase: {:?}", to);
                    match to {
                        MatchPhase::Active => {
                            played = true;
                            driver.resume();
                        }
                        MatchPhase::Lobby => {
                            if played {
                                info!("Match over");
                            }
                            return Ok(());
                        }
                        _ => driver.pause(),
                    }
                }
                Ok(ControllerEvent::Match(MatchEvent::RespawnLocal)) => driver.respawn(),
                Ok(ControllerEvent::Match(MatchEvent::Notice(text))) => eprintln!("{text}"),
                Ok(ControllerEvent::Match(MatchEvent::PresentResult(view))) => {
                    let headline = match view.winner {
                        None => "Draw.",
                        Some(_) if view.local_won() => "Victory!",
                        Some(_) => "Defeat.",
                    };
                    eprintln!("{} {} - {}", headline, view.player1.score, view.player2.score);
                    if let Some(slot) = view.winner {
                        eprintln!("Winner: {}", view.entry(slot).name);
                    }
                }
                Ok(ControllerEvent::Error(e)) => eprintln!("Error: {e}"),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("Dropped {} controller events", n),
                Err(RecvError::Closed) => bail!("controller stopped"),
            },
            line = stdin.next_line(), if stdin_open => match line? {
                Some(text) if !text.trim().is_empty() => {
                    handle.send(ControllerCommand::AcceptRemote(text.trim().to_string())).await?;
                }
                Some(_) => {}
                // stdin closed; keep playing until the match ends
                None => stdin_open = false,
            },
            _ = frame.tick(), if driver.active => {
                for command in driver.step(Instant::now()) {
                    handle.send(command).await?;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                handle.send(ControllerCommand::Cancel).await?;
                return Ok(());
            }
        }
    }
}

/// Scripted stand-in for a human player: drives in a circle around the spawn
/// point, fires periodically and sometimes lands a hit.
struct Driver {
    slot: PlayerSlot,
    active: bool,
    origin: Vec3,
    started: Instant,
    last_shot: Instant,
}

impl Driver {
    const RADIUS: f32 = 6.0;
    const SHOT_EVERY: Duration = Duration::from_millis(1500);
    const HIT_CHANCE: f64 = 0.35;
    const HIT_DAMAGE: u32 = 25;

    fn new(slot: PlayerSlot) -> Self {
        let now = Instant::now();
        Self { slot, active: false, origin: spawn_point(slot).0, started: now, last_shot: now }
    }

    fn resume(&mut self) {
        self.active = true;
    }

    fn pause(&mut self) {
        self.active = false;
    }

    fn respawn(&mut self) {
        self.started = Instant::now();
    }

    fn step(&mut self, now: Instant) -> Vec<ControllerCommand> {
        let t = now.duration_since(self.started).as_secs_f32();
        let angle = t * 0.8;
        let offset = Vec3::new(angle.cos(), 0.0, angle.sin()).scale(Self::RADIUS);
        let heading = Vec3::new(-angle.sin(), 0.0, angle.cos());
        let position = self.origin + offset;

        let mut commands = vec![ControllerCommand::UpdatePose(TankPose {
            position,
            rotation: Quat::from_yaw(angle),
            head_rotation: angle * 0.5,
            turret_rotation: -angle,
            velocity: heading.scale(Self::RADIUS * 0.8),
        })];

        if now.duration_since(self.last_shot) >= Self::SHOT_EVERY {
            self.last_shot = now;
            let target = spawn_point(self.slot.opponent()).0;
            let direction = (target - position).normalize();
            commands.push(ControllerCommand::Fire { position: position + Vec3::new(0.0, 1.0, 0.0), direction });
            if rand::thread_rng().gen_bool(Self::HIT_CHANCE) {
                commands.push(ControllerCommand::Hit { target: self.slot.opponent(), damage: Self::HIT_DAMAGE });
            }
        }
        commands
    }
}
