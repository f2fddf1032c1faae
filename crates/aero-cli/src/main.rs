use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

use aero_link::autodetect::{autodetect, default_candidate_bauds, default_candidate_devs};
use aero_link::{list_serial_ports, ConnectionSettings, LinkConfig, LinkSession, SerialSettings};
use aero_proto::Message;
use aero_vehicle::{
    CalibrationKind, ParamMetadata, ProfileStore, SafetySettings, Vehicle, VehicleConfig, VehicleEvent,
};

mod profiles;

use profiles::TomlProfileStore;

#[derive(Debug, Parser)]
#[command(name = "aero", version, about = "AeroLink - ground-station autopilot configuration")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check the config file without touching any hardware.
    Doctor,
    /// List serial ports.
    Ports,
    /// Probe serial ports/bauds for heartbeats.
    Autodetect,
    /// Connect, wait for a heartbeat and print link status.
    Status,
    /// Print vehicle events and link transitions until Ctrl-C.
    Monitor,
    Params { #[command(subcommand)] cmd: ParamsCmd },
    Arm {
        #[arg(long)]
        force: bool,
        /// Confirm arming.
        #[arg(long)]
        yes: bool,
        /// Confirm the propellers are removed.
        #[arg(long)]
        props_removed: bool,
    },
    Disarm {
        #[arg(long)]
        force: bool,
    },
    Reboot,
    Shutdown,
    MotorTest {
        #[arg(long)]
        motor: u8,
        #[arg(long)]
        throttle: f32,
        #[arg(long, default_value_t = 2.0)]
        seconds: f32,
        #[arg(long)]
        props_removed: bool,
    },
    StopMotors,
    /// gyro | accel | mag | baro | level
    Calibrate { kind: CalibrationKind },
    Profile { #[command(subcommand)] cmd: ProfileCmd },
    Safety { #[command(subcommand)] cmd: SafetyCmd },
}

#[derive(Debug, Subcommand)]
enum ParamsCmd {
    /// Download the full table and print it.
    Pull,
    Get { name: String },
    Set { name: String, value: f32 },
}

#[derive(Debug, Subcommand)]
enum ProfileCmd {
    /// Download the table and store it under NAME.
    Save { name: String },
    /// Write every value of NAME that differs from the vehicle.
    Apply { name: String },
    List,
}

#[derive(Debug, Subcommand)]
enum SafetyCmd {
    Show,
    Apply,
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    #[serde(default)]
    link: LinkConfig,
    connection: Option<ConnectionSettings>,
    #[serde(default)]
    vehicle: VehicleConfig,
    #[serde(default)]
    safety: SafetySettings,
    #[serde(default)]
    profiles: ProfilesCfg,
    #[serde(default)]
    autodetect: AutodetectCfg,
    #[serde(default)]
    metadata: Vec<ParamMetadata>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct ProfilesCfg {
    dir: String,
}

impl Default for ProfilesCfg {
    fn default() -> Self {
        Self { dir: "profiles".into() }
    }
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct AutodetectCfg {
    /// Use autodetect when no [connection] is configured.
    enable: bool,
    candidate_devs: Option<Vec<String>>,
    candidate_bauds: Option<Vec<u32>>,
    heartbeat_timeout_ms: Option<u64>,
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    toml::from_str(&s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg),
        Command::Ports => ports(),
        Command::Autodetect => {
            match run_autodetect(&cfg.autodetect).await {
                Some(s) => println!("CHOSEN: {} @ {}", s.port, s.baud),
                None => println!("CHOSEN: none"),
            }
            Ok(())
        }
        Command::Status => status(&cfg).await,
        Command::Monitor => monitor(&cfg).await,
        Command::Profile { cmd: ProfileCmd::List } => list_profiles(&cfg),
        Command::Safety { cmd: SafetyCmd::Show } => {
            cfg.safety.validate().context("[safety]")?;
            for (name, value) in cfg.safety.to_parameters() {
                println!("{} = {}", name, value);
            }
            Ok(())
        }
        cmd => with_vehicle(&cfg, cmd).await,
    }
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");
    match &cfg.connection {
        Some(c) => c.validate().map_err(anyhow::Error::msg).context("[connection]")?,
        None => {
            anyhow::ensure!(cfg.autodetect.enable, "no [connection] and autodetect.enable=false");
        }
    }
    anyhow::ensure!(cfg.link.heartbeat_timeout_ms > 0, "link.heartbeat_timeout_ms must be > 0");
    anyhow::ensure!(
        cfg.link.reconnect_initial_ms <= cfg.link.reconnect_max_ms,
        "link.reconnect_initial_ms exceeds link.reconnect_max_ms"
    );
    cfg.safety.validate().context("[safety]")?;
    for m in &cfg.metadata {
        if let (Some(lo), Some(hi)) = (m.min, m.max) {
            anyhow::ensure!(lo <= hi, "metadata {}: min {} > max {}", m.name, lo, hi);
        }
    }
    let store = TomlProfileStore::new(&cfg.profiles.dir);
    let n = store.list_profiles().context("profiles dir")?.len();
    info!("doctor: {} stored profiles in {}", n, cfg.profiles.dir);
    info!("doctor: OK");
    Ok(())
}

fn ports() -> Result<()> {
    let ports = list_serial_ports().context("enumerate serial ports")?;
    if ports.is_empty() {
        println!("no serial ports found");
    }
    for p in ports {
        println!("{}  {}", p.name, p.label);
    }
    Ok(())
}

async fn run_autodetect(cfg: &AutodetectCfg) -> Option<SerialSettings> {
    let devs = cfg.candidate_devs.clone().unwrap_or_else(default_candidate_devs);
    let bauds = cfg.candidate_bauds.clone().unwrap_or_else(default_candidate_bauds);
    let timeout = Duration::from_millis(cfg.heartbeat_timeout_ms.unwrap_or(1500));
    autodetect(&devs, &bauds, timeout).await
}

async fn resolve_connection(cfg: &Config) -> Result<ConnectionSettings> {
    if let Some(c) = &cfg.connection {
        c.validate().map_err(anyhow::Error::msg).context("[connection]")?;
        return Ok(c.clone());
    }
    anyhow::ensure!(cfg.autodetect.enable, "no [connection] configured and autodetect.enable=false");
    match run_autodetect(&cfg.autodetect).await {
        Some(s) => Ok(ConnectionSettings::Serial(s)),
        None => anyhow::bail!("autodetect failed: no heartbeat found"),
    }
}

async fn connect(cfg: &Config) -> Result<Vehicle> {
    let settings = resolve_connection(cfg).await?;
    let session = LinkSession::new(cfg.link.clone());
    let vehicle = Vehicle::new(session.clone(), cfg.vehicle.clone(), cfg.safety.clone());
    let n = vehicle.params().load_metadata(cfg.metadata.iter().cloned());
    if n > 0 {
        info!("loaded metadata for {} parameters", n);
    }
    session.connect(&settings).await.with_context(|| format!("connect {}", settings.endpoint()))?;
    Ok(vehicle)
}

async fn wait_heartbeat(session: &LinkSession) -> Result<Message> {
    let mut frames = session.subscribe();
    let timeout = session.config().heartbeat_timeout();
    let wait = async {
        while let Some(msg) = frames.recv().await {
            if matches!(&*msg, Message::Heartbeat(_)) {
                return Some((*msg).clone());
            }
        }
        None
    };
    tokio::time::timeout(timeout, wait)
        .await
        .ok()
        .flatten()
        .with_context(|| format!("no heartbeat within {} ms", timeout.as_millis()))
}

async fn status(cfg: &Config) -> Result<()> {
    let vehicle = connect(cfg).await?;
    let session = vehicle.session();
    let hb = wait_heartbeat(session).await;
    let st = session.stats();
    println!("state={:?}", session.state());
    println!("endpoint={}", st.endpoint.as_deref().unwrap_or("-"));
    match hb {
        Ok(Message::Heartbeat(hb)) => {
            println!("vehicle_type={} autopilot={} system_status={}", hb.vehicle_type, hb.autopilot, hb.system_status);
            println!("armed={}", hb.is_armed());
        }
        Ok(_) => {}
        Err(e) => println!("heartbeat: {:#}", e),
    }
    println!("frames_received={} frames_sent={} frame_errors={}", st.frames_received, st.frames_sent, st.frame_errors);
    println!("last_frame_age={:?}", st.last_frame_age());
    session.disconnect().await;
    Ok(())
}

async fn monitor(cfg: &Config) -> Result<()> {
    let vehicle = connect(cfg).await?;
    let mut events = vehicle.subscribe_events();
    let mut states = vehicle.session().subscribe_state();
    info!("monitor: Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(state) = states.recv() => println!("link: {:?}", state),
            Some(ev) = events.recv() => print_event(&ev),
        }
    }
    vehicle.session().disconnect().await;
    Ok(())
}

fn print_event(ev: &VehicleEvent) {
    match ev {
        VehicleEvent::StatusMessage(m) => println!("[{:?}] {}", m.severity, m.text),
        VehicleEvent::CalibrationProgress(p) => match p.position_label() {
            Some(pos) => println!("calibration {} {}% step {}: place vehicle {}", p.kind, p.percent, p.current_step, pos),
            None => println!("calibration {} {}%", p.kind, p.percent),
        },
        VehicleEvent::CalibrationFinished { kind, outcome } => println!("calibration {} finished: {:?}", kind, outcome),
        VehicleEvent::ArmedChanged { armed } => println!("armed={}", armed),
        VehicleEvent::ParameterDownloadCompleted { success, received, expected } => {
            println!("parameter download success={} {}/{:?}", success, received, expected)
        }
        VehicleEvent::ParameterUpdated { .. }
        | VehicleEvent::ParameterDownloadStarted
        | VehicleEvent::ParameterDownloadProgress { .. } => {}
    }
}

async fn with_vehicle(cfg: &Config, cmd: Command) -> Result<()> {
    let vehicle = connect(cfg).await?;
    wait_heartbeat(vehicle.session()).await?;
    let res = vehicle_cmd(cfg, &vehicle, cmd).await;
    vehicle.session().disconnect().await;
    res
}

async fn vehicle_cmd(cfg: &Config, vehicle: &Vehicle, cmd: Command) -> Result<()> {
    match cmd {
        Command::Params { cmd } => params_cmd(vehicle, cmd).await,
        Command::Arm { force, yes, props_removed } => {
            vehicle.commands().confirm_arming(yes);
            vehicle.commands().confirm_propellers_removed(props_removed);
            vehicle.arm(force).await.context("arm")?;
            println!("armed");
            Ok(())
        }
        Command::Disarm { force } => {
            vehicle.disarm(force).await.context("disarm")?;
            println!("disarmed");
            Ok(())
        }
        Command::Reboot => Ok(vehicle.reboot().await.context("reboot")?),
        Command::Shutdown => Ok(vehicle.shutdown().await.context("shutdown")?),
        Command::MotorTest { motor, throttle, seconds, props_removed } => {
            anyhow::ensure!(seconds.is_finite() && seconds >= 0.0, "--seconds must be >= 0");
            vehicle.commands().confirm_propellers_removed(props_removed);
            vehicle.motor_test(motor, throttle, Duration::from_secs_f32(seconds)).await.context("motor test")?;
            Ok(())
        }
        Command::StopMotors => Ok(vehicle.stop_all_motors().await.context("stop motors")?),
        Command::Calibrate { kind } => {
            let mut events = vehicle.subscribe_events();
            let printer = tokio::spawn(async move {
                while let Some(ev) = events.recv().await {
                    if matches!(ev, VehicleEvent::CalibrationProgress(_) | VehicleEvent::StatusMessage(_)) {
                        print_event(&ev);
                    }
                }
            });
            let res = vehicle.calibrate(kind).await;
            printer.abort();
            res.with_context(|| format!("{} calibration", kind))?;
            println!("{} calibration complete", kind);
            Ok(())
        }
        Command::Profile { cmd } => profile_cmd(cfg, vehicle, cmd).await,
        Command::Safety { cmd: SafetyCmd::Apply } => {
            let n = vehicle.apply_safety_settings().await.context("apply safety settings")?;
            println!("{} parameters written", n);
            Ok(())
        }
        other => anyhow::bail!("{:?} does not run against a vehicle", other),
    }
}

async fn params_cmd(vehicle: &Vehicle, cmd: ParamsCmd) -> Result<()> {
    match cmd {
        ParamsCmd::Pull => {
            let snap = vehicle.refresh_parameters().await.context("parameter download")?;
            for p in vehicle.params().parameters() {
                println!("{:<16} {}", p.name, p.value);
            }
            println!("{} parameters", snap.received);
        }
        ParamsCmd::Get { name } => {
            let p = vehicle.params().read_parameter(&name).await.with_context(|| format!("read {}", name))?;
            println!("{} = {}", p.name, p.value);
        }
        ParamsCmd::Set { name, value } => {
            vehicle.set_parameter(&name, value).await.with_context(|| format!("set {}", name))?;
            println!("{} = {}", name, value);
        }
    }
    Ok(())
}

async fn profile_cmd(cfg: &Config, vehicle: &Vehicle, cmd: ProfileCmd) -> Result<()> {
    let store = TomlProfileStore::new(&cfg.profiles.dir);
    match cmd {
        ProfileCmd::Save { name } => {
            vehicle.refresh_parameters().await.context("parameter download")?;
            let n = vehicle.params().save_profile(&store, &name)?;
            println!("saved {} parameters to {}", n, name);
        }
        ProfileCmd::Apply { name } => {
            vehicle.refresh_parameters().await.context("parameter download")?;
            let report = vehicle.params().apply_profile(&store, &name).await.with_context(|| format!("apply {}", name))?;
            println!("applied={} unchanged={} failed={}", report.applied.len(), report.unchanged, report.failed.len());
            for (param, err) in &report.failed {
                warn!("{}: {}", param, err);
            }
            anyhow::ensure!(report.failed.is_empty(), "{} parameters not applied", report.failed.len());
        }
        ProfileCmd::List => return list_profiles(cfg),
    }
    Ok(())
}

fn list_profiles(cfg: &Config) -> Result<()> {
    let store = TomlProfileStore::new(&cfg.profiles.dir);
    for name in store.list_profiles()? {
        let when = store.saved_at(&name).ok().and_then(|t| t.format(&Rfc3339).ok());
        println!("{}  {}", name, when.unwrap_or_default());
    }
    Ok(())
}
