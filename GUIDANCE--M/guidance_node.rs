use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use guidance_arbitration::{
    ArbitrationDecision, GuidanceConfig, GuidancePlugin, GuidanceRuntime, ManeuverType,
    PluginDescriptor, PluginError, PluginServiceLocator, PluginStatus, Proposal, ProposalRequest,
    SchedulerMetrics, TrajectorySegment, ValidityWindow,
};
use guidance_mock_drivers::{
    decode_hex_payload, BinaryMessage, DsrcReplayDriver, DsrcSettings, MockDriver, PayloadMode,
    ReplaySample, STATIC_BSM_PAYLOADS,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::init_tracing;
use shared_pubsub::{Envelope, MemoryPubSub, PubSubService, Subscription};
use tokio::{
    sync::{watch, OnceCell},
    time::Instant,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "guidance_node",
    version,
    about = "Runs maneuver arbitration against a mock DSRC radio"
)]
struct Cli {
    /// TOML configuration. Built-in defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Stops after this many cycles instead of waiting for Ctrl-C.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    cycles: Option<u64>,
    /// Tracing filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_filter: String,
}

/// Node-only sections living next to the guidance config.
#[derive(Debug, Default, Deserialize)]
struct NodeSections {
    #[serde(default)]
    mock_driver: DsrcSettings,
    #[serde(default)]
    demo: DemoSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct DemoSettings {
    /// Speed both demo plugins target.
    #[serde(default = "default_cruise_speed_mps")]
    cruise_speed_mps: f64,
    /// How long the platoon plugin keeps following after the leader goes quiet.
    #[serde(default = "default_leader_timeout_ms")]
    leader_timeout_ms: u64,
    /// `sample_id,message_type,hex` rows replayed by the radio.
    #[serde(default)]
    replay_file: Option<PathBuf>,
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            cruise_speed_mps: default_cruise_speed_mps(),
            leader_timeout_ms: default_leader_timeout_ms(),
            replay_file: None,
        }
    }
}

const fn default_cruise_speed_mps() -> f64 {
    25.0
}

const fn default_leader_timeout_ms() -> u64 {
    1500
}

#[derive(Debug, Clone, Default)]
struct NodeSettings {
    guidance: GuidanceConfig,
    mock_driver: DsrcSettings,
    demo: DemoSettings,
    samples: Vec<ReplaySample>,
}

impl NodeSettings {
    fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Self::parse("", Path::new("."));
        };
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading node config {}", path.display()))?;
        let base_dir = path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self::parse(&raw, &base_dir).with_context(|| format!("loading {}", path.display()))
    }

    fn parse(raw: &str, base_dir: &Path) -> Result<Self> {
        let guidance = GuidanceConfig::from_toml_str(raw, base_dir)?;
        let NodeSections { mock_driver, demo } =
            toml::from_str(raw).context("parsing node sections")?;
        if mock_driver.vehicle_count == 0 {
            bail!("mock_driver.vehicle_count must be at least 1");
        }
        if mock_driver.publish_period_ms < u64::from(mock_driver.vehicle_count) {
            bail!(
                "mock_driver.publish_period_ms ({}) must be at least vehicle_count ({})",
                mock_driver.publish_period_ms,
                mock_driver.vehicle_count
            );
        }
        if !demo.cruise_speed_mps.is_finite() || demo.cruise_speed_mps < 0.0 {
            bail!("demo.cruise_speed_mps must be a non-negative number");
        }
        let samples = match &demo.replay_file {
            Some(file) => load_samples(&base_dir.join(file))?,
            None if mock_driver.payload_mode == PayloadMode::Recorded => {
                bail!("mock_driver.payload_mode = \"recorded\" needs demo.replay_file")
            }
            None => static_samples(mock_driver.vehicle_count),
        };
        Ok(Self {
            guidance,
            mock_driver,
            demo,
            samples,
        })
    }
}

fn static_samples(vehicles: u32) -> Vec<ReplaySample> {
    STATIC_BSM_PAYLOADS
        .iter()
        .cycle()
        .zip(0..vehicles.max(1))
        .map(|(raw, sample_id)| ReplaySample::new(sample_id, "BSM", *raw))
        .collect()
}

fn load_samples(path: &Path) -> Result<Vec<ReplaySample>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading replay file {}", path.display()))?;
    let mut samples = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.splitn(3, ',').map(str::trim);
        let (Some(id), Some(kind), Some(bytes)) = (fields.next(), fields.next(), fields.next())
        else {
            bail!(
                "{}:{}: expected `sample_id,message_type,hex`",
                path.display(),
                index + 1
            );
        };
        let sample_id = id
            .parse()
            .with_context(|| format!("{}:{}: bad sample id {id:?}", path.display(), index + 1))?;
        samples.push(ReplaySample::new(sample_id, kind, bytes));
    }
    if samples.is_empty() {
        bail!("{} holds no samples", path.display());
    }
    Ok(samples)
}

/// Holds the configured speed every cycle.
struct CruisePlugin {
    speed_mps: f64,
}

#[async_trait]
impl GuidancePlugin for CruisePlugin {
    async fn propose(&self, request: &ProposalRequest) -> Result<Option<Proposal>, PluginError> {
        Ok(Some(Proposal::new(
            ManeuverType::SpeedControl,
            TrajectorySegment::new(self.speed_mps, 0, 100.0),
            ValidityWindow::new(request.cycle, request.cycle + 1),
        )))
    }
}

/// Follows the lead vehicle while its BSMs keep arriving.
struct PlatoonPlugin {
    locator: PluginServiceLocator,
    inbound_topic: String,
    leader: Vec<u8>,
    leader_timeout: Duration,
    speed_mps: f64,
    last_heard: Arc<Mutex<Option<Instant>>>,
    subscription: OnceCell<Subscription>,
}

impl PlatoonPlugin {
    fn new(
        locator: PluginServiceLocator,
        inbound_topic: String,
        leader: Vec<u8>,
        demo: &DemoSettings,
    ) -> Self {
        Self {
            locator,
            inbound_topic,
            leader,
            leader_timeout: Duration::from_millis(demo.leader_timeout_ms),
            speed_mps: demo.cruise_speed_mps,
            last_heard: Arc::new(Mutex::new(None)),
            subscription: OnceCell::new(),
        }
    }

    /// Subscribes to radio traffic on first use.
    async fn listen(&self) -> Result<(), PluginError> {
        self.subscription
            .get_or_try_init(|| async {
                let leader = self.leader.clone();
                let last_heard = Arc::clone(&self.last_heard);
                self.locator
                    .pubsub_service()
                    .subscribe(
                        &self.inbound_topic,
                        Arc::new(move |envelope: Envelope| {
                            match envelope.decode::<BinaryMessage>() {
                                Ok(message) if message.content == leader => {
                                    *last_heard.lock() = Some(Instant::now());
                                }
                                Ok(_) => {}
                                Err(err) => warn!(%err, "undecodable comms message"),
                            }
                        }),
                    )
                    .await
                    .map_err(|err| PluginError::Unavailable(err.to_string()))
            })
            .await?;
        Ok(())
    }

    fn leader_in_range(&self) -> bool {
        let heard = *self.last_heard.lock();
        heard.is_some_and(|at| at.elapsed() <= self.leader_timeout)
    }
}

#[async_trait]
impl GuidancePlugin for PlatoonPlugin {
    async fn propose(&self, request: &ProposalRequest) -> Result<Option<Proposal>, PluginError> {
        self.listen().await?;
        if !self.leader_in_range() {
            return Ok(None);
        }
        let joining = !request
            .previous
            .as_ref()
            .is_some_and(|decision| decision.maneuver == ManeuverType::Platooning);
        if joining {
            info!(cycle = request.cycle, "lead vehicle in range, joining platoon");
        }
        Ok(Some(
            Proposal::new(
                ManeuverType::Platooning,
                TrajectorySegment::new(self.speed_mps, 0, 30.0),
                ValidityWindow::single(request.cycle),
            )
            .with_priority(10)
            .with_confidence(0.9),
        ))
    }
}

#[derive(Debug, Serialize)]
struct NodeReport {
    scheduler: SchedulerMetrics,
    radio_messages: u64,
    plugins: Vec<PluginStatus>,
    last_decision: Option<ArbitrationDecision>,
}

async fn run_node(settings: NodeSettings, cycles: Option<u64>) -> Result<NodeReport> {
    let NodeSettings {
        guidance,
        mock_driver,
        demo,
        samples,
    } = settings;
    let bus: Arc<dyn PubSubService> = Arc::new(MemoryPubSub::with_settings(
        guidance.pubsub.channel_capacity,
        guidance.pubsub.backlog,
        guidance.pubsub.service_timeout(),
    ));
    let runtime = GuidanceRuntime::bootstrap_with_transport(guidance, Arc::clone(&bus))?;

    let radio = Arc::new(
        DsrcReplayDriver::start(mock_driver, Arc::clone(&bus))
            .await
            .context("starting mock DSRC driver")?,
    );
    let ack = bus
        .call_service(&radio.send_service(), json!({ "message_type": "BSM", "content": "" }))
        .await
        .context("radio handshake")?;
    info!(%ack, api = ?radio.driver_api(), "radio online");

    let (stop_radio, radio_shutdown) = watch::channel(false);
    let replay = tokio::spawn({
        let radio = Arc::clone(&radio);
        async move { radio.run(samples, radio_shutdown).await }
    });

    let cruise = runtime.install_plugin(
        PluginDescriptor::new("cruise", "1.0").with_capability(ManeuverType::SpeedControl),
        |_| CruisePlugin {
            speed_mps: demo.cruise_speed_mps,
        },
    )?;
    let inbound_topic = radio.inbound_topic();
    let leader = decode_hex_payload(STATIC_BSM_PAYLOADS[0]).context("decoding lead vehicle BSM")?;
    let platoon = runtime.install_plugin(
        PluginDescriptor::new("platoon", "1.0").with_capability(ManeuverType::Platooning),
        |locator| PlatoonPlugin::new(locator, inbound_topic, leader, &demo),
    )?;
    runtime.activate(cruise)?;
    runtime.activate(platoon)?;

    let scheduler = runtime.spawn_scheduler(cycles);
    let metrics = if cycles.is_some() {
        scheduler.wait().await
    } else {
        tokio::signal::ctrl_c()
            .await
            .context("waiting for ctrl-c")?;
        scheduler.stop().await
    };

    stop_radio.send_replace(true);
    let radio_messages = replay.await.context("radio replay task failed")??;
    radio.stop();
    info!(
        cycles = metrics.cycles_run,
        fail_safe = metrics.fail_safe_cycles,
        radio_messages,
        "guidance node stopped"
    );

    Ok(NodeReport {
        scheduler: metrics,
        radio_messages,
        plugins: runtime.statuses(),
        last_decision: runtime
            .arbitrator()
            .current_decision()
            .map(|decision| decision.as_ref().clone()),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_filter);
    let settings = NodeSettings::load(cli.config.as_deref())?;
    let report = run_node(settings, cli.cycles)
        .await
        .context("guidance node failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
