//! follower - track a locked object class and publish velocity commands.
//!
//! Frames arrive as length-prefixed JPEGs on the video port; one JSON command
//! record per frame leaves on the command port (or an MQTT topic). Operator
//! commands are read from stdin, one per line: c, 1-9, l, x, q.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use teleop_follower::detect::{DetectorBackend, ScriptedBackend};
use teleop_follower::ingest::{SyntheticScene, TcpFrameSubscriber};
use teleop_follower::notify::{alert_sink_from_env, speech_sink, CooldownPolicy, Notifier};
use teleop_follower::transport::{
    CommandPublisher, FrameChannel, MqttCommandPublisher, TcpCommandPublisher,
};
use teleop_follower::{Detectors, FollowerConfig, FollowerLoop, Notifications, OperatorInput};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum PublisherKind {
    Tcp,
    Mqtt,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Follower robot tracking and motion control loop")]
struct Args {
    /// Primary detector ONNX model (YOLOv8 layout).
    #[arg(long, env = "FOLLOWER_MODEL")]
    model: Option<PathBuf>,

    /// Class labels for the primary model, one per line.
    #[arg(long, env = "FOLLOWER_CLASSES")]
    classes: Option<PathBuf>,

    /// Hand-raise detector ONNX model.
    #[arg(long, env = "FOLLOWER_HAND_MODEL")]
    hand_model: Option<PathBuf>,

    /// Class labels for the hand-raise model.
    #[arg(long, env = "FOLLOWER_HAND_CLASSES")]
    hand_classes: Option<PathBuf>,

    /// Square model input size in pixels.
    #[arg(long, env = "FOLLOWER_MODEL_SIZE", default_value_t = 640)]
    model_size: u32,

    /// Where velocity commands are published.
    #[arg(long, value_enum, env = "FOLLOWER_PUBLISHER", default_value = "tcp")]
    publisher: PublisherKind,

    /// MQTT broker address (host[:port]).
    #[arg(long, env = "MQTT_BROKER_ADDR", default_value = "127.0.0.1:1883")]
    mqtt_broker: String,

    /// MQTT topic for command records.
    #[arg(long, env = "MQTT_TOPIC", default_value = "follower/cmd")]
    mqtt_topic: String,

    /// MQTT client identifier.
    #[arg(long, env = "MQTT_CLIENT_ID", default_value = "follower")]
    mqtt_client_id: String,

    /// Use a generated scene instead of the video port.
    #[arg(long)]
    synthetic: bool,

    /// Frame rate of the generated scene.
    #[arg(long, default_value_t = 15)]
    synthetic_fps: u32,

    /// Class to lock at startup.
    #[arg(long)]
    lock: Option<String>,

    /// Do not read operator commands from stdin.
    #[arg(long)]
    no_stdin: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = FollowerConfig::load()?;
    log::info!(
        "config loaded: {}x{}, video port {}, command port {}",
        config.video.width,
        config.video.height,
        config.transport.video_port,
        config.transport.ctrl_port
    );

    let stop = Arc::new(AtomicBool::new(false));
    let stop_handler = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        stop_handler.store(true, Ordering::SeqCst);
    })
    .context("install Ctrl-C handler")?;

    let frames = FrameChannel::new();
    let mut subscriber = None;
    let mut synthetic_thread = None;
    let detectors = if args.synthetic {
        let scripted = ScriptedBackend::new();
        let scene = SyntheticScene::new(
            config.video.width,
            config.video.height,
            config.emergency.person_class_name.clone(),
        );
        synthetic_thread = Some(scene.spawn(
            frames.clone(),
            Some(scripted.clone()),
            args.synthetic_fps,
            Arc::clone(&stop),
        )?);
        Detectors {
            primary: Box::new(scripted),
            secondary: None,
        }
    } else {
        subscriber = Some(TcpFrameSubscriber::bind(
            &config.transport.video_addr(),
            frames.clone(),
        )?);
        let primary = load_detector(
            args.model.as_deref(),
            args.classes.as_deref(),
            args.model_size,
        )?
        .unwrap_or_else(|| {
            log::warn!("no primary model given; using an empty scripted detector");
            Box::new(ScriptedBackend::new()) as Box<dyn DetectorBackend>
        });
        let secondary = load_detector(
            args.hand_model.as_deref(),
            args.hand_classes.as_deref(),
            args.model_size,
        )?;
        Detectors { primary, secondary }
    };
    log::info!(
        "detectors ready: primary={} ({} classes), hand={}",
        detectors.primary.name(),
        detectors.primary.class_names().len(),
        detectors
            .secondary
            .as_ref()
            .map(|d| d.name())
            .unwrap_or("none")
    );

    let publisher: Box<dyn CommandPublisher> = match args.publisher {
        PublisherKind::Tcp => {
            let publisher = TcpCommandPublisher::bind(&config.transport.ctrl_addr())?;
            log::info!("publishing commands on tcp://{}", publisher.local_addr());
            Box::new(publisher)
        }
        PublisherKind::Mqtt => Box::new(MqttCommandPublisher::connect(
            &args.mqtt_broker,
            &args.mqtt_client_id,
            &args.mqtt_topic,
        )?),
    };

    let notifications = Notifications {
        speech: Notifier::spawn(
            speech_sink(config.notify.speech_command.as_deref())?,
            CooldownPolicy::RepeatedText,
            config.notify.speech_queue,
        )?,
        alerts: Notifier::spawn(
            alert_sink_from_env()?,
            CooldownPolicy::AnyText,
            config.notify.alert_queue,
        )?,
    };

    let operator = if args.no_stdin {
        OperatorInput::none()
    } else {
        OperatorInput::spawn_stdin()?
    };

    let mut follower = FollowerLoop::new(&config, detectors, publisher, notifications)?;
    if let Some(class) = args.lock {
        log::info!("starting with target locked: {}", class);
        follower = follower.with_locked_class(class);
    }
    follower.announce_startup();
    follower.run(&frames, &operator, &stop)?;

    stop.store(true, Ordering::SeqCst);
    if let Some(mut subscriber) = subscriber {
        let stats = subscriber.stats();
        subscriber.stop();
        log::info!(
            "video: {} connections, {} frames, {} decode errors, {} oversize",
            stats.connections,
            stats.received,
            stats.decode_errors,
            stats.oversize
        );
    }
    if let Some(handle) = synthetic_thread {
        handle
            .join()
            .map_err(|_| anyhow!("synthetic video thread panicked"))?;
    }
    Ok(())
}

#[cfg(feature = "backend-tract")]
fn load_detector(
    model: Option<&Path>,
    classes: Option<&Path>,
    size: u32,
) -> Result<Option<Box<dyn DetectorBackend>>> {
    use teleop_follower::detect::{load_class_names, TractYoloBackend};

    let Some(model) = model else {
        return Ok(None);
    };
    let classes = classes
        .ok_or_else(|| anyhow!("model {} needs a class label file", model.display()))?;
    let names = load_class_names(classes)?;
    let mut backend = TractYoloBackend::new(model, size, size, names)?;
    backend.warm_up()?;
    log::info!("loaded {} ({}x{})", model.display(), size, size);
    Ok(Some(Box::new(backend)))
}

#[cfg(not(feature = "backend-tract"))]
fn load_detector(
    model: Option<&Path>,
    _classes: Option<&Path>,
    _size: u32,
) -> Result<Option<Box<dyn DetectorBackend>>> {
    match model {
        Some(model) => Err(anyhow!(
            "cannot load {}: built without the backend-tract feature",
            model.display()
        )),
        None => Ok(None),
    }
}
